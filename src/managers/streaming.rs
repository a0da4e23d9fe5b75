use crate::error::TranscribeError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle ping cadence; providers drop sessions that go quiet for too long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);
/// How long `finish` waits for one more final segment before returning what
/// it has. Finals arriving later surface through the late-transcript
/// callback.
const FINALIZE_GRACE: Duration = Duration::from_millis(800);
const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub ws_url: String,
    pub model: String,
    pub api_key: String,
    pub language: Option<String>,
}

/// Event callbacks, all optional. Invoked from the session's background
/// task, so they must not block.
#[derive(Default)]
pub struct StreamingCallbacks {
    /// Non-final text as it is being recognized.
    pub on_partial: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// A segment the provider will not revise further.
    pub on_final: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// A final segment that arrived after `finish` already returned.
    pub on_late_transcript: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&TranscribeError) + Send + Sync>>,
}

#[derive(Serialize)]
struct SessionStart {
    api_key: String,
    model: String,
    audio_format: String,
    sample_rate: u32,
    num_channels: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_hints: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default)]
struct SessionToken {
    text: String,
    #[serde(default)]
    is_final: bool,
}

#[derive(Deserialize, Debug, Default)]
struct SessionMessage {
    #[serde(default)]
    tokens: Vec<SessionToken>,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    error_message: Option<String>,
}

enum Command {
    Audio(Vec<u8>),
    Finalize(oneshot::Sender<String>),
    Stop,
}

/// Converts mono f32 samples to the little-endian PCM16 wire format.
fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Live transcription session over a realtime WebSocket endpoint.
///
/// Owns a background task that pumps audio out and tokens in. Audio pushed
/// while the connection is being re-established is rejected, not buffered;
/// the caller decides whether dropped audio is acceptable.
pub struct StreamingSession {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<SessionState>>,
}

impl StreamingSession {
    /// Opens the socket and starts the session. Fails fast when the endpoint
    /// is unreachable; reconnection only applies to sessions that were
    /// already open.
    pub async fn connect(
        config: StreamingConfig,
        callbacks: StreamingCallbacks,
    ) -> Result<Self, TranscribeError> {
        let state = Arc::new(Mutex::new(SessionState::Connecting));

        let (sink, source) = match open_socket(&config).await {
            Ok(halves) => halves,
            Err(e) => {
                *state.lock().unwrap() = SessionState::Closed;
                return Err(e);
            }
        };

        *state.lock().unwrap() = SessionState::Open;
        info!("Streaming session open to {}", config.ws_url);

        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            config,
            callbacks,
            state: state.clone(),
            finished: false,
            sink,
            source,
            command_rx,
            final_segments: Vec::new(),
            finalize_reply: None,
            finalize_deadline: None,
        };
        tokio::spawn(task.run());

        Ok(Self { commands, state })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Pushes one frame of audio. Errors when the session is not open, which
    /// also covers the window during a reconnect.
    pub fn send_audio(&self, samples: &[f32]) -> Result<(), TranscribeError> {
        if self.state() != SessionState::Open {
            return Err(TranscribeError::Network(
                "streaming session is not open".to_string(),
            ));
        }
        self.commands
            .send(Command::Audio(pcm_bytes(samples)))
            .map_err(|_| TranscribeError::Network("streaming session task is gone".to_string()))
    }

    /// Ends the utterance: tells the provider no more audio is coming, waits
    /// briefly for trailing finals, and returns the accumulated transcript.
    pub async fn finish(&self) -> Result<String, TranscribeError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                SessionState::Open => *state = SessionState::Closing,
                SessionState::Closed => {
                    return Err(TranscribeError::Network(
                        "streaming session already closed".to_string(),
                    ))
                }
                _ => {}
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Finalize(reply_tx))
            .map_err(|_| TranscribeError::Network("streaming session task is gone".to_string()))?;

        // The session task flips `finished` before sending the reply.
        reply_rx
            .await
            .map_err(|_| TranscribeError::Network("session ended during finalize".to_string()))
    }

    /// Tears the session down without waiting for trailing transcripts.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

async fn open_socket(config: &StreamingConfig) -> Result<(WsSink, WsSource), TranscribeError> {
    let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(&config.ws_url))
        .await
        .map_err(|_| TranscribeError::Timeout(CONNECT_TIMEOUT))?
        .map_err(|e| TranscribeError::Network(format!("WebSocket connect failed: {}", e)))?;

    let (mut sink, source) = stream.split();

    let start = SessionStart {
        api_key: config.api_key.clone(),
        model: config.model.clone(),
        audio_format: "pcm_s16le".to_string(),
        sample_rate: crate::audio_toolkit::SAMPLE_RATE,
        num_channels: 1,
        language_hints: config.language.clone().map(|l| vec![l]),
    };
    let payload = serde_json::to_string(&start)
        .map_err(|e| TranscribeError::Other(anyhow::anyhow!("start payload: {}", e)))?;

    sink.send(Message::Text(payload.into()))
        .await
        .map_err(|e| TranscribeError::Network(format!("failed to send session start: {}", e)))?;

    Ok((sink, source))
}

struct SessionTask {
    config: StreamingConfig,
    callbacks: StreamingCallbacks,
    state: Arc<Mutex<SessionState>>,
    /// Set once a finalize reply has been delivered; later finals are late
    /// transcripts.
    finished: bool,
    sink: WsSink,
    source: WsSource,
    command_rx: mpsc::UnboundedReceiver<Command>,
    final_segments: Vec<String>,
    finalize_reply: Option<oneshot::Sender<String>>,
    finalize_deadline: Option<Instant>,
}

impl SessionTask {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn emit_error(&self, error: &TranscribeError) {
        if let Some(cb) = &self.callbacks.on_error {
            cb(error);
        }
    }

    fn transcript(&self) -> String {
        self.final_segments.join(" ")
    }

    /// Delivers the accumulated transcript to a pending `finish` call.
    /// Marks the session finished in the same step so finals racing the
    /// reply land in the late-transcript channel, not in a result already
    /// handed out.
    fn resolve_finalize(&mut self) {
        if let Some(reply) = self.finalize_reply.take() {
            self.finished = true;
            let _ = reply.send(self.transcript());
        }
        self.finalize_deadline = None;
    }

    async fn run(mut self) {
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            // Pending finalize gets a grace deadline; otherwise sleep far
            // in the future so the select arm stays dormant.
            let deadline = self
                .finalize_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Audio(bytes)) => {
                            if let Err(e) = self.sink.send(Message::Binary(bytes.into())).await {
                                warn!("Audio send failed: {}", e);
                                if !self.reconnect().await {
                                    break;
                                }
                            }
                            keepalive.reset();
                        }
                        Some(Command::Finalize(reply)) => {
                            self.finalize_reply = Some(reply);
                            self.finalize_deadline = Some(Instant::now() + FINALIZE_GRACE);
                            let finalize_sent = self
                                .sink
                                .send(Message::Text(r#"{"type":"finalize"}"#.to_string().into()))
                                .await
                                .and(self.sink.send(Message::Binary(Vec::new().into())).await.map(|_| ()))
                                .is_ok();
                            if !finalize_sent {
                                warn!("Finalize send failed, returning accumulated transcript");
                                self.resolve_finalize();
                                break;
                            }
                        }
                        Some(Command::Stop) | None => break,
                    }
                }
                frame = self.source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_payload(text.as_ref()),
                        Some(Ok(Message::Close(_))) | None => {
                            if self.finalize_reply.is_some() || self.state_is_closing() {
                                self.resolve_finalize();
                                break;
                            }
                            warn!("Streaming socket closed unexpectedly");
                            if !self.reconnect().await {
                                break;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Streaming socket read failed: {}", e);
                            if self.finalize_reply.is_some() {
                                self.resolve_finalize();
                                break;
                            }
                            if !self.reconnect().await {
                                break;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if self.finalize_deadline.is_some() => {
                    debug!("Finalize grace period elapsed");
                    self.resolve_finalize();
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.sink.send(Message::Ping(Vec::new().into())).await {
                        warn!("Keepalive ping failed: {}", e);
                        if !self.reconnect().await {
                            break;
                        }
                    }
                }
            }
        }

        self.resolve_finalize();
        self.set_state(SessionState::Closed);
        let _ = self.sink.send(Message::Close(None)).await;
        debug!("Streaming session task finished");
    }

    fn state_is_closing(&self) -> bool {
        matches!(
            *self.state.lock().unwrap(),
            SessionState::Closing | SessionState::Closed
        )
    }

    fn handle_payload(&mut self, text: &str) {
        let payload: SessionMessage = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Ignoring malformed streaming payload: {}", e);
                return;
            }
        };

        if let Some(code) = payload.error_code {
            let error = TranscribeError::from_status(
                code,
                payload
                    .error_message
                    .unwrap_or_else(|| "unknown streaming error".to_string()),
            );
            self.emit_error(&error);
            return;
        }

        let mut got_final = false;
        for token in payload.tokens {
            if token.text.is_empty() {
                continue;
            }
            if token.is_final {
                if self.finished {
                    // finish() already returned; the caller gets this
                    // through the late-transcript channel instead.
                    if let Some(cb) = &self.callbacks.on_late_transcript {
                        cb(&token.text);
                    }
                } else {
                    self.final_segments.push(token.text.clone());
                    if let Some(cb) = &self.callbacks.on_final {
                        cb(&token.text);
                    }
                    got_final = true;
                }
            } else if let Some(cb) = &self.callbacks.on_partial {
                cb(&token.text);
            }
        }

        if payload.finished {
            debug!("Provider signalled end of stream");
            self.resolve_finalize();
        } else if got_final && self.finalize_deadline.is_some() {
            // The grace window is a race against one more final segment;
            // the segment just won it.
            self.resolve_finalize();
        }
    }

    /// Re-dials the endpoint after an abnormal close. Audio sent while this
    /// runs is rejected by `send_audio` via the state check.
    async fn reconnect(&mut self) -> bool {
        if self.state_is_closing() {
            return false;
        }
        self.set_state(SessionState::Connecting);

        for attempt in 1..=RECONNECT_ATTEMPTS {
            tokio::time::sleep(RECONNECT_DELAY).await;
            info!(
                "Reconnecting streaming session (attempt {}/{})",
                attempt, RECONNECT_ATTEMPTS
            );
            match open_socket(&self.config).await {
                Ok((sink, source)) => {
                    self.sink = sink;
                    self.source = source;
                    self.set_state(SessionState::Open);
                    return true;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        let error = TranscribeError::Network(format!(
            "streaming session lost after {} reconnect attempts",
            RECONNECT_ATTEMPTS
        ));
        self.emit_error(&error);
        self.set_state(SessionState::Closed);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_conversion_is_little_endian_16bit() {
        let bytes = pcm_bytes(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0x00, 0x00]);
        assert_eq!(&bytes[2..4], &32767i16.to_le_bytes());
        // Symmetric scaling: full negative swing maps to -32767.
        assert_eq!(&bytes[4..6], &(-32767i16).to_le_bytes());
    }

    #[test]
    fn start_payload_shape() {
        let start = SessionStart {
            api_key: "key".into(),
            model: "rt-1".into(),
            audio_format: "pcm_s16le".into(),
            sample_rate: 16000,
            num_channels: 1,
            language_hints: None,
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["audio_format"], "pcm_s16le");
        assert_eq!(json["sample_rate"], 16000);
        assert!(json.get("language_hints").is_none());
    }

    #[tokio::test]
    async fn connect_refused_reports_network_error() {
        // Port 1 on localhost is never listening.
        let result = StreamingSession::connect(
            StreamingConfig {
                ws_url: "ws://127.0.0.1:1".into(),
                model: "rt-1".into(),
                api_key: "key".into(),
                language: None,
            },
            StreamingCallbacks::default(),
        )
        .await;

        assert!(matches!(result, Err(TranscribeError::Network(_))));
    }
}
