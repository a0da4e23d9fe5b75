use futures_util::{SinkExt, StreamExt};
use sotto::managers::streaming::{
    SessionState, StreamingCallbacks, StreamingConfig, StreamingSession,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn config(url: String) -> StreamingConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    StreamingConfig {
        ws_url: url,
        model: "rt-test".into(),
        api_key: "test-key".into(),
        language: None,
    }
}

/// Starts a scripted endpoint; `on_finalize` receives the server-side socket
/// once the client's finalize control message arrives.
async fn spawn_server<F, Fut>(on_finalize: F) -> String
where
    F: FnOnce(
            tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        ) -> Fut
        + Send
        + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = &message {
                if text.as_str().contains("finalize") {
                    on_finalize(ws).await;
                    return;
                }
            }
        }
    });

    format!("ws://{}", addr)
}

#[tokio::test]
async fn finish_returns_accumulated_finals() {
    let (partial_tx, mut partial_rx) = mpsc::unbounded_channel();

    let url = spawn_server(|mut ws| async move {
        ws.send(Message::Text(
            r#"{"tokens":[{"text":"hello","is_final":false}]}"#.to_string().into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            r#"{"tokens":[{"text":"hello","is_final":true},{"text":"world","is_final":true}],"finished":true}"#
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    })
    .await;

    let callbacks = StreamingCallbacks {
        on_partial: Some(Box::new(move |text| {
            let _ = partial_tx.send(text.to_string());
        })),
        ..Default::default()
    };

    let session = StreamingSession::connect(config(url), callbacks)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Open);

    session.send_audio(&[0.0; 1600]).unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), session.finish())
        .await
        .expect("finalize handshake timed out")
        .unwrap();
    assert_eq!(text, "hello world");

    let partial = tokio::time::timeout(Duration::from_secs(1), partial_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial, "hello");

    session.stop();
}

#[tokio::test]
async fn final_after_handshake_goes_to_late_transcript_callback() {
    let url = spawn_server(|mut ws| async move {
        ws.send(Message::Text(
            r#"{"tokens":[{"text":"early","is_final":true}]}"#.to_string().into(),
        ))
        .await
        .unwrap();

        // Past the finalize grace window: this one must not make it into
        // the finish() result.
        tokio::time::sleep(Duration::from_millis(2600)).await;
        ws.send(Message::Text(
            r#"{"tokens":[{"text":"late","is_final":true}]}"#.to_string().into(),
        ))
        .await
        .unwrap();
    })
    .await;

    let (late_tx, mut late_rx) = mpsc::unbounded_channel();
    let callbacks = StreamingCallbacks {
        on_late_transcript: Some(Box::new(move |text| {
            let _ = late_tx.send(text.to_string());
        })),
        ..Default::default()
    };

    let session = StreamingSession::connect(config(url), callbacks)
        .await
        .unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), session.finish())
        .await
        .expect("finalize handshake timed out")
        .unwrap();
    assert_eq!(text, "early");

    let late = tokio::time::timeout(Duration::from_secs(5), late_rx.recv())
        .await
        .expect("late transcript never arrived")
        .unwrap();
    assert_eq!(late, "late");

    session.stop();
}

#[tokio::test]
async fn trickling_finals_do_not_stall_the_handshake() {
    // One final every 400 ms; the handshake must resolve on the first one
    // instead of chasing a fresh grace window per segment.
    let url = spawn_server(|mut ws| async move {
        for text in ["one", "two", "three"] {
            let payload = format!(r#"{{"tokens":[{{"text":"{}","is_final":true}}]}}"#, text);
            ws.send(Message::Text(payload.into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
    })
    .await;

    let (late_tx, mut late_rx) = mpsc::unbounded_channel();
    let callbacks = StreamingCallbacks {
        on_late_transcript: Some(Box::new(move |text| {
            let _ = late_tx.send(text.to_string());
        })),
        ..Default::default()
    };

    let session = StreamingSession::connect(config(url), callbacks)
        .await
        .unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), session.finish())
        .await
        .expect("finalize handshake timed out")
        .unwrap();
    assert_eq!(text, "one");

    for expected in ["two", "three"] {
        let late = tokio::time::timeout(Duration::from_secs(5), late_rx.recv())
            .await
            .expect("late transcript never arrived")
            .unwrap();
        assert_eq!(late, expected);
    }

    session.stop();
}

#[tokio::test]
async fn audio_is_rejected_after_stop() {
    let url = spawn_server(|_ws| async {}).await;

    let session = StreamingSession::connect(config(url), StreamingCallbacks::default())
        .await
        .unwrap();
    session.stop();

    // Teardown is asynchronous; wait for the state to settle.
    for _ in 0..50 {
        if session.state() == SessionState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.send_audio(&[0.0; 16]).is_err());
}
