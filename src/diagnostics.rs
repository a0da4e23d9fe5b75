use log::{info, warn};
use std::time::Duration;

/// Endpoints probed when every provider has failed, to tell "my network is
/// down" apart from "every provider is down".
const PROBE_ENDPOINTS: &[&str] = &[
    "https://www.google.com/generate_204",
    "https://one.one.one.one",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NetworkDiagnosis {
    pub internet_reachable: bool,
    pub results: Vec<(String, bool)>,
}

impl NetworkDiagnosis {
    pub fn summary(&self) -> String {
        if self.internet_reachable {
            "network is reachable, all transcription providers failed".to_string()
        } else {
            "network appears to be down (no probe endpoint reachable)".to_string()
        }
    }
}

/// Probes a small set of well-known endpoints with a short timeout.
pub async fn probe() -> NetworkDiagnosis {
    let client = match reqwest::Client::builder()
        .connect_timeout(PROBE_TIMEOUT)
        .timeout(PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build diagnostics HTTP client: {}", e);
            return NetworkDiagnosis {
                internet_reachable: false,
                results: Vec::new(),
            };
        }
    };

    let mut results = Vec::new();
    for endpoint in PROBE_ENDPOINTS {
        let reachable = client.head(*endpoint).send().await.is_ok();
        info!("Network probe {}: reachable={}", endpoint, reachable);
        results.push((endpoint.to_string(), reachable));
    }

    NetworkDiagnosis {
        internet_reachable: results.iter().any(|(_, ok)| *ok),
        results,
    }
}
