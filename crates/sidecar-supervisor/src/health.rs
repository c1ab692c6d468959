use crate::supervisor::SupervisorEvent;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const MIN_PROBE_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct HealthProbeConfig {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl HealthProbeConfig {
    pub fn new(url: String, interval_ms: u64) -> Self {
        Self {
            url,
            interval: Duration::from_millis(interval_ms.max(MIN_PROBE_INTERVAL_MS)),
            timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

/// Periodic HTTP GET against the process health endpoint. Emits a
/// `HealthChanged` event on every flip, including the first observation.
pub fn spawn_probe(
    name: String,
    config: HealthProbeConfig,
    events: mpsc::Sender<SupervisorEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(config.timeout).build() {
            Ok(client) => client,
            Err(err) => {
                warn!(event = "health_client_error", process = %name, error = %err);
                return;
            }
        };
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<bool> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let healthy = check_once(&client, &config.url).await;
                    if last != Some(healthy) {
                        debug!(
                            event = "health_flip",
                            process = %name,
                            healthy,
                            url = %config.url
                        );
                        last = Some(healthy);
                        if events
                            .send(SupervisorEvent::HealthChanged {
                                name: name.clone(),
                                healthy,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Healthy iff the endpoint answers with a status in [200, 400).
async fn check_once(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            (200..400).contains(&code)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_floored_at_one_second() {
        let config = HealthProbeConfig::new("http://localhost:1/healthz".to_string(), 10);
        assert_eq!(config.interval, Duration::from_millis(1_000));
        let config = HealthProbeConfig::new("http://localhost:1/healthz".to_string(), 15_000);
        assert_eq!(config.interval, Duration::from_millis(15_000));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unhealthy() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        // Reserved port with nothing listening.
        assert!(!check_once(&client, "http://127.0.0.1:9/healthz").await);
    }
}
