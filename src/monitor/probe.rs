//! One HTTP check against one target.
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{CheckResult, MonitoredTarget};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

/// Performs a check and folds every failure into the returned [`CheckResult`].
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn execute(&self, target: &MonitoredTarget) -> CheckResult;
}

pub struct HttpProbe {
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

/// 2xx and 3xx count as reachable.
pub fn is_healthy_status(status_code: u16) -> bool {
    (200..400).contains(&status_code)
}

#[async_trait]
impl ProbeExecutor for HttpProbe {
    async fn execute(&self, target: &MonitoredTarget) -> CheckResult {
        let method = match Method::from_bytes(target.method.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                warn!(target_id = %target.id, method = %target.method, "Unsupported HTTP method.");
                return CheckResult::transport_failure(
                    target.id.clone(),
                    Duration::ZERO,
                    format!("Error: invalid method: {e}"),
                );
            }
        };

        let start_time = Instant::now();
        // Hard upper bound: no check outlives its timeout.
        let outcome = tokio::time::timeout(
            self.timeout,
            self.client.request(method, &target.url).send(),
        )
        .await;
        let latency = start_time.elapsed();

        let result = match outcome {
            Ok(Ok(response)) => {
                let status_code = response.status().as_u16();
                if is_healthy_status(status_code) {
                    CheckResult::online(target.id.clone(), status_code, latency)
                } else {
                    CheckResult::offline(target.id.clone(), status_code, latency)
                }
            }
            Ok(Err(e)) => {
                let details = if e.is_timeout() {
                    "Error: Request timed out".to_string()
                } else {
                    format!("Error: {e}")
                };
                CheckResult::transport_failure(target.id.clone(), latency, details)
            }
            Err(_) => CheckResult::transport_failure(
                target.id.clone(),
                latency,
                "Error: Request timed out".to_string(),
            ),
        };

        debug!(
            target_id = %target.id,
            url = %target.url,
            status_code = result.status_code,
            latency_ms = result.latency.as_millis() as u64,
            classification = %result.classification,
            "Probe finished."
        );
        result
    }
}
