//! Locates a reachable server before a transport is opened.
//!
//! Candidates are tried round-robin. Each attempt asks for the health
//! endpoint and the host-config document at the same time; both must
//! succeed. Failed attempts back off exponentially with jitter and are
//! reported to the listener, and probing continues until it succeeds or the
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::SessionListener;
use super::resolver::{Deferred, Resolver};
use crate::config::{HEALTH_PATH, HOST_CONFIG_PATH, endpoint_url, is_localhost};

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const JITTER: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Host policy document served next to the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub use_external_auth_token: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("request timed out")]
    TimedOut,
    #[error("no response")]
    NoResponse,
    #[error("forbidden")]
    Forbidden,
    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("request failed: {0}")]
    Request(String),
}

impl ProbeFailure {
    /// Human readable account of the failure, as shown to the user.
    pub fn describe(&self, base: &Url) -> String {
        match self {
            ProbeFailure::TimedOut => "Connection timed out.".to_string(),
            ProbeFailure::NoResponse if is_localhost(base) => {
                "Is the server still running? If you stopped it, restart it and this session \
                 will reconnect."
                    .to_string()
            }
            ProbeFailure::NoResponse => format!("No response from the server at {base}."),
            ProbeFailure::Forbidden => format!(
                "Request to {base} was forbidden (HTTP 403). The server's CORS policy may not \
                 allow this origin; check its allowed origins and CORS settings."
            ),
            ProbeFailure::Status { code, body } => {
                format!("Connection failed with status {code}, and response \"{body}\".")
            }
            ProbeFailure::Request(message) => format!("Connection failed: {message}"),
        }
    }
}

#[async_trait]
pub trait ProbeBackend: Send + Sync {
    async fn health(&self, base: &Url) -> Result<(), ProbeFailure>;
    async fn host_config(&self, base: &Url) -> Result<HostConfig, ProbeFailure>;
}

#[derive(Clone, Default)]
pub struct ReqwestProbeBackend {
    client: reqwest::Client,
}

impl ReqwestProbeBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, base: &Url, path: &str) -> Result<reqwest::Response, ProbeFailure> {
        let endpoint = endpoint_url(base, path)
            .map_err(|err| ProbeFailure::Request(format!("invalid endpoint {path}: {err}")))?;
        let response = self.client.get(endpoint).send().await.map_err(classify)?;
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProbeFailure::Forbidden);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeFailure::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ProbeBackend for ReqwestProbeBackend {
    async fn health(&self, base: &Url) -> Result<(), ProbeFailure> {
        self.get(base, HEALTH_PATH).await.map(|_| ())
    }

    async fn host_config(&self, base: &Url) -> Result<HostConfig, ProbeFailure> {
        self.get(base, HOST_CONFIG_PATH)
            .await?
            .json::<HostConfig>()
            .await
            .map_err(|err| ProbeFailure::Request(format!("invalid host config: {err}")))
    }
}

fn classify(err: reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::TimedOut
    } else if err.is_connect() {
        ProbeFailure::NoResponse
    } else {
        ProbeFailure::Request(err.to_string())
    }
}

/// Delay before retry number `tries` (1-based). The first retry waits
/// `min`; later ones double, scaled by `1 + jitter`, capped at `max`.
pub fn backoff_delay(tries: u32, min: Duration, max: Duration, jitter: f64) -> Duration {
    if tries <= 1 {
        return min.min(max);
    }
    let exponent = (tries - 1).min(32) as i32;
    let scaled = min.as_secs_f64() * 2f64.powi(exponent) * (1.0 + jitter);
    Duration::from_secs_f64(scaled.clamp(0.0, max.as_secs_f64()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Index of the candidate that answered.
    pub index: usize,
    pub host_config: HostConfig,
}

pub struct HealthProber {
    servers: Vec<Url>,
    backend: Arc<dyn ProbeBackend>,
    config: ProbeConfig,
    listener: Arc<dyn SessionListener>,
    rng: Mutex<StdRng>,
}

impl HealthProber {
    pub fn new(
        servers: Vec<Url>,
        backend: Arc<dyn ProbeBackend>,
        config: ProbeConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        Self {
            servers,
            backend,
            config,
            listener,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Probes on a background task; the returned value resolves with the
    /// first healthy candidate, or is abandoned if `cancel` fires first.
    pub fn start(self, cancel: CancellationToken) -> Deferred<ProbeOutcome> {
        let (resolver, deferred) = Resolver::new();
        tokio::spawn(async move {
            if let Some(outcome) = self.run(cancel).await {
                resolver.resolve(outcome);
            }
        });
        deferred
    }

    pub async fn run(&self, cancel: CancellationToken) -> Option<ProbeOutcome> {
        if self.servers.is_empty() {
            warn!(target = "tideline::probe", "no servers to probe");
            cancel.cancelled().await;
            return None;
        }

        let mut index = 0usize;
        let mut tries = 0u32;
        let mut total_tries = 0u32;

        loop {
            if index == 0 {
                total_tries += 1;
            }
            let base = &self.servers[index];
            debug!(target = "tideline::probe", server = %base, attempt = tries + 1, "probing server");

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.attempt(base) => result,
            };

            match attempt {
                Ok(host_config) => {
                    debug!(target = "tideline::probe", server = %base, "server is healthy");
                    self.listener.on_allowed_origins(&host_config);
                    return Some(ProbeOutcome { index, host_config });
                }
                Err(failure) => {
                    tries += 1;
                    let jitter = self.rng.lock().gen_range(-JITTER..JITTER);
                    let delay = backoff_delay(
                        tries,
                        self.config.min_delay,
                        self.config.max_delay,
                        jitter,
                    );
                    let description = failure.describe(base);
                    warn!(
                        target = "tideline::probe",
                        server = %base,
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "server probe failed"
                    );
                    self.listener.on_retry(total_tries, &description, delay);
                    index = (index + 1) % self.servers.len();

                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(&self, base: &Url) -> Result<HostConfig, ProbeFailure> {
        let both = futures_util::future::try_join(
            self.backend.health(base),
            self.backend.host_config(base),
        );
        match tokio::time::timeout(self.config.request_timeout, both).await {
            Ok(result) => result.map(|((), host_config)| host_config),
            Err(_) => Err(ProbeFailure::TimedOut),
        }
    }
}
