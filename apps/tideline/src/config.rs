use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::session::prober::ProbeConfig;

pub const STREAM_PATH: &str = "_stcore/stream";
pub const HEALTH_PATH: &str = "_stcore/health";
pub const HOST_CONFIG_PATH: &str = "_stcore/host-config";
pub const MESSAGE_PATH: &str = "_stcore/message";

pub const DEFAULT_SERVER: &str = "127.0.0.1:8501";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_WARNING_THRESHOLD: u32 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no server configured")]
    NoServers,
    #[error("invalid server url '{raw}': {source}")]
    InvalidServer {
        raw: String,
        source: url::ParseError,
    },
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Candidate server base URIs, probed round-robin
    pub servers: Vec<Url>,
    /// Externally supplied session token; consumed by the first connection
    pub host_token: Option<String>,
    pub connect_timeout: Duration,
    /// Consecutive retries before connection errors are surfaced
    pub retry_warning_threshold: u32,
    pub probe: ProbeConfig,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("TIDELINE_SERVERS") {
            config.servers = parse_servers(&raw)?;
        }
        config.host_token = env::var("TIDELINE_HOST_TOKEN")
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        if let Ok(raw) = env::var("TIDELINE_CONNECT_TIMEOUT_MS") {
            let millis = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: "TIDELINE_CONNECT_TIMEOUT_MS",
                    value: raw.clone(),
                })?;
            config.connect_timeout = Duration::from_millis(millis);
        }
        if let Ok(raw) = env::var("TIDELINE_RETRY_WARNING") {
            config.retry_warning_threshold =
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidValue {
                        var: "TIDELINE_RETRY_WARNING",
                        value: raw.clone(),
                    })?;
        }

        Ok(config)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![Url::parse(&format!("http://{DEFAULT_SERVER}/")).expect("default url")],
            host_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_warning_threshold: DEFAULT_RETRY_WARNING_THRESHOLD,
            probe: ProbeConfig::default(),
        }
    }
}

/// Parses a comma separated list of server addresses.
pub fn parse_servers(raw: &str) -> Result<Vec<Url>, ConfigError> {
    let servers = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_base_uri)
        .collect::<Result<Vec<_>, _>>()?;
    if servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    Ok(servers)
}

/// Parses a server base URI, inferring the scheme when missing.
pub fn parse_base_uri(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{}", infer_scheme(trimmed), trimmed)
    };
    let mut url = Url::parse(&with_scheme).map_err(|source| ConfigError::InvalidServer {
        raw: raw.to_string(),
        source,
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Resolves an HTTP endpoint relative to a server base URI.
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path)
}

/// Cache-miss endpoint for a content hash.
pub fn message_url(base: &Url, hash: &str) -> Result<Url, url::ParseError> {
    let mut url = endpoint_url(base, MESSAGE_PATH)?;
    url.query_pairs_mut().append_pair("hash", hash);
    Ok(url)
}

/// Whether the base URI points at the local machine.
pub fn is_localhost(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            host.eq_ignore_ascii_case("localhost") || host == "::1" || host.starts_with("127.")
        }
        None => false,
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("0.0.0.0")
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}
