use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

use crate::transport::TransportError;

/// Fixed sub-protocol name offered ahead of the session continuity token.
pub const PROTOCOL_NAME: &str = "tideline";

/// Configuration for opening the session stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Server base URL (http/https or ws/wss)
    pub base: Url,
    /// Path of the stream endpoint relative to `base`
    pub path: String,
    /// Values for `Sec-WebSocket-Protocol`, in preference order
    pub protocols: Vec<String>,
}

impl WebSocketConfig {
    pub fn new(base: Url, path: impl Into<String>) -> Self {
        Self {
            base,
            path: path.into(),
            protocols: vec![PROTOCOL_NAME.to_string()],
        }
    }

    /// Appends a sub-protocol value, typically the session continuity token.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Build the full WebSocket URL
    pub fn build_url(&self) -> Result<Url, TransportError> {
        let mut url = self.base.clone();

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{other}' in {}",
                    self.base
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;

        // Normalize localhost to avoid IPv6 issues
        if url.host_str() == Some("localhost") {
            url.set_host(Some("127.0.0.1"))
                .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        }

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.join(self.path.trim_start_matches('/'))
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))
    }

    pub fn to_request(&self) -> Result<Request, TransportError> {
        let url = self.build_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        if !self.protocols.is_empty() {
            let value = HeaderValue::from_str(&self.protocols.join(", "))
                .map_err(|err| TransportError::InvalidUrl(format!("bad sub-protocol: {err}")))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
        Ok(request)
    }
}
