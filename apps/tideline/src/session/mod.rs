//! Session management: one reconnecting connection to an app server at a
//! time, plus the identity that survives reconnects.

pub mod connection;
pub mod prober;
pub mod resolver;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::{MessageCache, PayloadFetcher, ReqwestPayloadFetcher};
use crate::config::ClientConfig;
use crate::protocol::{BackMsg, ForwardMsg, ForwardMsgBody};
use crate::transport::{Connector, WebSocketConnector};

pub use connection::{Connection, ConnectionDeps};
pub use prober::{HostConfig, ProbeBackend, ProbeConfig, ProbeFailure, ReqwestProbeBackend};
pub use state::{ConnectionEvent, ConnectionState, IllegalTransition};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Receives everything a connection reports. Callbacks run on the
/// connection's task and must not block.
pub trait SessionListener: Send + Sync {
    fn on_state_change(&self, state: ConnectionState, error: Option<&str>);

    fn on_message(&self, msg: ForwardMsg);

    fn on_retry(&self, _attempt: u32, _description: &str, _delay: Duration) {}

    fn on_allowed_origins(&self, _host_config: &HostConfig) {}

    fn on_connection_error(&self, _description: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    Message(ForwardMsg),
    Retry {
        attempt: u32,
        description: String,
        delay: Duration,
    },
    AllowedOrigins(HostConfig),
    ConnectionError(String),
}

impl SessionListener for mpsc::UnboundedSender<SessionEvent> {
    fn on_state_change(&self, state: ConnectionState, error: Option<&str>) {
        let _ = self.send(SessionEvent::StateChanged {
            state,
            error: error.map(str::to_string),
        });
    }

    fn on_message(&self, msg: ForwardMsg) {
        let _ = self.send(SessionEvent::Message(msg));
    }

    fn on_retry(&self, attempt: u32, description: &str, delay: Duration) {
        let _ = self.send(SessionEvent::Retry {
            attempt,
            description: description.to_string(),
            delay,
        });
    }

    fn on_allowed_origins(&self, host_config: &HostConfig) {
        let _ = self.send(SessionEvent::AllowedOrigins(host_config.clone()));
    }

    fn on_connection_error(&self, description: &str) {
        let _ = self.send(SessionEvent::ConnectionError(description.to_string()));
    }
}

#[derive(Debug, Default)]
struct ContextInner {
    host_token: Option<String>,
    host_token_claimed: bool,
    last_session_id: Option<String>,
}

/// Session identity shared by every connection a manager creates.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl SessionContext {
    pub fn new(host_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                host_token,
                ..ContextInner::default()
            })),
        }
    }

    /// Token offered when opening a link: the host token the first time it
    /// is asked for, the last session id afterwards.
    pub fn claim_continuity_token(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        if !inner.host_token_claimed {
            inner.host_token_claimed = true;
            if let Some(token) = inner.host_token.take() {
                return Some(token);
            }
        }
        inner.last_session_id.clone()
    }

    pub fn set_last_session_id(&self, session_id: impl Into<String>) {
        self.inner.lock().last_session_id = Some(session_id.into());
    }

    pub fn last_session_id(&self) -> Option<String> {
        self.inner.lock().last_session_id.clone()
    }
}

/// Wraps the caller's listener: records session ids and escalates long
/// retry streaks to `on_connection_error`.
struct ManagedListener {
    inner: Arc<dyn SessionListener>,
    context: SessionContext,
    retry_warning_threshold: u32,
}

impl SessionListener for ManagedListener {
    fn on_state_change(&self, state: ConnectionState, error: Option<&str>) {
        self.inner.on_state_change(state, error);
    }

    fn on_message(&self, msg: ForwardMsg) {
        if let ForwardMsgBody::NewSession(session) = &msg.body {
            debug!(target = "tideline::session", session_id = %session.session_id, "new session");
            self.context.set_last_session_id(session.session_id.clone());
        }
        self.inner.on_message(msg);
    }

    fn on_retry(&self, attempt: u32, description: &str, delay: Duration) {
        if attempt >= self.retry_warning_threshold {
            self.inner.on_connection_error(description);
        }
        self.inner.on_retry(attempt, description, delay);
    }

    fn on_allowed_origins(&self, host_config: &HostConfig) {
        self.inner.on_allowed_origins(host_config);
    }

    fn on_connection_error(&self, description: &str) {
        self.inner.on_connection_error(description);
    }
}

pub struct ConnectionManager {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    probe_backend: Arc<dyn ProbeBackend>,
    cache: Arc<MessageCache>,
    context: SessionContext,
    listener: Arc<dyn SessionListener>,
    connection: Option<Connection>,
    state: Option<watch::Receiver<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(config.probe.request_timeout)
            .build()?;
        Self::with_parts(
            config,
            listener,
            Arc::new(WebSocketConnector),
            Arc::new(ReqwestProbeBackend::new(client.clone())),
            Arc::new(ReqwestPayloadFetcher::new(client)),
        )
    }

    pub fn with_parts(
        config: ClientConfig,
        listener: Arc<dyn SessionListener>,
        connector: Arc<dyn Connector>,
        probe_backend: Arc<dyn ProbeBackend>,
        fetcher: Arc<dyn PayloadFetcher>,
    ) -> Result<Self, SessionError> {
        if config.servers.is_empty() {
            return Err(SessionError::InvalidConfig(
                "at least one server is required".into(),
            ));
        }
        let context = SessionContext::new(config.host_token.clone());
        Ok(Self {
            config,
            connector,
            probe_backend,
            cache: Arc::new(MessageCache::new(fetcher)),
            context,
            listener,
            connection: None,
            state: None,
        })
    }

    /// Starts a fresh connection, replacing any existing one.
    pub fn connect(&mut self) {
        if let Some(previous) = self.connection.take() {
            previous.disconnect();
        }
        info!(
            target = "tideline::session",
            servers = self.config.servers.len(),
            "connecting"
        );
        let listener: Arc<dyn SessionListener> = Arc::new(ManagedListener {
            inner: self.listener.clone(),
            context: self.context.clone(),
            retry_warning_threshold: self.config.retry_warning_threshold,
        });
        let connection = Connection::spawn(ConnectionDeps {
            servers: self.config.servers.clone(),
            connect_timeout: self.config.connect_timeout,
            probe: self.config.probe.clone(),
            connector: self.connector.clone(),
            probe_backend: self.probe_backend.clone(),
            cache: self.cache.clone(),
            context: self.context.clone(),
            listener,
        });
        self.state = Some(connection.subscribe());
        self.connection = Some(connection);
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.as_ref() {
            connection.disconnect();
        }
    }

    /// Disconnects and waits for the connection to finish tearing down.
    pub async fn shutdown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    pub fn send(&self, msg: BackMsg) {
        match self.connection.as_ref() {
            Some(connection) => connection.send(msg),
            None => warn!(
                target = "tideline::session",
                kind = msg.label(),
                "not connected; dropping message"
            ),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .as_ref()
            .map(|state| *state.borrow())
            .unwrap_or(ConnectionState::Initial)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.state.clone()
    }

    /// Call once per completed script run.
    pub fn increment_message_cache_run_count(&self, max_age: u64) {
        self.cache.increment_run_count(max_age);
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoFetch;
    use crate::protocol::{NewSession, SessionSettings, encode_forward_msg};
    use crate::transport::mock::MockConnector;
    use async_trait::async_trait;
    use url::Url;

    struct FlakyProbe {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl ProbeBackend for FlakyProbe {
        async fn health(&self, _base: &Url) -> Result<(), ProbeFailure> {
            let mut left = self.failures_left.lock();
            if *left == 0 {
                return Ok(());
            }
            *left -= 1;
            Err(ProbeFailure::NoResponse)
        }

        async fn host_config(&self, _base: &Url) -> Result<HostConfig, ProbeFailure> {
            Ok(HostConfig::default())
        }
    }

    fn config(threshold: u32) -> ClientConfig {
        ClientConfig {
            retry_warning_threshold: threshold,
            host_token: Some("tok".into()),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn host_token_is_claimed_once() {
        let context = SessionContext::new(Some("host".into()));
        assert_eq!(context.claim_continuity_token().as_deref(), Some("host"));
        assert_eq!(context.claim_continuity_token(), None);
        context.set_last_session_id("s-1");
        assert_eq!(context.claim_continuity_token().as_deref(), Some("s-1"));
    }

    #[test]
    fn rejects_empty_server_list() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (connector, _server) = MockConnector::new();
        let config = ClientConfig {
            servers: Vec::new(),
            ..ClientConfig::default()
        };
        let result = ConnectionManager::with_parts(
            config,
            Arc::new(tx),
            connector,
            Arc::new(FlakyProbe {
                failures_left: Mutex::new(0),
            }),
            Arc::new(NoFetch),
        );
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_connection_errors_after_threshold() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connector, mut server) = MockConnector::new();
        let mut manager = ConnectionManager::with_parts(
            config(3),
            Arc::new(tx),
            connector,
            Arc::new(FlakyProbe {
                failures_left: Mutex::new(4),
            }),
            Arc::new(NoFetch),
        )
        .unwrap();

        manager.connect();
        let _peer = server.accept().await.unwrap();
        let mut state = manager.subscribe().unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert!(manager.is_connected());

        let mut retries = Vec::new();
        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Retry { attempt, .. } => retries.push(attempt),
                SessionEvent::ConnectionError(_) => errors += 1,
                _ => {}
            }
        }
        assert_eq!(retries, vec![1, 2, 3, 4]);
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn records_session_ids_from_new_session_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connector, mut server) = MockConnector::new();
        let mut manager = ConnectionManager::with_parts(
            config(30),
            Arc::new(tx),
            connector,
            Arc::new(FlakyProbe {
                failures_left: Mutex::new(0),
            }),
            Arc::new(NoFetch),
        )
        .unwrap();

        manager.connect();
        let peer = server.accept().await.unwrap();
        assert_eq!(peer.config.protocols[1], "tok");

        let new_session = ForwardMsg::new(
            "ns",
            ForwardMsgBody::NewSession(NewSession {
                script_run_id: "run-1".into(),
                session_id: "session-abc".into(),
                config: SessionSettings::default(),
            }),
        );
        peer.push(encode_forward_msg(&new_session).unwrap());

        loop {
            if let Some(SessionEvent::Message(msg)) = rx.recv().await {
                assert_eq!(msg, new_session);
                break;
            }
        }
        assert_eq!(
            manager.context().last_session_id().as_deref(),
            Some("session-abc")
        );

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::DisconnectedForever);
    }
}
