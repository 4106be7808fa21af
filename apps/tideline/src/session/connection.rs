//! The connection actor.
//!
//! One task owns the connection state, the open link, the connect timer, the
//! running probe and the pending-dispatch buffer. Everything asynchronous
//! (probing, opening the link, reading it, fetching missed cache entries)
//! runs on helper tasks that post back into the actor's inbox, tagged with
//! the probe or connection id they were started for. Inputs carrying a
//! superseded id are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::prober::{HealthProber, ProbeBackend, ProbeConfig};
use super::state::{ConnectionEvent, ConnectionState, Step, transition};
use super::{SessionContext, SessionListener};
use crate::cache::{Lookup, MessageCache};
use crate::config::STREAM_PATH;
use crate::protocol::{BackMsg, ForwardMsg, decode_forward_msg, encode_back_msg};
use crate::telemetry::logging::hexdump;
use crate::transport::{Connector, Link, LinkEvent, LinkSender, TransportError, WebSocketConfig};

/// Everything a connection needs, injected by the manager.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub servers: Vec<Url>,
    pub connect_timeout: Duration,
    pub probe: ProbeConfig,
    pub connector: Arc<dyn Connector>,
    pub probe_backend: Arc<dyn ProbeBackend>,
    pub cache: Arc<MessageCache>,
    pub context: SessionContext,
    pub listener: Arc<dyn SessionListener>,
}

enum Input {
    ProbeSucceeded {
        probe_id: u64,
        index: usize,
    },
    Opened {
        conn_id: u64,
        result: Result<Link, TransportError>,
    },
    ConnectTimedOut {
        conn_id: u64,
    },
    Link {
        conn_id: u64,
        event: LinkEvent,
    },
    Fetched {
        conn_id: u64,
        seq: u64,
        result: Result<ForwardMsg, String>,
    },
    Send(BackMsg),
    Disconnect,
}

/// Handle to a running connection actor. Dropping it disconnects.
pub struct Connection {
    inbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn spawn(deps: ConnectionDeps) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Initial);
        let actor = Actor {
            deps,
            state: ConnectionState::Initial,
            state_tx,
            inbox: inbox.downgrade(),
            server_index: 0,
            probe_id: 0,
            probe_cancel: None,
            conn_id: 0,
            link: None,
            link_task: None,
            connect_task: None,
            timer: None,
            next_seq: 0,
            next_dispatch: 0,
            pending: BTreeMap::new(),
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            inbox,
            state,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queues a message for the server. Dropped with a warning when no
    /// link is open.
    pub fn send(&self, msg: BackMsg) {
        if let Err(mpsc::error::SendError(Input::Send(msg))) = self.inbox.send(Input::Send(msg)) {
            warn!(
                target = "tideline::connection",
                kind = msg.label(),
                "connection is gone; dropping message"
            );
        }
    }

    pub fn disconnect(&self) {
        let _ = self.inbox.send(Input::Disconnect);
    }

    /// Disconnects and waits for the actor to finish tearing down.
    pub async fn shutdown(mut self) {
        self.disconnect();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.inbox.send(Input::Disconnect);
    }
}

struct Actor {
    deps: ConnectionDeps,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    inbox: mpsc::WeakUnboundedSender<Input>,
    server_index: usize,
    probe_id: u64,
    probe_cancel: Option<CancellationToken>,
    conn_id: u64,
    link: Option<LinkSender>,
    link_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    next_seq: u64,
    next_dispatch: u64,
    pending: BTreeMap<u64, ForwardMsg>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        self.handle_event(ConnectionEvent::Initialized, None);
        while !self.state.is_terminal() {
            let Some(input) = rx.recv().await else {
                break;
            };
            self.handle_input(input);
        }
        self.teardown();
        debug!(target = "tideline::connection", "connection actor stopped");
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::ProbeSucceeded { probe_id, index } => {
                if probe_id != self.probe_id || self.state != ConnectionState::PingingServer {
                    trace!(target = "tideline::connection", probe_id, "ignoring stale probe result");
                    return;
                }
                self.probe_cancel = None;
                self.server_index = index;
                self.handle_event(ConnectionEvent::ServerPingSucceeded, None);
            }
            Input::Opened { conn_id, result } => {
                if conn_id != self.conn_id || self.state != ConnectionState::Connecting {
                    trace!(target = "tideline::connection", conn_id, "ignoring stale link");
                    return;
                }
                self.connect_task = None;
                match result {
                    Ok(link) => self.on_link_open(conn_id, link),
                    Err(err) => {
                        self.handle_event(ConnectionEvent::ConnectionError, Some(err.to_string()))
                    }
                }
            }
            Input::ConnectTimedOut { conn_id } => {
                if conn_id != self.conn_id || self.state != ConnectionState::Connecting {
                    return;
                }
                let message = format!(
                    "websocket did not open within {} ms",
                    self.deps.connect_timeout.as_millis()
                );
                self.handle_event(ConnectionEvent::ConnectionTimedOut, Some(message));
            }
            Input::Link { conn_id, event } => {
                if conn_id != self.conn_id || self.link.is_none() {
                    return;
                }
                match event {
                    LinkEvent::Frame(frame) => self.on_frame(frame),
                    LinkEvent::Closed { reason } => {
                        info!(target = "tideline::connection", reason = ?reason, "websocket closed");
                        self.handle_event(ConnectionEvent::ConnectionClosed, reason);
                    }
                    LinkEvent::Error(message) => {
                        warn!(target = "tideline::connection", error = %message, "websocket error");
                        self.handle_event(ConnectionEvent::ConnectionError, Some(message));
                    }
                }
            }
            Input::Fetched {
                conn_id,
                seq,
                result,
            } => {
                if conn_id != self.conn_id || seq < self.next_dispatch {
                    return;
                }
                match result {
                    Ok(msg) => {
                        self.pending.insert(seq, msg);
                        self.drain();
                    }
                    Err(message) => self.handle_event(
                        ConnectionEvent::FatalError,
                        Some(format!("failed to process a message from the server: {message}")),
                    ),
                }
            }
            Input::Send(msg) => self.send(msg),
            Input::Disconnect => {
                info!(target = "tideline::connection", "disconnect requested");
                self.handle_event(ConnectionEvent::FatalError, None);
            }
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent, error: Option<String>) {
        match transition(self.state, event) {
            Ok(Step::Enter(next)) => self.set_state(next, error),
            Ok(Step::Discard) => {
                debug!(
                    target = "tideline::connection",
                    event = %event,
                    "discarding event after disconnect"
                );
            }
            Err(illegal) => {
                error!(target = "tideline::connection", error = %illegal, "illegal transition");
                self.set_state(
                    ConnectionState::DisconnectedForever,
                    Some(illegal.to_string()),
                );
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState, error: Option<String>) {
        debug!(
            target = "tideline::connection",
            from = %self.state,
            to = %next,
            error = ?error,
            "state change"
        );
        self.state = next;
        self.state_tx.send_replace(next);
        self.deps.listener.on_state_change(next, error.as_deref());

        if next != ConnectionState::Connecting {
            self.cancel_timer();
        }

        match next {
            ConnectionState::PingingServer => self.ping_server(),
            ConnectionState::Connecting => self.connect_to_server(),
            ConnectionState::DisconnectedForever => self.teardown(),
            ConnectionState::Initial | ConnectionState::Connected => {}
        }
    }

    fn ping_server(&mut self) {
        self.close_link();
        self.cancel_probe();

        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        self.probe_id += 1;
        let probe_id = self.probe_id;
        let cancel = CancellationToken::new();
        self.probe_cancel = Some(cancel.clone());

        let deferred = HealthProber::new(
            self.deps.servers.clone(),
            self.deps.probe_backend.clone(),
            self.deps.probe.clone(),
            self.deps.listener.clone(),
        )
        .start(cancel);

        tokio::spawn(async move {
            if let Ok(outcome) = deferred.await {
                let _ = inbox.send(Input::ProbeSucceeded {
                    probe_id,
                    index: outcome.index,
                });
            }
        });
    }

    fn connect_to_server(&mut self) {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        self.conn_id += 1;
        let conn_id = self.conn_id;

        let mut ws = WebSocketConfig::new(self.server_base().clone(), STREAM_PATH);
        if let Some(token) = self.deps.context.claim_continuity_token() {
            ws = ws.with_protocol(token);
        }
        info!(target = "tideline::connection", server = %ws.base, conn_id, "opening websocket");

        let connector = self.deps.connector.clone();
        let opened = inbox.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = connector.open(&ws).await;
            let _ = opened.send(Input::Opened { conn_id, result });
        }));

        let timeout = self.deps.connect_timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(Input::ConnectTimedOut { conn_id });
        }));
    }

    fn on_link_open(&mut self, conn_id: u64, link: Link) {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let (sender, mut events) = link.split();
        self.link = Some(sender);
        self.link_task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(event) => {
                        if inbox.send(Input::Link { conn_id, event }).is_err() {
                            return;
                        }
                    }
                    None => {
                        let _ = inbox.send(Input::Link {
                            conn_id,
                            event: LinkEvent::Closed { reason: None },
                        });
                        return;
                    }
                }
            }
        }));
        self.handle_event(ConnectionEvent::ConnectionSucceeded, None);
    }

    fn on_frame(&mut self, frame: Bytes) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let msg = match decode_forward_msg(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                trace!(
                    target = "tideline::connection",
                    seq,
                    frame = %hexdump(&frame),
                    "undecodable frame"
                );
                self.handle_event(
                    ConnectionEvent::FatalError,
                    Some(format!("failed to decode a message from the server: {err}")),
                );
                return;
            }
        };
        trace!(target = "tideline::connection", seq, kind = msg.body.label(), "frame decoded");

        match self.deps.cache.resolve_local(msg, &frame) {
            Ok(Lookup::Ready(msg)) => {
                self.pending.insert(seq, msg);
                self.drain();
            }
            Ok(Lookup::Fetch { hash, metadata }) => {
                let Some(inbox) = self.inbox.upgrade() else {
                    return;
                };
                let cache = self.deps.cache.clone();
                let base = self.server_base().clone();
                let conn_id = self.conn_id;
                tokio::spawn(async move {
                    let result = cache
                        .fetch_missing(&base, &hash, metadata)
                        .await
                        .map_err(|err| err.to_string());
                    let _ = inbox.send(Input::Fetched {
                        conn_id,
                        seq,
                        result,
                    });
                });
            }
            Err(err) => self.handle_event(
                ConnectionEvent::FatalError,
                Some(format!("failed to process a message from the server: {err}")),
            ),
        }
    }

    /// Hands buffered messages to the listener in arrival order, stopping at
    /// the first gap.
    fn drain(&mut self) {
        while let Some(msg) = self.pending.remove(&self.next_dispatch) {
            self.next_dispatch += 1;
            self.deps.listener.on_message(msg);
        }
    }

    fn send(&mut self, msg: BackMsg) {
        let link = match (&self.link, self.state) {
            (Some(link), ConnectionState::Connected) => link,
            _ => {
                warn!(
                    target = "tideline::connection",
                    kind = msg.label(),
                    state = %self.state,
                    "cannot send while not connected; dropping message"
                );
                return;
            }
        };
        match encode_back_msg(&msg) {
            Ok(frame) => {
                if let Err(err) = link.send(frame) {
                    warn!(target = "tideline::connection", kind = msg.label(), error = %err, "send failed");
                }
            }
            Err(err) => {
                warn!(target = "tideline::connection", kind = msg.label(), error = %err, "encode failed")
            }
        }
    }

    fn server_base(&self) -> &Url {
        &self.deps.servers[self.server_index]
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn cancel_probe(&mut self) {
        if let Some(cancel) = self.probe_cancel.take() {
            cancel.cancel();
        }
    }

    /// Drops the open or opening link. Messages still waiting on a fetch
    /// belong to the old link and are discarded with it.
    fn close_link(&mut self) {
        self.cancel_timer();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        if self.link.take().is_some() {
            debug!(target = "tideline::connection", conn_id = self.conn_id, "link closed");
        }
        self.pending.clear();
        self.next_dispatch = self.next_seq;
    }

    fn teardown(&mut self) {
        self.close_link();
        self.cancel_probe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, NoFetch, PayloadFetcher};
    use crate::protocol::{
        ForwardMsgBody, ForwardMsgMetadata, PageInfo, decode_back_msg, encode_forward_msg,
    };
    use crate::session::SessionEvent;
    use crate::session::prober::{HostConfig, ProbeFailure};
    use crate::transport::mock::{MockBehavior, MockConnector, MockServer};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockProbeBackend {
        healthy: AtomicBool,
    }

    impl MockProbeBackend {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl ProbeBackend for MockProbeBackend {
        async fn health(&self, _base: &Url) -> Result<(), ProbeFailure> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProbeFailure::NoResponse)
            }
        }

        async fn host_config(&self, _base: &Url) -> Result<HostConfig, ProbeFailure> {
            Ok(HostConfig::default())
        }
    }

    /// Serves payloads after a per-hash delay.
    #[derive(Default)]
    struct SlowFetcher {
        payloads: Mutex<HashMap<String, (Bytes, Duration)>>,
    }

    #[async_trait]
    impl PayloadFetcher for SlowFetcher {
        async fn fetch(&self, _base: &Url, hash: &str) -> Result<Bytes, CacheError> {
            let entry = self.payloads.lock().get(hash).cloned();
            let (payload, delay) = entry.ok_or_else(|| CacheError::Unavailable(hash.into()))?;
            tokio::time::sleep(delay).await;
            Ok(payload)
        }
    }

    struct Harness {
        connection: Connection,
        connector: Arc<MockConnector>,
        server: MockServer,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        context: SessionContext,
    }

    fn harness_with(fetcher: Arc<dyn PayloadFetcher>, probe: Arc<MockProbeBackend>) -> Harness {
        let (connector, server) = MockConnector::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let context = SessionContext::new(Some("host-token".into()));
        let deps = ConnectionDeps {
            servers: vec![Url::parse("http://127.0.0.1:8501/").unwrap()],
            connect_timeout: Duration::from_secs(15),
            probe: ProbeConfig::default(),
            connector: connector.clone(),
            probe_backend: probe,
            cache: Arc::new(MessageCache::new(fetcher)),
            context: context.clone(),
            listener: Arc::new(events_tx),
        };
        Harness {
            connection: Connection::spawn(deps),
            connector,
            server,
            events,
            context,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(NoFetch), MockProbeBackend::healthy())
    }

    async fn wait_for(connection: &Connection, state: ConnectionState) {
        let mut rx = connection.subscribe();
        rx.wait_for(|current| *current == state)
            .await
            .expect("state channel open");
    }

    fn page(hash: &str, query: &str, cacheable: bool) -> ForwardMsg {
        ForwardMsg::new(
            hash,
            ForwardMsgBody::PageInfoChanged(PageInfo {
                query_string: query.into(),
            }),
        )
        .with_metadata(ForwardMsgMetadata {
            cacheable,
            delta_path: Vec::new(),
        })
    }

    fn frame(msg: &ForwardMsg) -> Bytes {
        encode_forward_msg(msg).unwrap()
    }

    fn query_of(msg: &ForwardMsg) -> String {
        match &msg.body {
            ForwardMsgBody::PageInfoChanged(info) => info.query_string.clone(),
            other => panic!("unexpected body {other:?}"),
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> ForwardMsg {
        loop {
            match events.recv().await.expect("listener alive") {
                SessionEvent::Message(msg) => return msg,
                _ => continue,
            }
        }
    }

    /// Collects reported states up to and including `last`.
    async fn states_until(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        last: ConnectionState,
    ) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        loop {
            if let SessionEvent::StateChanged { state, .. } =
                events.recv().await.expect("listener alive")
            {
                states.push(state);
                if state == last {
                    return states;
                }
            }
        }
    }

    fn undelivered(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<ForwardMsg> {
        let mut messages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Message(msg) = event {
                messages.push(msg);
            }
        }
        messages
    }

    #[tokio::test]
    async fn connects_and_delivers_messages() {
        let mut h = harness();
        let mut peer = h.server.accept().await.unwrap();
        assert_eq!(
            states_until(&mut h.events, ConnectionState::Connected).await,
            vec![
                ConnectionState::PingingServer,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert_eq!(
            peer.config.protocols,
            vec!["tideline".to_string(), "host-token".to_string()]
        );

        peer.push(frame(&page("h1", "a=1", false)));
        assert_eq!(query_of(&next_message(&mut h.events).await), "a=1");

        h.connection.send(BackMsg::AppHeartbeat);
        let sent = peer.recv().await.unwrap();
        assert_eq!(decode_back_msg(&sent).unwrap(), BackMsg::AppHeartbeat);
    }

    #[tokio::test]
    async fn failed_fetch_of_missed_reference_is_fatal() {
        let mut h = harness();
        let peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        peer.push(frame(&ForwardMsg::new(
            "ref",
            ForwardMsgBody::RefHash("not-cached".into()),
        )));
        wait_for(&h.connection, ConnectionState::DisconnectedForever).await;

        let mut fatal = None;
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::StateChanged {
                state: ConnectionState::DisconnectedForever,
                error,
            } = event
            {
                fatal = error;
            }
        }
        let fatal = fatal.expect("terminal state reported with an error");
        assert!(fatal.contains("failed to process a message from the server"));
        assert!(!h.connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_pending_across_reconnect_is_discarded() {
        let fetcher = Arc::new(SlowFetcher::default());
        fetcher.payloads.lock().insert(
            "late".into(),
            (frame(&page("late", "late=1", true)), Duration::from_secs(5)),
        );
        let mut h = harness_with(fetcher, MockProbeBackend::healthy());
        let first = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        first.push(frame(&ForwardMsg::new(
            "ref",
            ForwardMsgBody::RefHash("late".into()),
        )));
        first.close(Some("server restart"));

        let second = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;
        second.push(frame(&page("after", "after=1", false)));
        assert_eq!(query_of(&next_message(&mut h.events).await), "after=1");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(undelivered(&mut h.events).is_empty());
        assert!(h.connection.is_connected());
    }

    #[tokio::test]
    async fn reconnects_after_close_with_session_token() {
        let mut h = harness();
        let peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;
        h.context.set_last_session_id("session-7");

        peer.close(Some("server restart"));
        let second = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        assert_eq!(
            second.config.protocols,
            vec!["tideline".to_string(), "session-7".to_string()]
        );
        assert_eq!(h.connector.open_count(), 2);
        peer.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_returns_to_probing() {
        let mut h = harness();
        h.connector.set_behavior(MockBehavior::Hang);
        wait_for(&h.connection, ConnectionState::Connecting).await;

        tokio::time::sleep(Duration::from_secs(16)).await;
        h.connector.set_behavior(MockBehavior::Accept);
        let _peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        let mut timed_out = false;
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::StateChanged {
                state: ConnectionState::PingingServer,
                error: Some(error),
            } = event
            {
                timed_out |= error.contains("did not open within 15000 ms");
            }
        }
        assert!(timed_out);
        // The second attempt started before the switch and hung too.
        assert_eq!(h.connector.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_arrival_order_despite_fetch_latency() {
        let fetcher = Arc::new(SlowFetcher::default());
        let mut rng = StdRng::seed_from_u64(42);
        let mut expected = Vec::new();
        let mut frames = Vec::new();
        for i in 0..24 {
            let query = format!("n={i}");
            expected.push(query.clone());
            if rng.gen_bool(0.5) {
                let hash = format!("h{i}");
                let delay = Duration::from_millis(rng.gen_range(1..400));
                let full = page(&hash, &query, true);
                fetcher
                    .payloads
                    .lock()
                    .insert(hash.clone(), (frame(&full), delay));
                frames.push(frame(&ForwardMsg::new(
                    format!("ref{i}"),
                    ForwardMsgBody::RefHash(hash),
                )));
            } else {
                frames.push(frame(&page(&format!("p{i}"), &query, false)));
            }
        }

        let mut h = harness_with(fetcher, MockProbeBackend::healthy());
        let peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;
        for frame in frames {
            peer.push(frame);
        }

        let mut delivered = Vec::new();
        for _ in 0..expected.len() {
            delivered.push(query_of(&next_message(&mut h.events).await));
        }
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn undecodable_frame_is_fatal() {
        let mut h = harness();
        let peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        peer.push(Bytes::from_static(b"\xffgarbage"));
        wait_for(&h.connection, ConnectionState::DisconnectedForever).await;

        let fatal = std::iter::from_fn(|| h.events.try_recv().ok()).find_map(|event| match event {
            SessionEvent::StateChanged {
                state: ConnectionState::DisconnectedForever,
                error,
            } => Some(error),
            _ => None,
        });
        assert!(
            fatal
                .flatten()
                .is_some_and(|error| error.contains("failed to decode"))
        );
        peer.closed().await;
    }

    #[tokio::test]
    async fn send_while_probing_is_dropped() {
        let probe = Arc::new(MockProbeBackend {
            healthy: AtomicBool::new(false),
        });
        let mut h = harness_with(Arc::new(NoFetch), probe.clone());
        wait_for(&h.connection, ConnectionState::PingingServer).await;

        h.connection.send(BackMsg::StopScript);
        probe.healthy.store(true, Ordering::SeqCst);
        let mut peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        h.connection.send(BackMsg::ClearCache);
        let first = peer.recv().await.unwrap();
        assert_eq!(decode_back_msg(&first).unwrap(), BackMsg::ClearCache);
    }

    #[tokio::test]
    async fn disconnect_is_terminal() {
        let mut h = harness();
        let peer = h.server.accept().await.unwrap();
        wait_for(&h.connection, ConnectionState::Connected).await;

        h.connection.disconnect();
        wait_for(&h.connection, ConnectionState::DisconnectedForever).await;
        peer.closed().await;

        // Frames and close events after the fact change nothing.
        peer.push(frame(&page("late", "late=1", false)));
        peer.close(None);
        h.connection.send(BackMsg::AppHeartbeat);
        assert_eq!(h.connection.state(), ConnectionState::DisconnectedForever);
        assert!(
            std::iter::from_fn(|| h.events.try_recv().ok())
                .all(|event| !matches!(event, SessionEvent::Message(_)))
        );
        assert_eq!(h.connector.open_count(), 1);
    }
}
