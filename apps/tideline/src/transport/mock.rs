//! In-process connector for exercising the connection state machine without
//! sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connector, Link, LinkEvent, TransportError, WebSocketConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Accept,
    Refuse(String),
    /// Never completes the handshake.
    Hang,
}

pub struct MockConnector {
    behavior: Mutex<MockBehavior>,
    accepted: mpsc::UnboundedSender<MockPeer>,
    opened: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            behavior: Mutex::new(MockBehavior::Accept),
            accepted,
            opened: AtomicUsize::new(0),
        });
        (connector, MockServer { accepted: rx })
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of `open` calls seen, including refused and hanging ones.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, config: &WebSocketConfig) -> Result<Link, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        match behavior {
            MockBehavior::Accept => {
                let (tx_out, rx_out) = mpsc::unbounded_channel();
                let (tx_in, rx_in) = mpsc::unbounded_channel();
                let peer = MockPeer {
                    config: config.clone(),
                    to_client: tx_in,
                    from_client: rx_out,
                };
                self.accepted
                    .send(peer)
                    .map_err(|_| TransportError::Handshake("mock server dropped".into()))?;
                Ok(Link::new(tx_out, rx_in))
            }
            MockBehavior::Refuse(reason) => Err(TransportError::Handshake(reason)),
            MockBehavior::Hang => {
                futures_util::future::pending::<()>().await;
                Err(TransportError::Closed)
            }
        }
    }
}

/// Receives the server side of every link the connector accepts.
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockServer {
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.accepted.recv().await
    }
}

pub struct MockPeer {
    pub config: WebSocketConfig,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
}

impl MockPeer {
    pub fn push(&self, frame: impl Into<Bytes>) -> bool {
        self.to_client.send(LinkEvent::Frame(frame.into())).is_ok()
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self.to_client.send(LinkEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    pub fn fail(&self, message: &str) {
        let _ = self.to_client.send(LinkEvent::Error(message.to_string()));
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_client.recv().await
    }

    /// Resolves once the client has dropped its end of the link.
    pub async fn closed(&self) {
        self.to_client.closed().await
    }
}
