use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod websocket;

pub use websocket::WebSocketConnector;
pub use websocket::config::WebSocketConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),
    #[error("transport handshake failed: {0}")]
    Handshake(String),
    #[error("transport closed")]
    Closed,
}

/// What the remote end of a [`Link`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Bytes),
    Closed { reason: Option<String> },
    Error(String),
}

/// Outbound half of an open link. Dropping every sender closes the link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl LinkSender {
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// An open, framed, bidirectional connection to the server.
#[derive(Debug)]
pub struct Link {
    outbound: LinkSender,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound: LinkSender { tx: outbound },
            inbound,
        }
    }

    pub fn split(self) -> (LinkSender, mpsc::UnboundedReceiver<LinkEvent>) {
        (self.outbound, self.inbound)
    }
}

/// Opens links. The connection state machine owns exactly one link at a time
/// and replaces it on reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &WebSocketConfig) -> Result<Link, TransportError>;
}
