use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace};

use super::{Connector, Link, LinkEvent, TransportError};

pub mod config;
use config::WebSocketConfig;

/// Opens session streams over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, config: &WebSocketConfig) -> Result<Link, TransportError> {
        let request = config.to_request()?;
        debug!(target = "tideline::transport", url = %request.uri(), "opening websocket");

        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|err| TransportError::Handshake(err.to_string()))?;

        // Create channels for bidirectional communication
        let (tx_out, rx_out) = mpsc::unbounded_channel::<Bytes>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(handle_websocket(ws_stream, rx_out, tx_in));

        Ok(Link::new(tx_out, rx_in))
    }
}

/// Pumps frames between the socket and the link channels until either side
/// goes away.
async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Bytes>,
    tx_in: mpsc::UnboundedSender<LinkEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx_out.recv().await {
            if ws_sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            _ = tx_in.closed() => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    trace!(target = "tideline::transport", bytes = data.len(), "frame received");
                    if tx_in.send(LinkEvent::Frame(Bytes::from(data))).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if tx_in.send(LinkEvent::Frame(Bytes::from(text.into_bytes()))).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    let _ = tx_in.send(LinkEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                Some(Err(err)) => {
                    let _ = tx_in.send(LinkEvent::Error(err.to_string()));
                    break;
                }
                None => {
                    let _ = tx_in.send(LinkEvent::Closed { reason: None });
                    break;
                }
            }
        }
    }

    send_task.abort();
    let _ = send_task.await;
}
