//! Socket transport seam.
//!
//! The connection manager only sees a [`Socket`]: a sender for outbound text
//! frames and a receiver of [`SocketEvent`]s. Dropping the socket closes it.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// Transport-level error. The socket may still be open.
    Error(String),
    Closed(Option<String>),
}

/// One open socket.
#[derive(Debug)]
pub struct Socket {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Socket {
    /// Pair of a socket and the far ends of its channels.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<SocketEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            outbound_rx,
            inbound_tx,
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Socket>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Socket> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        let (mut writer, mut reader) = stream.split();
        let (socket, mut outbound_rx, inbound_tx) = Socket::pair();
        let endpoint = url.to_string();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    warn!("websocket write error: {}", error);
                    return;
                }
            }
            let _ = writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => SocketEvent::Text(text.as_str().to_owned()),
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", endpoint, payload.len());
                        continue;
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|frame| frame.reason.to_string());
                        let _ = inbound_tx.send(SocketEvent::Closed(reason));
                        return;
                    }
                    Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => continue,
                    Err(error) => {
                        let _ = inbound_tx.send(SocketEvent::Error(error.to_string()));
                        break;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(SocketEvent::Closed(None));
        });

        Ok(socket)
    }
}
