//! Framed duplex transport used by the connection pool.
//!
//! The pool only needs "send a text frame" and "receive the next text frame";
//! the WebSocket implementation is one `Connector`, tests plug in their own.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{MinerError, Result};

pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv/v1";

/// Write half of a link.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
    async fn close(&mut self);
}

/// Read half of a link. `None` means the peer closed it.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

/// A freshly opened link, split in two.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens new links.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(PUBSUB_URL)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link> {
        tracing::debug!(url = %self.url, "Opening WebSocket");
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| MinerError::Transport(format!("connect {}: {}", self.url, e)))?;
        let (write, read) = stream.split();
        Ok(Link {
            sink: Box::new(WsSink { write }),
            source: Box::new(WsSource { read }),
        })
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| MinerError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // tungstenite answers pings itself
                Ok(_) => continue,
                Err(e) => return Some(Err(MinerError::Transport(e.to_string()))),
            }
        }
    }
}
