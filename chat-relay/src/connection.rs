//! Connection handles: the duplex message stream a session owns.
//!
//! A [`Connection`] splits into a write half ([`MessageSink`]) and a read half
//! ([`MessageSource`]) so the session can drive both directions from separate
//! tasks. [`WsConnection`] adapts an upgraded axum websocket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};

use crate::{
    error::{ReceiveError, TransportError},
    message::{self, ChatMessage},
};

pub trait Connection: Send + 'static {
    type Sink: MessageSink;
    type Source: MessageSource;

    fn split(self) -> (Self::Sink, Self::Source);
}

#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, message: &ChatMessage) -> Result<(), TransportError>;

    /// Closes the write half. Errors are not interesting at this point.
    async fn close(&mut self);
}

#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Waits for the next chat message. A clean close by the peer surfaces as
    /// [`TransportError::Closed`].
    async fn receive(&mut self) -> Result<ChatMessage, ReceiveError>;
}

pub struct WsConnection {
    socket: WebSocket,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Connection for WsConnection {
    type Sink = WsSink;
    type Source = WsSource;

    fn split(self) -> (WsSink, WsSource) {
        let (sink, stream) = self.socket.split();
        (WsSink { sink }, WsSource { stream })
    }
}

pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: &ChatMessage) -> Result<(), TransportError> {
        let text = message::encode_text(message)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(TransportError::io)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

pub struct WsSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn receive(&mut self) -> Result<ChatMessage, ReceiveError> {
        loop {
            let frame = match self.stream.next().await {
                Some(frame) => frame.map_err(TransportError::io)?,
                None => return Err(TransportError::Closed.into()),
            };

            match frame {
                Message::Text(text) => return Ok(message::decode(text.as_bytes())?),
                Message::Binary(bytes) => return Ok(message::decode(&bytes)?),
                Message::Close(_) => return Err(TransportError::Closed.into()),
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}
