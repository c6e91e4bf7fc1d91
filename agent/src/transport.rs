//! # tungstenite Transport
//!
//! The device's end of the framed transport seam: outbound WebSocket
//! connections carrying the device UID header.

use crate::error::AgentError;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tunnel_protocol::{WsConnAdapter, DEVICE_UID_HEADER};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TungsteniteReader(SplitStream<Socket>);

pub struct TungsteniteWriter(SplitSink<Socket, Message>);

/// Opens a WebSocket to `url` as `device_uid`.
pub async fn connect(url: &str, device_uid: &str) -> Result<WsConnAdapter, AgentError> {
    let mut request = url.into_client_request()?;
    let uid = HeaderValue::from_str(device_uid)
        .map_err(|_| AgentError::InvalidDeviceUid(device_uid.to_owned()))?;
    request.headers_mut().insert(DEVICE_UID_HEADER, uid);

    let (socket, _) = connect_async(request).await?;
    let (sink, stream) = socket.split();
    Ok(WsConnAdapter::new(
        TungsteniteReader(stream),
        TungsteniteWriter(sink),
    ))
}

impl Stream for TungsteniteReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(message) = ready!(self.0.poll_next_unpin(cx)) else {
                return Poll::Ready(None);
            };
            let frame = match message.map_err(io::Error::other) {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                Ok(Message::Close(_)) => None,
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => Some(Err(e)),
            };
            return Poll::Ready(frame);
        }
    }
}

impl Sink<Bytes> for TungsteniteWriter {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_ready_unpin(cx).map_err(io::Error::other)
    }

    fn start_send(mut self: Pin<&mut Self>, payload: Bytes) -> io::Result<()> {
        self.0
            .start_send_unpin(Message::Binary(payload.into()))
            .map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_flush_unpin(cx).map_err(io::Error::other)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_close_unpin(cx).map_err(io::Error::other)
    }
}
