//! # axum WebSocket Transport
//!
//! Plugs an upgraded axum [`WebSocket`] into the framed transport seam.
//! Binary and text messages both carry payload; ping/pong are answered by
//! axum and skipped here; a close frame ends the stream.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tunnel_protocol::WsConnAdapter;

pub struct WsReader(SplitStream<WebSocket>);

pub struct WsWriter(SplitSink<WebSocket, Message>);

/// Splits `socket` into its framed halves.
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader(stream), WsWriter(sink))
}

/// Wraps `socket` in a byte-stream adapter.
pub fn into_adapter(socket: WebSocket) -> WsConnAdapter {
    let (reader, writer) = split(socket);
    WsConnAdapter::new(reader, writer)
}

impl Stream for WsReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(message) = ready!(self.0.poll_next_unpin(cx)) else {
                return Poll::Ready(None);
            };
            let frame = match message.map_err(io::Error::other) {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(Message::Close(_)) => None,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => Some(Err(e)),
            };
            return Poll::Ready(frame);
        }
    }
}

impl Sink<Bytes> for WsWriter {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_ready_unpin(cx).map_err(io::Error::other)
    }

    fn start_send(mut self: Pin<&mut Self>, payload: Bytes) -> io::Result<()> {
        self.0
            .start_send_unpin(Message::Binary(payload))
            .map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_flush_unpin(cx).map_err(io::Error::other)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_close_unpin(cx).map_err(io::Error::other)
    }
}
