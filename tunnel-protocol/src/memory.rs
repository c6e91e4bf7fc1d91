//! # In-Memory Frame Pipe
//!
//! A pair of connected frame endpoints backed by unbounded channels. What
//! one end writes, the other end reads, one message at a time. Used to
//! drive adapters, dialers and lifecycles without opening sockets.

use crate::adapter::WsConnAdapter;
use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

type FrameTx = mpsc::UnboundedSender<io::Result<Bytes>>;
type FrameRx = mpsc::UnboundedReceiver<io::Result<Bytes>>;

/// Receiving side of one pipe end.
pub struct MemoryReader {
    rx: FrameRx,
}

/// Sending side of one pipe end.
pub struct MemoryWriter {
    tx: Option<FrameTx>,
}

/// One end of a [`pipe`].
pub struct MemoryEnd {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

/// Creates two connected ends.
pub fn pipe() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = MemoryEnd {
        reader: MemoryReader { rx: a_rx },
        writer: MemoryWriter { tx: Some(a_tx) },
    };
    let b = MemoryEnd {
        reader: MemoryReader { rx: b_rx },
        writer: MemoryWriter { tx: Some(b_tx) },
    };
    (a, b)
}

impl MemoryEnd {
    /// Wraps this end in a byte-stream adapter.
    pub fn into_adapter(self) -> WsConnAdapter {
        WsConnAdapter::new(self.reader, self.writer)
    }
}

impl MemoryWriter {
    /// Makes the peer's next read fail with `kind`, simulating a broken
    /// transport.
    pub fn inject_error(&self, kind: io::ErrorKind) -> bool {
        match &self.tx {
            Some(tx) => tx
                .send(Err(io::Error::new(kind, "injected transport error")))
                .is_ok(),
            None => false,
        }
    }
}

impl Stream for MemoryReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Sink<Bytes> for MemoryWriter {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, payload: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "frame pipe closed"))?;
        tx.send(Ok(payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame pipe peer gone"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}
