//! # Virtual Session Stream
//!
//! A logical channel obtained from a dial. It owns its own pickup transport
//! and holds a read-only back-reference to the parent device connection's
//! shutdown token: once the parent starts closing, every read and write
//! fails with [`io::ErrorKind::ConnectionAborted`] instead of hanging.
//!
//! Besides the `&self` methods, the stream implements tokio's
//! [`AsyncRead`]/[`AsyncWrite`] by forwarding to the transport after
//! checking the parent. `poll_shutdown` closes the stream's own transport.

use crate::error::BrokerError;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tunnel_protocol::{RevdialAddr, WsConnAdapter};

pub struct VirtualStream {
    session_id: String,
    device_uid: String,
    transport: WsConnAdapter,
    parent: CancellationToken,
    /// Registers the poll-based I/O for the parent's cancellation.
    parent_closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl VirtualStream {
    pub(crate) fn new(
        session_id: String,
        device_uid: String,
        transport: WsConnAdapter,
        parent: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            device_uid,
            transport,
            parent_closed: Box::pin(parent.clone().cancelled_owned()),
            parent,
        }
    }

    /// Identifier of the dial that produced this stream.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn device_uid(&self) -> &str {
        &self.device_uid
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.parent.is_cancelled() {
            return Err(parent_closed());
        }
        tokio::select! {
            biased;
            _ = self.parent.cancelled() => Err(parent_closed()),
            read = self.transport.read(buf) => read,
        }
    }

    /// Sends `buf` as one message.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.parent.is_cancelled() {
            return Err(parent_closed());
        }
        tokio::select! {
            biased;
            _ = self.parent.cancelled() => Err(parent_closed()),
            written = self.transport.write(buf) => written,
        }
    }

    /// Closes this stream's transport. The parent connection is untouched.
    pub async fn close(&self) -> io::Result<()> {
        self.transport.shutdown().await
    }

    pub fn local_addr(&self) -> RevdialAddr {
        self.transport.local_addr()
    }

    pub fn remote_addr(&self) -> RevdialAddr {
        self.transport.remote_addr()
    }

    fn poll_parent(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        match self.parent_closed.as_mut().poll(cx) {
            Poll::Ready(()) => Err(parent_closed()),
            Poll::Pending => Ok(()),
        }
    }
}

// ─── tokio I/O ──────────────────────────────────────────────────

impl AsyncRead for VirtualStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_parent(cx)?;
        Pin::new(&mut this.transport).poll_read(cx, buf)
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.poll_parent(cx)?;
        Pin::new(&mut this.transport).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_parent(cx)?;
        Pin::new(&mut this.transport).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().transport.poll_shutdown_transport(cx)
    }
}

impl fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualStream")
            .field("session_id", &self.session_id)
            .field("device_uid", &self.device_uid)
            .field("parent_closed", &self.parent.is_cancelled())
            .finish()
    }
}

fn parent_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, BrokerError::ParentClosed)
}
