//! # Byte-Stream Adapter
//!
//! Wraps a message-framed transport ([`FrameReader`] + [`FrameWriter`]) and
//! exposes connection-style `read`/`write`/`close` with deadline and address
//! accessors, so code that expects a continuous byte stream never sees
//! message boundaries. The same semantics are available through tokio's
//! [`AsyncRead`]/[`AsyncWrite`], so the adapter plugs into `tokio::io::copy`
//! and codecs.
//!
//! ## Semantics
//! - **Reads** are serialized by a read lock. A message is streamed out
//!   across as many reads as the caller's buffer requires; an exhausted or
//!   empty message transparently pulls the next one. `Ok(0)` only means the
//!   transport itself closed.
//! - **Writes** are serialized by an independent write lock; each call sends
//!   exactly one message.
//! - **Close** is a no-op, and so is `poll_shutdown`. Teardown belongs to
//!   whoever owns the transport and goes through [`WsConnAdapter::shutdown`].
//! - **Deadlines** are not enforced: the read deadline is ignored and the
//!   write deadline only synchronizes with in-flight writers. Callers that
//!   need timeouts wrap operations in `tokio::time::timeout` or a
//!   cancellation token.

use crate::frame::{FrameReader, FrameWriter};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;

/// Placeholder address: the transport rides over HTTP, so there is no
/// meaningful socket address to report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevdialAddr;

impl RevdialAddr {
    pub fn network(&self) -> &'static str {
        "revdial"
    }
}

impl fmt::Display for RevdialAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("revdialconn")
    }
}

struct ReadState {
    frames: Box<dyn FrameReader>,
    /// Unread remainder of the current message.
    current: Bytes,
}

impl ReadState {
    /// Fills `buf` from the current message, pulling the next one when it
    /// is used up. Transport errors are returned as-is; nothing is retried.
    fn poll_read_into(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                buf.put_slice(&self.current.split_to(n));
                return Poll::Ready(Ok(()));
            }

            // End of this message: more will probably come, so fetch the
            // next one instead of reporting end-of-stream.
            match ready!(self.frames.poll_next_unpin(cx)) {
                Some(Ok(frame)) => self.current = frame,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Byte-stream view over a framed transport.
pub struct WsConnAdapter {
    reader: Mutex<ReadState>,
    writer: Mutex<Box<dyn FrameWriter>>,
}

impl WsConnAdapter {
    pub fn new<R: FrameReader, W: FrameWriter>(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(ReadState {
                frames: Box::new(reader),
                current: Bytes::new(),
            }),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Reads up to `buf.len()` bytes, pulling new messages as needed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.reader.lock().await;
        let mut buf = ReadBuf::new(buf);
        poll_fn(|cx| state.poll_read_into(cx, &mut buf)).await?;
        Ok(buf.filled().len())
    }

    /// Sends `buf` as one complete message.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.send(Bytes::copy_from_slice(buf)).await?;
        Ok(buf.len())
    }

    /// Intentionally does nothing; see [`WsConnAdapter::shutdown`].
    pub async fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// Closes the underlying transport. Reserved for the transport's owner.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.close().await
    }

    /// Poll form of [`WsConnAdapter::shutdown`], for owners that wrap the
    /// adapter in their own `AsyncWrite`.
    pub fn poll_shutdown_transport(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.writer.get_mut().poll_close_unpin(cx)
    }

    pub async fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline).await?;
        self.set_write_deadline(deadline).await
    }

    /// No-op: the transport has no per-read timeout.
    pub async fn set_read_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    /// Waits for any in-flight write, otherwise a no-op.
    pub async fn set_write_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        let _writer = self.writer.lock().await;
        Ok(())
    }

    pub fn local_addr(&self) -> RevdialAddr {
        RevdialAddr
    }

    pub fn remote_addr(&self) -> RevdialAddr {
        RevdialAddr
    }
}

// ─── tokio I/O ──────────────────────────────────────────────────

impl AsyncRead for WsConnAdapter {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().reader.get_mut().poll_read_into(cx, buf)
    }
}

impl AsyncWrite for WsConnAdapter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let writer = self.get_mut().writer.get_mut();
        ready!(writer.poll_ready_unpin(cx))?;
        writer.start_send_unpin(Bytes::copy_from_slice(buf))?;
        // Push the message out now; a flush left pending finishes on the
        // next poll.
        if let Poll::Ready(Err(e)) = writer.poll_flush_unpin(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.get_mut().poll_flush_unpin(cx)
    }

    /// Flushes without closing, matching [`WsConnAdapter::close`].
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
