//! # Framed Transport Seam
//!
//! The broker and the agents speak WebSocket through different libraries
//! (axum on the server, tungstenite on devices). Both sides expose their
//! socket halves as a [`Stream`] of message payloads and a [`Sink`] of
//! them, so everything above this seam only deals in whole binary messages
//! and can be polled from `AsyncRead`/`AsyncWrite` impls.

use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;

/// The receiving half of a message-framed duplex transport.
///
/// Yields the payload of each complete message in order and ends once the
/// peer has closed the transport. Dropping a pending `next()` must not lose
/// a message.
pub trait FrameReader: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {}

impl<T> FrameReader for T where T: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {}

/// The sending half of a message-framed duplex transport.
///
/// Every item is sent as exactly one message. Closing the sink closes the
/// transport; later sends fail.
pub trait FrameWriter: Sink<Bytes, Error = io::Error> + Send + Unpin + 'static {}

impl<T> FrameWriter for T where T: Sink<Bytes, Error = io::Error> + Send + Unpin + 'static {}
