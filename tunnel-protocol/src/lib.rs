//! # Tunnel Protocol
//!
//! Shared vocabulary between the broker and the device agents:
//! - [`frame`]: the message-framed transport seam both sides plug into
//! - [`adapter`]: presents a framed transport as a continuous byte stream
//! - [`message`]: control messages written over a device connection
//! - [`directive`]: the out-of-band session close directive
//! - [`memory`]: in-process frame pipes
//!
//! Any change here must be understood by both the broker and the agents,
//! since they are deployed independently.

pub mod adapter;
pub mod directive;
pub mod frame;
pub mod memory;
pub mod message;

pub use adapter::{RevdialAddr, WsConnAdapter};
pub use directive::{close_session_request, parse_close_directive};
pub use frame::{FrameReader, FrameWriter};
pub use message::{control_lines, ControlMessage, MAX_CONTROL_LINE};

/// Header carrying the device UID on every device-initiated connection.
pub const DEVICE_UID_HEADER: &str = "X-Device-UID";

/// Header carrying the public URL address on bridged HTTP requests.
pub const PUBLIC_URL_ADDRESS_HEADER: &str = "X-Public-URL-Address";

/// Path the device opens its persistent connection on.
pub const CONNECTION_PATH: &str = "/ssh/connection";

/// Path the device opens pickup connections on, in answer to `conn-ready`.
pub const DIALER_PATH: &str = "/ssh/revdial";

/// Query parameter identifying which pending dial a pickup belongs to.
pub const DIAL_QUERY_PARAM: &str = "revdial.dialer";
