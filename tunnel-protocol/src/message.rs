//! # Control Messages
//!
//! The broker talks to a device over its persistent connection with
//! newline-terminated JSON objects tagged by `"command"`:
//!
//! ```text
//! {"command":"keep-alive"}
//! {"command":"conn-ready","connPath":"/ssh/revdial?revdial.dialer=…"}
//! ```
//!
//! Each message is written as its own frame, but readers go through the
//! byte-stream adapter, so [`control_lines`] re-splits them on `\n`.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Upper bound on a single control line.
pub const MAX_CONTROL_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Periodic liveness write from the broker; devices ignore it.
    KeepAlive,

    /// Asks the device to open a new connection on `conn_path`, which the
    /// broker hands to the dial waiting on it.
    ConnReady {
        #[serde(rename = "connPath")]
        conn_path: String,
    },

    /// Any command this build does not know about.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Serializes to one JSON line, including the trailing newline.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parses one line, with or without its trailing newline.
    pub fn decode(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line.strip_suffix(b"\n").unwrap_or(line))
    }
}

/// Splits a byte stream into control lines, rejecting any line longer
/// than [`MAX_CONTROL_LINE`].
pub fn control_lines<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_CONTROL_LINE))
}
