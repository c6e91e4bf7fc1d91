//! Session close directive.
//!
//! When a device reports that an SSH session ended, the broker dials the
//! device back and writes a bare HTTP request for `/ssh/close/<uid>` into
//! the fresh stream. The device's local handler tears that session down.

/// Path prefix of the close directive.
pub const CLOSE_PATH_PREFIX: &str = "/ssh/close/";

/// Renders the directive for session `uid`.
pub fn close_session_request(uid: &str) -> Vec<u8> {
    format!("GET {CLOSE_PATH_PREFIX}{uid} HTTP/1.1\r\nHost: revdialconn\r\n\r\n").into_bytes()
}

/// Extracts the session uid from a directive, if `data` starts with one.
pub fn parse_close_directive(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let request_line = text.split("\r\n").next()?;

    let mut parts = request_line.split(' ');
    if parts.next()? != "GET" {
        return None;
    }
    let uid = parts.next()?.strip_prefix(CLOSE_PATH_PREFIX)?;
    if uid.is_empty() || uid.contains('/') {
        return None;
    }
    Some(uid.to_owned())
}
