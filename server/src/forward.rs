//! # Public URL Bridging
//!
//! `ANY /ssh/http` forwards a browser request to a device's local web
//! server through a virtual stream.
//!
//! ## Flow
//! 1. Resolve `X-Public-URL-Address` to a device; 403 unless it has a public URL
//! 2. Dial the device
//! 3. Write the request as HTTP/1.0 with `Connection: close`, so the device
//!    answers with an unchunked body
//! 4. Parse the response head and stream the body back: exactly
//!    `Content-Length` bytes when the device sent one, otherwise everything
//!    up to end-of-stream

use crate::error::{BrokerError, BrokerResult};
use crate::state::AppState;
use crate::stream::VirtualStream;
use axum::{
    body::{self, Body},
    extract::{Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::AsyncReadExt;
use tracing::debug;
use tunnel_protocol::PUBLIC_URL_ADDRESS_HEADER;

const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;
const MAX_RESPONSE_HEAD: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub async fn http_handler(State(state): State<AppState>, request: Request) -> BrokerResult<Response> {
    let address = request
        .headers()
        .get(PUBLIC_URL_ADDRESS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::BadRequest(format!("missing {PUBLIC_URL_ADDRESS_HEADER} header")))?
        .to_owned();

    let device = state.resolver.resolve(&address).await?;
    if !device.public_url {
        return Err(BrokerError::PublicUrlDisabled(address));
    }

    let (parts, body) = request.into_parts();
    let body = body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| BrokerError::BadRequest(format!("unreadable request body: {e}")))?;

    let stream = state.dialer.dial(&device.uid).await?;
    debug!(device = %device.uid, address = %address, "bridging http request");

    match forward(&stream, &parts, body).await {
        Ok((head, rest)) => build_response(&parts.method, &head, rest, stream),
        Err(e) => {
            let _ = stream.close().await;
            Err(e)
        }
    }
}

async fn forward(stream: &VirtualStream, parts: &Parts, body: Bytes) -> BrokerResult<(Bytes, Bytes)> {
    stream.write(&encode_request(parts, body.len())).await?;
    if !body.is_empty() {
        stream.write(&body).await?;
    }
    Ok(read_response_head(stream).await?)
}

/// Serializes the request line and headers for the device.
fn encode_request(parts: &Parts, content_length: usize) -> Vec<u8> {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = format!("{} {} HTTP/1.0\r\n", parts.method, target).into_bytes();
    for (name, value) in &parts.headers {
        // The body was buffered, so its length is written below.
        if is_hop_by_hop(name.as_str()) || name == header::CONTENT_LENGTH {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if content_length > 0 {
        head.extend_from_slice(format!("Content-Length: {content_length}\r\n").as_bytes());
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

/// Reads until the end of the response head. Returns the head and whatever
/// body bytes arrived with it.
async fn read_response_head(stream: &VirtualStream) -> io::Result<(Bytes, Bytes)> {
    let mut buffer = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        if let Some(end) = find_head_end(&buffer) {
            let head = buffer.split_to(end + 4).freeze();
            return Ok((head, buffer.freeze()));
        }
        if buffer.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device closed before sending a response",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    content_length: Option<u64>,
}

impl ResponseHead {
    /// Number of body bytes to relay back for a `method` request.
    fn body_limit(&self, method: &Method) -> u64 {
        let bodyless = *method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED;
        if bodyless {
            0
        } else {
            self.content_length.unwrap_or(u64::MAX)
        }
    }
}

fn parse_response_head(head: &[u8]) -> BrokerResult<ResponseHead> {
    let malformed = || BrokerError::Transport(io::Error::new(io::ErrorKind::InvalidData, "malformed response head"));

    let text = std::str::from_utf8(head).map_err(|_| malformed())?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or_else(malformed)?;
    let mut fields = status_line.split_whitespace();
    if !fields.next().is_some_and(|v| v.starts_with("HTTP/")) {
        return Err(malformed());
    }
    let status = fields
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(malformed)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(malformed)?;
        if is_hop_by_hop(name.trim()) {
            continue;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| malformed())?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| malformed())?;
        if name == header::CONTENT_LENGTH {
            let length = value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(malformed)?;
            if content_length.replace(length).is_some_and(|seen| seen != length) {
                return Err(malformed());
            }
            if headers.iter().any(|(n, _)| *n == header::CONTENT_LENGTH) {
                continue;
            }
        }
        headers.push((name, value));
    }
    Ok(ResponseHead {
        status,
        headers,
        content_length,
    })
}

fn build_response(method: &Method, head: &[u8], rest: Bytes, stream: VirtualStream) -> BrokerResult<Response> {
    let head = parse_response_head(head)?;
    let limit = head.body_limit(method);

    // Bytes that arrived with the head count against the limit.
    let mut leftover = rest;
    leftover.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    let body = stream.take(limit - leftover.len() as u64);

    let first = (!leftover.is_empty()).then_some(leftover);
    let chunks = futures::stream::unfold(Some((body, first)), |state| async move {
        let (mut body, first) = state?;
        if let Some(chunk) = first {
            return Some((Ok(chunk), Some((body, None))));
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match body.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = body.into_inner().close().await;
                None
            }
            Ok(_) => Some((Ok(buf.freeze()), Some((body, None)))),
            Err(e) => {
                let _ = body.get_ref().close().await;
                Some((Err::<Bytes, io::Error>(e), None))
            }
        }
    });

    let mut response = Response::new(Body::from_stream(chunks));
    *response.status_mut() = head.status;
    let response_headers = response.headers_mut();
    for (name, value) in head.headers {
        response_headers.append(name, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(request: axum::http::Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn requests_are_downgraded_to_http_1_0() {
        let parts = parts(
            axum::http::Request::builder()
                .method(Method::POST)
                .uri("/ssh/http?page=2")
                .header("host", "demo.example.com")
                .header("connection", "keep-alive")
                .header("transfer-encoding", "chunked")
                .header("x-public-url-address", "demo")
                .body(())
                .unwrap(),
        );

        let encoded = String::from_utf8(encode_request(&parts, 5)).unwrap();
        assert!(encoded.starts_with("POST /ssh/http?page=2 HTTP/1.0\r\n"));
        assert!(encoded.contains("host: demo.example.com\r\n"));
        assert!(encoded.contains("x-public-url-address: demo\r\n"));
        assert!(encoded.contains("Content-Length: 5\r\n"));
        assert!(!encoded.contains("keep-alive"));
        assert!(!encoded.contains("chunked"));
        assert!(encoded.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn bodyless_requests_carry_no_content_length() {
        let parts = parts(axum::http::Request::builder().uri("/").body(()).unwrap());
        let encoded = String::from_utf8(encode_request(&parts, 0)).unwrap();
        assert_eq!(encoded, "GET / HTTP/1.0\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn response_heads_are_parsed_without_hop_headers() {
        let head = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\nConnection: close\r\n\r\n";
        let head = parse_response_head(head).unwrap();

        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.content_length, Some(9));
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[0].0, "content-type");
        assert_eq!(head.headers[0].1, "text/plain");
        assert_eq!(head.headers[1].0, "content-length");
        assert_eq!(head.headers[1].1, "9");
    }

    #[test]
    fn body_limit_follows_content_length() {
        let sized = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(sized.body_limit(&Method::GET), 5);
        assert_eq!(sized.body_limit(&Method::HEAD), 0);

        let unsized_head = parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(unsized_head.body_limit(&Method::GET), u64::MAX);

        let empty = parse_response_head(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(empty.body_limit(&Method::GET), 0);
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: five\r\n\r\n").is_err());

        let repeated = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(repeated.headers.len(), 1);
    }

    #[test]
    fn request_content_length_is_recomputed() {
        let parts = parts(
            axum::http::Request::builder()
                .method(Method::POST)
                .uri("/")
                .header("content-length", "999")
                .body(())
                .unwrap(),
        );
        let encoded = String::from_utf8(encode_request(&parts, 3)).unwrap();
        assert_eq!(encoded, "POST / HTTP/1.0\r\nContent-Length: 3\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn garbage_heads_are_rejected() {
        assert!(parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.0 abc\r\n\r\n").is_err());
        assert!(parse_response_head(b"HTTP/1.0 200 OK\r\nno-colon\r\n\r\n").is_err());
    }

    #[test]
    fn head_end_is_found_across_the_buffer() {
        assert_eq!(find_head_end(b"HTTP/1.0 200 OK\r\n\r\nbody"), Some(15));
        assert_eq!(find_head_end(b"HTTP/1.0 200 OK\r\n"), None);
    }
}
