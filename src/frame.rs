//! Frame assembly: turning a raw byte stream (or one datagram) into one
//! complete application-level message.
//!
//! Two framings exist. Header-delimited messages accumulate until the
//! blank-line separator plus however many body bytes the `Content-Length`
//! field announces. Envelope messages treat a single read as a whole
//! message, which callers on datagram or gateway paths rely on. A listener
//! that serves both picks per message with [`Framing::Detect`].

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::request::{looks_like_http, Method};

/// Matches the transfer size the upstream gateways use per read.
const READ_CHUNK: usize = 1024;

/// Framing strategy, selected per listener type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Accumulate to `\r\n\r\n`, then read `Content-Length` body bytes.
    /// A missing length field means zero body bytes.
    HeaderDelimited,
    /// One read is one complete message.
    Envelope,
    /// Inspect the first bytes and pick between the two.
    Detect,
}

/// Reads one complete message from `stream`.
///
/// Returns `Ok(None)` when the peer closes the stream before a complete
/// message arrives; the partial message is abandoned, not an error. One
/// message is assembled per read cycle: bytes past the frame end are
/// dropped, which callers replicate by issuing one request per connection.
pub async fn read_frame<S>(stream: &mut S, framing: Framing) -> io::Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut assembled: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let count = stream.read(&mut chunk).await?;
        if count == 0 {
            return Ok(None);
        }
        assembled.extend_from_slice(&chunk[..count]);

        let header_delimited = match framing {
            Framing::HeaderDelimited => true,
            Framing::Envelope => false,
            Framing::Detect => looks_like_http(&String::from_utf8_lossy(&assembled)),
        };
        if !header_delimited {
            return Ok(Some(String::from_utf8_lossy(&assembled).into_owned()));
        }
        if let Some(end) = frame_end(&assembled) {
            if assembled.len() >= end {
                return Ok(Some(String::from_utf8_lossy(&assembled[..end]).into_owned()));
            }
        }
    }
}

/// Position one past the last byte of a header-delimited message, or `None`
/// while the header block is still incomplete.
pub fn frame_end(buffer: &[u8]) -> Option<usize> {
    let header_end = find_blank_line(buffer)?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let mut content_length = 0;
    for line in headers.split("\r\n") {
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().unwrap_or(0);
            break;
        }
    }
    Some(header_end + 4 + content_length)
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Wraps a payload in the fixed success response shape the header-delimited
/// peers expect. `Content-Length` counts UTF-8 bytes.
pub fn encode_http_response(payload: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    )
}

/// Encodes an outbound header-delimited request for the primary or for a
/// replica's backup endpoint.
pub fn encode_http_request(method: Method, path: &str, body: Option<&str>) -> String {
    let body = body.unwrap_or("");
    format!(
        "{} {} HTTP/1.1\r\nContent-Type: application/json\r\nAccept: application/json\r\nContent-Length: {}\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    )
}

/// Extracts the body of a header-delimited message.
pub fn http_body(message: &str) -> Option<&str> {
    message.find("\r\n\r\n").map(|idx| &message[idx + 4..])
}
