//! HTTP request-head peeking and canned responses.
//!
//! The proxy parses just enough of an inbound connection to route it:
//! the request line and headers. Bytes are accumulated into a buffer the
//! caller later flushes to the backend, so nothing read here is lost.
//! After dispatch the connection is a transparent byte splice; no
//! message framing is tracked.
//!
//! Parsing is incremental: read, try `httparse`, repeat until the head
//! is complete or a bound (bytes, time) is hit.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Default limit on how long to wait for a complete request head.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit on request head size.
pub const DEFAULT_MAX_PEEK_BYTES: usize = 8192;

const MAX_HEADERS: usize = 64;

/// Result of peeking at a connection's request head.
#[derive(Debug)]
pub enum PeekResult {
    /// Head complete and parsed.
    Head(RequestHead),
    /// Bytes are not a valid HTTP request.
    Malformed,
    /// Peer closed, or the head outgrew the byte bound, before the head
    /// was complete.
    Incomplete,
    /// No complete head within the time bound.
    Timeout,
    /// I/O error during read.
    IoError(String),
}

/// The parts of a request head the proxy routes on.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Raw request target from the request line.
    pub path: String,
    /// Raw `Host` header value, if present.
    pub host: Option<String>,
    /// Length of the head (request line + headers + blank line) within
    /// the peek buffer.
    pub head_len: usize,
}

impl RequestHead {
    /// `Host` header value with any `:port` suffix stripped.
    pub fn host_name(&self) -> Option<&str> {
        self.host.as_deref().map(super::router::strip_host_port)
    }
}

/// Configuration for request-head peeking.
#[derive(Debug, Clone)]
pub struct PeekConfig {
    /// Maximum time to wait for a complete head.
    pub timeout: Duration,
    /// Maximum bytes of head to accept.
    pub max_bytes: usize,
}

impl Default for PeekConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PEEK_TIMEOUT,
            max_bytes: DEFAULT_MAX_PEEK_BYTES,
        }
    }
}

/// Incremental request-head reader.
pub struct HeadPeeker {
    config: PeekConfig,
}

impl HeadPeeker {
    pub fn new() -> Self {
        Self {
            config: PeekConfig::default(),
        }
    }

    pub fn with_config(config: PeekConfig) -> Self {
        Self { config }
    }

    /// Peek a request head from `stream`, accumulating everything read
    /// into `buffer`. The caller owns the buffered bytes; they are the
    /// pre-connect write queue for the backend.
    pub async fn peek<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> PeekResult {
        buffer.clear();

        match timeout(self.config.timeout, self.read_head(stream, buffer)).await {
            Ok(result) => result,
            Err(_) => PeekResult::Timeout,
        }
    }

    async fn read_head<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> PeekResult {
        let mut chunk = [0u8; 2048];

        loop {
            match parse_head(buffer) {
                Ok(Some(head)) => return PeekResult::Head(head),
                Ok(None) => {}
                Err(_) => return PeekResult::Malformed,
            }

            if buffer.len() >= self.config.max_bytes {
                return PeekResult::Incomplete;
            }

            let want = chunk.len().min(self.config.max_bytes - buffer.len());
            match stream.read(&mut chunk[..want]).await {
                Ok(0) => return PeekResult::Incomplete,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => return PeekResult::IoError(e.to_string()),
            }
        }
    }
}

impl Default for HeadPeeker {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a request head from a buffer; `None` when more bytes are
/// needed, an error when the bytes are not HTTP.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(head_len) => {
            let path = req.path.unwrap_or("/").to_string();
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .map(|h| String::from_utf8_lossy(h.value).into_owned());

            Ok(Some(RequestHead {
                path,
                host,
                head_len,
            }))
        }
    }
}

/// Substitute the literal `Host:` header line once, as the buffered
/// bytes are flushed toward a scheme-qualified backend.
pub fn rewrite_host(buf: &[u8], old_host: &str, new_host: &str) -> Vec<u8> {
    let needle = format!("\r\nHost: {old_host}\r\n");
    let replacement = format!("\r\nHost: {new_host}\r\n");

    match find(buf, needle.as_bytes()) {
        Some(at) => {
            let mut out = Vec::with_capacity(buf.len() + replacement.len());
            out.extend_from_slice(&buf[..at]);
            out.extend_from_slice(replacement.as_bytes());
            out.extend_from_slice(&buf[at + needle.len()..]);
            out
        }
        None => buf.to_vec(),
    }
}

/// Remove any `Referer` header line from the head section of a buffered
/// request; it would leak the original origin to a rewritten backend.
pub fn strip_referer(buf: &[u8], head_len: usize) -> Vec<u8> {
    let head_len = head_len.min(buf.len());
    let (head, body) = buf.split_at(head_len);

    let mut out = Vec::with_capacity(buf.len());
    let mut rest = head;
    while let Some(eol) = find(rest, b"\r\n") {
        let line = &rest[..eol + 2];
        let name = line.split(|&b| b == b':').next().unwrap_or(line);
        if !name.eq_ignore_ascii_case(b"referer") {
            out.extend_from_slice(line);
        }
        rest = &rest[eol + 2..];
    }
    out.extend_from_slice(rest);
    out.extend_from_slice(body);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Write a full HTTP/1.1 response and nothing else; every canned
/// response closes the connection.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    phrase: &str,
    body: &[u8],
    extra_headers: &[(&str, String)],
) -> io::Result<()> {
    let mut response = format!("HTTP/1.1 {status} {phrase}\r\nConnection: close\r\n");

    if body.is_empty() {
        response.push_str("Content-Length: 0\r\n");
    } else {
        response.push_str("Content-Type: text/plain\r\n");
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }

    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);

    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// `400 Bad Request` for byte streams that are not valid HTTP.
pub async fn respond_bad_request<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    write_response(writer, 400, "Bad Request", b"invalid HTTP", &[]).await
}

/// `503 Service Unavailable` when no backend resolves.
pub async fn respond_unavailable<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    write_response(writer, 503, "Service Unavailable", b"service unavailable", &[]).await
}

/// `301` to the HTTPS sibling of a plain-text listener.
pub async fn respond_https_redirect<W: AsyncWrite + Unpin>(
    writer: &mut W,
    host: &str,
    path: &str,
) -> io::Result<()> {
    write_response(
        writer,
        301,
        "Moved Permanently",
        b"Redirect to https",
        &[("Location", format!("https://{host}{path}"))],
    )
    .await
}
