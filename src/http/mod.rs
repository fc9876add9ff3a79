//! Minimal HTTP/1.1 plumbing for the proxy path
//!
//! Parses request/response heads off buffered streams, serializes them back
//! out, and frames bodies (Content-Length, chunked, or read-to-EOF) into
//! bounded chunks suitable for tunnel frames. Nothing here buffers a whole
//! body.

use crate::tunnel::MAX_PAYLOAD_SIZE;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// HTTP plumbing errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Header section too large")]
    TooLarge,

    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Upper bound on a head section (request line/status line + headers)
const MAX_HEAD_SIZE: usize = 32768;

/// Headers that terminate at each hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request metadata carried over the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// Response metadata carried over the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body
    Empty,
    /// Exactly this many bytes follow
    Length(u64),
    /// Chunked transfer coding
    Chunked,
    /// Body runs until the peer closes the stream (responses only)
    UntilEof,
}

/// Case-insensitive single-header lookup
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// True if the transfer-encoding names chunked
pub fn is_chunked(headers: &[(String, String)]) -> bool {
    header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Result<Option<u64>, HttpError> {
    match header(headers, "content-length") {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| HttpError::Malformed(format!("bad content-length: {}", v))),
        None => Ok(None),
    }
}

/// Body delimiting for a request head
pub fn request_body_kind(head: &RequestHead) -> Result<BodyKind, HttpError> {
    if is_chunked(&head.headers) {
        return Ok(BodyKind::Chunked);
    }
    match content_length(&head.headers)? {
        Some(0) | None => Ok(BodyKind::Empty),
        Some(n) => Ok(BodyKind::Length(n)),
    }
}

/// Body delimiting for a response head, given the request method
pub fn response_body_kind(
    method: &str,
    status: u16,
    headers: &[(String, String)],
) -> Result<BodyKind, HttpError> {
    if method.eq_ignore_ascii_case("HEAD") || status < 200 || status == 204 || status == 304 {
        return Ok(BodyKind::Empty);
    }
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyKind::Empty),
        Some(n) => Ok(BodyKind::Length(n)),
        None => Ok(BodyKind::UntilEof),
    }
}

/// Remove hop-by-hop headers, including any named by the connection header
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    let named: Vec<String> = header(headers, "connection")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();

    headers.retain(|(k, _)| {
        let k = k.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&k.as_str()) && !named.contains(&k)
    });
}

async fn read_head_line<R>(reader: &mut R, budget: &mut usize) -> Result<String, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(HttpError::UnexpectedEof);
    }
    *budget = budget.checked_sub(n).ok_or(HttpError::TooLarge)?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

async fn read_headers<R>(
    reader: &mut R,
    budget: &mut usize,
) -> Result<Vec<(String, String)>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = read_head_line(reader, budget).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header line: {}", line)))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
}

/// Read a request head off a public connection. Returns None on a clean
/// close between keep-alive requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_SIZE;

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    budget -= n.min(budget);

    let line = line.trim_end();
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("empty request line".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("request line missing target".to_string()))?;
    let version = parts.next().unwrap_or("HTTP/1.1");
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Malformed(format!("bad version: {}", version)));
    }

    let headers = read_headers(reader, &mut budget).await?;

    Ok(Some(RequestHead {
        method: method.to_string(),
        path: target.to_string(),
        headers,
    }))
}

/// Read a response head (client side, from the local server)
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_SIZE;

    let line = read_head_line(reader, &mut budget).await?;
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("empty status line".to_string()))?;
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Malformed(format!("bad version: {}", version)));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HttpError::Malformed(format!("bad status line: {}", line)))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_headers(reader, &mut budget).await?;

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Serialize a request head for the local server
pub fn encode_request_head(head: &RequestHead) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, head.path);
    for (name, value) in &head.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Serialize a response head for the public caller
pub fn encode_response_head(head: &ResponseHead) -> Vec<u8> {
    let reason = if head.reason.is_empty() {
        reason_phrase(head.status)
    } else {
        head.reason.as_str()
    };
    let mut out = format!("HTTP/1.1 {} {}\r\n", head.status, reason);
    for (name, value) in &head.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Canonical reason phrase for the statuses the relay emits itself
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Incremental body reader producing chunks no larger than a tunnel frame
/// payload. Single consumption; never buffers more than one chunk.
pub struct BodyReader<'a, R> {
    reader: &'a mut R,
    kind: BodyKind,
    remaining: u64,
    chunk_remaining: u64,
    done: bool,
}

impl<'a, R> BodyReader<'a, R>
where
    R: AsyncBufRead + AsyncRead + Unpin,
{
    pub fn new(reader: &'a mut R, kind: BodyKind) -> Self {
        let remaining = match kind {
            BodyKind::Length(n) => n,
            _ => 0,
        };
        Self {
            reader,
            kind,
            remaining,
            chunk_remaining: 0,
            done: matches!(kind, BodyKind::Empty),
        }
    }

    /// Next body chunk, or None once the body is complete
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.done {
            return Ok(None);
        }
        match self.kind {
            BodyKind::Empty => Ok(None),
            BodyKind::Length(_) => self.next_sized().await,
            BodyKind::Chunked => self.next_chunked().await,
            BodyKind::UntilEof => self.next_until_eof().await,
        }
    }

    async fn read_some(&mut self, want: usize) -> Result<Bytes, HttpError> {
        let mut buf = vec![0u8; want];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn next_sized(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.remaining == 0 {
            self.done = true;
            return Ok(None);
        }
        let want = self.remaining.min(MAX_PAYLOAD_SIZE as u64) as usize;
        let chunk = self.read_some(want).await?;
        self.remaining -= chunk.len() as u64;
        if self.remaining == 0 {
            self.done = true;
        }
        Ok(Some(chunk))
    }

    async fn next_chunked(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.chunk_remaining == 0 {
            let mut budget = MAX_HEAD_SIZE;
            let line = read_head_line(self.reader, &mut budget).await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_str, 16)
                .map_err(|_| HttpError::Malformed(format!("bad chunk size: {}", line)))?;
            if size == 0 {
                // Consume trailers up to the blank line
                loop {
                    let trailer = read_head_line(self.reader, &mut budget).await?;
                    if trailer.is_empty() {
                        break;
                    }
                }
                self.done = true;
                return Ok(None);
            }
            self.chunk_remaining = size;
        }

        let want = self.chunk_remaining.min(MAX_PAYLOAD_SIZE as u64) as usize;
        let chunk = self.read_some(want).await?;
        self.chunk_remaining -= chunk.len() as u64;
        if self.chunk_remaining == 0 {
            let mut crlf = [0u8; 2];
            self.reader.read_exact(&mut crlf).await?;
            if &crlf != b"\r\n" {
                return Err(HttpError::Malformed("missing chunk delimiter".to_string()));
            }
        }
        Ok(Some(chunk))
    }

    async fn next_until_eof(&mut self) -> Result<Option<Bytes>, HttpError> {
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Write one chunk in chunked transfer coding
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Terminate a chunked body
pub async fn finish_chunked<W>(writer: &mut W) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"0\r\n\r\n").await?;
    Ok(())
}
