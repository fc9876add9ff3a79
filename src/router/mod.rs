//! Request router
//!
//! Serves one public HTTP connection: parses requests of the form
//! `/<client-id>/<rest>`, resolves the ID to a live tunnel session, drives a
//! multiplexed exchange to completion, and relays the response back —
//! streamed, never whole-buffered. Every tunnel failure surfaces as an
//! explicit status to the public caller; nothing is silently swallowed.

use crate::http::{self, BodyKind, BodyReader, RequestHead, ResponseHead};
use crate::protocol::{RESPONSE_HEADER_TIMEOUT, STREAM_IDLE_TIMEOUT};
use crate::registry::ClientRegistry;
use crate::session::{ProxyStream, SessionHandle};
use crate::tunnel::TunnelError;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Whether the connection survives the exchange
enum Served {
    KeepAlive,
    Close,
}

/// Serve one accepted public connection until it closes
pub async fn serve_connection<S>(
    stream: S,
    registry: Arc<ClientRegistry>,
) -> Result<(), crate::Error>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let head = match http::read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!(error = %e, "Malformed public request");
                let _ = write_error(&mut write_half, 400, &e.to_string()).await;
                return Ok(());
            }
        };

        let wants_close = http::header(&head.headers, "connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        match handle_request(head, &mut reader, &mut write_half, &registry).await? {
            Served::KeepAlive if !wants_close => continue,
            _ => return Ok(()),
        }
    }
}

/// Split `/<client-id>/<rest>` into the ID and the path forwarded to the
/// private server. The forwarded path keeps its query string.
fn split_client_path(path: &str) -> Option<(&str, String)> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((id, rest)) => Some((id, format!("/{}", rest))),
        None => {
            // `/abc123` or `/abc123?q=1` map to the root of the private server
            match trimmed.split_once('?') {
                Some((id, query)) => Some((id, format!("/?{}", query))),
                None => Some((trimmed, "/".to_string())),
            }
        }
    }
}

/// Resolve a client ID, retrying once when the first resolution yields a
/// session that is verified dead.
async fn resolve_session(registry: &ClientRegistry, client_id: &str) -> Option<SessionHandle> {
    match registry.resolve(client_id).await {
        Some(session) if session.is_active() => Some(session),
        Some(_) => match registry.resolve(client_id).await {
            Some(session) if session.is_active() => Some(session),
            _ => None,
        },
        None => None,
    }
}

async fn handle_request<S>(
    head: RequestHead,
    reader: &mut BufReader<ReadHalf<S>>,
    writer: &mut WriteHalf<S>,
    registry: &Arc<ClientRegistry>,
) -> Result<Served, crate::Error>
where
    S: AsyncRead + AsyncWrite,
{
    let Some((client_id, rest)) = split_client_path(&head.path) else {
        write_error(writer, 404, "client not found").await?;
        return Ok(Served::Close);
    };

    let Some(session) = resolve_session(registry, client_id).await else {
        debug!(client_id, "No active session for public request");
        write_error(writer, 404, "client not found").await?;
        return Ok(Served::Close);
    };

    // Rewrite the head for the private server: strip the ID prefix, drop
    // hop-by-hop headers, keep the chunked marker so the client re-frames
    // the body on its side.
    let body_kind = match http::request_body_kind(&head) {
        Ok(kind) => kind,
        Err(e) => {
            debug!(error = %e, "Unroutable request framing");
            write_error(writer, 400, "bad request framing").await?;
            return Ok(Served::Close);
        }
    };
    let mut forwarded = RequestHead {
        method: head.method.clone(),
        path: rest,
        headers: head.headers.clone(),
    };
    http::strip_hop_by_hop(&mut forwarded.headers);
    if body_kind == BodyKind::Chunked {
        forwarded
            .headers
            .push(("transfer-encoding".to_string(), "chunked".to_string()));
    }

    let mut stream = match session.open_stream(forwarded).await {
        Ok(stream) => stream,
        Err(TunnelError::NotActive) => {
            write_error(writer, 404, "client not found").await?;
            return Ok(Served::Close);
        }
        Err(TunnelError::StreamsExhausted) => {
            write_error(writer, 503, "tunnel at capacity").await?;
            return Ok(Served::Close);
        }
        Err(e) => {
            warn!(client_id, error = %e, "Failed to open stream");
            write_error(writer, 502, "tunnel unavailable").await?;
            return Ok(Served::Close);
        }
    };

    debug!(client_id, stream_id = stream.id(), method = %head.method, "Forwarding request");

    // Pump the request body through the stream before waiting on the head
    let mut body = BodyReader::new(reader, body_kind);
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = stream.send_body_chunk(chunk).await {
                    warn!(client_id, error = %e, "Tunnel rejected request body");
                    write_error(writer, 502, "tunnel failed mid-request").await?;
                    return Ok(Served::Close);
                }
            }
            Ok(None) => break,
            Err(e) => {
                // Public caller sent a broken body; the exchange cannot
                // proceed and the connection framing is unrecoverable.
                debug!(client_id, error = %e, "Bad request body from caller");
                stream.abort("malformed request body").await;
                let _ = write_error(writer, 400, "bad request body").await;
                return Ok(Served::Close);
            }
        }
    }
    if stream.finish_request().await.is_err() {
        write_error(writer, 502, "tunnel failed mid-request").await?;
        return Ok(Served::Close);
    }

    // Correlated response head, under its own timeout
    let response = match stream.response_head(RESPONSE_HEADER_TIMEOUT).await {
        Ok(response) => response,
        Err(TunnelError::Timeout) => {
            warn!(client_id, "Response header timeout");
            write_error(writer, 504, "upstream timeout").await?;
            return Ok(Served::Close);
        }
        Err(e) => {
            warn!(client_id, error = %e, "Stream failed before response");
            write_error(writer, 502, "upstream error").await?;
            return Ok(Served::Close);
        }
    };

    relay_response(writer, &mut stream, response).await
}

/// Relay status, headers, and body to the public caller as chunks arrive
async fn relay_response<S>(
    writer: &mut WriteHalf<S>,
    stream: &mut ProxyStream,
    mut response: ResponseHead,
) -> Result<Served, crate::Error>
where
    S: AsyncWrite,
{
    http::strip_hop_by_hop(&mut response.headers);

    // With a known length the body passes through verbatim; otherwise the
    // relay re-frames it as chunked so the caller sees a delimited body.
    let chunked = http::header(&response.headers, "content-length").is_none();
    if chunked {
        response
            .headers
            .push(("transfer-encoding".to_string(), "chunked".to_string()));
    }

    writer
        .write_all(&http::encode_response_head(&response))
        .await?;

    loop {
        let chunk = match timeout(STREAM_IDLE_TIMEOUT, stream.next_body_chunk()).await {
            Err(_) => {
                stream.abort("body stream stalled").await;
                // Head already sent; all we can do is refuse to complete
                // the framing so the caller never mistakes it for a full
                // response.
                return Ok(Served::Close);
            }
            Ok(chunk) => chunk,
        };

        match chunk {
            Some(Ok(data)) => {
                let result = if chunked {
                    http::write_chunk(writer, &data).await
                } else {
                    writer.write_all(&data).await.map_err(http::HttpError::Io)
                };
                if result.is_err() {
                    // Public caller disconnected mid-response; propagate
                    // the cancellation so the stream ID is released.
                    stream.abort("caller disconnected").await;
                    return Ok(Served::Close);
                }
                writer.flush().await.ok();
                stream.consumed(data.len()).await;
            }
            Some(Err(e)) => {
                debug!(error = %e, "Stream failed mid-response");
                return Ok(Served::Close);
            }
            None => {
                if chunked {
                    http::finish_chunked(writer).await?;
                }
                writer.flush().await?;
                return Ok(Served::KeepAlive);
            }
        }
    }
}

/// Emit a relay-generated error response
async fn write_error<W>(writer: &mut W, status: u16, message: &str) -> Result<(), crate::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", message);
    let head = ResponseHead {
        status,
        reason: http::reason_phrase(status).to_string(),
        headers: vec![
            ("content-type".to_string(), "text/plain".to_string()),
            ("content-length".to_string(), body.len().to_string()),
            ("connection".to_string(), "close".to_string()),
        ],
    };
    writer.write_all(&http::encode_response_head(&head)).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
