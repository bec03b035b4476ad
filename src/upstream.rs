//! Outbound header-delimited calls: replica-to-primary forwarding and
//! bootstrap, and the primary's backup pushes to replicas.
//!
//! Every call opens a fresh connection, writes one framed request, and
//! waits for one framed response. There is no retry and no timeout beyond
//! what connect itself provides; a hung peer hangs the caller.

use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::info;

use crate::frame::{encode_http_request, http_body, read_frame, Framing};
use crate::record::Record;
use crate::request::{parse_id, parse_notes_path, Method, NotesPath, Request};

/// One request/response round trip. Returns the response body.
pub async fn call(
    addr: SocketAddr,
    method: Method,
    path: &str,
    body: Option<&str>,
) -> Result<String> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to {addr}"))?;
    let message = encode_http_request(method, path, body);
    stream
        .write_all(message.as_bytes())
        .await
        .with_context(|| format!("write request to {addr}"))?;

    let reply = read_frame(&mut stream, Framing::HeaderDelimited)
        .await
        .with_context(|| format!("read response from {addr}"))?
        .ok_or_else(|| anyhow!("{addr} closed the connection before replying"))?;
    Ok(http_body(&reply).unwrap_or_default().to_string())
}

/// The replica's one-time bootstrap read. As a side effect the primary
/// registers `port` for future backup pushes.
pub async fn bootstrap(primary: SocketAddr, port: u16) -> Result<Vec<Record>> {
    let payload = call(primary, Method::Get, &format!("/primary/{port}"), None)
        .await
        .context("bootstrap snapshot from primary")?;
    serde_json::from_str(&payload).context("decode bootstrap snapshot")
}

/// Forwards a mutation verbatim onto the primary's `/primary` namespace and
/// relays the primary's response body back unchanged.
pub async fn forward(primary: SocketAddr, request: &Request) -> Result<String> {
    let path = primary_path(request)?;
    info!(
        method = %request.method,
        path = %request.path,
        body = request.body.as_deref().unwrap_or(""),
        "forward request to primary"
    );
    let body = forwarded_body(request);
    call(primary, request.method, &path, body).await
}

/// Pushes one mutation to a replica's `/backup` namespace and waits for its
/// acknowledgment. The content of the acknowledgment is not inspected.
pub async fn push_backup(port: u16, request: &Request) -> Result<String> {
    let path = backup_path(request)?;
    let body = forwarded_body(request);
    call(replica_addr(port), request.method, &path, body)
        .await
        .with_context(|| format!("backup push to replica on port {port}"))
}

/// Explicitly removes a replica from the primary's registry.
pub async fn unregister(primary: SocketAddr, port: u16) -> Result<String> {
    call(
        primary,
        Method::Get,
        &format!("/primary/unregister/{port}"),
        None,
    )
    .await
}

fn replica_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// DELETE carries no body on the wire; everything else forwards the body
/// as received.
fn forwarded_body(request: &Request) -> Option<&str> {
    match request.method {
        Method::Delete => None,
        _ => request.body.as_deref(),
    }
}

fn primary_path(request: &Request) -> Result<String> {
    match (request.method, parse_notes_path(&request.path)) {
        (Method::Post, _) => Ok("/primary".to_string()),
        (_, Some(NotesPath::Item(id))) => Ok(format!("/primary/{id}")),
        _ => Err(anyhow!("request '{}' has no primary route", request.path)),
    }
}

/// Fan-out requests arrive in the `/primary` namespace, forwarded requests
/// in the public `/notes` one; both carry the item id as the last segment.
fn backup_path(request: &Request) -> Result<String> {
    match (request.method, item_id(&request.path)) {
        (Method::Post, _) => Ok("/backup".to_string()),
        (_, Some(id)) => Ok(format!("/backup/{id}")),
        _ => Err(anyhow!("request '{}' has no backup route", request.path)),
    }
}

fn item_id(path: &str) -> Option<i64> {
    let tail = path
        .strip_prefix("/primary")
        .or_else(|| path.strip_prefix("/notes"))?;
    parse_id(tail.strip_prefix('/')?)
}
