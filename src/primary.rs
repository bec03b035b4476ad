//! The authoritative primary store server.
//!
//! The primary owns record identity, keeps the registry of replica ports,
//! and replicates every accepted mutation to all registered replicas in
//! registration order before acknowledging the writer. Connections are
//! served strictly one at a time: a mutation and its entire fan-out finish
//! before the next connection is read, which is what keeps backup pushes
//! ordered per write.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::frame::{encode_http_response, read_frame, Framing};
use crate::record::{msg_payload, NoteFields};
use crate::request::{parse_id, Method, Request, Response};
use crate::store::PrimaryStore;
use crate::upstream;

const NOT_EXIST_ID: &str = "Not exist id. Try Again";
const NOT_VALID_REQUEST: &str = "Not valid Request header or body. Try Again!";

pub struct Primary {
    listener: TcpListener,
    store: Arc<PrimaryStore>,
    registry: Mutex<Vec<u16>>,
}

impl Primary {
    /// The store is constructed by the caller and passed in; the primary
    /// never owns a hidden global instance.
    pub fn new(listener: TcpListener, store: Arc<PrimaryStore>) -> Self {
        Self {
            listener,
            store,
            registry: Mutex::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("primary shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = self.handle_connection(stream).await {
                            // The in-flight request is aborted; the table may
                            // already hold the mutation and earlier replicas
                            // may already have applied it.
                            warn!(peer = %peer, error = ?err, "request aborted");
                        }
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let Some(message) = read_frame(&mut stream, Framing::HeaderDelimited).await? else {
            return Ok(());
        };
        let request = Request::from_http(&message)?;

        if let Some(rest) = request.path.strip_prefix("/primary/unregister/") {
            let port: u16 = rest
                .parse()
                .with_context(|| format!("bad unregister port '{rest}'"))?;
            self.unregister(port);
            let ack = serde_json::json!({ "unregister": "successful" }).to_string();
            return respond(&mut stream, &ack).await;
        }

        let response = self.dispatch(&request)?;
        if !request.method.is_read() && response.ok {
            self.fan_out(&request).await?;
        }
        respond(&mut stream, &response.payload).await
    }

    /// Applies one request to the store. Mutations that cannot even be
    /// decoded bail and abort the connection: replicas validate before
    /// forwarding, so an undecodable mutation here means a broken peer.
    fn dispatch(&self, request: &Request) -> Result<Response> {
        let Some(tail) = request.path.strip_prefix("/primary") else {
            return Ok(Response::error(msg_payload(NOT_VALID_REQUEST)));
        };
        let id = match tail {
            "" => None,
            _ => match tail.strip_prefix('/').and_then(parse_id) {
                Some(id) => Some(id),
                None => bail!("unroutable primary path '{}'", request.path),
            },
        };

        match (request.method, id) {
            // Bootstrap read: registers the caller and returns the full
            // snapshot it seeds its cache from.
            (Method::Get, Some(port)) => {
                let port = u16::try_from(port)
                    .with_context(|| format!("bootstrap port {port} out of range"))?;
                self.register(port);
                Ok(Response::ok(serde_json::to_string(&self.store.list_all())?))
            }
            (Method::Post, None) => {
                let fields = mutation_fields(request)?;
                let title = fields.title.context("create without title")?;
                let body = fields.body.context("create without body")?;
                let record = self.store.save(title, body);
                Ok(Response::ok(serde_json::to_string(&record)?))
            }
            (Method::Put, Some(id)) => {
                let fields = mutation_fields(request)?;
                if self.store.update_full(id, fields.title, fields.body) {
                    self.record_response(id)
                } else {
                    Ok(Response::error(msg_payload(NOT_EXIST_ID)))
                }
            }
            (Method::Patch, Some(id)) => {
                let fields = mutation_fields(request)?;
                if self.store.update_partial(id, fields.title, fields.body) {
                    self.record_response(id)
                } else {
                    Ok(Response::error(msg_payload(NOT_EXIST_ID)))
                }
            }
            (Method::Delete, Some(id)) => {
                if self.store.delete_by_id(id) {
                    Ok(Response::ok(msg_payload("OK")))
                } else {
                    Ok(Response::error(msg_payload(NOT_EXIST_ID)))
                }
            }
            _ => Ok(Response::error(msg_payload(NOT_VALID_REQUEST))),
        }
    }

    fn record_response(&self, id: i64) -> Result<Response> {
        match self.store.find_by_id(id) {
            Some(record) => Ok(Response::ok(serde_json::to_string(&record)?)),
            None => Ok(Response::error(msg_payload(NOT_EXIST_ID))),
        }
    }

    /// Pushes the mutation to every registered replica, in registration
    /// order, waiting for each acknowledgment before the next push. A
    /// failed push propagates: no retry, no rollback of the pushes (or the
    /// table mutation) that already happened.
    async fn fan_out(&self, request: &Request) -> Result<()> {
        let ports = self.registry.lock().unwrap().clone();
        for port in ports {
            info!(
                port,
                method = %request.method,
                body = request.body.as_deref().unwrap_or(""),
                "tell backup to update"
            );
            let ack = upstream::push_backup(port, request).await?;
            debug!(port, ack = %ack, "backup acknowledged");
        }
        Ok(())
    }

    fn register(&self, port: u16) {
        let mut registry = self.registry.lock().unwrap();
        if !registry.contains(&port) {
            registry.push(port);
            info!(port, "registered replica");
        }
    }

    /// Unknown ports are silently ignored.
    fn unregister(&self, port: u16) {
        let mut registry = self.registry.lock().unwrap();
        registry.retain(|registered| *registered != port);
        info!(port, "unregistered replica");
    }

    #[cfg(test)]
    fn registered_ports(&self) -> Vec<u16> {
        self.registry.lock().unwrap().clone()
    }
}

async fn respond(stream: &mut TcpStream, payload: &str) -> Result<()> {
    stream
        .write_all(encode_http_response(payload).as_bytes())
        .await
        .context("write response")?;
    stream.shutdown().await.context("close connection")?;
    Ok(())
}

fn mutation_fields(request: &Request) -> Result<NoteFields> {
    let body = request
        .body
        .as_deref()
        .context("mutation arrived without a body")?;
    NoteFields::parse(body).with_context(|| format!("undecodable mutation body '{body}'"))
}
