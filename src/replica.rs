//! The local replica process: an in-memory mirror fronted by TCP and UDP
//! listeners on one port.
//!
//! Policy per request: reads are answered from the local cache and never
//! forwarded; every other valid request is forwarded verbatim to the
//! primary and the primary's response relayed back unchanged; `/backup`
//! requests are applied straight to the cache; anything structurally
//! invalid is answered locally with an error payload.
//!
//! The accept/read path stays on per-connection tasks. The slow "forward to
//! primary and wait" step is offloaded to a fixed pool of workers fed by an
//! mpsc work queue, each job carrying a oneshot responder.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::frame::{encode_http_response, read_frame, Framing};
use crate::record::{msg_payload, NoteFields};
use crate::request::{
    looks_like_http, parse_id, parse_notes_path, validate, DecodeError, Method, NotesPath, Request,
};
use crate::store::ReplicaCache;
use crate::upstream;

pub const DEFAULT_WORKERS: usize = 10;

const NOT_VALID_REQUEST: &str = "Not Valid Request";

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub primary: SocketAddr,
    pub workers: usize,
}

struct ReplicaState {
    name: String,
    primary: SocketAddr,
    cache: ReplicaCache,
}

/// A queued "forward and wait" unit of work. Dropping the responder without
/// sending tells the waiting connection the forward failed.
struct ForwardJob {
    request: Request,
    respond_to: oneshot::Sender<String>,
}

/// Bootstraps from the primary, then serves until `shutdown` resolves.
///
/// The bootstrap read both seeds the cache and registers this replica for
/// backup pushes; on clean shutdown the replica explicitly unregisters.
pub async fn run_until<F>(config: ReplicaConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let snapshot = upstream::bootstrap(config.primary, config.port).await?;
    info!(
        name = %config.name,
        port = config.port,
        records = snapshot.len(),
        "seeded cache from primary snapshot"
    );
    let state = Arc::new(ReplicaState {
        name: config.name.clone(),
        primary: config.primary,
        cache: ReplicaCache::from_snapshot(snapshot),
    });

    let listener = TcpListener::bind((config.ip, config.port))
        .await
        .with_context(|| format!("bind replica TCP listener on port {}", config.port))?;
    let socket = Arc::new(
        UdpSocket::bind((config.ip, config.port))
            .await
            .with_context(|| format!("bind replica UDP socket on port {}", config.port))?,
    );
    info!(name = %config.name, port = config.port, "replica listening for TCP and UDP");

    let workers = config.workers.max(1);
    let (jobs_tx, jobs_rx) = mpsc::channel::<ForwardJob>(workers);
    let jobs_rx = Arc::new(Mutex::new(jobs_rx));
    for _ in 0..workers {
        tokio::spawn(worker_loop(Arc::clone(&state), Arc::clone(&jobs_rx)));
    }
    let udp_task = tokio::spawn(udp_loop(Arc::clone(&socket), jobs_tx.clone()));

    tokio::pin!(shutdown);
    loop {
        select! {
            _ = &mut shutdown => {
                info!(name = %config.name, "replica shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    let jobs = jobs_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(state, jobs, stream).await {
                            warn!(peer = %peer, error = ?err, "connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }

    udp_task.abort();
    if let Err(err) = upstream::unregister(config.primary, config.port).await {
        warn!(error = ?err, "failed to unregister from primary");
    }
    Ok(())
}

pub async fn run_until_ctrl_c(config: ReplicaConfig) -> Result<()> {
    run_until(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}

/// Serves one TCP connection. Backups are applied inline (they are fast and
/// must not queue behind forwards); everything else goes through the pool.
async fn handle_connection(
    state: Arc<ReplicaState>,
    jobs: mpsc::Sender<ForwardJob>,
    mut stream: TcpStream,
) -> Result<()> {
    while let Some(message) = read_frame(&mut stream, Framing::Detect).await? {
        let request = match decode(&message) {
            Ok(request) => request,
            Err(DecodeError::UnknownMethod(token)) => {
                debug!(token, "request with unknown method");
                stream
                    .write_all(msg_payload(NOT_VALID_REQUEST).as_bytes())
                    .await?;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if request.path.starts_with("/backup") {
            let ack = apply_backup(&state, &request)?;
            info!(
                name = %state.name,
                method = %request.method,
                body = request.body.as_deref().unwrap_or(""),
                "acknowledge update"
            );
            stream.write_all(encode_http_response(&ack).as_bytes()).await?;
            stream.shutdown().await?;
            return Ok(());
        }

        let (respond_to, response) = oneshot::channel();
        jobs.send(ForwardJob {
            request,
            respond_to,
        })
        .await
        .map_err(|_| anyhow!("worker pool stopped"))?;
        match response.await {
            // Bare payload: the gateway re-wraps it for its own wire format.
            Ok(payload) => stream.write_all(payload.as_bytes()).await?,
            Err(_) => break,
        }
    }
    Ok(())
}

/// Receives envelope datagrams and answers each from a detached task so a
/// slow forward never stalls the receive loop.
async fn udp_loop(socket: Arc<UdpSocket>, jobs: mpsc::Sender<ForwardJob>) {
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let (count, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                warn!(error = ?err, "udp receive failed");
                continue;
            }
        };
        let message = String::from_utf8_lossy(&buffer[..count]).into_owned();
        let request = match Request::from_envelope(&message) {
            Ok(request) => request,
            Err(DecodeError::UnknownMethod(token)) => {
                debug!(token, "datagram with unknown method");
                let _ = socket
                    .send_to(msg_payload(NOT_VALID_REQUEST).as_bytes(), peer)
                    .await;
                continue;
            }
            Err(err) => {
                warn!(error = %err, "dropping undecodable datagram");
                continue;
            }
        };

        let socket = Arc::clone(&socket);
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let (respond_to, response) = oneshot::channel();
            if jobs.send(ForwardJob { request, respond_to }).await.is_err() {
                return;
            }
            if let Ok(payload) = response.await {
                if let Err(err) = socket.send_to(payload.as_bytes(), peer).await {
                    warn!(peer = %peer, error = ?err, "failed to send udp reply");
                }
            }
        });
    }
}

async fn worker_loop(state: Arc<ReplicaState>, jobs: Arc<Mutex<mpsc::Receiver<ForwardJob>>>) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else { break };

        match answer(&state, &job.request).await {
            Ok(payload) => {
                if !job.request.method.is_read() {
                    info!(
                        name = %state.name,
                        method = %job.request.method,
                        payload = %payload,
                        "acknowledge write completed"
                    );
                }
                let _ = job.respond_to.send(payload);
            }
            // Transport failure on the forward; the waiting connection sees
            // its responder dropped and closes without a reply.
            Err(err) => warn!(name = %state.name, error = ?err, "forward to primary failed"),
        }
    }
}

/// The read-local/write-forward policy for one normalized request.
async fn answer(state: &ReplicaState, request: &Request) -> Result<String> {
    if !validate(request) {
        return Ok(msg_payload(NOT_VALID_REQUEST));
    }
    match (request.method, parse_notes_path(&request.path)) {
        (Method::Get, Some(NotesPath::List)) => Ok(serde_json::to_string(&state.cache.list_all())?),
        (Method::Get, Some(NotesPath::Item(id))) => Ok(match state.cache.find_by_id(id) {
            Some(record) => serde_json::to_string(&record)?,
            None => msg_payload(&format!("Not exist id - {id}")),
        }),
        _ => upstream::forward(state.primary, request).await,
    }
}

/// Applies a primary-pushed backup mutation directly to the cache, skipping
/// the `/notes` validation logic entirely, and returns the fixed
/// acknowledgment payload.
fn apply_backup(state: &ReplicaState, request: &Request) -> Result<String> {
    let tail = request.path.strip_prefix("/backup").unwrap_or_default();
    let id = match tail {
        "" => None,
        _ => tail.strip_prefix('/').and_then(parse_id),
    };

    match (request.method, id) {
        (Method::Post, None) => {
            let fields = backup_fields(request)?;
            let title = fields.title.context("backup create without title")?;
            let body = fields.body.context("backup create without body")?;
            state.cache.apply_create(title, body);
        }
        (Method::Put, Some(id)) => {
            let fields = backup_fields(request)?;
            state.cache.apply_update_full(id, fields.title, fields.body);
        }
        (Method::Patch, Some(id)) => {
            let fields = backup_fields(request)?;
            state.cache.apply_update_partial(id, fields.title, fields.body);
        }
        (Method::Delete, Some(id)) => state.cache.apply_delete(id),
        _ => bail!("unroutable backup path '{}'", request.path),
    }
    Ok(serde_json::json!({ "update": "successful" }).to_string())
}

fn backup_fields(request: &Request) -> Result<NoteFields> {
    let body = request
        .body
        .as_deref()
        .context("backup mutation without a body")?;
    NoteFields::parse(body).with_context(|| format!("undecodable backup body '{body}'"))
}

fn decode(message: &str) -> Result<Request, DecodeError> {
    if looks_like_http(message) {
        Request::from_http(message)
    } else {
        Request::from_envelope(message)
    }
}
