//! Protocol gateways: thin translators that front one replica each.
//!
//! A gateway accepts requests in its own wire format, relays the raw
//! message to its paired replica, and relays the reply back. The HTTP
//! gateway re-wraps the replica's bare payload in an HTTP-style response;
//! the TCP and UDP gateways return the payload verbatim. Each gateway
//! spawns its replica as a child process at startup and terminates it on
//! shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::frame::{encode_http_response, read_frame, Framing};
use crate::request::Request;

/// Bounded wait applied after each termination signal to the replica child.
const CHILD_EXIT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GatewayKind {
    /// Header-delimited requests; responses wrapped in an HTTP-style 200.
    Http,
    /// One envelope per TCP read; bare payload back.
    Tcp,
    /// One envelope per datagram; bare payload back.
    Udp,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub name: String,
    pub listen: SocketAddr,
    /// Port the paired replica listens on (TCP and UDP).
    pub storage_port: u16,
    /// Primary address handed to the spawned replica for its bootstrap.
    pub primary: SocketAddr,
}

/// Spawns the paired replica, serves until `shutdown` resolves, then
/// terminates the child.
pub async fn run<F>(config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let child = spawn_replica(&config)?;
    let served = serve(config, shutdown).await;
    stop_replica(child).await;
    served
}

pub async fn run_until_ctrl_c(config: GatewayConfig) -> Result<()> {
    run(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}

/// The listener half alone, for callers that manage the replica themselves.
pub async fn serve<F>(config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    match config.kind {
        GatewayKind::Udp => serve_udp(config, shutdown).await,
        GatewayKind::Http | GatewayKind::Tcp => serve_tcp(config, shutdown).await,
    }
}

async fn serve_tcp<F>(config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind gateway listener on {}", config.listen))?;
    info!(name = %config.name, kind = ?config.kind, addr = %config.listen, "gateway listening");
    let config = Arc::new(config);

    tokio::pin!(shutdown);
    loop {
        select! {
            _ = &mut shutdown => {
                info!(name = %config.name, "gateway shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(&config, stream).await {
                            warn!(peer = %peer, error = ?err, "client connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }
    Ok(())
}

async fn handle_connection(config: &GatewayConfig, mut stream: TcpStream) -> Result<()> {
    let framing = match config.kind {
        GatewayKind::Http => Framing::HeaderDelimited,
        _ => Framing::Envelope,
    };
    while let Some(message) = read_frame(&mut stream, framing).await? {
        // Decoding here is for the log line only; the message is relayed
        // as received and the replica is the one that rejects it.
        log_request(config, decode_for_log(config.kind, &message).as_ref());

        let reply = relay_tcp(config.storage_port, &message).await?;
        log_response(config, &reply);

        let out = match config.kind {
            GatewayKind::Http => encode_http_response(&reply),
            _ => reply,
        };
        stream.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn serve_udp<F>(config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let socket = Arc::new(
        UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("bind gateway socket on {}", config.listen))?,
    );
    info!(name = %config.name, kind = ?config.kind, addr = %config.listen, "gateway listening");
    let config = Arc::new(config);

    let mut buffer = vec![0u8; 64 * 1024];
    tokio::pin!(shutdown);
    loop {
        select! {
            _ = &mut shutdown => {
                info!(name = %config.name, "gateway shutting down");
                break;
            }
            received = socket.recv_from(&mut buffer) => {
                let (count, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = ?err, "udp receive failed");
                        continue;
                    }
                };
                let message = String::from_utf8_lossy(&buffer[..count]).into_owned();
                let config = Arc::clone(&config);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Err(err) = handle_datagram(&config, &socket, peer, &message).await {
                        warn!(peer = %peer, error = ?err, "datagram dropped");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_datagram(
    config: &GatewayConfig,
    socket: &UdpSocket,
    peer: SocketAddr,
    message: &str,
) -> Result<()> {
    log_request(config, Request::from_envelope(message).map_err(Into::into).as_ref());

    let reply = relay_udp(config.storage_port, message).await?;
    log_response(config, &reply);

    socket
        .send_to(reply.as_bytes(), peer)
        .await
        .context("send reply datagram")?;
    Ok(())
}

/// Relays the raw message to the paired replica over a fresh TCP
/// connection. One read is one reply on this path; the replica answers
/// with a bare payload.
async fn relay_tcp(storage_port: u16, message: &str) -> Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", storage_port))
        .await
        .context("connect to local replica")?;
    stream
        .write_all(message.as_bytes())
        .await
        .context("relay request to replica")?;

    let mut buffer = vec![0u8; 64 * 1024];
    let count = stream.read(&mut buffer).await.context("read replica reply")?;
    if count == 0 {
        bail!("replica closed the connection without replying");
    }
    Ok(String::from_utf8_lossy(&buffer[..count]).into_owned())
}

/// Same relay over UDP, from an ephemeral local socket.
async fn relay_udp(storage_port: u16, message: &str) -> Result<String> {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .context("bind relay socket")?;
    socket
        .send_to(message.as_bytes(), ("127.0.0.1", storage_port))
        .await
        .context("relay datagram to replica")?;

    let mut buffer = vec![0u8; 64 * 1024];
    let (count, _) = socket
        .recv_from(&mut buffer)
        .await
        .context("read replica reply")?;
    Ok(String::from_utf8_lossy(&buffer[..count]).into_owned())
}

fn decode_for_log(kind: GatewayKind, message: &str) -> Result<Request> {
    match kind {
        GatewayKind::Http => Request::from_http(message),
        GatewayKind::Tcp | GatewayKind::Udp => Request::from_envelope(message),
    }
    .map_err(Into::into)
}

fn log_request(config: &GatewayConfig, request: Result<&Request, &anyhow::Error>) {
    match request {
        Ok(request) => info!(
            name = %config.name,
            method = %request.method,
            path = %request.path,
            body = request.body.as_deref().unwrap_or(""),
            "request"
        ),
        Err(err) => debug!(name = %config.name, error = %err, "relaying undecoded message"),
    }
}

fn log_response(config: &GatewayConfig, reply: &str) {
    info!(name = %config.name, response = %reply, "response");
}

fn spawn_replica(config: &GatewayConfig) -> Result<Child> {
    let exe = std::env::current_exe().context("locate own executable")?;
    let child = Command::new(exe)
        .arg("replica")
        .arg("--name")
        .arg(&config.name)
        .arg("--ip")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(config.storage_port.to_string())
        .arg("--primary")
        .arg(config.primary.to_string())
        .spawn()
        .context("spawn replica child process")?;
    info!(name = %config.name, port = config.storage_port, "replica started as a child process");
    Ok(child)
}

/// Terminates the replica child: ask politely first, then a bounded wait,
/// then a hard kill with another bounded wait.
async fn stop_replica(mut child: Child) {
    if terminate_gracefully(&child) {
        match timeout(CHILD_EXIT_WAIT, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "replica child terminated");
                return;
            }
            Ok(Err(err)) => warn!(error = ?err, "failed waiting for replica child"),
            Err(_) => warn!("replica child ignored the term signal"),
        }
    }
    if let Err(err) = child.start_kill() {
        warn!(error = ?err, "failed to kill replica child");
        return;
    }
    match timeout(CHILD_EXIT_WAIT, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "replica child killed"),
        Ok(Err(err)) => warn!(error = ?err, "failed waiting for replica child"),
        Err(_) => warn!("replica child did not terminate in time"),
    }
}

/// Sends SIGTERM to a still-running child. Returns `false` when no signal
/// could be delivered and the caller should go straight to the hard kill.
#[cfg(unix)]
fn terminate_gracefully(child: &Child) -> bool {
    match child.id() {
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_child: &Child) -> bool {
    false
}
