use std::net::{IpAddr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::gateway::GatewayKind;
use crate::replica::DEFAULT_WORKERS;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the authoritative primary store.
    Primary(PrimaryArgs),
    /// Run a local replica backed by the primary.
    Replica(ReplicaArgs),
    /// Run a protocol gateway with its own replica child process.
    Gateway(GatewayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PrimaryArgs {
    /// Socket address the primary should bind to. Use port 0 for ephemeral.
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ReplicaArgs {
    /// Name used in log lines, e.g. "App one LS".
    #[arg(long)]
    pub name: String,

    /// Interface to bind the TCP listener and UDP socket on.
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: IpAddr,

    /// Port shared by the TCP listener and UDP socket.
    #[arg(long)]
    pub port: u16,

    /// Address of the primary store.
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub primary: SocketAddr,

    /// Number of forwarding workers.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Wire format this gateway speaks to its clients.
    #[arg(long, value_enum)]
    pub kind: GatewayKind,

    /// Name used in log lines and passed on to the replica child.
    #[arg(long)]
    pub name: String,

    /// Socket address the gateway should bind to.
    #[arg(long)]
    pub listen: SocketAddr,

    /// Port the paired replica child will listen on.
    #[arg(long)]
    pub storage_port: u16,

    /// Address of the primary store, handed to the replica child.
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub primary: SocketAddr,
}
