use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_notes::{
    cli::{Cli, Command},
    gateway::{self, GatewayConfig},
    primary::Primary,
    replica::{self, ReplicaConfig},
    store::PrimaryStore,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Primary(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let primary = Primary::new(listener, Arc::new(PrimaryStore::new()));
            info!("primary listening on {}", primary.local_addr()?);
            if let Err(err) = primary.run_until_ctrl_c().await {
                warn!("primary exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Replica(args) => {
            let config = ReplicaConfig {
                name: args.name,
                ip: args.ip,
                port: args.port,
                primary: args.primary,
                workers: args.workers,
            };
            if let Err(err) = replica::run_until_ctrl_c(config).await {
                warn!("replica exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Gateway(args) => {
            let config = GatewayConfig {
                kind: args.kind,
                name: args.name,
                listen: args.listen,
                storage_port: args.storage_port,
                primary: args.primary,
            };
            if let Err(err) = gateway::run_until_ctrl_c(config).await {
                warn!("gateway exited with error: {err:?}");
                return Err(err);
            }
        }
    }

    Ok(())
}
