use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshkad::Host;

#[derive(Parser, Debug)]
#[command(name = "meshkad")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on (0 lets the OS pick one).
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Bootstrap nodes as node:// addresses.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDRESS")]
    bootstrap: Vec<String>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value_t = 300)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let host = Host::builder().port(args.port).build().await?;
    info!("node address: {}", host.address());

    let accept = host.clone();
    tokio::spawn(async move {
        if let Err(err) = accept.listen().await {
            warn!("accept loop ended: {err:#}");
        }
    });

    for address in &args.bootstrap {
        info!(%address, "bootstrapping");
        match host.bootstrap(address).await {
            Ok(()) => info!("bootstrap complete"),
            Err(err) => warn!(error = %format!("{err:#}"), "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                host.close();
                break;
            }
            _ = interval.tick() => {
                let peers = host.peers().await;
                info!(peers = peers.len(), "status");
            }
        }
    }

    Ok(())
}
