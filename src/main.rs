//! MHF channel server daemon
//!
//! Starts one or more sibling channels on consecutive ports, all sharing a
//! single world for worldcasts and cross-channel lookups.
//!
//! # Usage
//!
//! ```bash
//! mhf-channel --port 54001
//! mhf-channel --config channel.toml --channels 4 --relay-stdout
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use mhf_channel::{ChannelConfig, ChannelServer, World};

/// MHF channel server
#[derive(Parser, Debug)]
#[command(name = "mhf-channel")]
#[command(about = "Channel server core for the MHF session protocol")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "MHF_CHANNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port of the first channel (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of sibling channels, on consecutive ports
    #[arg(long, default_value = "1")]
    channels: u16,

    /// Print relayed chat as JSON lines on stdout
    #[arg(long)]
    relay_stdout: bool,

    /// Log registry statistics every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mhf_channel=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut base = match &args.config {
        Some(path) => ChannelConfig::load(path)?,
        None => ChannelConfig::default(),
    };
    if let Some(host) = args.host {
        base.host = host;
    }
    if let Some(port) = args.port {
        base.port = port;
    }

    let world = World::new();
    let mut handles = Vec::new();

    for offset in 0..args.channels.max(1) {
        let config = if offset == 0 { base.clone() } else { base.sibling(offset) };
        let addr = format!("{}:{}", config.host, config.port);
        let server = ChannelServer::new(config);
        world.add_channel(server.clone());

        let listener = TcpListener::bind(&addr).await?;
        let handle = server.start(listener)?;
        tracing::info!("Channel {} listening on {}", server.id(), handle.local_addr);

        if args.relay_stdout {
            spawn_relay_printer(&server);
        }
        handles.push(handle);
    }

    if args.stats_interval > 0 {
        let world = world.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for channel in world.channels() {
                    match serde_json::to_string(&channel.stats()) {
                        Ok(json) => tracing::info!("stats {}", json),
                        Err(e) => tracing::warn!("Failed to encode stats: {}", e),
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down {} channel(s)", handles.len());

    for handle in &handles {
        handle.shutdown();
    }
    for handle in handles {
        handle.join().await;
    }

    Ok(())
}

/// Print every relayed chat line as JSON until the channel goes away
fn spawn_relay_printer(server: &ChannelServer) {
    let mut relay = server.subscribe_relay();
    tokio::spawn(async move {
        loop {
            match relay.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to encode relay event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Relay printer lagged, skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
