//! ReqBoard relay: fans presence and lock broadcasts out to every client
//! subscribed to the same document channel.
//!
//! ```bash
//! RUST_LOG=info reqboard-relay --bind 0.0.0.0:9090
//! ```

use clap::Parser;
use log::info;
use reqboard_realtime::{RelayServer, RelayServerConfig};

/// WebSocket broadcast relay for realtime document channels
#[derive(Parser)]
#[command(name = "reqboard-relay")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Frames buffered per subscriber before it starts lagging (at least 1)
    #[arg(short, long, default_value_t = 256, value_parser = clap::value_parser!(u64).range(1..))]
    capacity: u64,

    /// Channels one connection may subscribe to
    #[arg(long, default_value_t = 64)]
    max_channels: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let server = RelayServer::new(RelayServerConfig {
        bind_addr: cli.bind,
        channel_capacity: cli.capacity as usize,
        max_channels_per_connection: cli.max_channels,
    });
    info!("starting reqboard relay on {}", server.bind_addr());

    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
