//! Matrix chat server.
//!
//! Run with: cargo run -p matrix-chat-server -- --port 7878
//!
//! Then connect with any line-based client, e.g. `nc 127.0.0.1 7878`.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use matrix_chat_transport::{ChatServer, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Host or address to listen on
    #[arg(long, env = "MATRIX_CHAT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on; 0 picks a free port
    #[arg(short, long, env = "MATRIX_CHAT_PORT", default_value_t = 7878)]
    port: u16,

    /// Lines buffered per client before delivery starts waiting
    #[arg(long, env = "MATRIX_CHAT_QUEUE_CAPACITY", default_value_t = 64)]
    queue_capacity: usize,

    /// Broadcasts queued for delivery before senders have to wait
    #[arg(long, env = "MATRIX_CHAT_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Milliseconds to wait on a stalled client before dropping it
    #[arg(long, env = "MATRIX_CHAT_DELIVERY_TIMEOUT_MS", default_value_t = 2000)]
    delivery_timeout_ms: u64,

    /// Longest accepted input line in bytes
    #[arg(long, env = "MATRIX_CHAT_MAX_LINE_LENGTH", default_value_t = 8192)]
    max_line_length: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "MATRIX_CHAT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            outbound_queue_capacity: self.queue_capacity,
            broadcast_queue_capacity: self.broadcast_capacity,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            max_line_length: self.max_line_length,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .init();

    let config = cli.server_config();
    let server = ChatServer::bind(config)
        .await
        .context("failed to start chat server")?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for interrupt");
            return;
        }
        tracing::info!("interrupt received, shutting down");
        on_signal.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}
