pub mod client;
pub mod config;
pub mod connection;
pub mod pool;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tunnelcrab_core::Result;

pub use client::Client;
pub use config::ClientConfig;

/// Initialize tracing for the client process. Call once, before `run()`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelcrab_client=info".into()),
        )
        .init();
}

/// Spawn a task that cancels `shutdown` on Ctrl+C or SIGTERM.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down…"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down…"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received Ctrl+C, shutting down…");
        }
        shutdown.cancel();
    });
}

/// Run every configured tunnel until `shutdown` is cancelled.
pub async fn run(config: ClientConfig, shutdown: CancellationToken) -> Result<()> {
    let client = Arc::new(Client::new(&config));
    client.run(shutdown).await
}
