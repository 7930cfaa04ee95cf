use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tunnelcrab_core::Result;

use crate::config::ClientConfig;
use crate::pool::Pool;

/// Owns one `Pool` per configured tunnel.
pub struct Client {
    pools: Vec<Arc<Pool>>,
    fatal_rx: tokio::sync::Mutex<mpsc::Receiver<tunnelcrab_core::TunnelError>>,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::channel(config.tunnels.len().max(1));
        let register_url = config.register_url();
        let pools = config
            .tunnels
            .iter()
            .map(|tunnel| {
                Pool::new(
                    tunnel.name.clone(),
                    tunnel.subdomain_or_generate(),
                    tunnel.port,
                    register_url.clone(),
                    config.secret_key.clone(),
                    config.pool_idle_size,
                    config.pool_max_size,
                    fatal_tx.clone(),
                )
            })
            .collect();
        Self {
            pools,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
        }
    }

    /// Fill every pool's initial connections (fatal on failure, since a
    /// rejected registration means the credentials or configuration are
    /// wrong), then run periodic safety-net refills until `shutdown` is
    /// cancelled or a pool reports a fatal registration failure. A failure
    /// on a periodic tick is routed through the same fatal channel as the
    /// initial fill, so a credential revoked mid-flight still brings the
    /// process down instead of retrying forever against a broker that will
    /// never accept it again.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        for pool in &self.pools {
            pool.connector().await?;
            info!(tunnel = %pool.name, subdomain = %pool.subdomain, "tunnel requested");
        }

        for pool in self.pools.clone() {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = pool.connector_reporting_fatal().await {
                                error!(tunnel = %pool.name, error = %e, "periodic reconnect failed");
                                break;
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            });
        }

        let mut fatal_rx = self.fatal_rx.lock().await;
        tokio::select! {
            _ = shutdown.cancelled() => {}
            Some(err) = fatal_rx.recv() => {
                error!(error = %err, "tunnel registration failed fatally, shutting down");
                self.shutdown().await;
                return Err(err);
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown().await;
        }
    }
}
