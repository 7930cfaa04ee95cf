use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};

use tunnelcrab_core::{Greeting, PoolId, Result};

use crate::connection::{self, Connection, Status};

/// Maintains `pool_idle_size` idle outbound WebSockets to one subdomain,
/// capped at `pool_max_size` total.
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub subdomain: String,
    register_url: String,
    secret_key: String,
    local_server: String,
    pool_idle_size: u32,
    pool_max_size: u32,
    connections: Mutex<Vec<Arc<Connection>>>,
    pending: AtomicU32,
    done: AtomicBool,
    first_connected: AtomicBool,
    fatal_tx: mpsc::Sender<tunnelcrab_core::TunnelError>,
}

impl Pool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        subdomain: String,
        local_port: u16,
        register_url: String,
        secret_key: String,
        pool_idle_size: u32,
        pool_max_size: u32,
        fatal_tx: mpsc::Sender<tunnelcrab_core::TunnelError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: PoolId::generate(),
            name,
            subdomain,
            register_url,
            secret_key,
            local_server: format!("http://127.0.0.1:{local_port}"),
            pool_idle_size,
            pool_max_size,
            connections: Mutex::new(Vec::new()),
            pending: AtomicU32::new(0),
            done: AtomicBool::new(false),
            first_connected: AtomicBool::new(false),
            fatal_tx,
        })
    }

    fn counts(&self) -> (u32, u32) {
        let conns = self.connections.lock().unwrap();
        let idle = conns.iter().filter(|c| c.status() == Status::Idle).count() as u32;
        (idle, conns.len() as u32)
    }

    /// Fire-and-forget refill, triggered by connection activity (spec
    /// §4.F step 2). Errors are routed to the fatal channel exactly like a
    /// periodic-tick failure: a rejected reconnection means the
    /// credentials or configuration went bad mid-flight.
    pub fn refresh(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let _ = pool.connector_reporting_fatal().await;
        });
    }

    /// Run `connector`, forwarding any error to the fatal channel in
    /// addition to returning it, so both the caller and `Client::run`'s
    /// top-level `select!` see the same failure.
    pub async fn connector_reporting_fatal(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.connector().await {
            let _ = self
                .fatal_tx
                .send(tunnelcrab_core::TunnelError::Other(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Open new connections until `pool_idle_size` idle connections exist
    /// or `pool_max_size` total connections are reached. Returns the first
    /// dial error encountered, if any. The original treats a rejected
    /// registration as fatal (bad credentials/config), so the caller is
    /// expected to propagate it up to process exit.
    pub async fn connector(self: &Arc<Self>) -> Result<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        loop {
            let (idle, total) = self.counts();
            let pending = self.pending.load(Ordering::Acquire);
            if idle + pending >= self.pool_idle_size || total + pending >= self.pool_max_size {
                return Ok(());
            }
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.dial_one().await?;
        }
    }

    async fn dial_one(self: &Arc<Self>) -> Result<()> {
        let greeting = Greeting {
            pool_id: self.id.clone(),
            pool_idle_size: self.pool_idle_size,
        };
        let result = connection::connect(
            self,
            &self.register_url,
            &self.secret_key,
            &self.subdomain,
            &self.local_server,
            &greeting,
        )
        .await;
        self.pending.fetch_sub(1, Ordering::AcqRel);

        let (conn, stream) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(tunnel = %self.name, error = %e, "tunnel registration failed");
                return Err(e);
            }
        };

        let is_initial = self
            .first_connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if is_initial {
            info!(tunnel = %self.name, subdomain = %self.subdomain, "tunnel running");
        }

        self.connections.lock().unwrap().push(conn.clone());

        tokio::spawn(conn.clone().keepalive_loop());
        let pool = self.clone();
        let local_server = self.local_server.clone();
        tokio::spawn(async move {
            conn.clone()
                .serve_loop(stream, local_server, is_initial)
                .await;
            pool.remove(&conn);
        });

        Ok(())
    }

    fn remove(&self, conn: &Arc<Connection>) {
        self.connections
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, conn));
    }

    pub async fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        let snapshot = self.connections.lock().unwrap().clone();
        for conn in snapshot {
            conn.close().await;
        }
    }
}
