use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::WebSocket;
use tokio::sync::mpsc;
use tracing::info;

use tunnelcrab_core::{PoolId, Subdomain};

use crate::auth::TunnelUser;
use crate::connection::{Connection, Status};

/// Idle-connection advertisement bus capacity. One slot is enough: a
/// connection only ever has one outstanding offer at a time (it cannot
/// become idle twice before the dispatcher claims or a reap removes it).
const IDLE_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolSize {
    pub idle: u32,
    pub busy: u32,
    pub closed: u32,
}

/// The set of Connections sharing one subdomain + tunnel user.
pub struct Pool {
    pub id: PoolId,
    pub subdomain: Subdomain,
    pub local_server: String,
    pub user: TunnelUser,
    idle_timeout: Duration,
    size: AtomicU32,
    connections: Mutex<Vec<Arc<Connection>>>,
    idle_tx: mpsc::Sender<Arc<Connection>>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
    done: AtomicBool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("subdomain", &self.subdomain)
            .field("local_server", &self.local_server)
            .field("user", &self.user)
            .field("size", &self.size_counts())
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

impl Pool {
    pub fn new(
        id: PoolId,
        subdomain: Subdomain,
        local_server: String,
        user: TunnelUser,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(IDLE_CHANNEL_CAPACITY);
        Arc::new(Self {
            id,
            subdomain,
            local_server,
            user,
            idle_timeout,
            size: AtomicU32::new(0),
            connections: Mutex::new(Vec::new()),
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            done: AtomicBool::new(false),
        })
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Accept a newly-upgraded WebSocket from the Client and add it to the
    /// pool. Rejected once the pool is shutting down.
    pub fn register(self: &Arc<Self>, ws: WebSocket) {
        if self.is_done() {
            return;
        }
        info!(pool = %self.id, subdomain = %self.subdomain, "registering new connection");
        let conn = Connection::register(self, ws);
        self.connections.lock().unwrap().push(conn);
    }

    /// Advertise an idle connection to the dispatcher. Only ever called
    /// from a freshly spawned task (see `Connection::offer`) so it never
    /// blocks the caller that made the connection idle.
    pub async fn offer(&self, conn: Arc<Connection>) {
        let _ = self.idle_tx.send(conn).await;
    }

    /// The dispatcher's sole consumer of this pool's idle advertisements.
    pub async fn recv_idle(&self, deadline: std::time::Instant) -> Option<Arc<Connection>> {
        let mut rx = self.idle_rx.lock().await;
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        tokio::select! {
            biased;
            maybe_conn = rx.recv() => maybe_conn,
            _ = tokio::time::sleep(remaining) => None,
        }
    }

    /// Close surplus idle connections that have been idle longer than
    /// `idle_timeout`, then drop every Closed connection from the list.
    pub async fn clean(&self) {
        let snapshot = self.connections.lock().unwrap().clone();

        let mut idle_seen = 0u32;
        let size = self.size.load(Ordering::Relaxed);
        for conn in &snapshot {
            if conn.status() == Status::Idle {
                idle_seen += 1;
                if idle_seen > size && conn.idle_since().elapsed() > self.idle_timeout {
                    conn.close().await;
                }
            }
        }

        self.connections
            .lock()
            .unwrap()
            .retain(|c| c.status() != Status::Closed);
    }

    /// Clean, then report whether the pool has no connections left.
    pub async fn is_empty(&self) -> bool {
        self.clean().await;
        self.connections.lock().unwrap().is_empty()
    }

    pub fn size_counts(&self) -> PoolSize {
        let mut ps = PoolSize::default();
        for conn in self.connections.lock().unwrap().iter() {
            match conn.status() {
                Status::Idle => ps.idle += 1,
                Status::Busy => ps.busy += 1,
                Status::Closed => ps.closed += 1,
            }
        }
        ps
    }

    pub async fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        let snapshot = self.connections.lock().unwrap().clone();
        for conn in snapshot {
            conn.close().await;
        }
        self.clean().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> Arc<Pool> {
        Pool::new(
            PoolId::generate(),
            Subdomain::parse("test").unwrap(),
            "http://localhost:9999".to_string(),
            TunnelUser {
                identifier: "alice".into(),
            },
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn new_pool_is_empty() {
        let pool = test_pool();
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn rejects_register_after_shutdown() {
        let pool = test_pool();
        pool.shutdown().await;
        assert!(pool.is_done());
    }

    #[tokio::test]
    async fn recv_idle_times_out_with_no_connections() {
        let pool = test_pool();
        let deadline = std::time::Instant::now() + Duration::from_millis(20);
        assert!(pool.recv_idle(deadline).await.is_none());
    }
}
