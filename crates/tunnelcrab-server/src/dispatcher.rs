use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, RwLock};

use tunnelcrab_core::Subdomain;

use crate::connection::Connection;
use crate::pool::Pool;

pub type Registry = RwLock<HashMap<Subdomain, Arc<Pool>>>;

/// One-shot request fed to the dispatcher: "give me an idle connection for
/// this subdomain before this deadline". Exactly one value (or none) is
/// ever sent back.
pub struct DispatchRequest {
    pub subdomain: Subdomain,
    pub deadline: Instant,
    pub respond: oneshot::Sender<Option<Arc<Connection>>>,
}

/// Spawn the single long-running dispatcher task. Dropping the returned
/// sender (or closing it) ends the task, which is how `Broker::shutdown`
/// tears it down.
pub fn spawn(registry: Arc<Registry>) -> mpsc::Sender<DispatchRequest> {
    let (tx, mut rx) = mpsc::channel::<DispatchRequest>(64);

    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let conn = dispatch_one(&registry, &request.subdomain, request.deadline).await;
            // Ignore send errors: the requester gave up (e.g. the inbound
            // HTTP connection was already dropped).
            let _ = request.respond.send(conn);
        }
    });

    tx
}

/// Claim an idle connection for `subdomain`, or return `None` once
/// `deadline` elapses or the pool disappears. Requests are processed one
/// at a time by the single dispatcher task, matching the original's total
/// ordering; within that, pools are looked up by subdomain directly
/// rather than via a dynamic N-way select; spec §4.D/§9 permit this
/// simplification once pools are subdomain-keyed.
async fn dispatch_one(
    registry: &Registry,
    subdomain: &Subdomain,
    deadline: Instant,
) -> Option<Arc<Connection>> {
    loop {
        let pool = {
            let guard = registry.read().await;
            guard.get(subdomain).cloned()
        };
        let pool = pool?;

        if Instant::now() >= deadline {
            return None;
        }

        match pool.recv_idle(deadline).await {
            Some(conn) => {
                if conn.take() {
                    return Some(conn);
                }
                // Lost the race (e.g. a reaper close beat us to it); retry.
            }
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TunnelUser;
    use std::time::Duration;
    use tunnelcrab_core::PoolId;

    fn new_registry() -> Arc<Registry> {
        Arc::new(RwLock::new(HashMap::new()))
    }

    #[tokio::test]
    async fn returns_none_for_unknown_subdomain() {
        let registry = new_registry();
        let subdomain = Subdomain::parse("xxyyzz").unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(dispatch_one(&registry, &subdomain, deadline)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn returns_none_when_pool_has_no_idle_connection_before_deadline() {
        let subdomain = Subdomain::parse("test").unwrap();
        let pool = Pool::new(
            PoolId::generate(),
            subdomain.clone(),
            "http://localhost:1".into(),
            TunnelUser {
                identifier: "alice".into(),
            },
            Duration::from_secs(60),
        );
        let registry = new_registry();
        registry.write().await.insert(subdomain.clone(), pool);

        let deadline = Instant::now() + Duration::from_millis(30);
        let start = Instant::now();
        assert!(dispatch_one(&registry, &subdomain, deadline)
            .await
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
