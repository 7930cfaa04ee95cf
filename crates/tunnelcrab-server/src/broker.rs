use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::interval;
use tracing::{info, warn};

use tunnelcrab_core::{Greeting, Result, Subdomain, TunnelError};

use crate::admin::{AdminRouter, NotFoundAdminRouter};
use crate::auth::{StaticUserResolver, UserResolver};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatcher::{self, DispatchRequest, Registry};
use crate::pool::Pool;

/// Everything about a registration request except the WebSocket itself,
/// pulled out of the headers by the `/register` route.
pub struct RegisterRequest {
    pub subdomain: String,
    pub local_server: String,
    pub secret_key: String,
    pub greeting: String,
}

/// The process-wide tunnel state: pool registry, dispatcher handle, user
/// resolver, and the admin-API seam. Shared behind an `Arc` by every route
/// handler, mirroring the teacher's `AppState`.
pub struct Broker {
    pub config: ServerConfig,
    registry: Arc<Registry>,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
    users: Box<dyn UserResolver>,
    pub admin: Box<dyn AdminRouter>,
}

impl Broker {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_resolver_and_admin(
            config.clone(),
            Box::new(StaticUserResolver::new(&config)),
            Box::new(NotFoundAdminRouter),
        )
    }

    /// Construct with a custom `UserResolver` and `AdminRouter`, the two
    /// seams a deployment with the admin API plugs into (spec §6).
    pub fn with_resolver_and_admin(
        config: ServerConfig,
        users: Box<dyn UserResolver>,
        admin: Box<dyn AdminRouter>,
    ) -> Arc<Self> {
        let registry: Arc<Registry> = Arc::new(RwLock::new(HashMap::new()));
        let dispatch_tx = dispatcher::spawn(registry.clone());
        Arc::new(Self {
            config,
            registry,
            dispatch_tx,
            users,
            admin,
        })
    }

    /// Validate a registration request and return the Pool it should be
    /// attached to, creating it if needed. Does not touch the WebSocket;
    /// the caller upgrades and calls `pool.register(ws)` afterwards.
    pub async fn authorize_registration(&self, req: &RegisterRequest) -> Result<Arc<Pool>> {
        let subdomain = Subdomain::parse(&req.subdomain)?;

        let user = self
            .users
            .get_by_secret_key(&req.secret_key)
            .await
            .ok_or_else(|| TunnelError::Other("unknown secret key".into()))?;
        self.users.set_active(&user).await;

        let greeting = Greeting::parse(&req.greeting)?;

        let pool = {
            let guard = self.registry.read().await;
            guard.get(&subdomain).cloned()
        };

        let pool = match pool {
            Some(existing) if existing.id == greeting.pool_id => existing,
            Some(existing) => {
                return Err(TunnelError::Other(format!(
                    "subdomain {} already in use by pool {}",
                    subdomain, existing.id
                )));
            }
            None => {
                let created = Pool::new(
                    greeting.pool_id.clone(),
                    subdomain.clone(),
                    req.local_server.clone(),
                    user,
                    self.config.idle_timeout(),
                );
                self.registry
                    .write()
                    .await
                    .insert(subdomain.clone(), created.clone());
                created
            }
        };

        pool.set_size(greeting.pool_idle_size);
        Ok(pool)
    }

    /// Look up the Pool serving `subdomain`, if any is currently registered.
    pub async fn pool_for(&self, subdomain: &Subdomain) -> Option<Arc<Pool>> {
        self.registry.read().await.get(subdomain).cloned()
    }

    /// Submit a Dispatch Request and await its outcome, bounded by the
    /// configured dispatch timeout.
    pub async fn dispatch(&self, subdomain: Subdomain) -> Option<Arc<Connection>> {
        let (respond, rx) = oneshot::channel();
        let request = DispatchRequest {
            subdomain,
            deadline: Instant::now() + self.config.timeout(),
            respond,
        };
        if self.dispatch_tx.send(request).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Parse the subdomain a request targets from its `Host` header, if
    /// it ends with `.<configured domain>`.
    pub fn subdomain_from_host(&self, host: &str) -> Option<Subdomain> {
        let host = host.split(':').next().unwrap_or(host);
        let suffix = format!(".{}", self.config.domain);
        let label = host.strip_suffix(&suffix)?;
        Subdomain::parse(label).ok()
    }

    /// Every 5 seconds (and once more at shutdown), drop empty pools and
    /// log occupancy, mirroring the original's reaper.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => broker.reap().await,
                    _ = shutdown.cancelled() => {
                        broker.reap().await;
                        break;
                    }
                }
            }
        });
    }

    async fn reap(&self) {
        let mut guard = self.registry.write().await;
        let mut idle = 0u32;
        let mut busy = 0u32;
        let mut keep = HashMap::new();
        for (subdomain, pool) in guard.drain() {
            if pool.is_empty().await {
                pool.shutdown().await;
                continue;
            }
            let counts = pool.size_counts();
            idle += counts.idle;
            busy += counts.busy;
            keep.insert(subdomain, pool);
        }
        let npools = keep.len();
        *guard = keep;
        drop(guard);
        info!(npools, idle, busy, "reaped pools");
    }

    pub async fn shutdown(&self) {
        let mut guard = self.registry.write().await;
        for (_, pool) in guard.drain() {
            pool.shutdown().await;
        }
    }
}

pub fn synthetic_error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

pub(crate) fn fatal_register_diagnostic(message: &str) -> String {
    warn!(%message, "rejecting tunnel registration");
    message.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use std::sync::Arc as StdArc;
    use tunnelcrab_core::PoolId;

    fn test_config() -> ServerConfig {
        ServerConfig {
            domain: "example.com".into(),
            users: vec![UserConfig {
                identifier: "alice".into(),
                secret_key: "s3cret".into(),
            }],
            ..ServerConfig::default()
        }
    }

    fn register_req(subdomain: &str, pool_id: &PoolId, idle: u32) -> RegisterRequest {
        RegisterRequest {
            subdomain: subdomain.into(),
            local_server: "http://localhost:9999".into(),
            secret_key: "s3cret".into(),
            greeting: Greeting::format(pool_id, idle),
        }
    }

    #[tokio::test]
    async fn creates_a_new_pool_on_first_registration() {
        let broker = Broker::new(test_config());
        let pool_id = PoolId::generate();
        let req = register_req("myapp", &pool_id, 2);
        let pool = broker.authorize_registration(&req).await.unwrap();
        assert_eq!(pool.id, pool_id);
        assert_eq!(pool.subdomain.as_str(), "myapp");
    }

    #[tokio::test]
    async fn reconnecting_with_the_same_pool_id_reuses_the_pool() {
        let broker = Broker::new(test_config());
        let pool_id = PoolId::generate();
        let first = broker
            .authorize_registration(&register_req("myapp", &pool_id, 1))
            .await
            .unwrap();
        let second = broker
            .authorize_registration(&register_req("myapp", &pool_id, 3))
            .await
            .unwrap();
        assert!(StdArc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn a_different_pool_id_on_the_same_subdomain_is_a_conflict() {
        let broker = Broker::new(test_config());
        broker
            .authorize_registration(&register_req("myapp", &PoolId::generate(), 1))
            .await
            .unwrap();
        let err = broker
            .authorize_registration(&register_req("myapp", &PoolId::generate(), 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn unknown_secret_key_is_rejected() {
        let broker = Broker::new(test_config());
        let mut req = register_req("myapp", &PoolId::generate(), 1);
        req.secret_key = "wrong".into();
        let err = broker.authorize_registration(&req).await.unwrap_err();
        assert!(err.to_string().contains("secret key"));
    }

    #[tokio::test]
    async fn subdomain_from_host_strips_configured_domain() {
        let broker = Broker::new(test_config());
        assert_eq!(
            broker.subdomain_from_host("myapp.example.com").unwrap().as_str(),
            "myapp"
        );
        assert!(broker.subdomain_from_host("myapp.other.com").is_none());
    }
}
