use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::ServerConfig;

/// A tunnel-owning identity, resolved from the `X-Secret-Key` header on
/// `/register`. Persistence/CRUD for these lives in the admin API, which
/// this crate treats as an external collaborator (see spec §6); this
/// trait is the only seam the broker needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUser {
    pub identifier: String,
}

#[async_trait]
pub trait UserResolver: Send + Sync {
    /// Resolve a secret key to its owning user, or `None` if unknown.
    async fn get_by_secret_key(&self, secret_key: &str) -> Option<TunnelUser>;

    /// Mark a user as having an active tunnel. The admin API's persistence
    /// layer owns what happens with this; the in-memory resolver used for
    /// standalone deployments treats it as a no-op.
    async fn set_active(&self, _user: &TunnelUser) {}
}

/// Resolves users from the static list in `ServerConfig`. Good enough for
/// single-node deployments; a deployment with the admin API plugs in a
/// database-backed `UserResolver` instead.
pub struct StaticUserResolver {
    by_secret: HashMap<String, TunnelUser>,
}

impl StaticUserResolver {
    pub fn new(config: &ServerConfig) -> Self {
        let by_secret = config
            .users
            .iter()
            .map(|u| {
                (
                    u.secret_key.clone(),
                    TunnelUser {
                        identifier: u.identifier.clone(),
                    },
                )
            })
            .collect();
        Self { by_secret }
    }
}

#[async_trait]
impl UserResolver for StaticUserResolver {
    async fn get_by_secret_key(&self, secret_key: &str) -> Option<TunnelUser> {
        self.by_secret.get(secret_key).cloned()
    }
}
