use std::sync::Arc;

use axum::{routing::get, Router};

use crate::broker::Broker;

/// Unconditional liveness probe, answered regardless of pool state and not
/// gated by the `X-Secret-Key` auth the tunnel routes require.
async fn status() -> &'static str {
    "ok"
}

pub fn router() -> Router<Arc<Broker>> {
    Router::new().route("/status", get(status))
}
