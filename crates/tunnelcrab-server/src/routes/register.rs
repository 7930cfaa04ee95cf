use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::info;

use tunnelcrab_core::TunnelError;

use crate::broker::{fatal_register_diagnostic, Broker, RegisterRequest};

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

/// Pick a non-101 status for a rejected upgrade. The original always
/// writes a diagnostic body and leaves the exact status to whatever the
/// HTTP framework defaults to; we choose something more specific where the
/// failure kind is unambiguous.
fn status_for(err: &TunnelError) -> StatusCode {
    match err {
        TunnelError::InvalidSubdomain(_) | TunnelError::InvalidGreeting(_) => {
            StatusCode::BAD_REQUEST
        }
        TunnelError::Other(msg) if msg.contains("secret key") => StatusCode::UNAUTHORIZED,
        TunnelError::Other(msg) if msg.contains("already in use") => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn register(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let subdomain = header(&headers, "X-Tunnel-Subdomain");
    let local_server = header(&headers, "X-Local-Server");
    let secret_key = header(&headers, "X-Secret-Key");
    let greeting = header(&headers, "X-Greeting-Message");

    let (subdomain, local_server, secret_key, greeting) =
        match (subdomain, local_server, secret_key, greeting) {
            (Some(s), Some(l), Some(k), Some(g)) => (s, l, k, g),
            _ => {
                let body = fatal_register_diagnostic(
                    "missing one of X-Tunnel-Subdomain, X-Local-Server, X-Secret-Key, X-Greeting-Message",
                );
                return (StatusCode::BAD_REQUEST, body).into_response();
            }
        };

    let request = RegisterRequest {
        subdomain,
        local_server,
        secret_key,
        greeting,
    };

    let pool = match broker.authorize_registration(&request).await {
        Ok(pool) => pool,
        Err(e) => {
            let body = fatal_register_diagnostic(&e.to_string());
            return (status_for(&e), body).into_response();
        }
    };

    info!(subdomain = %pool.subdomain, pool = %pool.id, "accepted tunnel registration");
    ws.on_upgrade(move |socket| async move {
        pool.register(socket);
    })
}

pub fn router() -> Router<Arc<Broker>> {
    Router::new().route("/register", get(register))
}
