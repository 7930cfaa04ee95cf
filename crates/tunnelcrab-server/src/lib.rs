pub mod admin;
pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod pool;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use tunnelcrab_core::Result;

pub use broker::Broker;
pub use config::ServerConfig;

/// Initialize tracing for the broker process. Call once, before `serve()`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelcrab_server=info,tower_http=info".into()),
        )
        .init();
}

/// Build the axum router: `/register`, `/status`, then the tunnel catch-all.
pub fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .merge(routes::register::router())
        .merge(routes::status::router())
        .merge(routes::tunnel::router())
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
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

/// Run the broker until `shutdown` is cancelled.
pub async fn serve(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = config.addr();
    let broker = Broker::new(config);
    broker.spawn_reaper(shutdown.clone());

    let router = build_router(broker.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| tunnelcrab_core::TunnelError::Other(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "tunnel broker listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| tunnelcrab_core::TunnelError::Other(format!("server error: {e}")))?;

    broker.shutdown().await;
    info!("tunnel broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> ServerConfig {
        ServerConfig {
            domain: "example.com".into(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn status_route_answers_ok_without_auth() {
        let router = build_router(Broker::new(test_config()));
        let response = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn unregistered_subdomain_yields_526() {
        let router = build_router(Broker::new(test_config()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Host", "xxyyzz.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 526);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            br#"{"error":"unregistered tunnel subdomain"}"#
        );
    }

    #[tokio::test]
    async fn unknown_host_falls_back_to_admin_router() {
        let router = build_router(Broker::new(test_config()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/dashboard")
                    .header("Host", "admin.other-domain.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
