use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};

/// The admin HTTP API (login, tunnel-user CRUD, stats, dashboard) is out of
/// scope for this crate (spec §1); it is consumed here only as an
/// interface (spec §6): whatever isn't a tunnel request (Host header
/// doesn't carry a valid subdomain of the configured domain) is handed to
/// this collaborator instead of the tunnel dispatcher.
#[async_trait]
pub trait AdminRouter: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response;
}

/// Default used when no admin API is wired in: every non-tunnel request
/// gets a plain 404.
pub struct NotFoundAdminRouter;

#[async_trait]
impl AdminRouter for NotFoundAdminRouter {
    async fn handle(&self, _req: Request<Body>) -> Response {
        (StatusCode::NOT_FOUND, "not found").into_response()
    }
}
