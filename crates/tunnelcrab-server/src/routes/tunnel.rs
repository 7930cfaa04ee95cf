use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{info, warn};

use tunnelcrab_core::Headers;

use crate::broker::{synthetic_error_body, Broker};
use crate::connection::ProxiedRequest;

/// Request bodies are buffered whole (see SPEC_FULL.md §4 on the
/// streaming-writer open question); this bounds how much memory one
/// in-flight request can hold.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

fn error_526(message: &str) -> Response {
    warn!(%message, "broker-side tunnel failure");
    (StatusCode::from_u16(526).unwrap(), synthetic_error_body(message)).into_response()
}

fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Headers::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(v.to_string());
        }
    }
    out
}

fn apply_headers(response: &mut Response, header: &Headers) {
    let headers = response.headers_mut();
    for (name, values) in header {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

/// Catch-all for any inbound HTTP whose `Host` carries a valid subdomain
/// of the configured domain. Hosts that don't match are handed to the
/// admin-API seam instead (spec §6).
async fn tunnel_request(State(broker): State<Arc<Broker>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let Some(subdomain) = broker.subdomain_from_host(&host) else {
        return broker.admin.handle(Request::from_parts(parts, body)).await;
    };

    let Some(pool) = broker.pool_for(&subdomain).await else {
        return error_526("unregistered tunnel subdomain");
    };

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return error_526(&format!("failed to read request body: {e}")),
    };

    let mut url = pool.local_server.clone();
    url.push_str(parts.uri.path());
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let proxied = ProxiedRequest {
        method: parts.method.to_string(),
        url,
        header: collect_headers(&parts.headers),
        content_length: body.len() as i64,
        body,
    };

    let Some(conn) = broker.dispatch(subdomain).await else {
        return error_526("no idle tunnel connection available");
    };

    match conn.proxy_request(proxied).await {
        Ok(resp) => {
            info!(status = resp.status_code, path = %parts.uri.path(), "proxied request");
            let mut response = match StatusCode::from_u16(resp.status_code) {
                Ok(status) => (status, resp.body).into_response(),
                Err(_) => (StatusCode::OK, resp.body).into_response(),
            };
            apply_headers(&mut response, &resp.header);
            response
        }
        Err(e) => error_526(&e.to_string()),
    }
}

pub fn router() -> Router<Arc<Broker>> {
    Router::new().fallback(tunnel_request)
}
