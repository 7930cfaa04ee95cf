use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use tunnelcrab_core::{Greeting, Headers, Result, SerializedRequest, SerializedResponse, TunnelError};
use tunnelcrab_ws::Classified;

use crate::pool::Pool;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Closed,
}

/// One outbound WebSocket to the broker's `/register` endpoint. Executes
/// whatever requests arrive on it against the locally configured target.
pub struct Connection {
    pool: Weak<Pool>,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    status: Mutex<Status>,
    closed: AtomicBool,
    http_client: reqwest::Client,
}

/// Dial the broker and complete the registration handshake. Returns the
/// Connection plus the read half the caller must drive via `serve`.
pub async fn connect(
    pool: &Arc<Pool>,
    register_url: &str,
    secret_key: &str,
    subdomain: &str,
    local_server: &str,
    greeting: &Greeting,
) -> Result<(Arc<Connection>, SplitStream<WsStream>)> {
    let mut request = register_url
        .into_client_request()
        .map_err(|e| TunnelError::Other(format!("invalid target url: {e}")))?;
    let header_err = |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
        TunnelError::Other(format!("invalid registration header value: {e}"))
    };
    let headers = request.headers_mut();
    headers.insert("X-Secret-Key", secret_key.parse().map_err(header_err)?);
    headers.insert("X-Tunnel-Subdomain", subdomain.parse().map_err(header_err)?);
    headers.insert("X-Local-Server", local_server.parse().map_err(header_err)?);
    headers.insert(
        "X-Greeting-Message",
        Greeting::format(&greeting.pool_id, greeting.pool_idle_size)
            .parse()
            .map_err(header_err)?,
    );

    let (ws, _response) = connect_async(request).await.map_err(|e| match e {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            let body = resp
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            TunnelError::Other(format!(
                "registration rejected ({}): {body}",
                resp.status()
            ))
        }
        other => TunnelError::Transport(other.to_string()),
    })?;

    let (sink, stream) = ws.split();
    let conn = Arc::new(Connection {
        pool: Arc::downgrade(pool),
        sink: tokio::sync::Mutex::new(sink),
        status: Mutex::new(Status::Idle),
        closed: AtomicBool::new(false),
        http_client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TunnelError::Other(format!("failed to build http client: {e}")))?,
    });
    Ok((conn, stream))
}

impl Connection {
    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == Status::Closed {
                return;
            }
            *status = Status::Closed;
        }
        self.closed.store(true, Ordering::Release);
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }

    async fn send_text(&self, value: &impl serde::Serialize) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    async fn send_binary(&self, body: Vec<u8>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(body.into()))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    async fn ping(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(Duration::from_secs(1), sink.send(Message::Ping(Vec::new().into())))
            .await
            .map_err(|_| TunnelError::Transport("ping write timed out".into()))?
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Every 30 seconds, write a ping with a 1-second write deadline;
    /// closes the connection on failure.
    pub async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.ping().await {
                warn!(error = %e, "keepalive ping failed, closing connection");
                self.close().await;
                break;
            }
        }
    }

    /// Read requests off the WebSocket, execute them locally, and write
    /// the responses back, until the connection closes.
    pub async fn serve_loop(
        self: Arc<Self>,
        mut stream: SplitStream<WsStream>,
        local_server: String,
        is_initial_connection: bool,
    ) {
        if is_initial_connection {
            info!(%local_server, "tunnel connection established");
        }
        loop {
            if self.is_closed() {
                break;
            }
            *self.status.lock().unwrap() = Status::Idle;

            let msg = match stream.next().await {
                Some(Ok(m)) => m,
                _ => break,
            };

            let bytes = match tunnelcrab_ws::classify_tungstenite(msg) {
                Classified::Control => continue,
                Classified::Close => break,
                Classified::Data(bytes) => bytes,
            };

            *self.status.lock().unwrap() = Status::Running;
            if let Some(pool) = self.pool.upgrade() {
                pool.refresh();
            }

            let shr: SerializedRequest = match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(_) => break,
            };
            let body = match stream.next().await {
                Some(Ok(m)) => match tunnelcrab_ws::classify_tungstenite(m) {
                    Classified::Data(b) => b,
                    _ => break,
                },
                _ => break,
            };

            match self.execute(&shr, body).await {
                Ok((status, header, resp_body)) => {
                    info!(method = %shr.method, status, path = %shr.url, "proxied request");
                    let shp = SerializedResponse {
                        status_code: status,
                        header,
                        content_length: resp_body.len() as i64,
                    };
                    if self.send_text(&shp).await.is_err() {
                        break;
                    }
                    if self.send_binary(resp_body.to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(message) => {
                    let shp = SerializedResponse::error(527, message.len());
                    if self.send_text(&shp).await.is_err() {
                        break;
                    }
                    if self.send_binary(message.into_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.close().await;
    }

    /// Run the request against the local target. `Err` carries the
    /// diagnostic text that becomes the HTTP 527 body; the Connection
    /// stays open in that case (spec §7 kind 4).
    async fn execute(
        &self,
        shr: &SerializedRequest,
        body: Bytes,
    ) -> std::result::Result<(u16, Headers, Bytes), String> {
        let method = reqwest::Method::from_bytes(shr.method.as_bytes())
            .map_err(|e| format!("invalid method {}: {e}", shr.method))?;
        let mut builder = self.http_client.request(method, &shr.url);
        for (name, values) in &shr.header {
            for value in values {
                builder = builder.header(name, value);
            }
        }
        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| format!("upstream request failed: {e}"))?;

        let status = response.status().as_u16();
        let mut header: Headers = Headers::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                header
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(v.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| format!("failed to read upstream body: {e}"))?;
        Ok((status, header, body))
    }
}
