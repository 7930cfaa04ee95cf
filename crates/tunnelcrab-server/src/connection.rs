use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use tunnelcrab_core::{Headers, Result, SerializedRequest, SerializedResponse, TunnelError};
use tunnelcrab_ws::Classified;

use crate::pool::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Busy,
    Closed,
}

struct ConnState {
    status: Status,
    idle_since: Instant,
}

/// A single server-side WebSocket connection to one Client process. Relays
/// at most one HTTP request at a time (`status` enforces this).
///
/// The sink lives behind a `tokio::sync::Mutex` because writes are
/// held across `.await`; the status/idle_since pair lives behind a plain
/// `std::sync::Mutex` because those transitions are synchronous and must
/// never be held across an await point (see spec §5 locking discipline).
pub struct Connection {
    pool: Weak<Pool>,
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    state: Mutex<ConnState>,
    next_frame_tx: mpsc::Sender<oneshot::Sender<Bytes>>,
    closed: AtomicBool,
}

/// Request payload handed to `Connection::proxy_request`. Bodies are fully
/// buffered `Bytes`; see SPEC_FULL.md §4 on the streaming-writer open
/// question.
pub struct ProxiedRequest {
    pub method: String,
    pub url: String,
    pub header: Headers,
    pub content_length: i64,
    pub body: Bytes,
}

pub struct ProxiedResponse {
    pub status_code: u16,
    pub header: Headers,
    pub body: Bytes,
}

impl Connection {
    /// Split `ws`, wire up the rendezvous channel, register as Idle, and
    /// spawn the reader loop. Mirrors `NewConnection` + its immediate
    /// `Release()` + `go c.read()` in the original.
    pub fn register(pool: &Arc<Pool>, ws: WebSocket) -> Arc<Self> {
        let (sink, stream) = ws.split();
        let (next_frame_tx, next_frame_rx) = mpsc::channel(1);

        let conn = Arc::new(Self {
            pool: Arc::downgrade(pool),
            sink: tokio::sync::Mutex::new(sink),
            state: Mutex::new(ConnState {
                status: Status::Idle,
                idle_since: Instant::now(),
            }),
            next_frame_tx,
            closed: AtomicBool::new(false),
        });

        conn.offer();
        tokio::spawn(Self::reader_loop(conn.clone(), stream, next_frame_rx));

        conn
    }

    fn offer(self: &Arc<Self>) {
        let conn = self.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Some(pool) = pool.upgrade() {
                pool.offer(conn).await;
            }
        });
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn idle_since(&self) -> Instant {
        self.state.lock().unwrap().idle_since
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Atomically move Idle -> Busy. False if Closed or already Busy.
    pub fn take(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != Status::Idle {
            return false;
        }
        state.status = Status::Busy;
        true
    }

    /// Move Busy -> Idle (no-op if Closed) and re-advertise on the pool's
    /// idle channel from a fresh task so the caller is never blocked.
    pub fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.status == Status::Closed {
            return;
        }
        state.idle_since = Instant::now();
        state.status = Status::Idle;
        drop(state);
        self.offer();
    }

    /// Close once, idempotently. Does not remove itself from the pool's
    /// connection list; that happens lazily in `Pool::clean`.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
        }
        self.closed.store(true, Ordering::Release);
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }

    async fn send_text(&self, value: &impl serde::Serialize) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut sink = self.sink.lock().await;
        sink.send(tunnelcrab_ws::axum_text(json))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    async fn send_binary(&self, body: Vec<u8>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(tunnelcrab_ws::axum_binary(body))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Hand a oneshot sender to the reader loop and wait for the next
    /// application frame it reads off the socket. This is the Rust
    /// analogue of the "channel of channel of io.Reader" rendezvous:
    /// see SPEC_FULL.md §4 for why a fully-read `Bytes` stands in for a
    /// streaming reader handle here.
    async fn await_next_frame(&self) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.next_frame_tx
            .send(tx)
            .await
            .map_err(|_| TunnelError::Transport("reader loop gone".into()))?;
        rx.await
            .map_err(|_| TunnelError::Transport("connection closed waiting for frame".into()))
    }

    /// Relay one HTTP request/response pair over the WebSocket. Closes the
    /// connection and returns an error on any transport-level failure;
    /// releases it back to Idle on success.
    pub async fn proxy_request(self: &Arc<Self>, req: ProxiedRequest) -> Result<ProxiedResponse> {
        match self.proxy_request_inner(req).await {
            Ok(resp) => {
                self.release();
                Ok(resp)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn proxy_request_inner(&self, req: ProxiedRequest) -> Result<ProxiedResponse> {
        let shr = SerializedRequest {
            method: req.method,
            url: req.url,
            header: req.header,
            content_length: req.content_length,
        };
        self.send_text(&shr).await?;
        self.send_binary(req.body.to_vec()).await?;

        let meta_bytes = self.await_next_frame().await?;
        let shp: SerializedResponse = serde_json::from_slice(&meta_bytes)
            .map_err(|e| TunnelError::Decode(format!("response metadata: {e}")))?;

        let body_bytes = self.await_next_frame().await?;

        Ok(ProxiedResponse {
            status_code: shp.status_code,
            header: shp.header,
            body: body_bytes,
        })
    }

    /// Repeatedly pulls the next WebSocket message. Control frames are
    /// drained inline; application frames are paired with whichever
    /// `proxy_request` rendezvous is currently waiting. An unsolicited
    /// data frame (connection not Busy) or a read error closes the
    /// connection; see spec §4.B.
    async fn reader_loop(
        conn: Arc<Connection>,
        mut stream: SplitStream<WebSocket>,
        mut next_frame_rx: mpsc::Receiver<oneshot::Sender<Bytes>>,
    ) {
        loop {
            if conn.is_closed() {
                break;
            }
            let msg = match stream.next().await {
                Some(Ok(m)) => m,
                _ => break,
            };
            match tunnelcrab_ws::classify_axum(msg) {
                Classified::Control => continue,
                Classified::Close => break,
                Classified::Data(bytes) => {
                    if conn.status() != Status::Busy {
                        warn!("unsolicited frame on idle connection, closing");
                        break;
                    }
                    match next_frame_rx.recv().await {
                        Some(responder) => {
                            let _ = responder.send(bytes);
                        }
                        None => break,
                    }
                }
            }
        }
        conn.close().await;
    }
}
