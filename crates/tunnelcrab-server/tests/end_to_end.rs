use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use tunnelcrab_core::{Greeting, PoolId, SerializedRequest, SerializedResponse};
use tunnelcrab_server::config::UserConfig;
use tunnelcrab_server::{Broker, ServerConfig};

/// Exercises the whole pipeline (broker, pool, dispatcher, connection)
/// end-to-end: a fake Client registers a tunnel and answers exactly one
/// request, standing in for scenario 1 of the concrete seed tests.
#[tokio::test]
async fn get_request_round_trips_through_a_registered_tunnel() {
    let config = ServerConfig {
        domain: "example.com".into(),
        users: vec![UserConfig {
            identifier: "alice".into(),
            secret_key: "s3cret".into(),
        }],
        ..ServerConfig::default()
    };
    let broker = Broker::new(config);
    let router = tunnelcrab_server::build_router(broker);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let pool_id = PoolId::generate();
    let greeting = Greeting::format(&pool_id, 1);
    let mut request = format!("ws://{addr}/register")
        .into_client_request()
        .unwrap();
    let headers = request.headers_mut();
    headers.insert("X-Secret-Key", "s3cret".parse().unwrap());
    headers.insert("X-Tunnel-Subdomain", "test".parse().unwrap());
    headers.insert("X-Local-Server", "http://localhost:9999".parse().unwrap());
    headers.insert("X-Greeting-Message", greeting.parse().unwrap());

    let (ws_stream, _resp) = connect_async(request)
        .await
        .expect("registration should succeed");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    tokio::spawn(async move {
        let meta = match ws_rx.next().await {
            Some(Ok(Message::Text(t))) => t,
            other => panic!("expected text metadata frame, got {other:?}"),
        };
        let shr: SerializedRequest = serde_json::from_str(&meta).unwrap();
        assert_eq!(shr.method, "GET");
        match ws_rx.next().await {
            Some(Ok(Message::Binary(_))) => {}
            other => panic!("expected binary body frame, got {other:?}"),
        }

        let body = b"{\"message\":\"ok\"}\n".to_vec();
        let shp = SerializedResponse {
            status_code: 200,
            header: Default::default(),
            content_length: body.len() as i64,
        };
        ws_tx
            .send(Message::Text(serde_json::to_string(&shp).unwrap().into()))
            .await
            .unwrap();
        ws_tx.send(Message::Binary(body.into())).await.unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/"))
        .header("Host", "test.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "{\"message\":\"ok\"}\n");
}

#[tokio::test]
async fn unregistered_subdomain_returns_526_with_json_body() {
    let config = ServerConfig {
        domain: "example.com".into(),
        ..ServerConfig::default()
    };
    let broker = Broker::new(config);
    let router = tunnelcrab_server::build_router(broker);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/"))
        .header("Host", "xxyyzz.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 526);
    assert_eq!(
        response.text().await.unwrap(),
        r#"{"error":"unregistered tunnel subdomain"}"#
    );
}
