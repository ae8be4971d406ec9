//! WebSocket integration tests: in-process Hub on an ephemeral port, real `demo-core` Cores.

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thehub::ipc::serve_ws;
use thehub::types::Secret;
use thehub::{Hub, HubConfig, Manifest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const DEMO_CORE: &str = env!("CARGO_BIN_EXE_demo-core");
const TOKEN: &str = "s3cret";
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Helper: boot a Hub with one `echo` Core and serve it on 127.0.0.1.
async fn start_hub(token: Option<&str>) -> (Arc<Hub>, SocketAddr) {
    let config = HubConfig {
        token: token.map(Secret::new),
        ..HubConfig::default()
    };
    let hub = Hub::new(config);
    let manifest = Manifest::from_yaml_str(&format!(
        "cores:\n  echo:\n    command: \"{}\"\n    args: [\"--tool\", \"say\"]\n",
        DEMO_CORE
    ))
    .unwrap();
    let report = hub.reconcile(&manifest).await.unwrap();
    assert_eq!(report.added, vec!["echo".to_string()]);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_ws(hub.clone(), listener));
    (hub, addr)
}

/// Helper: build an upgrade request offering the `mcp` subprotocol.
fn upgrade_request(
    addr: SocketAddr,
    bearer: Option<&str>,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    let headers = request.headers_mut();
    headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mcp"));
    if let Some(token) = bearer {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
    }
    request
}

/// Helper: plain HTTP GET returning the raw response text.
async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    tokio::time::timeout(STEP_TIMEOUT, stream.read_to_string(&mut raw))
        .await
        .unwrap()
        .unwrap();
    raw
}

fn body_of(raw: &str) -> &str {
    raw.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}

#[tokio::test]
async fn test_authorized_client_calls_tool() {
    let (hub, addr) = start_hub(Some(TOKEN)).await;

    let (mut socket, response) =
        tokio_tungstenite::connect_async(upgrade_request(addr, Some(TOKEN)))
            .await
            .unwrap();
    assert_eq!(
        response.headers().get("sec-websocket-protocol").unwrap(),
        "mcp"
    );

    let call = json!({
        "jsonrpc": "2.0", "id": 7, "method": "tools/call",
        "params": {"name": "echo.say", "arguments": {"text": "over ws"}},
    });
    socket.send(Message::Text(call.to_string())).await.unwrap();

    let reply = loop {
        let message = tokio::time::timeout(STEP_TIMEOUT, socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            break serde_json::from_str::<Value>(&text).unwrap();
        }
    };
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["content"][0]["text"], "echo: over ws");

    let metrics = http_get(addr, "/metrics").await;
    assert!(metrics.contains(
        "requests_total{client=\"ws\",method=\"tools/call\",core=\"echo\"} 1"
    ));

    hub.shutdown().await;
}

#[tokio::test]
async fn test_missing_token_closes_with_4401() {
    let (hub, addr) = start_hub(Some(TOKEN)).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(upgrade_request(addr, None))
        .await
        .unwrap();

    let close_code = loop {
        match tokio::time::timeout(STEP_TIMEOUT, socket.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => break Some(u16::from(frame.code)),
            Some(Ok(Message::Close(None))) | None | Some(Err(_)) => break None,
            Some(Ok(_)) => continue,
        }
    };
    assert_eq!(close_code, Some(4401));

    hub.shutdown().await;
}

#[tokio::test]
async fn test_wrong_token_closes_with_4401() {
    let (hub, addr) = start_hub(Some(TOKEN)).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(upgrade_request(addr, Some("guess")))
            .await
            .unwrap();

    let message = tokio::time::timeout(STEP_TIMEOUT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4401),
        other => panic!("expected close frame, got {:?}", other),
    }

    hub.shutdown().await;
}

#[tokio::test]
async fn test_healthz_reports_cores_and_tools() {
    let (hub, addr) = start_hub(None).await;

    let raw = http_get(addr, "/healthz").await;
    assert!(raw.starts_with("HTTP/1.1 200"), "response: {}", raw);
    let body: Value = serde_json::from_str(body_of(&raw)).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["cores"], json!(["echo"]));
    assert_eq!(body["tools"], 2);
    let started = body["startedAt"].as_str().unwrap();
    assert_eq!(started, hub.started_at().to_rfc3339());
    assert!(body["uptimeSecs"].as_i64().unwrap() >= 0);

    hub.shutdown().await;
}
