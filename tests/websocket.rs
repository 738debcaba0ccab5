//! End-to-end tests of the WebSocket transport against a loopback router

mod common;

use common::init_tracing;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wamp_client::{
    Connection, ConnectionConfig, Dict, List, Message, Transport, WampError, WebSocketTransport,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum RouterEvent {
    Handshake {
        protocol: Option<String>,
        client: Option<String>,
    },
    Received(List),
}

/// Accept one WebSocket client and answer it like a minimal broker
async fn spawn_router() -> (String, mpsc::UnboundedReceiver<RouterEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();

        let handshake_events = events_tx.clone();
        let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let protocol = header("Sec-WebSocket-Protocol");
            let client = header("X-Client");

            if let Some(protocol) = &protocol {
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_str(protocol).unwrap(),
                );
            }
            let _ = handshake_events.send(RouterEvent::Handshake { protocol, client });
            Ok(response)
        };
        let mut ws = accept_hdr_async(stream, callback).await.unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            let text = match frame {
                WsMessage::Text(text) => text.as_str().to_string(),
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let message: List = serde_json::from_str(&text).unwrap();
            let _ = events_tx.send(RouterEvent::Received(message.clone()));

            let replies = match message[0].as_u64() {
                Some(1) => vec![json!([2, 1234, {"roles": {"broker": {}}}])],
                Some(32) => vec![
                    json!([33, message[1].clone(), 77]),
                    json!([36, 77, 5, {}, ["hi"]]),
                ],
                Some(6) => vec![json!([6, {}, "wamp.error.goodbye_and_out"])],
                _ => vec![],
            };
            for reply in replies {
                if ws.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
        }

        let _ = ws.close(None).await;
    });

    (url, events_rx)
}

async fn next_received(events: &mut mpsc::UnboundedReceiver<RouterEvent>) -> List {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(RouterEvent::Received(message)) => return message,
            Some(_) => continue,
            None => panic!("router stopped"),
        }
    }
}

#[tokio::test]
async fn test_connection_round_trip_over_websocket() {
    init_tracing();
    let (url, mut router) = spawn_router().await;

    let config = ConnectionConfig::new(url, "realm1")
        .header("X-Client", "wamp-test")
        .no_reconnect();
    let connection = Connection::new(config);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    connection.on_join(move |session, _details| {
        let event_tx = event_tx.clone();
        session
            .subscribe(
                "com.example.topic",
                move |args, _kwargs, details| {
                    let _ = event_tx.send((args, details));
                },
                Dict::new(),
                |result| assert!(result.is_ok()),
            )
            .unwrap();
    });

    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
    connection.on_disconnect(move |reason| {
        let _ = disconnect_tx.send(reason.to_string());
    });

    connection.open().unwrap();

    match timeout(WAIT, router.recv()).await.unwrap() {
        Some(RouterEvent::Handshake { protocol, client }) => {
            assert_eq!(protocol.as_deref(), Some("wamp.2.json"));
            assert_eq!(client.as_deref(), Some("wamp-test"));
        }
        other => panic!("expected handshake, got {other:?}"),
    }

    let hello = next_received(&mut router).await;
    assert_eq!(hello[0], json!(1));
    assert_eq!(hello[1], json!("realm1"));

    let subscribe = next_received(&mut router).await;
    assert_eq!(subscribe[0], json!(32));
    assert_eq!(subscribe[3], json!("com.example.topic"));

    let (args, details) = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(args, Some(vec![json!("hi")]));
    assert_eq!(details.get("publication"), Some(&json!(5)));

    let session = connection.session().unwrap();
    assert_eq!(session.id(), Some(1234));
    assert_eq!(session.subscription(77).map(|s| s.id()), Some(77));

    connection.close().unwrap();
    let goodbye = next_received(&mut router).await;
    assert_eq!(goodbye, vec![json!(6), json!({}), json!("wamp.close.normal")]);

    timeout(WAIT, connection.stopped()).await.unwrap();
    assert!(timeout(WAIT, disconnect_rx.recv()).await.unwrap().is_some());
    assert!(!connection.is_open());
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_transport_events_and_disconnect() {
    init_tracing();
    let (url, mut router) = spawn_router().await;
    let config = ConnectionConfig::new(url, "realm1");
    let transport = Arc::new(WebSocketTransport::new(&config));

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let open_tx = tx.clone();
    transport.on_open(Arc::new(move || {
        let _ = open_tx.send("open".to_string());
    }));
    let message_tx = tx.clone();
    transport.on_message(Arc::new(move |payload: List| {
        let _ = message_tx.send(Value::Array(payload).to_string());
    }));
    transport.on_close(Arc::new(move |reason| {
        let _ = tx.send(format!("close: {}", reason));
    }));

    transport.connect();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "open");
    assert!(transport.is_connected());

    transport
        .send(&Message::Hello {
            realm: "realm1".to_string(),
            details: Dict::new(),
        })
        .unwrap();
    assert_eq!(next_received(&mut router).await, vec![json!(1), json!("realm1"), json!({})]);

    let welcome = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(welcome, r#"[2,1234,{"roles":{"broker":{}}}]"#);

    // Close handshake is asynchronous
    assert!(!transport.disconnect());
    assert!(!transport.is_connected());
    assert!(matches!(
        transport.send(&Message::Unsubscribed { request: 1 }),
        Err(WampError::NotConnected)
    ));

    let closed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(closed.starts_with("close: "));

    // Reported once; later disconnects are immediate no-ops
    assert!(transport.disconnect());
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_unreachable_router_reports_disconnect() {
    init_tracing();

    // Reserve a port, then free it so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let connection = Connection::new(ConnectionConfig::new(url, "realm1").no_reconnect());
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on_disconnect(move |reason| {
        let _ = tx.send(reason.to_string());
    });
    connection.on_connect(|| panic!("connection should not open"));

    connection.open().unwrap();

    let reason = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(reason.contains("Connection failed"), "unexpected reason: {reason}");
    timeout(WAIT, connection.stopped()).await.unwrap();
    assert!(!connection.is_open());
}
