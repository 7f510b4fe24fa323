mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use ea_fleet_engine::backend::{InboundMessage, OutboundMessage};
use ea_fleet_engine::errors::SendError;
use ea_fleet_engine::ingestion::{ConnectionConfig, ConnectionManager};
use ea_fleet_engine::models::{ConnectionPhase, ConnectionState};

const EA_UPDATE: &str = r#"{"type":"ea_update","data":{"magic_number":42,"instance_uuid":"x1",
    "symbol":"EURUSD","strategy_tag":"trend","status":"active","last_seen":"2026-03-01T10:00:00Z"}}"#;

fn config(url: String, token: Option<&str>) -> ConnectionConfig {
    ConnectionConfig {
        url,
        auth_token: token.map(String::from),
        reconnect_base: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(15),
        heartbeat_timeout: Duration::from_secs(10),
    }
}

async fn wait_for_state<F>(rx: &mut watch::Receiver<ConnectionState>, pred: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("connection state never reached the expected condition")
}

#[tokio::test]
async fn test_subscriptions_replayed_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(usize, Vec<OutboundMessage>)>();

    tokio::spawn(async move {
        for conn in 0usize.. {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        received.push(serde_json::from_str(text.as_str()).unwrap());
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            seen_tx.send((conn, received)).unwrap();

            if conn == 0 {
                // Drop without a close handshake, like a network failure.
                drop(ws);
                continue;
            }

            ws.send(Message::Text(EA_UPDATE.to_string().into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            break;
        }
    });

    let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
    let manager = Arc::new(ConnectionManager::new(
        config(format!("ws://{addr}/ws"), Some("secret")),
        inbound_tx,
    ));
    manager.subscribe("ea_updates");
    let mut states = manager.watch_state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(manager.clone().run(shutdown_rx));

    let expected = vec![
        OutboundMessage::Auth {
            token: "secret".into(),
        },
        OutboundMessage::Subscribe {
            channels: vec!["ea_updates".into()],
        },
    ];

    let (conn, first) = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(conn, 0);
    assert_eq!(first, expected);

    // Second connection: same auth + subscription, never re-issued by us.
    let (conn, second) = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(conn, 1);
    assert_eq!(second, expected);

    let msg = timeout(Duration::from_secs(5), inbound_rx.recv()).await.unwrap().unwrap();
    match msg {
        InboundMessage::EaUpdate(update) => {
            let agents = update.into_agents();
            assert_eq!(agents.len(), 1);
            assert_eq!(agents[0].magic_number, 42);
        }
        other => panic!("unexpected message {other:?}"),
    }

    let state = wait_for_state(&mut states, |s| s.is_connected()).await;
    assert_eq!(state.reconnect_attempts, 0);
    assert!(state.connected_since.is_some());

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
    assert_eq!(manager.state().phase, ConnectionPhase::Disconnected);
}

#[tokio::test]
async fn test_missing_pong_forces_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel::<usize>();

    tokio::spawn(async move {
        // Hold every socket open but never read it, so pings go unanswered.
        let mut held = Vec::new();
        for conn in 0usize.. {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            held.push(ws);
            if accepted_tx.send(conn).is_err() {
                break;
            }
        }
    });

    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let mut cfg = config(format!("ws://{addr}/ws"), None);
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.heartbeat_timeout = Duration::from_millis(150);
    let manager = Arc::new(ConnectionManager::new(cfg, inbound_tx));
    let mut states = manager.watch_state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(manager.clone().run(shutdown_rx));

    assert_eq!(timeout(Duration::from_secs(5), accepted_rx.recv()).await.unwrap(), Some(0));

    // The error survives until the next successful handshake.
    let lost = wait_for_state(&mut states, |s| {
        s.last_error.as_deref().is_some_and(|e| e.contains("no pong"))
    })
    .await;
    assert!(matches!(
        lost.phase,
        ConnectionPhase::Degraded | ConnectionPhase::Connecting
    ));

    // The transport never reported closure, yet the manager came back.
    assert_eq!(timeout(Duration::from_secs(5), accepted_rx.recv()).await.unwrap(), Some(1));

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreachable_endpoint_stays_disconnected() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let manager = Arc::new(ConnectionManager::new(
        config(format!("ws://{addr}/ws"), None),
        inbound_tx,
    ));
    let mut states = manager.watch_state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(manager.clone().run(shutdown_rx));

    let state = wait_for_state(&mut states, |s| s.reconnect_attempts >= 2).await;
    assert_ne!(state.phase, ConnectionPhase::Connected);
    assert_ne!(state.phase, ConnectionPhase::Degraded);

    let err = manager
        .send(OutboundMessage::Subscribe {
            channels: vec!["news".into()],
        })
        .unwrap_err();
    assert_eq!(err, SendError::NotConnected);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
}
