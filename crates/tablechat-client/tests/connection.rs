//! Connection manager tests against an in-memory transport.
//!
//! Time is paused, so reconnect delays are exact and the tests run instantly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tablechat_client::{
    ConnectionError, ConnectionHandle, ConnectionStatus, Connector, Duplex, RequestError,
    SessionBootstrap, spawn_connection,
};
use tablechat_types::{ChatRequest, ServerEvent};
use tokio::sync::broadcast;
use tokio::time::Instant;

const DELAY: Duration = Duration::from_millis(2000);

/// Server side of one in-memory session.
struct FakeServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl FakeServer {
    fn push(&self, frame: &str) {
        self.to_client.unbounded_send(frame.to_string()).unwrap();
    }
}

/// Connector that follows a script of successes and failures and records
/// the instant of every attempt. Runs out of script = success.
struct ScriptedConnector {
    script: Mutex<VecDeque<bool>>,
    attempts: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<FakeServer>,
}

impl ScriptedConnector {
    fn new(script: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, rx) = mpsc::unbounded();
        let connector = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            attempts: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Duplex, ConnectionError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let succeed = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if !succeed {
            return Err(ConnectionError::Transport("connection refused".into()));
        }

        let (to_client, client_rx) = mpsc::unbounded::<String>();
        let (client_tx, from_client) = mpsc::unbounded::<String>();
        self.servers
            .unbounded_send(FakeServer {
                to_client,
                from_client,
            })
            .unwrap();

        Ok(Duplex {
            sink: Box::pin(
                client_tx.sink_map_err(|e| ConnectionError::Transport(e.to_string())),
            ),
            stream: Box::pin(client_rx.map(Ok)),
        })
    }
}

/// Bootstrap that fails a fixed number of times, then succeeds.
struct CountingBootstrap {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl SessionBootstrap for CountingBootstrap {
    async fn start_session(&self) -> Result<(), RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(RequestError::Status {
                url: url::Url::parse("http://localhost:8000/chat-server").unwrap(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "no active websocket".into(),
            });
        }
        Ok(())
    }
}

async fn wait_connected(handle: &ConnectionHandle, connected: bool) {
    handle
        .watch_state()
        .wait_for(|s| s.connected == connected)
        .await
        .unwrap();
}

fn drain(rx: &mut broadcast::Receiver<ConnectionStatus>) -> Vec<ConnectionStatus> {
    let mut out = Vec::new();
    while let Ok(status) = rx.try_recv() {
        out.push(status);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_fixed_delay_until_connected() {
    let (connector, mut servers) = ScriptedConnector::new(&[true, false, false, true]);
    let handle = spawn_connection(connector.clone(), None, DELAY);

    wait_connected(&handle, true).await;
    let server = servers.next().await.unwrap();
    let mut status = handle.subscribe_status();

    let closed_at = Instant::now();
    drop(server);
    wait_connected(&handle, false).await;

    // Nothing happens before the delay elapses.
    tokio::time::sleep(DELAY - Duration::from_millis(1)).await;
    assert_eq!(connector.attempts().len(), 1);

    wait_connected(&handle, true).await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts[1] - closed_at, DELAY);
    assert_eq!(attempts[2] - attempts[1], DELAY);
    assert_eq!(attempts[3] - attempts[2], DELAY);

    assert_eq!(
        drain(&mut status),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Reconnecting { attempt: 1 },
            ConnectionStatus::Error("transport error: connection refused".into()),
            ConnectionStatus::Reconnecting { attempt: 2 },
            ConnectionStatus::Error("transport error: connection refused".into()),
            ConnectionStatus::Reconnecting { attempt: 3 },
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn initial_failure_is_retried() {
    let (connector, _servers) = ScriptedConnector::new(&[false, true]);
    let start = Instant::now();
    let handle = spawn_connection(connector.clone(), None, DELAY);

    wait_connected(&handle, true).await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], start);
    assert_eq!(attempts[1] - attempts[0], DELAY);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_bypasses_delay() {
    let (connector, mut servers) = ScriptedConnector::new(&[]);
    let handle = spawn_connection(connector.clone(), None, DELAY);
    wait_connected(&handle, true).await;
    let mut first = servers.next().await.unwrap();

    let before = Instant::now();
    handle.reconnect().await.unwrap();
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1], before);
    assert!(handle.state().connected);
    assert_eq!(handle.state().generation, 2);

    // The old session was closed by the client.
    assert_eq!(first.from_client.next().await, None);
    let _second = servers.next().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn send_requires_connection() {
    let (connector, mut servers) = ScriptedConnector::new(&[true, false]);
    let handle = spawn_connection(connector.clone(), None, DELAY);
    wait_connected(&handle, true).await;
    let mut server = servers.next().await.unwrap();

    let request = ChatRequest::new("cars", "", "how many rows?");
    handle.send(&request).await.unwrap();
    let frame = server.from_client.next().await.unwrap();
    let sent: ChatRequest = serde_json::from_str(&frame).unwrap();
    assert_eq!(sent, request);

    drop(server);
    wait_connected(&handle, false).await;
    let err = handle.send(&request).await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_closing() {
    let (connector, mut servers) = ScriptedConnector::new(&[]);
    let handle = spawn_connection(connector.clone(), None, DELAY);
    let mut events = handle.subscribe_events();
    wait_connected(&handle, true).await;
    let server = servers.next().await.unwrap();

    server.push("not json");
    server.push(r#"{"event":"on_tool_start","message":"?"}"#);
    server.push(r#"{"role":"assistant","event":"on_chain_start","message":""}"#);
    server.push(r#"{"role":"assistant","event":"on_chat_model_stream","message":"Hi","time":0.3}"#);

    let first = events.recv().await.unwrap();
    assert!(matches!(first, ServerEvent::TurnStart { .. }));
    let second = events.recv().await.unwrap();
    assert_eq!(
        second,
        ServerEvent::ContentDelta {
            text: "Hi".into(),
            elapsed_time: Some("0.3".into()),
        }
    );
    assert!(handle.state().connected);
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_runs_once_and_retries_after_failure() {
    let (connector, mut servers) = ScriptedConnector::new(&[]);
    let bootstrap = Arc::new(CountingBootstrap {
        failures_left: AtomicU32::new(1),
        calls: AtomicU32::new(0),
    });
    let handle = spawn_connection(
        connector.clone(),
        Some(bootstrap.clone() as Arc<dyn SessionBootstrap>),
        DELAY,
    );

    wait_connected(&handle, true).await;
    assert!(!handle.state().chat_ready);
    assert_eq!(bootstrap.calls.load(Ordering::SeqCst), 1);

    // Second connection retries the bootstrap.
    drop(servers.next().await.unwrap());
    handle
        .watch_state()
        .wait_for(|s| s.is_ready())
        .await
        .unwrap();
    assert_eq!(bootstrap.calls.load(Ordering::SeqCst), 2);

    // Later connections leave the session alone.
    drop(servers.next().await.unwrap());
    wait_connected(&handle, false).await;
    wait_connected(&handle, true).await;
    assert!(handle.state().chat_ready);
    assert_eq!(bootstrap.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn close_stops_reconnecting() {
    let (connector, mut servers) = ScriptedConnector::new(&[]);
    let handle = spawn_connection(connector.clone(), None, DELAY);
    wait_connected(&handle, true).await;
    let mut server = servers.next().await.unwrap();

    handle.close().await;
    assert_eq!(server.from_client.next().await, None);
    assert!(!handle.state().connected);

    tokio::time::sleep(DELAY * 10).await;
    assert_eq!(connector.attempts().len(), 1);

    let err = handle
        .send(&ChatRequest::new("cars", "", "hello?"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Shutdown));
}
