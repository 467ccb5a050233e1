//! Stream connection manager.
//!
//! A single actor task owns the duplex chat stream. It connects, forwards
//! every parsed [`ServerEvent`] to subscribers in arrival order, and when the
//! stream drops it schedules exactly one reconnect attempt after a fixed
//! delay, repeating until [`ConnectionHandle::close`]. The first successful
//! connection also starts the server-side chat session once.
//!
//! ```text
//!   ConnectionHandle (Clone+Send+Sync)   mpsc    ConnectionActor (tokio task)
//!   ┌──────────────────────────┐     ────────▶  ┌────────────────────────────┐
//!   │ .send(ChatRequest)       │                │ Duplex (sink + stream)     │
//!   │ .reconnect() / .close()  │     ◀────────  │ fixed-delay reconnect      │
//!   └──────────────────────────┘      oneshot   │ one-time session bootstrap │
//!        ▲ broadcast: ServerEvent,               └────────────────────────────┘
//!        │ ConnectionStatus; watch: LinkState
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use reqwest::cookie::{CookieStore, Jar};
use tablechat_types::{ChatRequest, ServerEvent};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use url::Url;

use crate::backend::RequestError;
use crate::constants::{EVENT_CHANNEL_CAPACITY, STATUS_CHANNEL_CAPACITY};

// ============================================================================
// Error Type
// ============================================================================

/// Errors from the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected to server")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection manager shut down")]
    Shutdown,
}

// ============================================================================
// Observable state
// ============================================================================

/// Connection lifecycle status.
///
/// Subscribe via [`ConnectionHandle::subscribe_status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Error(String),
}

/// Latest link state, readable at any time via [`ConnectionHandle::state`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkState {
    pub connected: bool,
    /// The server-side chat session was started. Stays set across reconnects.
    pub chat_ready: bool,
    /// Bumped on every successful connection. Replies to a request never
    /// cross a generation change.
    pub generation: u64,
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        self.connected && self.chat_ready
    }
}

// ============================================================================
// Transport seam
// ============================================================================

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// One live duplex session carrying text frames.
pub struct Duplex {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens duplex sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Duplex, ConnectionError>;
}

/// Starts the server-side chat session after the stream is up.
#[async_trait]
pub trait SessionBootstrap: Send + Sync + 'static {
    async fn start_session(&self) -> Result<(), RequestError>;
}

/// Websocket transport.
///
/// When given a cookie jar, the cookies stored for `cookie_url` are attached
/// to the handshake so the backend can associate the stream with the session.
pub struct WsConnector {
    url: Url,
    cookies: Option<(Arc<Jar>, Url)>,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url, cookies: None }
    }

    /// Attach cookies the jar holds for `cookie_url` (the HTTP base URL).
    pub fn with_cookies(mut self, jar: Arc<Jar>, cookie_url: Url) -> Self {
        self.cookies = Some((jar, cookie_url));
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Duplex, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        if let Some((jar, cookie_url)) = &self.cookies
            && let Some(value) = jar.cookies(cookie_url)
        {
            request.headers_mut().insert(COOKIE, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        tracing::debug!(url = %self.url, "websocket connected");

        let (sink, stream) = ws.split();
        let sink = sink
            .with(|text: String| {
                future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(WsMessage::Text(text)))
            })
            .sink_map_err(|e| ConnectionError::Transport(e.to_string()));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
            })
        });

        Ok(Duplex {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum Command {
    Send {
        frame: String,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// ConnectionHandle (Send + Sync public API)
// ============================================================================

/// Cloneable handle to the connection actor.
///
/// Dropping every handle shuts the actor down.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<ServerEvent>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    state_rx: watch::Receiver<LinkState>,
}

impl ConnectionHandle {
    /// Send a user request. Fails with `NotConnected` rather than queueing.
    pub async fn send(&self, request: &ChatRequest) -> Result<(), ConnectionError> {
        let frame = request.to_json()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { frame, reply })
            .map_err(|_| ConnectionError::Shutdown)?;
        rx.await.map_err(|_| ConnectionError::Shutdown)?
    }

    /// Drop any live session and connect again now, bypassing the delay.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reconnect { reply })
            .map_err(|_| ConnectionError::Shutdown)?;
        rx.await.map_err(|_| ConnectionError::Shutdown)?
    }

    /// Close the session and stop reconnecting. The actor exits.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Incoming events, in arrival order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for link state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }
}

// ============================================================================
// ConnectionActor (internal)
// ============================================================================

/// What woke the actor loop.
enum Wake {
    Command(Option<Command>),
    Frame(Option<Result<String, ConnectionError>>),
    Retry,
}

struct ConnectionActor {
    connector: Arc<dyn Connector>,
    bootstrap: Option<Arc<dyn SessionBootstrap>>,
    reconnect_delay: Duration,
    event_tx: broadcast::Sender<ServerEvent>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    state_tx: watch::Sender<LinkState>,
    /// Live session (None = disconnected).
    link: Option<Duplex>,
    /// When the next connection attempt is due (None = not scheduled).
    retry_at: Option<Instant>,
    /// Scheduled attempts since the last successful connection.
    attempt: u32,
}

impl ConnectionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let _ = self.try_connect().await;
        loop {
            let wake = match (&mut self.link, self.retry_at) {
                (Some(link), _) => tokio::select! {
                    cmd = rx.recv() => Wake::Command(cmd),
                    frame = link.stream.next() => Wake::Frame(frame),
                },
                (None, Some(deadline)) => tokio::select! {
                    cmd = rx.recv() => Wake::Command(cmd),
                    _ = sleep_until(deadline) => Wake::Retry,
                },
                (None, None) => Wake::Command(rx.recv().await),
            };

            match wake {
                Wake::Command(None) => {
                    tracing::debug!("connection actor shutting down: all handles dropped");
                    self.shutdown().await;
                    return;
                }
                Wake::Command(Some(Command::Close { reply })) => {
                    tracing::info!("connection closed by client");
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Frame(Some(Ok(text))) => self.dispatch(&text),
                Wake::Frame(Some(Err(e))) => self.lost(&e.to_string()),
                Wake::Frame(None) => self.lost("stream closed"),
                Wake::Retry => {
                    self.retry_at = None;
                    self.attempt += 1;
                    self.publish_status(ConnectionStatus::Reconnecting {
                        attempt: self.attempt,
                    });
                    let _ = self.try_connect().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { frame, reply } => {
                let Some(link) = self.link.as_mut() else {
                    let _ = reply.send(Err(ConnectionError::NotConnected));
                    return;
                };
                match link.sink.send(frame).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        self.lost(&msg);
                        let _ = reply.send(Err(ConnectionError::Transport(msg)));
                    }
                }
            }
            Command::Reconnect { reply } => {
                tracing::info!("manual reconnect requested");
                self.drop_link().await;
                self.retry_at = None;
                self.attempt = 0;
                let _ = reply.send(self.try_connect().await);
            }
            Command::Close { .. } => unreachable!("close handled by run loop"),
        }
    }

    /// Attempt one connection. On failure the next attempt is scheduled.
    async fn try_connect(&mut self) -> Result<(), ConnectionError> {
        match self.connector.connect().await {
            Ok(duplex) => {
                self.link = Some(duplex);
                self.attempt = 0;
                tracing::info!("chat stream connected");
                self.state_tx.send_modify(|s| {
                    s.connected = true;
                    s.generation += 1;
                });
                self.publish_status(ConnectionStatus::Connected);
                self.bootstrap_once().await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = self.attempt, "connection attempt failed");
                self.publish_status(ConnectionStatus::Error(e.to_string()));
                self.schedule_retry();
                Err(e)
            }
        }
    }

    /// Start the chat session on the first successful connection.
    async fn bootstrap_once(&mut self) {
        if self.state_tx.borrow().chat_ready {
            return;
        }
        let Some(bootstrap) = self.bootstrap.clone() else {
            self.state_tx.send_modify(|s| s.chat_ready = true);
            return;
        };
        match bootstrap.start_session().await {
            Ok(()) => {
                tracing::info!("chat session started");
                self.state_tx.send_modify(|s| s.chat_ready = true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat session bootstrap failed, will retry on next connection");
            }
        }
    }

    /// Decode one frame and broadcast it. Malformed frames are dropped.
    fn dispatch(&self, text: &str) {
        match ServerEvent::from_json(text) {
            Ok(event) => {
                tracing::trace!(event = %event.kind(), "server event");
                let _ = self.event_tx.send(event);
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
            }
        }
    }

    /// The live session ended unexpectedly.
    fn lost(&mut self, reason: &str) {
        tracing::warn!(
            reason,
            delay_ms = self.reconnect_delay.as_millis() as u64,
            "chat stream lost, scheduling reconnect"
        );
        self.link = None;
        self.state_tx.send_modify(|s| s.connected = false);
        self.publish_status(ConnectionStatus::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.retry_at = Some(Instant::now() + self.reconnect_delay);
    }

    /// Close the live session, if any, without scheduling a retry.
    async fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.sink.close().await;
            self.state_tx.send_modify(|s| s.connected = false);
            self.publish_status(ConnectionStatus::Disconnected);
        }
    }

    async fn shutdown(&mut self) {
        self.retry_at = None;
        self.drop_link().await;
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let _ = self.status_tx.send(status);
    }
}

// ============================================================================
// Public spawn function
// ============================================================================

/// Spawn the connection actor on the current tokio runtime.
///
/// The first connection attempt starts immediately. `bootstrap` runs once,
/// after the first successful connection; without one the link is
/// chat-ready as soon as it connects.
pub fn spawn_connection(
    connector: Arc<dyn Connector>,
    bootstrap: Option<Arc<dyn SessionBootstrap>>,
    reconnect_delay: Duration,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
    let (state_tx, state_rx) = watch::channel(LinkState::default());

    let actor = ConnectionActor {
        connector,
        bootstrap,
        reconnect_delay,
        event_tx: event_tx.clone(),
        status_tx: status_tx.clone(),
        state_tx,
        link: None,
        retry_at: None,
        attempt: 0,
    };
    tokio::spawn(actor.run(rx));

    ConnectionHandle {
        tx,
        event_tx,
        status_tx,
        state_rx,
    }
}
