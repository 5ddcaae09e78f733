//! Control channel client.
//!
//! `ControlChannel` maintains the single authenticated WebSocket session to
//! the control plane: the HMAC auth handshake, heartbeat sender/monitor pair,
//! request/response correlation, and fixed-delay reconnection with a capped
//! attempt counter.
//!
//! # Concurrency contract
//!
//! All writes funnel through one mpsc queue drained by a single writer task,
//! so messages are globally ordered on the stream. One dedicated reader task
//! parses inbound frames; correlated responses resolve their pending slot
//! in-line, everything else is dispatched to its registered handler on a
//! fresh task so a slow handler cannot stall the reader.

use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
};
use uuid::Uuid;

use super::{ChannelError, ChannelStats, ConnectionState, Envelope, Session, SharedConnectionState};
use crate::constants;

/// Async callback registered for one inbound message type.
pub type MessageHandler =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Commands for the single writer task.
#[derive(Debug)]
enum WriterCommand {
    /// Serialized JSON frame.
    Text(String),
    /// Pong reply carrying the ping payload.
    Pong(Vec<u8>),
    /// Graceful close.
    Close,
}

/// Heartbeat bookkeeping shared between sender, monitor and reader.
#[derive(Debug, Default)]
struct HeartbeatState {
    /// Monotonic instant of the last heartbeat put on the wire.
    last_sent: Option<Instant>,
    /// Wall-clock timestamps for the status surface.
    last_sent_at: Option<chrono::DateTime<chrono::Utc>>,
    last_received_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Consecutive monitor-observed misses. Reset by any valid response.
    missed: u32,
}

/// State shared across the channel's background tasks.
struct ChannelShared {
    state: SharedConnectionState,
    connected: AtomicBool,
    pending: StdMutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
    handlers: StdRwLock<HashMap<String, MessageHandler>>,
    session: StdRwLock<Option<Session>>,
    heartbeat: StdMutex<HeartbeatState>,
    heartbeat_interval_secs: AtomicU64,
    heartbeat_timeout_secs: AtomicU64,
    writer_tx: StdRwLock<Option<mpsc::Sender<WriterCommand>>>,
    agent_id: String,
}

impl ChannelShared {
    /// Marks the session lost: authentication state is discarded, pending
    /// request slots are cancelled, and the writer queue is detached.
    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state.set(ConnectionState::Disconnected);
        *self.session.write().expect("session lock poisoned") = None;
        *self.writer_tx.write().expect("writer lock poisoned") = None;

        // Dropping the senders wakes every in-flight send_request with Closed.
        self.pending.lock().expect("pending lock poisoned").clear();
    }

    fn writer(&self) -> Option<mpsc::Sender<WriterCommand>> {
        self.writer_tx.read().expect("writer lock poisoned").clone()
    }
}

impl std::fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelShared")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

/// Computes the auth handshake signature:
/// `HMAC_SHA256(api_key, "agent_id:timestamp:nonce")`, hex encoded.
pub(crate) fn auth_signature(api_key: &str, agent_id: &str, timestamp: &str, nonce: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(api_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(format!("{agent_id}:{timestamp}:{nonce}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builder for [`ControlChannel`].
#[derive(Debug, Default)]
pub struct ControlChannelBuilder {
    server_url: Option<String>,
    api_key: Option<String>,
    agent_id: Option<String>,
    capabilities: Vec<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    reconnect_delay: Option<Duration>,
    max_reconnect_attempts: Option<u32>,
}

impl ControlChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control-plane WebSocket URL (required).
    #[must_use]
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// API key for the bearer header and HMAC handshake (required).
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Stable agent identity (required).
    #[must_use]
    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    /// Protocol capability set advertised at registration.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Client certificate + key for mutual TLS.
    #[must_use]
    pub fn client_cert(mut self, cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        self.cert_file = cert;
        self.key_file = key;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Builds the channel.
    ///
    /// # Panics
    ///
    /// Panics if `server_url`, `api_key` or `agent_id` are not set.
    #[must_use]
    pub fn build(self) -> ControlChannel {
        let agent_id = self.agent_id.expect("agent_id is required");
        ControlChannel {
            server_url: self.server_url.expect("server_url is required"),
            api_key: self.api_key.expect("api_key is required"),
            capabilities: self.capabilities,
            cert_file: self.cert_file,
            key_file: self.key_file,
            reconnect_delay: self.reconnect_delay.unwrap_or(constants::RECONNECT_DELAY),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(constants::MAX_RECONNECT_ATTEMPTS),
            reconnect_attempts: AtomicU32::new(0),
            tasks: StdMutex::new(Vec::new()),
            shared: Arc::new(ChannelShared {
                state: SharedConnectionState::default(),
                connected: AtomicBool::new(false),
                pending: StdMutex::new(HashMap::new()),
                handlers: StdRwLock::new(HashMap::new()),
                session: StdRwLock::new(None),
                heartbeat: StdMutex::new(HeartbeatState::default()),
                heartbeat_interval_secs: AtomicU64::new(
                    self.heartbeat_interval
                        .unwrap_or(constants::HEARTBEAT_INTERVAL)
                        .as_secs(),
                ),
                heartbeat_timeout_secs: AtomicU64::new(
                    self.heartbeat_timeout
                        .unwrap_or(constants::HEARTBEAT_TIMEOUT)
                        .as_secs(),
                ),
                writer_tx: StdRwLock::new(None),
                agent_id,
            }),
        }
    }
}

/// The agent's single authenticated message stream to the control plane.
pub struct ControlChannel {
    server_url: String,
    api_key: String,
    capabilities: Vec<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    reconnect_attempts: AtomicU32,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("server_url", &self.server_url)
            .field("connected", &self.is_connected())
            .field("reconnect_attempts", &self.reconnect_attempts.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Creates a new channel builder.
    #[must_use]
    pub fn builder() -> ControlChannelBuilder {
        ControlChannelBuilder::new()
    }

    /// Registers the handler invoked for inbound messages of `msg_type`.
    ///
    /// Handlers run on their own task; they must not assume ordering with
    /// other handlers.
    pub fn register_handler(&self, msg_type: &str, handler: MessageHandler) {
        self.shared
            .handlers
            .write()
            .expect("handlers lock poisoned")
            .insert(msg_type.to_string(), handler);
        log::debug!("Registered message handler: {}", msg_type);
    }

    /// Whether the underlying stream is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether an authenticated session is active.
    pub fn is_authenticated(&self) -> bool {
        self.shared.state.is_authenticated()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// The server-assigned session id, when authenticated.
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Updates the heartbeat cadence without reconnecting.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.shared
            .heartbeat_interval_secs
            .store(interval.as_secs().max(1), Ordering::SeqCst);
        log::info!("Heartbeat interval set to {}s", interval.as_secs());
    }

    /// Updates the heartbeat staleness threshold.
    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        self.shared
            .heartbeat_timeout_secs
            .store(timeout.as_secs().max(1), Ordering::SeqCst);
        log::info!("Heartbeat timeout set to {}s", timeout.as_secs());
    }

    /// Point-in-time statistics for the `status` command.
    pub fn stats(&self) -> ChannelStats {
        let heartbeat = self.shared.heartbeat.lock().expect("heartbeat lock poisoned");
        ChannelStats {
            connected: self.is_connected(),
            authenticated: self.is_authenticated(),
            session_id: self.session_id(),
            last_heartbeat_sent: heartbeat.last_sent_at.map(|t| t.to_rfc3339()),
            last_heartbeat_received: heartbeat.last_received_at.map(|t| t.to_rfc3339()),
            missed_heartbeats: heartbeat.missed,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    /// Connects, authenticates, and starts the background loops.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            log::warn!("Channel already connected");
            return Ok(());
        }

        self.shared.state.set(ConnectionState::Connecting);
        log::info!("Connecting to control plane: {}", self.server_url);

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::ConnectionFailed(format!("invalid URL: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| ChannelError::ConnectionFailed("invalid api key header".into()))?,
        );
        headers.insert(
            "X-Agent-ID",
            self.shared
                .agent_id
                .parse()
                .map_err(|_| ChannelError::ConnectionFailed("invalid agent id header".into()))?,
        );
        headers.insert(
            "User-Agent",
            constants::user_agent()
                .parse()
                .expect("static user agent is a valid header"),
        );

        let connector = super::tls::build_connector(
            self.cert_file.as_deref(),
            self.key_file.as_deref(),
        )
        .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (ws_stream, _) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| {
                self.shared.state.set(ConnectionState::Disconnected);
                ChannelError::ConnectionFailed(format!("WebSocket connect failed: {e}"))
            })?;

        let (mut sink, mut stream) = ws_stream.split();

        // Single-writer discipline: every outbound frame goes through this
        // queue, drained by one task that owns the sink.
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(constants::WRITE_QUEUE_DEPTH);
        *self.shared.writer_tx.write().expect("writer lock poisoned") = Some(writer_tx.clone());
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.state.set(ConnectionState::Connected);

        let writer_shared = Arc::clone(&self.shared);
        let writer_task = tokio::spawn(async move {
            while let Some(command) = writer_rx.recv().await {
                let result = match command {
                    WriterCommand::Text(text) => sink.send(Message::Text(text)).await,
                    WriterCommand::Pong(payload) => sink.send(Message::Pong(payload)).await,
                    WriterCommand::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    log::error!("WebSocket write failed: {}", e);
                    writer_shared.mark_disconnected();
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&self.shared);
        let reader_writer_tx = writer_tx;
        let reader_task = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => Self::route_inbound(&reader_shared, envelope),
                        Err(e) => log::error!("Failed to parse inbound message: {}", e),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if reader_writer_tx.send(WriterCommand::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::warn!("WebSocket closed by server");
                        reader_shared.mark_disconnected();
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket read error: {}", e);
                        reader_shared.mark_disconnected();
                        break;
                    }
                    None => {
                        log::warn!("WebSocket stream ended");
                        reader_shared.mark_disconnected();
                        break;
                    }
                    _ => {}
                }
            }
        });

        {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.push(writer_task);
            tasks.push(reader_task);
        }

        // Auth handshake. Failure closes the stream; the supervisor's
        // reconnect path owns the retry cadence.
        match self.authenticate().await {
            Ok(session) => {
                log::info!("Authenticated, session {}", session.session_id);
                *self.shared.session.write().expect("session lock poisoned") = Some(session);
                self.shared.state.set(ConnectionState::Authenticated);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                *self.shared.heartbeat.lock().expect("heartbeat lock poisoned") =
                    HeartbeatState::default();
            }
            Err(e) => {
                log::error!("Authentication failed: {}", e);
                self.disconnect().await;
                return Err(e);
            }
        }

        self.spawn_heartbeat_tasks();
        self.send_registration().await;

        Ok(())
    }

    async fn authenticate(&self) -> Result<Session, ChannelError> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let nonce = Uuid::new_v4().to_string();
        let signature = auth_signature(&self.api_key, &self.shared.agent_id, &timestamp, &nonce);

        let request = Envelope::new(
            "auth",
            json!({
                "agent_id": self.shared.agent_id,
                "timestamp": timestamp,
                "nonce": nonce,
                "signature": signature,
                "version": constants::VERSION,
            }),
        );

        let response = self
            .send_request(request, constants::AUTH_TIMEOUT)
            .await
            .map_err(|e| ChannelError::AuthenticationFailed(e.to_string()))?;

        if response.msg_type != "auth_response" {
            return Err(ChannelError::AuthenticationFailed(format!(
                "unexpected response type: {}",
                response.msg_type
            )));
        }

        let data = response.data;
        if data.get("success").and_then(serde_json::Value::as_bool) != Some(true) {
            let error = data
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            return Err(ChannelError::AuthenticationFailed(error.to_string()));
        }

        let token = data
            .get("token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ChannelError::AuthenticationFailed("missing token".into()))?;
        let session_id = data
            .get("session_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ChannelError::AuthenticationFailed("missing session_id".into()))?;

        Ok(Session {
            session_id: session_id.to_string(),
            auth_token: token.to_string(),
        })
    }

    fn spawn_heartbeat_tasks(&self) {
        let sender_shared = Arc::clone(&self.shared);
        let sender_task = tokio::spawn(async move {
            log::debug!("Heartbeat sender started");
            while sender_shared.connected.load(Ordering::SeqCst)
                && sender_shared.state.is_authenticated()
            {
                let session_id = sender_shared
                    .session
                    .read()
                    .expect("session lock poisoned")
                    .as_ref()
                    .map(|s| s.session_id.clone());

                let mut envelope = Envelope::new(
                    "heartbeat",
                    json!({
                        "agent_id": sender_shared.agent_id,
                        "session_id": session_id,
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    }),
                );
                envelope.stamp();

                let sent = match (serde_json::to_string(&envelope), sender_shared.writer()) {
                    (Ok(text), Some(writer)) => writer.send(WriterCommand::Text(text)).await.is_ok(),
                    _ => false,
                };

                if sent {
                    let mut heartbeat =
                        sender_shared.heartbeat.lock().expect("heartbeat lock poisoned");
                    heartbeat.last_sent = Some(Instant::now());
                    heartbeat.last_sent_at = Some(chrono::Utc::now());
                    log::debug!("Heartbeat sent");
                } else {
                    // Send failures alone do not count as misses; the monitor
                    // observes the resulting staleness on its own clock.
                    log::error!("Failed to send heartbeat");
                }

                let interval = sender_shared.heartbeat_interval_secs.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
            log::debug!("Heartbeat sender stopped");
        });

        let monitor_shared = Arc::clone(&self.shared);
        let monitor_task = tokio::spawn(async move {
            log::debug!("Heartbeat monitor started");
            loop {
                let interval = monitor_shared.heartbeat_interval_secs.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(interval)).await;

                if !monitor_shared.connected.load(Ordering::SeqCst)
                    || !monitor_shared.state.is_authenticated()
                {
                    break;
                }

                let timeout = monitor_shared.heartbeat_timeout_secs.load(Ordering::SeqCst);
                let missed = {
                    let mut heartbeat =
                        monitor_shared.heartbeat.lock().expect("heartbeat lock poisoned");
                    let stale = heartbeat
                        .last_sent
                        .is_some_and(|sent| sent.elapsed() > Duration::from_secs(timeout));
                    if stale {
                        heartbeat.missed += 1;
                        log::warn!("Heartbeat stale, {} missed", heartbeat.missed);
                    }
                    heartbeat.missed
                };

                if missed > 0 && missed < constants::MAX_MISSED_HEARTBEATS {
                    monitor_shared.state.set(ConnectionState::Degraded {
                        missed_heartbeats: missed,
                    });
                }

                if missed >= constants::MAX_MISSED_HEARTBEATS {
                    log::error!(
                        "{} consecutive heartbeats missed, dropping session",
                        missed
                    );
                    monitor_shared.mark_disconnected();
                    break;
                }
            }
            log::debug!("Heartbeat monitor stopped");
        });

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.push(sender_task);
        tasks.push(monitor_task);
    }

    async fn send_registration(&self) {
        let envelope = Envelope::new(
            "agent_register",
            json!({
                "agent_id": self.shared.agent_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "capabilities": self.capabilities,
                "version": constants::VERSION,
            }),
        );
        if self.send(envelope).await {
            log::info!("Sent agent registration");
        } else {
            log::error!("Failed to send agent registration");
        }
    }

    /// Fire-and-forget send. Stamps `id`/`timestamp` if absent. Returns
    /// whether the frame was accepted by the writer queue.
    pub async fn send(&self, mut envelope: Envelope) -> bool {
        if !self.is_connected() {
            log::error!("Cannot send {}: channel not connected", envelope.msg_type);
            return false;
        }
        envelope.stamp();

        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize {}: {}", envelope.msg_type, e);
                return false;
            }
        };

        match self.shared.writer() {
            Some(writer) => {
                let accepted = writer.send(WriterCommand::Text(text)).await.is_ok();
                if accepted {
                    log::debug!("Sent message: {}", envelope.msg_type);
                }
                accepted
            }
            None => false,
        }
    }

    /// Sends a request and waits up to `timeout` for the correlated response.
    ///
    /// The pending slot is installed before the send and removed on every
    /// exit path, so no entries leak.
    pub async fn send_request(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }

        let request_id = Uuid::new_v4();
        envelope.id = Some(request_id);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id, tx);

        if !self.send(envelope).await {
            self.shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            return Err(ChannelError::SendFailed("write queue rejected frame".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the connection died and cancelled the slot.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&request_id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Routes one inbound message: pending-slot correlation first, then the
    /// heartbeat fast path, then registered handlers on their own task.
    fn route_inbound(shared: &Arc<ChannelShared>, envelope: Envelope) {
        if let Some(id) = envelope.id {
            let slot = shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            if let Some(tx) = slot {
                let _ = tx.send(envelope);
                return;
            }
        }

        if envelope.msg_type == "heartbeat_response" {
            let mut heartbeat = shared.heartbeat.lock().expect("heartbeat lock poisoned");
            heartbeat.missed = 0;
            heartbeat.last_received_at = Some(chrono::Utc::now());
            drop(heartbeat);
            if matches!(shared.state.get(), ConnectionState::Degraded { .. }) {
                shared.state.set(ConnectionState::Authenticated);
            }
            log::debug!("Heartbeat response received");
            return;
        }

        let handler = shared
            .handlers
            .read()
            .expect("handlers lock poisoned")
            .get(&envelope.msg_type)
            .cloned();

        match handler {
            Some(handler) => {
                tokio::spawn(handler(envelope));
            }
            None => log::warn!("No handler for message type: {}", envelope.msg_type),
        }
    }

    /// Closes the session and stops all background tasks.
    pub async fn disconnect(&self) {
        if let Some(writer) = self.shared.writer() {
            let _ = writer.send(WriterCommand::Close).await;
        }
        self.shared.mark_disconnected();

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        for task in tasks {
            task.abort();
        }
        log::info!("Channel disconnected");
    }

    /// One reconnection attempt: tear down, wait the fixed delay, connect.
    ///
    /// Attempts count up across failures and reset to zero inside a
    /// successful `connect()`. Past the cap the error is fatal.
    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.max_reconnect_attempts {
            return Err(ChannelError::ReconnectExhausted(self.max_reconnect_attempts));
        }

        log::info!(
            "Reconnect attempt {} of {}",
            attempt,
            self.max_reconnect_attempts
        );
        self.disconnect().await;
        tokio::time::sleep(self.reconnect_delay).await;
        self.connect().await
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }
    }
}
