//! Agent supervisor.
//!
//! Owns the process lifecycle: loads configuration and the persistent agent
//! identity, wires the channel, collector and executor together, routes
//! inbound control messages by type, and keeps the critical background loops
//! (connection monitor, resource reporter, update poller) alive, respawning
//! any that exit with an error.

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelError, ControlChannel, Envelope};
use crate::collector::{BatchSink, ResultCollector};
use crate::config::AgentConfig;
use crate::constants;
use crate::executor::{ResultSink, TaskExecutor, TaskSpec};
use crate::monitor::ResourceMonitor;
use crate::protocol::ProtocolRegistry;
use crate::update::{SignatureManager, UpdateClient};

/// Names of the supervised background loops.
const CONNECTION_MONITOR: &str = "connection_monitor";
const RESOURCE_REPORTER: &str = "resource_reporter";
const UPDATE_POLLER: &str = "update_poller";

/// Everything the inbound message handlers need, shared behind one `Arc`.
struct HandlerContext {
    agent_id: String,
    config: Arc<StdRwLock<AgentConfig>>,
    /// Weak: the channel owns the handlers, so a strong reference here would
    /// cycle and keep both alive past shutdown.
    channel: Weak<ControlChannel>,
    executor: Arc<TaskExecutor>,
    update_client: Arc<UpdateClient>,
    monitor: Arc<ResourceMonitor>,
    registry: Arc<ProtocolRegistry>,
    shutdown: CancellationToken,
}

impl HandlerContext {
    async fn reply(&self, envelope: Envelope) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if !channel.send(envelope).await {
            log::error!("Failed to send response message");
        }
    }

    async fn handle_task_assign(&self, envelope: Envelope) {
        let raw_task_id = envelope
            .data
            .get("task_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        log::info!("Task assignment received: {}", raw_task_id);

        let (status, error_message) = match serde_json::from_value::<TaskSpec>(envelope.data.clone())
        {
            Ok(spec) => match self.executor.dispatch(spec) {
                Ok(()) => ("accepted", None),
                Err(e) => ("rejected", Some(e.to_string())),
            },
            Err(e) => ("error", Some(format!("malformed task: {e}"))),
        };

        self.reply(Envelope::new(
            "task_assign_response",
            json!({
                "task_id": raw_task_id,
                "status": status,
                "agent_id": self.agent_id,
                "error_message": error_message,
            }),
        ))
        .await;
    }

    async fn handle_task_cancel(&self, envelope: Envelope) {
        let raw_task_id = envelope
            .data
            .get("task_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        log::info!("Task cancellation received: {}", raw_task_id);

        let (status, error_message) = match raw_task_id.parse::<Uuid>() {
            Ok(task_id) => {
                if self.executor.cancel(task_id) {
                    ("cancelled", None)
                } else {
                    ("not_found", Some("task not found or already finished".to_string()))
                }
            }
            Err(e) => ("error", Some(format!("invalid task_id: {e}"))),
        };

        self.reply(Envelope::new(
            "task_cancel_response",
            json!({
                "task_id": raw_task_id,
                "status": status,
                "agent_id": self.agent_id,
                "error_message": error_message,
            }),
        ))
        .await;
    }

    async fn handle_config_update(&self, envelope: Envelope) {
        log::info!("Configuration update received");

        let applied = match envelope.data.as_object() {
            Some(updates) => {
                let mut config = self.config.write().expect("config lock poisoned");
                let applied = config.apply_update(updates);
                if let Err(e) = config.save() {
                    log::error!("Failed to persist updated config: {}", e);
                }
                applied
            }
            None => Vec::new(),
        };

        // Hot-apply the reconfigurable settings.
        for key in &applied {
            match *key {
                "heartbeat_interval" => {
                    let secs = self.config.read().expect("config lock poisoned").heartbeat_interval;
                    if let Some(channel) = self.channel.upgrade() {
                        channel.set_heartbeat_interval(Duration::from_secs(secs));
                    }
                }
                "heartbeat_timeout" => {
                    let secs = self.config.read().expect("config lock poisoned").heartbeat_timeout;
                    if let Some(channel) = self.channel.upgrade() {
                        channel.set_heartbeat_timeout(Duration::from_secs(secs));
                    }
                }
                "max_concurrent_tasks" => {
                    let max = self
                        .config
                        .read()
                        .expect("config lock poisoned")
                        .max_concurrent_tasks;
                    self.executor.set_max_concurrent_tasks(max);
                }
                // The resource reporter reads its cadence from the shared
                // config on every cycle.
                _ => {}
            }
        }

        self.reply(Envelope::new(
            "config_update_response",
            json!({
                "status": "updated",
                "agent_id": self.agent_id,
                "applied_keys": applied,
            }),
        ))
        .await;
    }

    async fn handle_agent_command(&self, envelope: Envelope) {
        let command = envelope
            .data
            .get("command")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        log::info!("Agent command received: {}", command);

        let mut response = json!({
            "command": command,
            "agent_id": self.agent_id,
            "status": "success",
        });

        match command.as_str() {
            "status" => {
                response["result"] = self.status_report();
            }
            "reload_config" => {
                let path = {
                    let config = self.config.read().expect("config lock poisoned");
                    config.path().to_path_buf()
                };
                let mut reloaded = AgentConfig::load(Some(&path));
                // The persisted identity must survive a reload.
                reloaded.agent_id = Some(self.agent_id.clone());

                if let Some(channel) = self.channel.upgrade() {
                    channel
                        .set_heartbeat_interval(Duration::from_secs(reloaded.heartbeat_interval));
                    channel.set_heartbeat_timeout(Duration::from_secs(reloaded.heartbeat_timeout));
                }
                self.executor
                    .set_max_concurrent_tasks(reloaded.max_concurrent_tasks);
                *self.config.write().expect("config lock poisoned") = reloaded;
                log::info!("Configuration reloaded");
            }
            "restart" => {
                match self.update_client.schedule_restart(constants::RESTART_DELAY) {
                    Ok(()) => {
                        response["result"] = json!("restart scheduled");
                        // Reply first, then wind the process down; the
                        // detached script brings the agent back up.
                        self.shutdown.cancel();
                    }
                    Err(e) => {
                        response["status"] = json!("error");
                        response["error_message"] = json!(e.to_string());
                    }
                }
            }
            other => {
                response["status"] = json!("error");
                response["error_message"] = json!(format!("unknown command: {other}"));
            }
        }

        self.reply(Envelope::new("agent_command_response", response)).await;
    }

    fn status_report(&self) -> serde_json::Value {
        let config = self.config.read().expect("config lock poisoned");
        let channel_stats = self
            .channel
            .upgrade()
            .map(|channel| serde_json::to_value(channel.stats()).unwrap_or_default());

        json!({
            "agent_id": self.agent_id,
            "agent_name": config.agent_name,
            "version": constants::VERSION,
            "server_url": config.server_url,
            "heartbeat_interval": config.heartbeat_interval,
            "resource_report_interval": config.resource_report_interval,
            "max_concurrent_tasks": config.max_concurrent_tasks,
            "connection": channel_stats,
            "executor": {
                "in_flight": self.executor.in_flight(),
                "statistics": self.executor.stats(),
                "running_tasks": self.executor.running_tasks(),
            },
            "supported_protocols": self.registry.supported_protocols(),
            "update_status": self.update_client.current_status(),
            "resources": self.monitor.collect(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

/// The long-lived probe agent process.
pub struct Agent {
    agent_id: String,
    config: Arc<StdRwLock<AgentConfig>>,
    registry: Arc<ProtocolRegistry>,
    channel: Arc<ControlChannel>,
    collector: Arc<ResultCollector>,
    executor: Arc<TaskExecutor>,
    monitor: Arc<ResourceMonitor>,
    update_client: Arc<UpdateClient>,
    shutdown: CancellationToken,
    background: StdMutex<HashMap<&'static str, JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("agent_id", &self.agent_id).finish_non_exhaustive()
    }
}

impl Agent {
    /// Builds the component graph: registry, channel, collector, executor,
    /// update client. Nothing connects or runs until [`Agent::start`].
    pub fn new(mut config: AgentConfig) -> Result<Self> {
        let agent_id = config.ensure_agent_id()?;
        log::info!("Agent id: {}", agent_id);

        let registry = Arc::new(ProtocolRegistry::with_builtin_handlers());

        let channel = Arc::new(
            ControlChannel::builder()
                .server_url(config.server_url.clone())
                .api_key(config.api_key.clone())
                .agent_id(agent_id.clone())
                .capabilities(registry.supported_protocols())
                .client_cert(config.cert_file.clone(), config.key_file.clone())
                .heartbeat_interval(Duration::from_secs(config.heartbeat_interval))
                .heartbeat_timeout(Duration::from_secs(config.heartbeat_timeout))
                .build(),
        );

        // Collector → channel: best-effort send; the collector spools what
        // the channel cannot take.
        let spool_path = config
            .path()
            .parent()
            .map(|dir| dir.join("results_spool.jsonl"))
            .unwrap_or_else(|| "results_spool.jsonl".into());
        let batch_channel = Arc::downgrade(&channel);
        let batch_sink: BatchSink = Arc::new(move |batch| {
            let channel = batch_channel.clone();
            Box::pin(async move {
                let Some(channel) = channel.upgrade() else {
                    return false;
                };
                if !channel.is_authenticated() {
                    log::warn!("Channel not authenticated, batch will be spooled");
                    return false;
                }
                match serde_json::to_value(&batch) {
                    Ok(data) => channel.send(Envelope::new("task_results_batch", data)).await,
                    Err(e) => {
                        log::error!("Failed to serialize result batch: {}", e);
                        false
                    }
                }
            })
        });
        let collector = Arc::new(ResultCollector::new(
            agent_id.clone(),
            config.result_batch_size,
            Duration::from_secs(config.result_batch_timeout),
            spool_path,
            batch_sink,
        ));

        // Executor → collector: every terminal record is collected.
        let sink_collector = Arc::clone(&collector);
        let result_sink: ResultSink = Arc::new(move |report| {
            let collector = Arc::clone(&sink_collector);
            Box::pin(async move {
                collector.collect(report).await;
            })
        });
        let executor = Arc::new(TaskExecutor::new(
            agent_id.clone(),
            Arc::clone(&registry),
            config.max_concurrent_tasks,
            Duration::from_secs(config.default_task_timeout),
            result_sink,
        ));

        let mut signature = SignatureManager::new();
        if let Some(ref path) = config.update_public_key_file {
            signature = signature
                .with_public_key_file(path)
                .context("Failed to load update public key")?;
        }
        if let Some(ref secret) = config.update_hmac_secret {
            signature = signature.with_hmac_secret(secret.clone());
        }
        let update_client = Arc::new(UpdateClient::new(
            config.update_server_url.clone(),
            agent_id.clone(),
            &config.api_key,
            config.install_dir.clone(),
            signature,
        )?);
        update_client.set_progress_callback(Arc::new(|status, percent, message| {
            log::info!("Update: {} ({:.0}%) {}", status, percent, message);
        }));

        Ok(Self {
            agent_id,
            config: Arc::new(StdRwLock::new(config)),
            registry,
            channel,
            collector,
            executor,
            monitor: Arc::new(ResourceMonitor::new()),
            update_client,
            shutdown: CancellationToken::new(),
            background: StdMutex::new(HashMap::new()),
        })
    }

    /// The persistent agent identity.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Token observed by every background loop; cancelling it is the
    /// graceful-shutdown signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers inbound routing, starts the components, connects the
    /// channel and spawns the background loops.
    pub async fn start(&self) -> Result<()> {
        log::info!("Starting agent...");

        let context = Arc::new(HandlerContext {
            agent_id: self.agent_id.clone(),
            config: Arc::clone(&self.config),
            channel: Arc::downgrade(&self.channel),
            executor: Arc::clone(&self.executor),
            update_client: Arc::clone(&self.update_client),
            monitor: Arc::clone(&self.monitor),
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
        });
        self.register_message_handlers(&context);

        self.executor.start();
        self.collector.start();

        self.channel
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to control plane: {e}"))?;

        self.spawn_background(CONNECTION_MONITOR);
        self.spawn_background(RESOURCE_REPORTER);
        self.spawn_background(UPDATE_POLLER);

        log::info!("Agent started");
        Ok(())
    }

    fn register_message_handlers(&self, context: &Arc<HandlerContext>) {
        macro_rules! route {
            ($msg_type:literal, $method:ident) => {{
                let context = Arc::clone(context);
                self.channel.register_handler(
                    $msg_type,
                    Arc::new(move |envelope| {
                        let context = Arc::clone(&context);
                        Box::pin(async move { context.$method(envelope).await })
                    }),
                );
            }};
        }

        route!("task_assign", handle_task_assign);
        route!("task_cancel", handle_task_cancel);
        route!("config_update", handle_config_update);
        route!("agent_command", handle_agent_command);
        log::info!("Message handlers registered");
    }

    /// Spawns (or respawns) one named background loop.
    fn spawn_background(&self, name: &'static str) {
        let handle = match name {
            CONNECTION_MONITOR => tokio::spawn(Self::connection_monitor(
                Arc::clone(&self.channel),
                self.shutdown.clone(),
            )),
            RESOURCE_REPORTER => tokio::spawn(Self::resource_reporter(
                Arc::clone(&self.channel),
                Arc::clone(&self.monitor),
                Arc::clone(&self.config),
                self.agent_id.clone(),
                self.shutdown.clone(),
            )),
            UPDATE_POLLER => tokio::spawn(Self::update_poller(
                Arc::clone(&self.update_client),
                Arc::clone(&self.config),
                self.shutdown.clone(),
            )),
            other => {
                log::error!("Unknown background task: {}", other);
                return;
            }
        };
        self.background
            .lock()
            .expect("background lock poisoned")
            .insert(name, handle);
    }

    /// Polls channel liveness and drives reconnection. Exhausting the
    /// reconnect cap is the one fatal exit.
    async fn connection_monitor(
        channel: Arc<ControlChannel>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        log::info!("Connection monitor started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("Connection monitor stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(constants::CONNECTION_MONITOR_INTERVAL) => {}
            }

            if channel.is_connected() {
                continue;
            }

            log::warn!("Connection lost, attempting reconnect");
            match channel.reconnect().await {
                Ok(()) => log::info!("Reconnected to control plane"),
                Err(e @ ChannelError::ReconnectExhausted(_)) => {
                    return Err(anyhow::anyhow!(e).context("Control plane unreachable"));
                }
                Err(e) => log::error!("Reconnect failed: {}", e),
            }
        }
    }

    /// Samples host resources on the configured cadence and reports them.
    /// Skips (without buffering) while the channel is down.
    async fn resource_reporter(
        channel: Arc<ControlChannel>,
        monitor: Arc<ResourceMonitor>,
        config: Arc<StdRwLock<AgentConfig>>,
        agent_id: String,
        shutdown: CancellationToken,
    ) -> Result<()> {
        log::info!("Resource reporter started");
        loop {
            let interval = {
                let config = config.read().expect("config lock poisoned");
                Duration::from_secs(config.resource_report_interval.max(1))
            };
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("Resource reporter stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(interval) => {}
            }

            if !channel.is_authenticated() {
                log::debug!("Channel down, skipping resource report");
                continue;
            }

            let metrics = monitor.collect();
            let envelope = Envelope::new(
                "resource_report",
                json!({
                    "agent_id": agent_id,
                    "timestamp": metrics.timestamp,
                    "metrics": metrics,
                }),
            );
            if channel.send(envelope).await {
                log::debug!("Resource report sent");
            }
        }
    }

    /// Periodically runs the update pipeline when unattended updates are
    /// enabled. A successful install schedules a restart and shuts the
    /// process down so the new version can come up.
    async fn update_poller(
        update_client: Arc<UpdateClient>,
        config: Arc<StdRwLock<AgentConfig>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        log::info!("Update poller started");
        loop {
            let (interval, enabled) = {
                let config = config.read().expect("config lock poisoned");
                (
                    Duration::from_secs(config.update_check_interval.max(60)),
                    config.auto_update,
                )
            };
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("Update poller stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(interval) => {}
            }

            if !enabled {
                continue;
            }

            match update_client.perform_update(true).await {
                Ok(true) => {
                    log::info!("Update installed, shutting down for restart");
                    shutdown.cancel();
                    return Ok(());
                }
                Ok(false) => log::debug!("No update available"),
                Err(e) => log::error!("Update attempt failed: {}", e),
            }
        }
    }

    /// Supervises the background loops until shutdown. Loops that exit with
    /// an error are respawned; a fatal error (reconnect cap exhausted) ends
    /// the run with `Err`.
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(constants::TASK_SWEEP_INTERVAL) => {}
            }

            let finished: Vec<(&'static str, JoinHandle<Result<()>>)> = {
                let mut background = self.background.lock().expect("background lock poisoned");
                let names: Vec<&'static str> = background
                    .iter()
                    .filter(|(_, handle)| handle.is_finished())
                    .map(|(name, _)| *name)
                    .collect();
                names
                    .into_iter()
                    .filter_map(|name| background.remove_entry(name))
                    .collect()
            };

            for (name, handle) in finished {
                match handle.await {
                    Ok(Ok(())) => {
                        log::info!("Background task {} finished cleanly", name);
                    }
                    Ok(Err(e)) => {
                        if e.downcast_ref::<ChannelError>()
                            .is_some_and(|e| matches!(e, ChannelError::ReconnectExhausted(_)))
                        {
                            log::error!("Fatal: {}", e);
                            return Err(e);
                        }
                        log::error!("Background task {} failed: {}, respawning", name, e);
                        self.spawn_background(name);
                    }
                    Err(join_error) => {
                        log::error!(
                            "Background task {} panicked: {}, respawning",
                            name,
                            join_error
                        );
                        self.spawn_background(name);
                    }
                }
            }
        }
    }

    /// Graceful shutdown: drain the executor, final-flush the collector,
    /// close the channel, stop the background loops.
    pub async fn stop(&self) {
        log::info!("Stopping agent...");
        self.shutdown.cancel();

        self.executor.stop().await;
        self.collector.stop().await;
        self.channel.disconnect().await;

        let background: Vec<JoinHandle<Result<()>>> = self
            .background
            .lock()
            .expect("background lock poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in background {
            handle.abort();
        }

        log::info!("Agent stopped");
    }
}
