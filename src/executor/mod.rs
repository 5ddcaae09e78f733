//! Bounded concurrent task executor.
//!
//! Accepts probe jobs from the control plane, admits them against a
//! concurrency cap, runs the protocol handler under a hard deadline, retries
//! transient failures with exponential backoff, and emits exactly one
//! terminal record per task to the result sink.
//!
//! # Admission vs. execution bound
//!
//! Admission performs a first-line cardinality check against the in-flight
//! set, but the actual concurrency bound is a semaphore the worker acquires
//! before invoking the handler. Reconfiguring `max_concurrent_tasks` swaps
//! the semaphore; permits already held on the old one stay valid, so the
//! change is race-free.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{ProbeRequest, ProbeResult, ProtocolRegistry};

/// Lifecycle state of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this state ends the record's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

/// A probe job as assigned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: Uuid,
    pub protocol: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Per-task deadline in seconds. Falls back to the executor default.
    #[serde(default, alias = "timeout_seconds")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub parameters: Map<String, serde_json::Value>,
}

impl TaskSpec {
    /// Structural validation independent of the protocol handler.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() {
            return Err("target must not be empty".to_string());
        }
        if self.port == Some(0) {
            return Err("port must be in 1..=65535".to_string());
        }
        if self.timeout == Some(0) {
            return Err("timeout must be greater than zero".to_string());
        }
        if matches!(self.protocol.as_str(), "tcp" | "udp") && self.port.is_none() {
            return Err(format!("port is required for {} tasks", self.protocol));
        }
        Ok(())
    }
}

/// Internal per-task state tracking.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub spec: TaskSpec,
    pub status: ExecutionStatus,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<ProbeResult>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl TaskExecution {
    fn new(spec: TaskSpec, max_retries: u32) -> Self {
        Self {
            spec,
            status: ExecutionStatus::Pending,
            start_time: chrono::Utc::now(),
            end_time: None,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// Milliseconds between start and end, when both are stamped.
    pub fn duration_ms(&self) -> Option<f64> {
        self.end_time.map(|end| {
            (end - self.start_time)
                .num_microseconds()
                .unwrap_or_default() as f64
                / 1000.0
        })
    }

    fn mark_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.start_time = chrono::Utc::now();
    }

    fn mark_completed(&mut self, result: ProbeResult) {
        self.status = ExecutionStatus::Completed;
        self.end_time = Some(chrono::Utc::now());
        self.result = Some(result);
    }

    fn mark_failed(&mut self, error: String) {
        self.status = ExecutionStatus::Failed;
        self.end_time = Some(chrono::Utc::now());
        self.error_message = Some(error);
    }

    fn mark_timeout(&mut self) {
        self.status = ExecutionStatus::Timeout;
        self.end_time = Some(chrono::Utc::now());
        self.error_message = Some("task execution timed out".to_string());
    }

    fn mark_cancelled(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.end_time = Some(chrono::Utc::now());
        self.error_message = Some("task cancelled".to_string());
    }

    /// Only handler failures retry; timeout and cancellation are terminal.
    fn can_retry(&self) -> bool {
        self.status == ExecutionStatus::Failed && self.retry_count < self.max_retries
    }

    /// Transitions back to pending for the next attempt and returns the
    /// backoff to sleep first: `min(2^retry_count, 60)` seconds.
    fn increment_retry(&mut self) -> Duration {
        self.retry_count += 1;
        self.status = ExecutionStatus::Pending;
        self.end_time = None;
        self.error_message = None;
        Duration::from_secs(2u64.pow(self.retry_count).min(60))
    }
}

/// Terminal record handed to the result sink, enriched with the probe
/// handler's observables when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub agent_id: String,
    pub execution_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_status: Option<crate::protocol::ProbeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Map<String, serde_json::Value>>,
}

impl TaskReport {
    fn from_execution(agent_id: &str, execution: &TaskExecution) -> Self {
        Self {
            task_id: execution.spec.task_id,
            agent_id: agent_id.to_string(),
            execution_time: execution.start_time.to_rfc3339(),
            duration_ms: execution.duration_ms(),
            status: execution.status,
            error_message: execution.error_message.clone(),
            retry_count: execution.retry_count,
            probe_status: execution.result.as_ref().map(|r| r.status),
            metrics: execution.result.as_ref().map(|r| r.metrics.clone()),
            raw_data: execution.result.as_ref().map(|r| r.raw_data.clone()),
        }
    }
}

/// Why a dispatch was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// The executor is stopping or stopped.
    NotRunning,
    /// The task id is already in flight.
    Duplicate(Uuid),
    /// The in-flight set is at `max_concurrent_tasks`.
    CapacityExceeded(usize),
    /// The job failed structural validation or names an unknown protocol.
    InvalidTask(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "executor is not running"),
            Self::Duplicate(id) => write!(f, "task {id} is already in flight"),
            Self::CapacityExceeded(max) => {
                write!(f, "maximum concurrent tasks reached ({max})")
            }
            Self::InvalidTask(msg) => write!(f, "invalid task: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Async callback receiving every terminal record.
pub type ResultSink = Arc<dyn Fn(TaskReport) -> BoxFuture<'static, ()> + Send + Sync>;

/// Aggregate execution statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub total_executed: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub total_cancelled: u64,
    pub avg_execution_time_ms: f64,
}

/// Summary of one in-flight task for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub task_id: Uuid,
    pub protocol: String,
    pub target: String,
    pub status: ExecutionStatus,
    pub started_at: String,
}

/// Per-task bookkeeping held in the in-flight set.
struct InFlight {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    protocol: String,
    target: String,
    status: ExecutionStatus,
    started_at: chrono::DateTime<chrono::Utc>,
}

/// Shared internals referenced by every worker.
struct ExecutorInner {
    agent_id: String,
    registry: Arc<ProtocolRegistry>,
    default_timeout: Duration,
    running: AtomicBool,
    max_concurrent: AtomicUsize,
    semaphore: StdMutex<Arc<Semaphore>>,
    executions: StdMutex<HashMap<Uuid, InFlight>>,
    stats: StdMutex<ExecutorStats>,
    sink: ResultSink,
}

impl ExecutorInner {
    fn current_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore.lock().expect("semaphore lock poisoned"))
    }

    fn set_status(&self, task_id: Uuid, status: ExecutionStatus) {
        if let Some(entry) = self
            .executions
            .lock()
            .expect("executions lock poisoned")
            .get_mut(&task_id)
        {
            entry.status = status;
        }
    }

    fn update_stats(&self, execution: &TaskExecution) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total_executed += 1;
        match execution.status {
            ExecutionStatus::Completed => stats.total_successful += 1,
            ExecutionStatus::Failed => stats.total_failed += 1,
            ExecutionStatus::Timeout => stats.total_timeout += 1,
            ExecutionStatus::Cancelled => stats.total_cancelled += 1,
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }
        if let Some(duration) = execution.duration_ms() {
            let previous = stats.avg_execution_time_ms * (stats.total_executed - 1) as f64;
            stats.avg_execution_time_ms = (previous + duration) / stats.total_executed as f64;
        }
    }

    async fn emit(&self, execution: &TaskExecution) {
        let report = TaskReport::from_execution(&self.agent_id, execution);
        (self.sink)(report).await;
    }
}

impl std::fmt::Debug for ExecutorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorInner")
            .field("agent_id", &self.agent_id)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// The worker pool dispatching probe jobs to protocol handlers.
#[derive(Debug)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
    max_retries: u32,
}

impl TaskExecutor {
    pub fn new(
        agent_id: impl Into<String>,
        registry: Arc<ProtocolRegistry>,
        max_concurrent_tasks: usize,
        default_timeout: Duration,
        sink: ResultSink,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                agent_id: agent_id.into(),
                registry,
                default_timeout,
                running: AtomicBool::new(false),
                max_concurrent: AtomicUsize::new(max_concurrent_tasks.max(1)),
                semaphore: StdMutex::new(Arc::new(Semaphore::new(max_concurrent_tasks.max(1)))),
                executions: StdMutex::new(HashMap::new()),
                stats: StdMutex::new(ExecutorStats::default()),
                sink,
            }),
            max_retries: crate::constants::MAX_TASK_RETRIES,
        }
    }

    /// Starts accepting jobs.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            log::warn!("Task executor already running");
            return;
        }
        log::info!("Task executor started");
    }

    /// Whether the executor accepts new jobs.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Admits a job and spawns its worker.
    pub fn dispatch(&self, spec: TaskSpec) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::NotRunning);
        }
        spec.validate().map_err(DispatchError::InvalidTask)?;
        if !self.inner.registry.is_supported(&spec.protocol) {
            return Err(DispatchError::InvalidTask(format!(
                "unsupported protocol: {}",
                spec.protocol
            )));
        }

        let task_id = spec.task_id;
        let cancel = CancellationToken::new();

        {
            let mut executions = self
                .inner
                .executions
                .lock()
                .expect("executions lock poisoned");
            if executions.contains_key(&task_id) {
                return Err(DispatchError::Duplicate(task_id));
            }
            let max = self.inner.max_concurrent.load(Ordering::SeqCst);
            if executions.len() >= max {
                return Err(DispatchError::CapacityExceeded(max));
            }
            executions.insert(
                task_id,
                InFlight {
                    cancel: cancel.clone(),
                    handle: None,
                    protocol: spec.protocol.clone(),
                    target: spec.target.clone(),
                    status: ExecutionStatus::Pending,
                    started_at: chrono::Utc::now(),
                },
            );
        }

        let execution = TaskExecution::new(spec, self.max_retries);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(Self::run_worker(inner, execution, cancel));

        // The worker may already have removed its entry for a fast-failing
        // task; only park the handle if the entry still exists.
        if let Some(entry) = self
            .inner
            .executions
            .lock()
            .expect("executions lock poisoned")
            .get_mut(&task_id)
        {
            entry.handle = Some(handle);
        }

        log::info!("Task {} dispatched", task_id);
        Ok(())
    }

    /// Worker lifecycle: attempt loop with bounded retry, then exactly one
    /// terminal emission and removal from the in-flight set.
    async fn run_worker(
        inner: Arc<ExecutorInner>,
        mut execution: TaskExecution,
        cancel: CancellationToken,
    ) {
        let task_id = execution.spec.task_id;

        loop {
            // Concurrency bound: one permit per running handler invocation.
            let semaphore = inner.current_semaphore();
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        execution.mark_cancelled();
                        inner.update_stats(&execution);
                        break;
                    }
                },
                () = cancel.cancelled() => {
                    execution.mark_cancelled();
                    inner.update_stats(&execution);
                    break;
                }
            };

            match inner.registry.handler(&execution.spec.protocol) {
                Ok(handler) => {
                    execution.mark_running();
                    inner.set_status(task_id, ExecutionStatus::Running);

                    let timeout = execution
                        .spec
                        .timeout
                        .map(Duration::from_secs)
                        .unwrap_or(inner.default_timeout);
                    let request = ProbeRequest {
                        target: execution.spec.target.clone(),
                        port: execution.spec.port,
                        timeout,
                        parameters: execution.spec.parameters.clone(),
                    };

                    log::debug!(
                        "Task {} running: {} -> {}",
                        task_id,
                        execution.spec.protocol,
                        execution.spec.target
                    );

                    tokio::select! {
                        outcome = tokio::time::timeout(timeout, handler.probe(&request)) => {
                            match outcome {
                                Ok(Ok(result)) => execution.mark_completed(result),
                                Ok(Err(e)) => execution.mark_failed(e.to_string()),
                                Err(_) => execution.mark_timeout(),
                            }
                        }
                        () = cancel.cancelled() => execution.mark_cancelled(),
                    }
                }
                Err(e) => execution.mark_failed(e.to_string()),
            }

            drop(permit);
            inner.set_status(task_id, execution.status);
            inner.update_stats(&execution);

            if execution.can_retry() && !cancel.is_cancelled() {
                let backoff = execution.increment_retry();
                inner.set_status(task_id, ExecutionStatus::Pending);
                log::info!(
                    "Task {} retry {} in {}s",
                    task_id,
                    execution.retry_count,
                    backoff.as_secs()
                );

                // Shutdown during backoff must still yield a terminal record.
                tokio::select! {
                    () = tokio::time::sleep(backoff) => continue,
                    () = cancel.cancelled() => {
                        execution.mark_cancelled();
                        inner.update_stats(&execution);
                        break;
                    }
                }
            }
            break;
        }

        log::debug!("Task {} terminal: {:?}", task_id, execution.status);
        inner.emit(&execution).await;
        inner
            .executions
            .lock()
            .expect("executions lock poisoned")
            .remove(&task_id);
    }

    /// Signals cancellation for an in-flight task. Returns `false` when the
    /// task is unknown or already terminal.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let executions = self
            .inner
            .executions
            .lock()
            .expect("executions lock poisoned");
        match executions.get(&task_id) {
            Some(entry) => {
                entry.cancel.cancel();
                log::info!("Task {} cancellation requested", task_id);
                true
            }
            None => {
                log::warn!("Cancel for unknown task {}", task_id);
                false
            }
        }
    }

    /// Stops admission, cancels every in-flight worker and waits for each to
    /// emit its terminal record.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Task executor stopping");

        let handles: Vec<JoinHandle<()>> = {
            let mut executions = self
                .inner
                .executions
                .lock()
                .expect("executions lock poisoned");
            executions
                .values_mut()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.handle.take()
                })
                .collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("Worker task panicked during shutdown: {}", e);
                }
            }
        }

        log::info!("Task executor stopped");
    }

    /// Race-free reconfiguration of the concurrency cap: the admission check
    /// reads the new value, and new workers acquire the new semaphore while
    /// permits on the old one drain naturally.
    pub fn set_max_concurrent_tasks(&self, max: usize) {
        let max = max.max(1);
        self.inner.max_concurrent.store(max, Ordering::SeqCst);
        *self.inner.semaphore.lock().expect("semaphore lock poisoned") =
            Arc::new(Semaphore::new(max));
        log::info!("Max concurrent tasks set to {}", max);
    }

    /// Number of tasks currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner
            .executions
            .lock()
            .expect("executions lock poisoned")
            .len()
    }

    /// Snapshot of aggregate statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.inner.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Snapshot of in-flight tasks for the `status` command.
    pub fn running_tasks(&self) -> Vec<RunningTask> {
        self.inner
            .executions
            .lock()
            .expect("executions lock poisoned")
            .iter()
            .map(|(task_id, entry)| RunningTask {
                task_id: *task_id,
                protocol: entry.protocol.clone(),
                target: entry.target.clone(),
                status: entry.status,
                started_at: entry.started_at.to_rfc3339(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProbeError, ProbeHandler, ProbeStatus};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    /// Scriptable handler: sleeps, then fails the first `fail_times` calls.
    struct ScriptedHandler {
        delay: Duration,
        fail_times: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProbeHandler for ScriptedHandler {
        fn protocol(&self) -> &'static str {
            "scripted"
        }

        fn validate(&self, _request: &ProbeRequest) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(ProbeError::Execution("scripted failure".into()));
            }

            let mut result = ProbeResult::new("scripted", &request.target, request.port);
            result.status = ProbeStatus::Success;
            result.metrics.insert("status_code".into(), serde_json::json!(200));
            Ok(result)
        }
    }

    fn registry_with(handler: ScriptedHandler) -> Arc<ProtocolRegistry> {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(handler)).unwrap();
        Arc::new(registry)
    }

    fn spec(protocol: &str, timeout: Option<u64>) -> TaskSpec {
        TaskSpec {
            task_id: Uuid::new_v4(),
            protocol: protocol.to_string(),
            target: "example.com".to_string(),
            port: None,
            timeout,
            parameters: Map::new(),
        }
    }

    fn executor_with_sink(
        registry: Arc<ProtocolRegistry>,
        max_concurrent: usize,
    ) -> (TaskExecutor, mpsc::UnboundedReceiver<TaskReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: ResultSink = Arc::new(move |report| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(report);
            })
        });
        let executor = TaskExecutor::new(
            "agent-1",
            registry,
            max_concurrent,
            Duration::from_secs(5),
            sink,
        );
        executor.start();
        (executor, rx)
    }

    #[tokio::test]
    async fn test_happy_path_emits_single_completed_record() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_millis(5),
            fail_times: AtomicU32::new(0),
            calls: Arc::clone(&calls),
        });
        let (executor, mut rx) = executor_with_sink(registry, 4);

        let task = spec("scripted", Some(5));
        executor.dispatch(task.clone()).unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.task_id, task.task_id);
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.probe_status, Some(ProbeStatus::Success));
        assert_eq!(report.retry_count, 0);
        assert_eq!(report.metrics.unwrap()["status_code"], serde_json::json!(200));

        // Exactly one record, and the in-flight set drains.
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_terminal_without_retry() {
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_secs(10),
            fail_times: AtomicU32::new(0),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let (executor, mut rx) = executor_with_sink(registry, 2);

        executor.dispatch(spec("scripted", Some(1))).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.status, ExecutionStatus::Timeout);
        assert!(report.duration_ms.unwrap() >= 1000.0);
        assert!(report.duration_ms.unwrap() < 2000.0);
        assert!(report.metrics.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_schedule_and_single_emission() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_millis(1),
            fail_times: AtomicU32::new(2),
            calls: Arc::clone(&calls),
        });
        let (executor, mut rx) = executor_with_sink(registry, 2);

        executor.dispatch(spec("scripted", Some(30))).unwrap();

        // Paused time auto-advances through the 2s + 4s backoffs.
        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_emits_one_failed_record() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_millis(1),
            fail_times: AtomicU32::new(100),
            calls: Arc::clone(&calls),
        });
        let (executor, mut rx) = executor_with_sink(registry, 2);

        executor.dispatch(spec("scripted", Some(30))).unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.retry_count, crate::constants::MAX_TASK_RETRIES);
        // Initial attempt + max_retries, never max_retries + 2.
        assert_eq!(
            calls.load(Ordering::SeqCst),
            crate::constants::MAX_TASK_RETRIES + 1
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_admission_boundaries() {
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_secs(10),
            fail_times: AtomicU32::new(0),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let (executor, _rx) = executor_with_sink(registry, 2);

        let first = spec("scripted", Some(30));
        executor.dispatch(first.clone()).unwrap();

        // Duplicate task id rejected.
        assert_eq!(
            executor.dispatch(first.clone()),
            Err(DispatchError::Duplicate(first.task_id))
        );

        // At max - 1 admission succeeds; at max it rejects.
        executor.dispatch(spec("scripted", Some(30))).unwrap();
        assert_eq!(
            executor.dispatch(spec("scripted", Some(30))),
            Err(DispatchError::CapacityExceeded(2))
        );

        executor.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_rejections() {
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_millis(1),
            fail_times: AtomicU32::new(0),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let (executor, _rx) = executor_with_sink(Arc::clone(&registry), 2);

        // Unknown protocol.
        assert!(matches!(
            executor.dispatch(spec("gopher", Some(5))),
            Err(DispatchError::InvalidTask(_))
        ));

        // Port required for tcp/udp.
        let mut tcp_task = spec("tcp", Some(5));
        tcp_task.protocol = "tcp".to_string();
        assert!(matches!(
            executor.dispatch(tcp_task),
            Err(DispatchError::InvalidTask(_))
        ));

        // Stopped executor rejects everything.
        executor.stop().await;
        assert_eq!(
            executor.dispatch(spec("scripted", Some(5))),
            Err(DispatchError::NotRunning)
        );
    }

    #[tokio::test]
    async fn test_cancel_running_task_emits_cancelled() {
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_secs(30),
            fail_times: AtomicU32::new(0),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let (executor, mut rx) = executor_with_sink(registry, 2);

        let task = spec("scripted", Some(60));
        executor.dispatch(task.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(executor.cancel(task.task_id));
        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Cancelled);

        // Cancelled records are not retried, and cancelling again is a no-op.
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!executor.cancel(task.task_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_emits_cancelled() {
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_millis(1),
            fail_times: AtomicU32::new(100),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: ResultSink = Arc::new(move |report| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(report);
            })
        });
        let executor = TaskExecutor::new(
            "agent-1",
            registry,
            2,
            Duration::from_secs(5),
            sink,
        );
        executor.start();

        let task = spec("scripted", Some(30));
        executor.dispatch(task.clone()).unwrap();

        // Let the first attempt fail and the worker enter its backoff sleep,
        // then stop the executor mid-backoff.
        tokio::time::sleep(Duration::from_millis(500)).await;
        executor.stop().await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.task_id, task.task_id);
        assert_eq!(report.status, ExecutionStatus::Cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        struct GaugeHandler {
            active: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl ProbeHandler for GaugeHandler {
            fn protocol(&self) -> &'static str {
                "gauge"
            }

            fn validate(&self, _request: &ProbeRequest) -> Result<(), ProbeError> {
                Ok(())
            }

            async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);

                let mut result = ProbeResult::new("gauge", &request.target, None);
                result.status = ProbeStatus::Success;
                Ok(result)
            }
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ProtocolRegistry::new();
        registry
            .register(Arc::new(GaugeHandler {
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
            }))
            .unwrap();
        let (executor, mut rx) = executor_with_sink(Arc::new(registry), 3);

        for _ in 0..3 {
            executor.dispatch(spec("gauge", Some(5))).unwrap();
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let registry = registry_with(ScriptedHandler {
            delay: Duration::from_millis(1),
            fail_times: AtomicU32::new(0),
            calls: Arc::new(AtomicU32::new(0)),
        });
        let (executor, mut rx) = executor_with_sink(registry, 2);

        executor.dispatch(spec("scripted", Some(5))).unwrap();
        rx.recv().await.unwrap();

        let stats = executor.stats();
        assert_eq!(stats.total_executed, 1);
        assert_eq!(stats.total_successful, 1);
        assert!(stats.avg_execution_time_ms >= 0.0);
    }

    #[test]
    fn test_task_spec_validation() {
        let mut task = TaskSpec {
            task_id: Uuid::new_v4(),
            protocol: "tcp".to_string(),
            target: "host".to_string(),
            port: Some(0),
            timeout: Some(5),
            parameters: Map::new(),
        };
        assert!(task.validate().is_err());

        task.port = Some(443);
        assert!(task.validate().is_ok());

        task.timeout = Some(0);
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_task_spec_accepts_timeout_seconds_alias() {
        let task: TaskSpec = serde_json::from_value(serde_json::json!({
            "task_id": Uuid::new_v4(),
            "protocol": "icmp",
            "target": "example.com",
            "timeout_seconds": 10,
        }))
        .unwrap();
        assert_eq!(task.timeout, Some(10));
    }
}
