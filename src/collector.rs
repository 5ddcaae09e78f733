//! Result batch collector.
//!
//! Aggregates terminal task records into size-or-time bounded batches and
//! ships them through the control channel. A batch that cannot be delivered
//! (channel down) is appended to a bounded on-disk spool and replayed, in
//! order, before the next delivery attempt, so results survive both
//! disconnects and process restarts.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::constants;
use crate::executor::TaskReport;

/// One `task_results_batch` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBatch {
    pub agent_id: String,
    pub timestamp: String,
    pub results: Vec<TaskReport>,
}

/// Async delivery callback; returns whether the batch made it onto the wire.
pub type BatchSink = Arc<dyn Fn(ResultBatch) -> BoxFuture<'static, bool> + Send + Sync>;

/// A spooled batch with its spool timestamp for TTL pruning.
#[derive(Debug, Serialize, Deserialize)]
struct SpooledBatch {
    spooled_at: i64,
    batch: ResultBatch,
}

/// Bounded JSON-lines spool for undeliverable batches.
#[derive(Debug)]
struct Spool {
    path: PathBuf,
    /// Line count cache so appends don't re-read the file.
    count: AtomicUsize,
    max_batches: usize,
    ttl: Duration,
}

impl Spool {
    fn open(path: PathBuf, max_batches: usize, ttl: Duration) -> Self {
        let count = fs::read_to_string(&path)
            .map(|content| content.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0);
        if count > 0 {
            log::info!("Found {} spooled result batches at {}", count, path.display());
        }
        Self {
            path,
            count: AtomicUsize::new(count),
            max_batches,
            ttl,
        }
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn append(&self, batch: &ResultBatch) {
        if self.count.load(Ordering::SeqCst) >= self.max_batches {
            // Bounded spool: drop the oldest entries to make room.
            let kept = self.drain();
            let skip = kept.len().saturating_sub(self.max_batches - 1);
            if skip > 0 {
                log::warn!("Result spool full, dropping {} oldest batches", skip);
            }
            for entry in kept.into_iter().skip(skip) {
                self.write_line(&entry);
            }
        }

        let entry = SpooledBatch {
            spooled_at: chrono::Utc::now().timestamp(),
            batch: batch.clone(),
        };
        self.write_line(&entry);
        log::info!(
            "Spooled batch of {} results ({} batches spooled)",
            batch.results.len(),
            self.len()
        );
    }

    fn write_line(&self, entry: &SpooledBatch) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to serialize spool entry: {}", e);
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));
        match result {
            Ok(()) => {
                self.count.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => log::error!("Failed to write result spool {}: {}", self.path.display(), e),
        }
    }

    /// Reads every valid, unexpired entry and truncates the spool.
    fn drain(&self) -> Vec<SpooledBatch> {
        let content = fs::read_to_string(&self.path).unwrap_or_default();
        let _ = fs::remove_file(&self.path);
        self.count.store(0, Ordering::SeqCst);

        let cutoff = chrono::Utc::now().timestamp() - self.ttl.as_secs() as i64;
        let mut entries = Vec::new();
        let mut expired = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<SpooledBatch>(line) {
                Ok(entry) if entry.spooled_at >= cutoff => entries.push(entry),
                Ok(_) => expired += 1,
                Err(e) => log::warn!("Skipping corrupt spool line: {}", e),
            }
        }
        if expired > 0 {
            log::warn!("Dropped {} spooled batches past their TTL", expired);
        }
        entries
    }
}

struct CollectorInner {
    agent_id: String,
    batch_size: usize,
    buffer: StdMutex<Vec<TaskReport>>,
    sink: BatchSink,
    spool: Spool,
    running: AtomicBool,
}

impl CollectorInner {
    /// Swaps the buffer empty under the lock and returns the previous
    /// contents. The outbound send never happens while holding the lock.
    fn swap_buffer(&self) -> Vec<TaskReport> {
        std::mem::take(&mut *self.buffer.lock().expect("buffer lock poisoned"))
    }

    async fn flush(&self, results: Vec<TaskReport>) {
        if results.is_empty() {
            return;
        }
        let batch = ResultBatch {
            agent_id: self.agent_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            results,
        };
        self.deliver(batch).await;
    }

    /// Replays spooled batches in order, then attempts the new batch.
    /// Anything undeliverable goes (back) to the spool.
    async fn deliver(&self, batch: ResultBatch) {
        if self.spool.len() > 0 {
            let backlog = self.spool.drain();
            let mut failed_from = None;
            for (index, entry) in backlog.iter().enumerate() {
                if !(self.sink)(entry.batch.clone()).await {
                    failed_from = Some(index);
                    break;
                }
            }
            if let Some(from) = failed_from {
                for entry in &backlog[from..] {
                    self.spool.append(&entry.batch);
                }
                // The channel is down; don't even try the fresh batch.
                self.spool.append(&batch);
                return;
            }
            if !backlog.is_empty() {
                log::info!("Replayed {} spooled result batches", backlog.len());
            }
        }

        let count = batch.results.len();
        if (self.sink)(batch.clone()).await {
            log::debug!("Sent batch of {} task results", count);
        } else {
            self.spool.append(&batch);
        }
    }
}

impl std::fmt::Debug for CollectorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorInner")
            .field("agent_id", &self.agent_id)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Time-and-size windowed aggregator for task results.
#[derive(Debug)]
pub struct ResultCollector {
    inner: Arc<CollectorInner>,
    batch_timeout: Duration,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl ResultCollector {
    pub fn new(
        agent_id: impl Into<String>,
        batch_size: usize,
        batch_timeout: Duration,
        spool_path: PathBuf,
        sink: BatchSink,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                agent_id: agent_id.into(),
                batch_size: batch_size.max(1),
                buffer: StdMutex::new(Vec::new()),
                sink,
                spool: Spool::open(spool_path, constants::SPOOL_MAX_BATCHES, constants::SPOOL_TTL),
                running: AtomicBool::new(false),
            }),
            batch_timeout,
            ticker: StdMutex::new(None),
        }
    }

    /// Starts the periodic flush loop.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = self.batch_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first window
            // is a full `batch_timeout` wide.
            ticker.tick().await;

            while inner.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let pending = inner.swap_buffer();
                inner.flush(pending).await;
            }
        });

        *self.ticker.lock().expect("ticker lock poisoned") = Some(handle);
        log::info!("Result collector started");
    }

    /// Buffers one terminal record; flushes immediately when the buffer
    /// reaches `batch_size`.
    pub async fn collect(&self, report: TaskReport) {
        let ready = {
            let mut buffer = self.inner.buffer.lock().expect("buffer lock poisoned");
            buffer.push(report);
            if buffer.len() >= self.inner.batch_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(results) = ready {
            self.inner.flush(results).await;
        }
    }

    /// Records currently buffered (not yet flushed).
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().expect("buffer lock poisoned").len()
    }

    /// Batches waiting in the on-disk spool.
    pub fn spooled(&self) -> usize {
        self.inner.spool.len()
    }

    /// Stops the flush loop and performs one final flush of the remainder.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.ticker.lock().expect("ticker lock poisoned").take() {
            handle.abort();
        }

        let remainder = self.inner.swap_buffer();
        self.inner.flush(remainder).await;
        log::info!("Result collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionStatus;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use tokio::sync::Mutex as TokioMutex;
    use uuid::Uuid;

    fn report(n: u32) -> TaskReport {
        TaskReport {
            task_id: Uuid::new_v4(),
            agent_id: "agent-1".to_string(),
            execution_time: chrono::Utc::now().to_rfc3339(),
            duration_ms: Some(f64::from(n)),
            status: ExecutionStatus::Completed,
            error_message: None,
            retry_count: 0,
            probe_status: None,
            metrics: None,
            raw_data: None,
        }
    }

    /// Sink that records delivered batches and can be switched off.
    fn recording_sink() -> (BatchSink, Arc<TokioMutex<Vec<ResultBatch>>>, Arc<StdAtomicBool>) {
        let delivered: Arc<TokioMutex<Vec<ResultBatch>>> = Arc::new(TokioMutex::new(Vec::new()));
        let healthy = Arc::new(StdAtomicBool::new(true));

        let sink_delivered = Arc::clone(&delivered);
        let sink_healthy = Arc::clone(&healthy);
        let sink: BatchSink = Arc::new(move |batch| {
            let delivered = Arc::clone(&sink_delivered);
            let healthy = Arc::clone(&sink_healthy);
            Box::pin(async move {
                if healthy.load(Ordering::SeqCst) {
                    delivered.lock().await.push(batch);
                    true
                } else {
                    false
                }
            })
        });

        (sink, delivered, healthy)
    }

    fn collector_with(
        batch_size: usize,
        timeout: Duration,
        dir: &tempfile::TempDir,
        sink: BatchSink,
    ) -> ResultCollector {
        ResultCollector::new(
            "agent-1",
            batch_size,
            timeout,
            dir.path().join("spool.jsonl"),
            sink,
        )
    }

    #[tokio::test]
    async fn test_size_triggered_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, delivered, _) = recording_sink();
        let collector = collector_with(3, Duration::from_secs(60), &dir, sink);

        collector.collect(report(1)).await;
        collector.collect(report(2)).await;
        assert_eq!(collector.buffered(), 2);
        assert!(delivered.lock().await.is_empty());

        collector.collect(report(3)).await;
        assert_eq!(collector.buffered(), 0);

        let batches = delivered.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].results.len(), 3);
        assert_eq!(batches[0].agent_id, "agent-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_triggered_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, delivered, _) = recording_sink();
        let collector = collector_with(100, Duration::from_secs(30), &dir, sink);
        collector.start();

        collector.collect(report(1)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(delivered.lock().await.len(), 1);
        assert_eq!(collector.buffered(), 0);
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_stop_performs_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, delivered, _) = recording_sink();
        let collector = collector_with(100, Duration::from_secs(60), &dir, sink);
        collector.start();

        collector.collect(report(1)).await;
        collector.collect(report(2)).await;
        collector.stop().await;

        let batches = delivered.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].results.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_spools_and_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, delivered, healthy) = recording_sink();
        let collector = collector_with(1, Duration::from_secs(60), &dir, sink);

        // Channel down: both batches land in the spool.
        healthy.store(false, Ordering::SeqCst);
        collector.collect(report(1)).await;
        collector.collect(report(2)).await;
        assert_eq!(collector.spooled(), 2);
        assert!(delivered.lock().await.is_empty());

        // Channel back: the next collect replays the backlog first.
        healthy.store(true, Ordering::SeqCst);
        collector.collect(report(3)).await;
        assert_eq!(collector.spooled(), 0);

        let batches = delivered.lock().await;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].results[0].duration_ms, Some(1.0));
        assert_eq!(batches[1].results[0].duration_ms, Some(2.0));
        assert_eq!(batches[2].results[0].duration_ms, Some(3.0));
    }

    #[tokio::test]
    async fn test_spool_survives_collector_restart() {
        let dir = tempfile::tempdir().unwrap();
        let spool_path = dir.path().join("spool.jsonl");

        {
            let (sink, _, healthy) = recording_sink();
            healthy.store(false, Ordering::SeqCst);
            let collector =
                ResultCollector::new("agent-1", 1, Duration::from_secs(60), spool_path.clone(), sink);
            collector.collect(report(7)).await;
            assert_eq!(collector.spooled(), 1);
        }

        // A new collector (fresh process) picks the backlog up from disk.
        let (sink, delivered, _) = recording_sink();
        let collector =
            ResultCollector::new("agent-1", 1, Duration::from_secs(60), spool_path, sink);
        assert_eq!(collector.spooled(), 1);

        collector.collect(report(8)).await;
        let batches = delivered.lock().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].results[0].duration_ms, Some(7.0));
    }
}
