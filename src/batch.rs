//! Batch Processor - Bounded Worker Pool per Call
//!
//! `process_batch` spins up `max_workers` tokio tasks (parallel on the
//! multi-thread runtime) that drain a shared queue of items. Each item runs
//! in its own task so a panic or a timeout is confined to that item. Every
//! worker is joined before the call returns, on every path.
//!
//! Results come back in **input order**, one per dispatched item. With
//! `continue_on_error = false` the first failure stops workers from taking
//! new items; items already running still finish, and the untouched ones
//! are listed in [`BatchReport::skipped`].
//!
//! There is no cancellation API. A caller that wraps `process_batch` in its
//! own timeout and drops the future aborts the workers, but item tasks that
//! are already running are detached and may keep going until they finish.
//!
//! A timed-out item is aborted, and its worker waits for the task to end
//! before taking the next item. Abort only lands at an `.await`, so an item
//! that blocks its thread keeps the worker busy until it returns. The number
//! of running items never exceeds `max_workers`.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::{EngineError, Result};
use crate::traits::BatchItem;

/// Progress hook: `(completed, total)` after each item resolves
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Lifecycle of one `process_batch` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchPhase {
    Created,
    Running,
    /// Every dispatched item has resolved
    Completed,
}

#[derive(Debug)]
pub enum BatchOutcome<R> {
    Success(R),
    Failure { error: EngineError, attempts: u32 },
}

/// Outcome for one input item
#[derive(Debug)]
pub struct BatchItemResult<R> {
    pub item_id: String,
    /// Position of the item in the input
    pub index: usize,
    pub outcome: BatchOutcome<R>,
    pub elapsed: Duration,
}

impl<R> BatchItemResult<R> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Success(_))
    }

    #[must_use]
    pub fn value(&self) -> Option<&R> {
        match &self.outcome {
            BatchOutcome::Success(value) => Some(value),
            BatchOutcome::Failure { .. } => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&EngineError> {
        match &self.outcome {
            BatchOutcome::Success(_) => None,
            BatchOutcome::Failure { error, .. } => Some(error),
        }
    }
}

/// The failure that stopped a fail-fast batch
#[derive(Debug, Clone)]
pub struct BatchAbort {
    pub item_id: String,
    pub error: EngineError,
}

/// Counts for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {} of {}, {} failed",
            self.processed, self.total, self.failed
        )?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        Ok(())
    }
}

/// Everything `process_batch` knows when it returns
#[derive(Debug)]
pub struct BatchReport<R> {
    pub batch_id: Uuid,
    pub total: usize,
    /// One entry per dispatched item, in input order
    pub results: Vec<BatchItemResult<R>>,
    /// Items never started because the batch aborted
    pub skipped: Vec<String>,
    pub abort: Option<BatchAbort>,
    pub phase: BatchPhase,
    pub elapsed: Duration,
}

impl<R> BatchReport<R> {
    fn empty(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            total: 0,
            results: Vec::new(),
            skipped: Vec::new(),
            abort: None,
            phase: BatchPhase::Completed,
            elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &R)> {
        self.results
            .iter()
            .filter_map(|r| r.value().map(|v| (r.item_id.as_str(), v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &EngineError)> {
        self.results
            .iter()
            .filter_map(|r| r.error().map(|e| (r.item_id.as_str(), e)))
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        let succeeded = self.succeeded();
        BatchSummary {
            total: self.total,
            processed: self.results.len(),
            succeeded,
            failed: self.results.len() - succeeded,
            skipped: self.skipped.len(),
        }
    }

    /// Fold a later chunk into this report, shifting its indices by `offset`
    fn absorb(&mut self, other: BatchReport<R>, offset: usize) {
        self.total += other.total;
        self.results.extend(other.results.into_iter().map(|mut r| {
            r.index += offset;
            r
        }));
        self.skipped.extend(other.skipped);
        if self.abort.is_none() {
            self.abort = other.abort;
        }
    }
}

/// Per-call knobs; defaults come from [`BatchConfig`]
#[derive(Clone)]
pub struct BatchOptions {
    pub max_workers: usize,
    pub continue_on_error: bool,
    pub item_timeout: Option<Duration>,
    pub progress: Option<ProgressCallback>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("max_workers", &self.max_workers)
            .field("continue_on_error", &self.continue_on_error)
            .field("item_timeout", &self.item_timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl BatchOptions {
    #[must_use]
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            continue_on_error: config.continue_on_error,
            item_timeout: config.item_timeout(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    #[must_use]
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_progress<P>(mut self, progress: P) -> Self
    where
        P: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }
}

/// State shared by the workers of one batch
struct Shared<T, F, R> {
    batch_id: Uuid,
    total: usize,
    queue: Mutex<VecDeque<(usize, T)>>,
    per_item_fn: Arc<F>,
    continue_on_error: bool,
    item_timeout: Option<Duration>,
    progress: Option<ProgressCallback>,
    aborted: AtomicBool,
    abort: Mutex<Option<BatchAbort>>,
    completed: AtomicUsize,
    results: mpsc::UnboundedSender<BatchItemResult<R>>,
}

impl<T, F, Fut, R> Shared<T, F, R>
where
    T: BatchItem,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn work(self: Arc<Self>, worker: usize) {
        debug!(batch_id = %self.batch_id, worker, "Worker started");

        loop {
            if self.aborted.load(Ordering::Acquire) {
                break;
            }
            let next = self.queue.lock().pop_front();
            let Some((index, item)) = next else {
                break;
            };

            let item_id = item.item_id();
            let started = Instant::now();
            let outcome = self.run_item(item).await;

            if let BatchOutcome::Failure { error, attempts } = &outcome {
                warn!(batch_id = %self.batch_id, item_id = %item_id, attempts, error = %error, "Batch item failed");
                if !self.continue_on_error {
                    self.trip(&item_id, error);
                }
            }

            // The receiver outlives every worker
            let _ = self.results.send(BatchItemResult {
                item_id,
                index,
                outcome,
                elapsed: started.elapsed(),
            });

            let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
            self.report_progress(done);
        }

        debug!(batch_id = %self.batch_id, worker, "Worker finished");
    }

    async fn run_item(&self, item: T) -> BatchOutcome<R> {
        // Call inside the task: a panic while building the future stays in the item
        let f = Arc::clone(&self.per_item_fn);
        let mut handle = tokio::spawn(async move { f(item).await });

        let joined = match self.item_timeout {
            Some(limit) => {
                if let Ok(joined) = tokio::time::timeout(limit, &mut handle).await {
                    joined
                } else {
                    handle.abort();
                    // Hold the worker slot until the task is really gone
                    let _ = handle.await;
                    return BatchOutcome::Failure {
                        error: EngineError::ItemTimeout { timeout: limit },
                        attempts: 1,
                    };
                }
            }
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => BatchOutcome::Success(value),
            Ok(Err(error)) => BatchOutcome::Failure {
                attempts: error.attempts(),
                error,
            },
            Err(join_err) => {
                let message = panic_message(join_err);
                error!(batch_id = %self.batch_id, message = %message, "Batch item panicked");
                BatchOutcome::Failure {
                    error: EngineError::WorkerPanic { message },
                    attempts: 1,
                }
            }
        }
    }

    /// First failure wins; later ones only log
    fn trip(&self, item_id: &str, error: &EngineError) {
        let mut abort = self.abort.lock();
        if abort.is_none() {
            *abort = Some(BatchAbort {
                item_id: item_id.to_string(),
                error: error.clone(),
            });
            self.aborted.store(true, Ordering::Release);
        }
    }

    fn report_progress(&self, done: usize) {
        if let Some(progress) = &self.progress {
            // Advisory only; a panicking callback must not take the worker down
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| progress(done, self.total)));
            if outcome.is_err() {
                warn!(batch_id = %self.batch_id, "Progress callback panicked");
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs batches with defaults taken from configuration
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    defaults: BatchOptions,
    batch_size: usize,
}

impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new(&BatchConfig::default())
    }
}

impl BatchProcessor {
    #[must_use]
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            defaults: BatchOptions::from_config(config),
            batch_size: config.batch_size.max(1),
        }
    }

    /// A copy of the configured defaults, ready to be adjusted per call
    #[must_use]
    pub fn options(&self) -> BatchOptions {
        self.defaults.clone()
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Apply `per_item_fn` to every item with at most `max_workers` in flight
    ///
    /// Never fails as a whole: each item's failure is recorded on its own
    /// result. See the module docs for ordering and abort semantics.
    pub async fn process_batch<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        per_item_fn: F,
        options: &BatchOptions,
    ) -> BatchReport<R>
    where
        T: BatchItem,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let batch_id = Uuid::new_v4();
        let total = items.len();
        debug!(batch_id = %batch_id, total, phase = ?BatchPhase::Created, "Batch created");

        if total == 0 {
            return BatchReport::empty(batch_id);
        }

        let started = Instant::now();
        let ids: Vec<String> = items.iter().map(BatchItem::item_id).collect();
        let worker_count = options.max_workers.clamp(1, total);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            batch_id,
            total,
            queue: Mutex::new(items.into_iter().enumerate().collect()),
            per_item_fn: Arc::new(per_item_fn),
            continue_on_error: options.continue_on_error,
            item_timeout: options.item_timeout,
            progress: options.progress.clone(),
            aborted: AtomicBool::new(false),
            abort: Mutex::new(None),
            completed: AtomicUsize::new(0),
            results: tx,
        });

        info!(
            batch_id = %batch_id,
            total,
            workers = worker_count,
            continue_on_error = options.continue_on_error,
            phase = ?BatchPhase::Running,
            "Batch running"
        );

        let mut pool = JoinSet::new();
        for worker in 0..worker_count {
            pool.spawn(Arc::clone(&shared).work(worker));
        }

        // Scoped pool: nothing escapes this loop
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(batch_id = %batch_id, error = %e, "Batch worker terminated abnormally");
            }
        }

        let mut slots: Vec<Option<BatchItemResult<R>>> = (0..total).map(|_| None).collect();
        while let Ok(result) = rx.try_recv() {
            let index = result.index;
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }

        let mut skipped_indices: Vec<usize> =
            shared.queue.lock().drain(..).map(|(index, _)| index).collect();
        skipped_indices.sort_unstable();

        let mut results = Vec::with_capacity(total - skipped_indices.len());
        let mut skipped = Vec::with_capacity(skipped_indices.len());
        for (index, (slot, id)) in slots.into_iter().zip(ids).enumerate() {
            match slot {
                Some(result) => results.push(result),
                None if skipped_indices.binary_search(&index).is_ok() => skipped.push(id),
                // Popped by a worker that died before reporting
                None => results.push(BatchItemResult {
                    item_id: id,
                    index,
                    outcome: BatchOutcome::Failure {
                        error: EngineError::WorkerPanic {
                            message: "worker terminated before reporting".to_string(),
                        },
                        attempts: 1,
                    },
                    elapsed: Duration::ZERO,
                }),
            }
        }

        let abort = shared.abort.lock().take();
        let report = BatchReport {
            batch_id,
            total,
            results,
            skipped,
            abort,
            phase: BatchPhase::Completed,
            elapsed: started.elapsed(),
        };

        let summary = report.summary();
        if let Some(abort) = &report.abort {
            error!(
                batch_id = %batch_id,
                item_id = %abort.item_id,
                error = %abort.error,
                %summary,
                "Batch aborted on first failure"
            );
        } else {
            info!(
                batch_id = %batch_id,
                %summary,
                elapsed_ms = report.elapsed.as_millis(),
                phase = ?report.phase,
                "Batch completed"
            );
        }

        report
    }

    /// Split `items` into `batch_size` chunks and run them one after another
    ///
    /// Indices in the merged report refer to positions in `items`. Progress
    /// is reported against the full input. A fail-fast abort in one chunk
    /// skips all later chunks.
    pub async fn process_in_chunks<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        per_item_fn: F,
        options: &BatchOptions,
    ) -> BatchReport<R>
    where
        T: BatchItem,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let batch_size = batch_size.max(1);
        let overall = items.len();
        let started = Instant::now();
        let per_item_fn = Arc::new(per_item_fn);

        let mut merged = BatchReport::empty(Uuid::new_v4());
        let mut remaining = items.into_iter().peekable();
        let mut offset = 0;

        while remaining.peek().is_some() {
            let chunk: Vec<T> = remaining.by_ref().take(batch_size).collect();
            let chunk_len = chunk.len();

            if merged.is_aborted() {
                merged.total += chunk_len;
                merged.skipped.extend(chunk.iter().map(BatchItem::item_id));
                offset += chunk_len;
                continue;
            }

            let mut chunk_options = options.clone();
            if let Some(progress) = options.progress.clone() {
                let base = offset;
                chunk_options.progress = Some(Arc::new(move |done: usize, _total: usize| {
                    progress(base + done, overall);
                }));
            }

            let f = Arc::clone(&per_item_fn);
            let report = self
                .process_batch(chunk, move |item| (*f)(item), &chunk_options)
                .await;
            merged.absorb(report, offset);
            offset += chunk_len;
        }

        merged.elapsed = started.elapsed();
        info!(batch_id = %merged.batch_id, chunks = overall.div_ceil(batch_size), summary = %merged.summary(), "Chunked batch completed");
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let processor = BatchProcessor::default();
        let report: BatchReport<()> = processor
            .process_batch(Vec::<u64>::new(), |_| async { Ok(()) }, &processor.options())
            .await;

        assert_eq!(report.total, 0);
        assert!(report.results.is_empty());
        assert_eq!(report.phase, BatchPhase::Completed);
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let processor = BatchProcessor::default();
        let items: Vec<u64> = (0..12).collect();

        // Later items finish first
        let report = processor
            .process_batch(
                items,
                |n| async move {
                    tokio::time::sleep(Duration::from_millis(24 - n * 2)).await;
                    Ok(n * 10)
                },
                &processor.options().with_max_workers(4),
            )
            .await;

        let values: Vec<u64> = report.results.iter().filter_map(|r| r.value().copied()).collect();
        assert_eq!(values, (0..12).map(|n| n * 10).collect::<Vec<_>>());
        let indices: Vec<usize> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panicking_item_is_isolated() {
        let processor = BatchProcessor::default();
        let report = processor
            .process_batch(
                vec![1_u64, 2, 3],
                |n| async move {
                    assert!(n != 2, "boom on two");
                    Ok(n)
                },
                &processor.options(),
            )
            .await;

        assert_eq!(report.succeeded(), 2);
        let failed: Vec<(&str, &EngineError)> = report.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "2");
        assert!(matches!(failed[0].1, EngineError::WorkerPanic { message } if message.contains("boom on two")));
    }

    #[tokio::test]
    async fn test_attempts_come_from_exhausted_errors() {
        let processor = BatchProcessor::default();
        let report: BatchReport<()> = processor
            .process_batch(
                vec![7_u64],
                |_| async {
                    Err(EngineError::RetriesExhausted {
                        attempts: 4,
                        source: Box::new(EngineError::timeout("slow")),
                    })
                },
                &processor.options(),
            )
            .await;

        match &report.results[0].outcome {
            BatchOutcome::Failure { attempts, .. } => assert_eq!(*attempts, 4),
            BatchOutcome::Success(()) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_summary_display() {
        let summary = BatchSummary {
            total: 10,
            processed: 8,
            succeeded: 6,
            failed: 2,
            skipped: 2,
        };
        assert_eq!(summary.to_string(), "processed 8 of 10, 2 failed, 2 skipped");
    }
}
