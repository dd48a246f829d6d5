//! Queue worker.
//!
//! Polls one named queue and routes each message to the [`Job`] registered
//! for its type. Requeued jobs are retried with exponential backoff until
//! `max_attempts`; rejected or exhausted jobs move to the dead-letter list.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{Job, JobOutcome};
use super::{MemoryQueue, QueuedMessage};
use crate::config::WorkerConfig;

/// A job that will not be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: u64,
    pub message: QueuedMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub dead_letter_count: usize,
    pub pending_count: usize,
}

/// Consumes a [`MemoryQueue`].
pub struct QueueWorker {
    queue: Arc<MemoryQueue>,
    queue_name: String,
    config: WorkerConfig,
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
    dead_letters: DashMap<u64, DeadLetterEntry>,
    next_dead_letter_id: AtomicU64,
    processed: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    cancel: CancellationToken,
}

impl QueueWorker {
    pub fn new(queue: Arc<MemoryQueue>, queue_name: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            config,
            jobs: RwLock::new(HashMap::new()),
            dead_letters: DashMap::new(),
            next_dead_letter_id: AtomicU64::new(1),
            processed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Worker for the queue named in `config`.
    pub fn from_config(queue: Arc<MemoryQueue>, config: WorkerConfig) -> Self {
        let queue_name = config.queue.clone();
        Self::new(queue, queue_name, config)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Register the handler for a job type, replacing any previous one.
    pub fn register_job(&self, job: Arc<dyn Job>) {
        self.jobs.write().insert(job.job_type().to_string(), job);
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Process the next ready message, if any.
    pub async fn process_next(&self) -> Option<JobOutcome> {
        let mut message = self.queue.pop_ready(&self.queue_name)?;
        message.attempts += 1;
        self.processed.fetch_add(1, Ordering::Relaxed);

        let job = self.jobs.read().get(&message.job_type).cloned();
        let outcome = match job {
            Some(job) => job.execute(&message).await,
            None => {
                warn!(job_type = %message.job_type, "No handler registered for job type");
                JobOutcome::Reject
            }
        };

        match outcome {
            JobOutcome::Ack => {
                self.acked.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Reject => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.dead_letter(message, "rejected");
            }
            JobOutcome::Requeue if message.attempts >= self.config.max_attempts => {
                warn!(
                    job_id = %message.id,
                    attempts = message.attempts,
                    "Job exhausted retries"
                );
                self.dead_letter(message, "max attempts exceeded");
            }
            JobOutcome::Requeue => {
                self.requeued.fetch_add(1, Ordering::Relaxed);
                let delay = self.calculate_retry_delay(message.attempts);
                debug!(
                    job_id = %message.id,
                    attempts = message.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job requeued"
                );
                self.queue.requeue(message, delay);
            }
        }

        Some(outcome)
    }

    /// Process messages until none is ready. Returns how many were processed.
    pub async fn process_ready(&self) -> usize {
        let mut count = 0;
        while self.process_next().await.is_some() {
            count += 1;
        }
        count
    }

    /// Poll until cancelled.
    pub async fn run(self: Arc<Self>) {
        info!(queue = %self.queue_name, "Queue worker started");
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            self.process_ready().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!(queue = %self.queue_name, "Queue worker stopped");
    }

    /// Exponential backoff from the first retry, capped, with ±25% jitter.
    fn calculate_retry_delay(&self, attempts: u32) -> Duration {
        let base_delay = self.config.initial_retry_delay_ms;
        let max_delay = self.config.max_retry_delay_ms;

        let exponent = attempts.saturating_sub(1);
        let delay_ms = base_delay.saturating_mul(2u64.saturating_pow(exponent));
        let delay_ms = delay_ms.min(max_delay);

        let jitter_range = delay_ms / 4;
        let delay_ms = if jitter_range > 0 {
            let offset = rand::random::<u64>() % (jitter_range * 2 + 1);
            (delay_ms - jitter_range).saturating_add(offset)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }

    fn dead_letter(&self, message: QueuedMessage, reason: &str) {
        let id = self.next_dead_letter_id.fetch_add(1, Ordering::Relaxed);
        warn!(job_id = %message.id, reason, "Job moved to dead letters");
        self.dead_letters.insert(
            id,
            DeadLetterEntry {
                id,
                message,
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            },
        );
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<_> = self.dead_letters.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Drop dead letters older than the retention window. Returns how many were removed.
    pub fn cleanup_dead_letters(&self) -> usize {
        let retention = chrono::Duration::days(self.config.dead_letter_retention_days as i64);
        let cutoff = Utc::now() - retention;

        let before = self.dead_letters.len();
        self.dead_letters
            .retain(|_, entry| entry.dead_lettered_at > cutoff);
        before - self.dead_letters.len()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_letter_count: self.dead_letters.len(),
            pending_count: self.queue.len(&self.queue_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DEFAULT_QUEUE, JobQueue, SubmitOptions};
    use async_trait::async_trait;
    use serde_json::Map;

    struct Scripted {
        outcome: JobOutcome,
    }

    #[async_trait]
    impl Job for Scripted {
        fn job_type(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _message: &QueuedMessage) -> JobOutcome {
            self.outcome
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            max_attempts: 3,
            initial_retry_delay_ms: 0,
            max_retry_delay_ms: 0,
            ..Default::default()
        }
    }

    async fn worker_with(outcome: JobOutcome) -> QueueWorker {
        let queue = Arc::new(MemoryQueue::new());
        queue
            .submit("scripted", Map::new(), SubmitOptions::default())
            .await
            .unwrap();
        let worker = QueueWorker::new(queue, DEFAULT_QUEUE, config());
        worker.register_job(Arc::new(Scripted { outcome }));
        worker
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let worker = QueueWorker::new(
            Arc::new(MemoryQueue::new()),
            DEFAULT_QUEUE,
            WorkerConfig {
                initial_retry_delay_ms: 1000,
                max_retry_delay_ms: 4000,
                ..Default::default()
            },
        );

        let first = worker.calculate_retry_delay(1).as_millis();
        assert!((750..=1250).contains(&first));
        let third = worker.calculate_retry_delay(3).as_millis();
        assert!((3000..=5000).contains(&third));
        let tenth = worker.calculate_retry_delay(10).as_millis();
        assert!(tenth <= 5000);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let worker = worker_with(JobOutcome::Ack).await;
        assert_eq!(worker.process_ready().await, 1);

        let stats = worker.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.dead_letter_count, 0);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_immediately() {
        let worker = worker_with(JobOutcome::Reject).await;
        assert_eq!(worker.process_ready().await, 1);

        let dead = worker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "rejected");
        assert_eq!(dead[0].message.attempts, 1);
    }

    #[tokio::test]
    async fn test_requeue_until_max_attempts() {
        let worker = worker_with(JobOutcome::Requeue).await;
        assert_eq!(worker.process_ready().await, 3);

        let stats = worker.stats();
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.dead_letter_count, 1);
        assert_eq!(worker.dead_letters()[0].reason, "max attempts exceeded");
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_rejected() {
        let queue = Arc::new(MemoryQueue::new());
        queue
            .submit("mystery", Map::new(), SubmitOptions::default())
            .await
            .unwrap();
        let worker = QueueWorker::new(queue, DEFAULT_QUEUE, config());

        assert_eq!(worker.process_next().await, Some(JobOutcome::Reject));
        assert_eq!(worker.cleanup_dead_letters(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let worker = Arc::new(worker_with(JobOutcome::Ack).await);
        let token = worker.cancellation_token();
        let handle = tokio::spawn(Arc::clone(&worker).run());

        token.cancel();
        handle.await.unwrap();
        assert_eq!(worker.stats().acked, 1);
    }
}
