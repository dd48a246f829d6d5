//! Background delivery.
//!
//! Queued notifications are submitted to a [`JobQueue`] as one job per
//! notifiable and channel. [`MemoryQueue`] is the in-process adapter, and
//! [`QueueWorker`] consumes it, retrying with backoff and dead-lettering
//! jobs that cannot succeed.

mod job;
mod worker;

pub use job::{Job, JobOutcome, SendQueuedNotificationJob, args};
pub use worker::{DeadLetterEntry, QueueWorker, WorkerStats};

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// Job type of a queued notification delivery.
pub const SEND_QUEUED_NOTIFICATION: &str = "send_queued_notification";

/// Queue used when a submission names none.
pub const DEFAULT_QUEUE: &str = "default";

/// Where and when a job should run. Unset fields use the queue's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub queue: Option<String>,
    pub connection: Option<String>,
    pub delay: Option<Duration>,
}

/// A job waiting in, or taken from, a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub job_type: String,
    pub arguments: Map<String, Value>,
    pub queue: String,
    pub connection: Option<String>,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }
}

/// External job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job; returns the job id.
    async fn submit(
        &self,
        job_type: &str,
        arguments: Map<String, Value>,
        options: SubmitOptions,
    ) -> Result<String>;
}

/// In-process named queues with delayed availability.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<QueuedMessage>>>,
    submissions: Mutex<Vec<QueuedMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the first message of `queue` whose availability time has passed.
    pub fn pop_ready(&self, queue: &str) -> Option<QueuedMessage> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let messages = queues.get_mut(queue)?;
        let index = messages.iter().position(|m| m.is_available(now))?;
        messages.remove(index)
    }

    /// Put a message back, available after `delay`.
    pub fn requeue(&self, mut message: QueuedMessage, delay: Duration) {
        message.available_at = available_after(Utc::now(), delay);
        self.queues
            .lock()
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
    }

    /// Messages currently waiting in `queue`, ready or not.
    pub fn len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(VecDeque::is_empty)
    }

    /// Snapshot of waiting messages in `queue`.
    pub fn pending(&self, queue: &str) -> Vec<QueuedMessage> {
        self.queues
            .lock()
            .get(queue)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every submission ever made, in order.
    pub fn submissions(&self) -> Vec<QueuedMessage> {
        self.submissions.lock().clone()
    }

    pub fn clear_submissions(&self) {
        self.submissions.lock().clear();
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(
        &self,
        job_type: &str,
        arguments: Map<String, Value>,
        options: SubmitOptions,
    ) -> Result<String> {
        let now = Utc::now();
        let message = QueuedMessage {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            arguments,
            queue: options.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            connection: options.connection,
            attempts: 0,
            available_at: available_after(now, options.delay.unwrap_or_default()),
            enqueued_at: now,
        };
        debug!(id = %message.id, job_type, queue = %message.queue, "Job submitted");

        self.submissions.lock().push(message.clone());
        let id = message.id.clone();
        self.queues
            .lock()
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
        Ok(id)
    }
}

fn available_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arguments() -> Map<String, Value> {
        match json!({"answer": 42}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_submit_routes_to_named_queue() {
        let queue = MemoryQueue::new();
        queue
            .submit("ping", arguments(), SubmitOptions::default())
            .await
            .unwrap();
        queue
            .submit(
                "ping",
                arguments(),
                SubmitOptions {
                    queue: Some("mail".to_string()),
                    connection: Some("redis".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(queue.len(DEFAULT_QUEUE), 1);
        assert_eq!(queue.len("mail"), 1);
        assert_eq!(queue.submissions().len(), 2);

        let message = queue.pop_ready("mail").unwrap();
        assert_eq!(message.connection.as_deref(), Some("redis"));
        assert_eq!(message.argument("answer"), Some(&json!(42)));
        assert!(queue.pop_ready("mail").is_none());
    }

    #[tokio::test]
    async fn test_delayed_messages_are_not_ready() {
        let queue = MemoryQueue::new();
        queue
            .submit(
                "ping",
                arguments(),
                SubmitOptions {
                    delay: Some(Duration::from_secs(3600)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(queue.pop_ready(DEFAULT_QUEUE).is_none());
        assert_eq!(queue.len(DEFAULT_QUEUE), 1);
        assert!(!queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_without_delay_is_ready() {
        let queue = MemoryQueue::new();
        queue
            .submit("ping", arguments(), SubmitOptions::default())
            .await
            .unwrap();

        let mut message = queue.pop_ready(DEFAULT_QUEUE).unwrap();
        message.attempts += 1;
        queue.requeue(message, Duration::ZERO);

        let again = queue.pop_ready(DEFAULT_QUEUE).unwrap();
        assert_eq!(again.attempts, 1);
    }
}
