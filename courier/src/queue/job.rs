//! Queued job execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strum::Display;
use tracing::{debug, error};

use super::{QueuedMessage, SEND_QUEUED_NOTIFICATION};
use crate::codec::NotificationCodec;
use crate::notifiable::NotifiableResolver;
use crate::sender::Sender;

/// Argument names of a queued notification job.
pub mod args {
    pub const NOTIFIABLE_MODEL: &str = "notifiable_model";
    pub const NOTIFIABLE_KEY: &str = "notifiable_key";
    /// Base64 serialized notification.
    pub const NOTIFICATION: &str = "notification";
    pub const CHANNELS: &str = "channels";
}

/// What the queue should do with a message after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobOutcome {
    /// Done; remove the message.
    Ack,
    /// Will never succeed; do not retry.
    Reject,
    /// Retry later.
    Requeue,
}

/// Handler for one job type.
#[async_trait]
pub trait Job: Send + Sync {
    fn job_type(&self) -> &str;

    async fn execute(&self, message: &QueuedMessage) -> JobOutcome;
}

/// Delivers one queued notification to one notifiable.
pub struct SendQueuedNotificationJob {
    sender: Arc<dyn Sender>,
    resolver: Arc<dyn NotifiableResolver>,
    codec: Arc<NotificationCodec>,
}

impl SendQueuedNotificationJob {
    pub fn new(
        sender: Arc<dyn Sender>,
        resolver: Arc<dyn NotifiableResolver>,
        codec: Arc<NotificationCodec>,
    ) -> Self {
        Self {
            sender,
            resolver,
            codec,
        }
    }
}

fn non_empty_str<'a>(message: &'a QueuedMessage, name: &str) -> Option<&'a str> {
    message
        .argument(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

/// Keys may be serialized as numbers by other producers.
fn key_argument(message: &QueuedMessage) -> Option<String> {
    match message.argument(args::NOTIFIABLE_KEY)? {
        Value::String(key) if !key.is_empty() => Some(key.clone()),
        Value::Number(key) => Some(key.to_string()),
        _ => None,
    }
}

fn channels_argument(message: &QueuedMessage) -> Option<Vec<String>> {
    let channels: Vec<String> = message
        .argument(args::CHANNELS)?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    (!channels.is_empty()).then_some(channels)
}

#[async_trait]
impl Job for SendQueuedNotificationJob {
    fn job_type(&self) -> &str {
        SEND_QUEUED_NOTIFICATION
    }

    async fn execute(&self, message: &QueuedMessage) -> JobOutcome {
        let (Some(model), Some(key), Some(serialized)) = (
            non_empty_str(message, args::NOTIFIABLE_MODEL),
            key_argument(message),
            non_empty_str(message, args::NOTIFICATION),
        ) else {
            error!(job_id = %message.id, "Notification job received invalid arguments");
            return JobOutcome::Reject;
        };
        let channels = channels_argument(message);

        let envelope = match self.codec.deserialize_base64(serialized) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(job_id = %message.id, error = %e, "Invalid notification payload");
                return JobOutcome::Reject;
            }
        };

        let notifiable = match self.resolver.resolve(model, &key).await {
            Ok(notifiable) => notifiable,
            Err(e) => {
                error!(
                    job_id = %message.id,
                    model,
                    key = %key,
                    error = %e,
                    "Notification job failed to load notifiable"
                );
                return JobOutcome::Requeue;
            }
        };

        match self
            .sender
            .send_now(notifiable.into(), envelope.clone(), channels.clone())
            .await
        {
            Ok(()) => {
                debug!(job_id = %message.id, "Queued notification delivered");
                JobOutcome::Ack
            }
            Err(e) => {
                error!(
                    job_id = %message.id,
                    notification = envelope.type_name(),
                    channels = ?channels,
                    error = %e,
                    "Notification job failed"
                );
                JobOutcome::Requeue
            }
        }
    }
}
