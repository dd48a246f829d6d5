//! Notification dispatch.
//!
//! [`NotificationSender`] fans one notification out to each notifiable, in
//! input order, and to each of that notifiable's channels, in order. Nothing
//! here runs concurrently; event observers see a deterministic sequence.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info};

use crate::codec::NotificationCodec;
use crate::events::{DispatchEvent, EventBus};
use crate::locale;
use crate::notifiable::{Notifiable, Recipients};
use crate::notification::{Envelope, NotificationId};
use crate::queue::{JobQueue, SEND_QUEUED_NOTIFICATION, SubmitOptions, args};
use crate::registry::ChannelRegistry;
use crate::{Error, Result};

/// Something that can dispatch notifications.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Dispatch, queueing the work if the notification asks for it.
    async fn send(&self, recipients: Recipients, envelope: Envelope) -> Result<()>;

    /// Dispatch immediately. A non-empty `channels` overrides `via()`.
    async fn send_now(
        &self,
        recipients: Recipients,
        envelope: Envelope,
        channels: Option<Vec<String>>,
    ) -> Result<()>;
}

/// The production sender.
pub struct NotificationSender {
    registry: Arc<ChannelRegistry>,
    events: Arc<EventBus>,
    codec: Arc<NotificationCodec>,
    queue: Option<Arc<dyn JobQueue>>,
    locale: Option<String>,
}

impl NotificationSender {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        events: Arc<EventBus>,
        codec: Arc<NotificationCodec>,
    ) -> Self {
        Self {
            registry,
            events,
            codec,
            queue: None,
            locale: None,
        }
    }

    /// Queue used for notifications that ask to be queued.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Locale used when the notification does not set one.
    pub fn with_locale(mut self, locale: Option<String>) -> Self {
        self.locale = locale;
        self
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// Notification locale, then sender locale, then the notifiable's preference.
    fn resolve_locale(&self, envelope: &Envelope, notifiable: &Notifiable) -> Option<String> {
        envelope
            .locale()
            .map(str::to_string)
            .or_else(|| self.locale.clone())
            .or_else(|| notifiable.preferred_locale())
    }

    async fn send_to_notifiable(
        &self,
        notifiable: &Notifiable,
        envelope: &Envelope,
        pinned: Option<&NotificationId>,
        channels: Option<&[String]>,
    ) -> Result<()> {
        let channels = match channels {
            Some(channels) if !channels.is_empty() => channels.to_vec(),
            _ => envelope.notification().via(notifiable),
        };
        if channels.is_empty() {
            debug!(notifiable = %notifiable.label(), "No channels; skipping notifiable");
            return Ok(());
        }

        let locale = self.resolve_locale(envelope, notifiable);
        let id = pinned.cloned().unwrap_or_else(NotificationId::generate);
        let mut envelope = envelope.with_id(id);
        if let Some(locale) = &locale {
            envelope = envelope.with_locale(locale.clone());
        }

        locale::scope(locale, async {
            for channel in &channels {
                self.deliver(notifiable, &envelope, channel).await?;
            }
            Ok::<(), Error>(())
        })
        .await
    }

    async fn deliver(&self, notifiable: &Notifiable, envelope: &Envelope, channel: &str) -> Result<()> {
        let envelope = envelope.clone();

        let sending = self
            .events
            .dispatch(DispatchEvent::sending(notifiable, &envelope, channel));
        if sending.is_stopped() || !envelope.notification().should_send(notifiable, channel) {
            debug!(
                notifiable = %notifiable.label(),
                channel,
                "Delivery skipped"
            );
            return Ok(());
        }

        let result = async {
            let instance = self.registry.resolve(channel)?;
            instance.send(notifiable, &envelope).await
        }
        .await;

        match result {
            Ok(Some(response)) => {
                self.events.dispatch(DispatchEvent::sent(
                    notifiable, &envelope, channel, response,
                ));
                debug!(notifiable = %notifiable.label(), channel, "Notification sent");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!(
                    notifiable = %notifiable.label(),
                    channel,
                    notification = envelope.type_name(),
                    error = %e,
                    "Notification delivery failed"
                );
                self.events.dispatch(DispatchEvent::failed(
                    notifiable,
                    &envelope,
                    channel,
                    e.to_string(),
                ));
                Err(e)
            }
        }
    }

    /// One job per entity notifiable and channel.
    async fn queue_notification(&self, recipients: Recipients, envelope: Envelope) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| Error::config("No job queue configured for queued notifications"))?;
        let options = submit_options(&envelope);
        let pinned = pinned_id(&recipients, &envelope);

        for notifiable in recipients {
            let Some(entity) = notifiable.as_entity() else {
                debug!("Anonymous notifiable cannot be queued; skipping");
                continue;
            };

            let channels = envelope.notification().via(&notifiable);
            if channels.is_empty() {
                continue;
            }

            let id = pinned.clone().unwrap_or_else(NotificationId::generate);
            let locale = self.resolve_locale(&envelope, &notifiable);

            for channel in channels {
                let mut job = envelope.with_id(id.clone());
                if let Some(locale) = &locale {
                    job = job.with_locale(locale.clone());
                }

                let mut arguments = Map::new();
                arguments.insert(args::NOTIFIABLE_MODEL.to_string(), json!(entity.model()));
                arguments.insert(args::NOTIFIABLE_KEY.to_string(), json!(entity.key()));
                arguments.insert(
                    args::NOTIFICATION.to_string(),
                    Value::String(self.codec.serialize_base64(&job)?),
                );
                arguments.insert(args::CHANNELS.to_string(), json!([channel]));

                let job_id = queue
                    .submit(SEND_QUEUED_NOTIFICATION, arguments, options.clone())
                    .await?;
                info!(
                    job_id = %job_id,
                    notifiable = %notifiable.label(),
                    channel = %channel,
                    "Notification queued"
                );
            }
        }
        Ok(())
    }
}

/// A pinned id identifies one delivery, so it only applies to a single recipient.
fn pinned_id(recipients: &Recipients, envelope: &Envelope) -> Option<NotificationId> {
    let id = envelope.id()?;
    if recipients.len() > 1 {
        debug!(id = %id, "Pinned id ignored for multiple recipients");
        return None;
    }
    Some(id.clone())
}

/// Envelope settings win over the notification's queueing defaults.
pub(crate) fn submit_options(envelope: &Envelope) -> SubmitOptions {
    let defaults = envelope.notification().should_queue();
    SubmitOptions {
        queue: envelope
            .queue()
            .map(str::to_string)
            .or_else(|| defaults.and_then(|d| d.queue())),
        connection: envelope
            .connection()
            .map(str::to_string)
            .or_else(|| defaults.and_then(|d| d.connection())),
        delay: envelope.delay().or_else(|| defaults.and_then(|d| d.delay())),
    }
}

#[async_trait]
impl Sender for NotificationSender {
    async fn send(&self, recipients: Recipients, envelope: Envelope) -> Result<()> {
        if envelope.is_queueable() {
            return self.queue_notification(recipients, envelope).await;
        }
        self.send_now(recipients, envelope, None).await
    }

    async fn send_now(
        &self,
        recipients: Recipients,
        envelope: Envelope,
        channels: Option<Vec<String>>,
    ) -> Result<()> {
        let pinned = pinned_id(&recipients, &envelope);
        for notifiable in recipients {
            self.send_to_notifiable(&notifiable, &envelope, pinned.as_ref(), channels.as_deref())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Channel, ChannelContext, ChannelSettings};
    use crate::notifiable::EntityRecord;
    use crate::notification::{Notification, ShouldQueue};
    use crate::queue::MemoryQueue;
    use crate::registry::ChannelFactory;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Option<String>, String)>>,
    }

    struct RecordingChannel {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn send(&self, notifiable: &Notifiable, envelope: &Envelope) -> Result<Option<Value>> {
            self.recorder.seen.lock().push((
                notifiable.label(),
                envelope.id().map(|id| id.to_string()),
                locale::current(),
            ));
            Ok(Some(json!({"ok": true})))
        }
    }

    struct Digest;

    impl Notification for Digest {
        fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
            vec!["log".to_string(), "log2".to_string()]
        }
    }

    struct QueuedDigest;

    impl Notification for QueuedDigest {
        fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
            vec!["log".to_string()]
        }

        fn should_queue(&self) -> Option<&dyn ShouldQueue> {
            Some(self)
        }
    }

    impl ShouldQueue for QueuedDigest {
        fn queue(&self) -> Option<String> {
            Some("digests".to_string())
        }

        fn delay(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }
    }

    fn sender(recorder: &Arc<Recorder>) -> NotificationSender {
        let registry = Arc::new(ChannelRegistry::default());
        for name in ["log", "log2"] {
            let recorder = Arc::clone(recorder);
            let factory: ChannelFactory = Arc::new(move |_: &ChannelContext, _: &ChannelSettings| {
                let channel: Arc<dyn Channel> = Arc::new(RecordingChannel {
                    recorder: Arc::clone(&recorder),
                });
                Ok(channel)
            });
            registry.register(name, factory, ChannelSettings::new()).unwrap();
        }
        NotificationSender::new(
            registry,
            Arc::new(EventBus::default()),
            Arc::new(NotificationCodec::new()),
        )
    }

    #[tokio::test]
    async fn test_identity_shared_per_notifiable() {
        let recorder = Arc::new(Recorder::default());
        let sender = sender(&recorder);
        let recipients: Recipients = vec![
            Notifiable::from(EntityRecord::new("Users", "1")),
            Notifiable::from(EntityRecord::new("Users", "2")),
        ]
        .into();

        sender.send_now(recipients, Envelope::new(Digest), None).await.unwrap();

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].0, "Users:1");
        assert_eq!(seen[0].1, seen[1].1);
        assert_eq!(seen[2].1, seen[3].1);
        assert_ne!(seen[0].1, seen[2].1);
    }

    #[tokio::test]
    async fn test_locale_precedence() {
        let recorder = Arc::new(Recorder::default());
        let user = Notifiable::from(EntityRecord::new("Users", "1").field("locale", "ja"));

        let plain = sender(&recorder);
        plain
            .send_now(user.clone().into(), Envelope::new(Digest), Some(vec!["log".to_string()]))
            .await
            .unwrap();

        let bound = sender(&recorder).with_locale(Some("de".to_string()));
        bound
            .send_now(user.clone().into(), Envelope::new(Digest), Some(vec!["log".to_string()]))
            .await
            .unwrap();
        bound
            .send_now(
                user.into(),
                Envelope::new(Digest).with_locale("fr"),
                Some(vec!["log".to_string()]),
            )
            .await
            .unwrap();

        let locales: Vec<_> = recorder.seen.lock().iter().map(|s| s.2.clone()).collect();
        assert_eq!(locales, vec!["ja", "de", "fr"]);
        assert_eq!(locale::current(), locale::default_locale());
    }

    #[tokio::test]
    async fn test_pinned_id_is_reused() {
        let recorder = Arc::new(Recorder::default());
        let sender = sender(&recorder);
        let user = Notifiable::from(EntityRecord::new("Users", "1"));

        sender
            .send_now(user.into(), Envelope::new(Digest).with_id("fixed"), None)
            .await
            .unwrap();

        let seen = recorder.seen.lock().clone();
        assert!(seen.iter().all(|s| s.1.as_deref() == Some("fixed")));
    }

    #[tokio::test]
    async fn test_pinned_id_ignored_for_several_recipients() {
        let recorder = Arc::new(Recorder::default());
        let sender = sender(&recorder);
        let recipients: Recipients = vec![
            Notifiable::from(EntityRecord::new("Users", "1")),
            Notifiable::from(EntityRecord::new("Users", "2")),
        ]
        .into();

        sender
            .send_now(recipients, Envelope::new(Digest).with_id("fixed"), None)
            .await
            .unwrap();

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|s| s.1.as_deref() != Some("fixed")));
        assert_eq!(seen[0].1, seen[1].1);
        assert_ne!(seen[1].1, seen[2].1);
    }

    #[tokio::test]
    async fn test_queue_without_queue_configured_fails() {
        let recorder = Arc::new(Recorder::default());
        let sender = sender(&recorder);
        let user = Notifiable::from(EntityRecord::new("Users", "1"));

        let err = sender.send(user.into(), Envelope::new(QueuedDigest)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_submit_options_from_capability_and_envelope() {
        let envelope = Envelope::new(QueuedDigest);
        let options = submit_options(&envelope);
        assert_eq!(options.queue.as_deref(), Some("digests"));
        assert_eq!(options.delay, Some(Duration::from_secs(5)));
        assert!(options.connection.is_none());

        let options = submit_options(&envelope.on_queue("urgent").on_connection("redis"));
        assert_eq!(options.queue.as_deref(), Some("urgent"));
        assert_eq!(options.connection.as_deref(), Some("redis"));

        let options = submit_options(&Envelope::new(Digest));
        assert_eq!(options, SubmitOptions::default());
    }

    #[tokio::test]
    async fn test_queue_path_skips_anonymous() {
        let queue = Arc::new(MemoryQueue::new());
        let sender = NotificationSender::new(
            Arc::new(ChannelRegistry::default()),
            Arc::new(EventBus::default()),
            Arc::new(NotificationCodec::new()),
        )
        .with_queue(queue.clone());

        let anonymous = crate::notifiable::AnonymousNotifiable::new()
            .route("log", "somewhere")
            .unwrap();
        sender
            .send(anonymous.into(), Envelope::new(QueuedDigest))
            .await
            .unwrap();
        assert!(queue.submissions().is_empty());
    }
}
