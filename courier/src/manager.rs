//! Entry point tying the registry, sender and event bus together.
//!
//! The manager owns its collaborators; there is no process-global instance.
//! The bound [`Sender`] can be swapped for a [`CapturingSender`] in tests,
//! either explicitly or through the guard returned by [`NotificationManager::fake`].

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::channels::{Channel, ChannelContext, ChannelKind, ChannelSettings, canonical_name};
use crate::codec::NotificationCodec;
use crate::config::{ChannelConfig, CourierConfig};
use crate::events::EventBus;
use crate::locale;
use crate::notifiable::{AnonymousNotifiable, NotifiableResolver, Recipients};
use crate::notification::{Envelope, Notification};
use crate::queue::{JobQueue, SendQueuedNotificationJob};
use crate::registry::{ChannelProvider, ChannelRegistry, factory_of};
use crate::sender::{NotificationSender, Sender};
use crate::testing::CapturingSender;
use crate::{Error, Result};

/// Channel kinds that may be configured without a class.
const DEFAULT_CLASSES: [&str; 2] = ["database", "mail"];

pub struct NotificationManager {
    registry: Arc<ChannelRegistry>,
    events: Arc<EventBus>,
    codec: Arc<NotificationCodec>,
    queue: Option<Arc<dyn JobQueue>>,
    locale: RwLock<Option<String>>,
    bound: RwLock<Option<Arc<dyn Sender>>>,
}

impl NotificationManager {
    pub fn new(context: ChannelContext) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new(context)),
            events: Arc::new(EventBus::default()),
            codec: Arc::new(NotificationCodec::new()),
            queue: None,
            locale: RwLock::new(None),
            bound: RwLock::new(None),
        }
    }

    /// Build a manager and apply the channel section of `config`.
    ///
    /// Also replaces the process-wide default locale.
    pub fn from_config(config: &CourierConfig, context: ChannelContext) -> Result<Self> {
        locale::set_default_locale(config.default_locale.clone());
        let manager = Self::new(context).with_events(Arc::new(EventBus::new(config.event_capacity)));
        manager.set_locale(config.locale.clone());
        for (name, channel) in &config.channels {
            manager.set_config(name, channel.clone())?;
        }
        info!(
            channels = config.channels.len(),
            locale = ?config.locale,
            "Notification manager configured"
        );
        Ok(manager)
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn codec(&self) -> &Arc<NotificationCodec> {
        &self.codec
    }

    /// Make `N` transportable through the queue.
    pub fn register_notification<N>(&self)
    where
        N: Notification + Serialize + DeserializeOwned + Default,
    {
        self.codec.register::<N>();
    }

    /// Add a discovery participant to the registry.
    pub fn add_provider(&self, provider: Arc<dyn ChannelProvider>) {
        self.registry.add_provider(provider);
    }

    /// Store configuration for channel `name`, built on first use.
    ///
    /// `database` and `mail` default to their built-in kinds when no class is given.
    pub fn set_config(&self, name: &str, config: ChannelConfig) -> Result<()> {
        let class = match config.class {
            Some(class) => class,
            None if DEFAULT_CLASSES.contains(&name) => name.to_string(),
            None => {
                return Err(Error::config(format!(
                    "Channel '{}' is configured without a class",
                    name
                )));
            }
        };
        self.registry.register_class(name, &class, config.settings)
    }

    /// Names with explicit configuration.
    pub fn configured(&self) -> Vec<String> {
        self.registry.configured()
    }

    /// Resolve a channel by configured name or by channel kind.
    ///
    /// A kind that is not configured yet is registered under its canonical
    /// name with empty settings.
    pub fn channel(&self, name: &str) -> Result<Arc<dyn Channel>> {
        if self.registry.has(name) {
            return self.registry.resolve(name);
        }
        if let Some(factory) = self.registry.kind(name) {
            let canonical = canonical_name(name);
            if !self.registry.has(&canonical) {
                self.registry
                    .register(canonical.clone(), factory, ChannelSettings::new())?;
            }
            return self.registry.resolve(&canonical);
        }
        self.registry.resolve(name)
    }

    /// Resolve the channel of kind `C`, registering the kind if needed.
    pub fn channel_of<C: ChannelKind>(&self) -> Result<Arc<dyn Channel>> {
        let name = C::kind_name();
        if self.registry.kind(&name).is_none() {
            self.registry.register_kind::<C>();
        }
        if !self.registry.has(&name) {
            self.registry
                .register(name.clone(), factory_of::<C>(), ChannelSettings::new())?;
        }
        self.registry.resolve(&name)
    }

    /// Locale bound on the production sender.
    pub fn set_locale(&self, locale: Option<String>) {
        *self.locale.write() = locale;
    }

    pub fn locale(&self) -> Option<String> {
        self.locale.read().clone()
    }

    /// Replace the sender servicing `send` and `send_now`.
    pub fn configure_sender(&self, sender: Arc<dyn Sender>) {
        debug!("Custom sender bound");
        *self.bound.write() = Some(sender);
    }

    /// Return to the production sender.
    pub fn reset_sender(&self) {
        *self.bound.write() = None;
    }

    /// The sender currently servicing dispatch.
    pub fn sender(&self) -> Arc<dyn Sender> {
        if let Some(sender) = self.bound.read().as_ref() {
            return Arc::clone(sender);
        }
        Arc::new(self.production_sender())
    }

    fn production_sender(&self) -> NotificationSender {
        let sender = NotificationSender::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.codec),
        )
        .with_locale(self.locale());
        match &self.queue {
            Some(queue) => sender.with_queue(Arc::clone(queue)),
            None => sender,
        }
    }

    /// Bind a fresh [`CapturingSender`] until the guard is dropped.
    pub fn fake(&self) -> FakeGuard<'_> {
        let sender = Arc::new(CapturingSender::new());
        self.configure_sender(sender.clone());
        FakeGuard {
            manager: self,
            sender,
        }
    }

    /// Dispatch, queueing if the notification asks for it.
    pub async fn send<R, E>(&self, recipients: R, notification: E) -> Result<()>
    where
        R: Into<Recipients>,
        E: Into<Envelope>,
    {
        self.sender()
            .send(recipients.into(), notification.into())
            .await
    }

    /// Dispatch immediately on the notification's own channels.
    pub async fn send_now<R, E>(&self, recipients: R, notification: E) -> Result<()>
    where
        R: Into<Recipients>,
        E: Into<Envelope>,
    {
        self.sender()
            .send_now(recipients.into(), notification.into(), None)
            .await
    }

    /// Dispatch immediately on `channels` instead of `via()`.
    pub async fn send_now_via<R, E, I, S>(&self, recipients: R, notification: E, channels: I) -> Result<()>
    where
        R: Into<Recipients>,
        E: Into<Envelope>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = channels.into_iter().map(Into::into).collect();
        self.sender()
            .send_now(recipients.into(), notification.into(), Some(channels))
            .await
    }

    /// Anonymous target routed on one channel.
    pub fn route(&self, channel: &str, route: impl Into<Value>) -> Result<AnonymousNotifiable> {
        AnonymousNotifiable::new().route(channel, route)
    }

    /// Anonymous target routed on several channels.
    pub fn routes<I, K, V>(&self, routes: I) -> Result<AnonymousNotifiable>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        routes
            .into_iter()
            .try_fold(AnonymousNotifiable::new(), |target, (channel, route)| {
                target.route(channel, route)
            })
    }

    /// Consumer-side job delivering through the production sender.
    pub fn queued_job(&self, resolver: Arc<dyn NotifiableResolver>) -> SendQueuedNotificationJob {
        SendQueuedNotificationJob::new(
            Arc::new(self.production_sender()),
            resolver,
            Arc::clone(&self.codec),
        )
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(ChannelContext::default())
    }
}

/// Keeps a [`CapturingSender`] bound; restores the production sender on drop.
pub struct FakeGuard<'a> {
    manager: &'a NotificationManager,
    sender: Arc<CapturingSender>,
}

impl FakeGuard<'_> {
    pub fn sender(&self) -> &Arc<CapturingSender> {
        &self.sender
    }
}

impl Deref for FakeGuard<'_> {
    type Target = CapturingSender;

    fn deref(&self) -> &Self::Target {
        &self.sender
    }
}

impl Drop for FakeGuard<'_> {
    fn drop(&mut self) {
        self.manager.reset_sender();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::WebhookChannel;
    use crate::notifiable::{EntityRecord, Notifiable};
    use serde_json::json;

    struct Hello;

    impl Notification for Hello {
        fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
            vec!["database".to_string()]
        }
    }

    #[test]
    fn test_set_config_defaults_builtin_classes() {
        let manager = NotificationManager::default();
        manager.set_config("database", ChannelConfig::new()).unwrap();
        manager
            .set_config("alerts", ChannelConfig::new().class("mail"))
            .unwrap();

        let err = manager.set_config("sms", ChannelConfig::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(manager.configured(), vec!["alerts", "database"]);
    }

    #[test]
    fn test_channel_by_kind_registers_canonical_name() {
        let manager = NotificationManager::default();

        let by_path = manager.channel("courier::channels::WebhookChannel").unwrap();
        assert!(manager.registry().is_loaded("webhook"));

        let by_type = manager.channel_of::<WebhookChannel>().unwrap();
        assert!(Arc::ptr_eq(&by_path, &by_type));

        let err = manager.channel("nowhere").err().unwrap();
        assert!(matches!(err, Error::ChannelNotConfigured { .. }));
    }

    #[test]
    fn test_routes_reject_database() {
        let manager = NotificationManager::default();
        let target = manager
            .routes([("mail", json!("a@example.test")), ("webhook", json!("https://x.test"))])
            .unwrap();
        assert_eq!(target.routes().len(), 2);

        assert!(manager.route("database", "x").is_err());
        assert!(manager.routes([("mail", "a"), ("database", "b")]).is_err());
    }

    #[tokio::test]
    async fn test_fake_guard_resets_on_drop() {
        let manager = NotificationManager::default();
        let user = EntityRecord::new("Users", "1");

        {
            let fake = manager.fake();
            manager.send(user.clone(), Hello).await.unwrap();
            fake.assert_sent_times::<Hello>(1);
        }

        manager.send_now(user, Hello).await.unwrap();
        assert!(manager.bound.read().is_none());
    }
}
