//! Delivery channels.
//!
//! This module provides the channel contract and the built-in channels:
//! - Database records
//! - Email through a pluggable transport
//! - Generic webhooks (HTTP POST/PUT)

mod database;
mod mail;
mod webhook;

pub use database::DatabaseChannel;
pub use mail::{LogTransport, MailChannel, MailSettings, MailTransport, OutgoingMail};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookSettings};

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::database::{MemoryNotificationRepository, NotificationRepository};
use crate::notifiable::Notifiable;
use crate::notification::Envelope;
use crate::{Error, Result};

/// Free-form channel options, as configured.
pub type ChannelSettings = Map<String, Value>;

/// A delivery mechanism for one notification to one notifiable.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Deliver the notification.
    ///
    /// `Ok(None)` means the channel had nothing to deliver; no `sent`
    /// event is emitted for it.
    async fn send(&self, notifiable: &Notifiable, envelope: &Envelope) -> Result<Option<Value>>;
}

/// A channel type that can be constructed from configuration.
pub trait ChannelKind: Channel + Sized + 'static {
    fn build(context: &ChannelContext, settings: &ChannelSettings) -> Result<Self>;

    /// Canonical registration name, e.g. `WebhookChannel` -> `webhook`.
    fn kind_name() -> String {
        canonical_name(std::any::type_name::<Self>())
    }
}

/// Shared collaborators handed to channel constructors.
#[derive(Clone)]
pub struct ChannelContext {
    pub records: Arc<dyn NotificationRepository>,
    pub mailer: Arc<dyn MailTransport>,
    pub http: reqwest::Client,
}

impl ChannelContext {
    pub fn new(records: Arc<dyn NotificationRepository>, mailer: Arc<dyn MailTransport>) -> Self {
        Self {
            records,
            mailer,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self::new(
            Arc::new(MemoryNotificationRepository::new()),
            Arc::new(LogTransport),
        )
    }
}

/// Strip the module path, generic arguments and a trailing `Channel`, then lowercase.
pub fn canonical_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let short = base.rsplit("::").next().unwrap_or(base);
    let short = short.strip_suffix("Channel").unwrap_or(short);
    let short = if short.is_empty() { "channel" } else { short };
    short.to_lowercase()
}

/// Deserialize typed settings from the free-form map.
pub fn parse_settings<T: DeserializeOwned>(channel: &str, settings: &ChannelSettings) -> Result<T> {
    serde_json::from_value(Value::Object(settings.clone()))
        .map_err(|e| Error::config(format!("Invalid settings for channel '{}': {}", channel, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("courier::channels::WebhookChannel"), "webhook");
        assert_eq!(canonical_name("app::SmsChannel<Twilio>"), "sms");
        assert_eq!(canonical_name("Slack"), "slack");
        assert_eq!(canonical_name("app::Channel"), "channel");
    }

    #[test]
    fn test_kind_names_of_built_ins() {
        assert_eq!(DatabaseChannel::kind_name(), "database");
        assert_eq!(MailChannel::kind_name(), "mail");
        assert_eq!(WebhookChannel::kind_name(), "webhook");
    }

    #[test]
    fn test_parse_settings_reports_channel() {
        let mut settings = ChannelSettings::new();
        settings.insert("timeout_secs".to_string(), Value::String("soon".to_string()));
        let err = parse_settings::<WebhookSettings>("webhook", &settings).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("webhook"));
    }
}
