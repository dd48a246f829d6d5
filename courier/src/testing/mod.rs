//! Test doubles.
//!
//! [`CapturingSender`] records dispatches instead of delivering them and
//! offers assertion helpers over what was recorded. Bind it with
//! [`NotificationManager::fake`](crate::NotificationManager::fake).
//! [`MemoryTransport`] collects outgoing mail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};

use crate::Result;
use crate::channels::{MailTransport, OutgoingMail};
use crate::notifiable::{Notifiable, Recipients};
use crate::notification::{Envelope, Notification};
use crate::sender::Sender;

/// Mail transport that keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<Value> {
        let mut sent = self.sent.lock();
        sent.push(mail.clone());
        Ok(json!({ "transport": "memory", "to": mail.to, "index": sent.len() - 1 }))
    }
}

/// One recorded dispatch of a notification to one notifiable.
#[derive(Debug, Clone)]
pub struct CapturedNotification {
    pub notifiable: Notifiable,
    /// `None` for anonymous targets.
    pub notifiable_key: Option<String>,
    pub notification: Envelope,
    pub notification_type: String,
    pub channels: Vec<String>,
    pub locale: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Whether the notification would have gone through the queue.
    pub queued: bool,
}

impl CapturedNotification {
    pub fn is<N: Notification>(&self) -> bool {
        self.notification.downcast_ref::<N>().is_some()
    }

    pub fn is_on_demand(&self) -> bool {
        self.notifiable.is_anonymous()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

fn same_notifiable(a: &Notifiable, b: &Notifiable) -> bool {
    match (a, b) {
        (Notifiable::Entity(a), Notifiable::Entity(b)) => a.model() == b.model() && a.key() == b.key(),
        (Notifiable::Anonymous(a), Notifiable::Anonymous(b)) => a == b,
        _ => false,
    }
}

/// Returns true when every key of `expected` is present in `actual` with an
/// equal value, recursing into objects.
fn contains_subset(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected.iter().all(|(key, value)| {
            actual
                .get(key)
                .is_some_and(|found| contains_subset(found, value))
        }),
        (actual, expected) => actual == expected,
    }
}

/// Sender that records instead of delivering.
#[derive(Debug, Default)]
pub struct CapturingSender {
    captured: RwLock<Vec<CapturedNotification>>,
}

impl CapturingSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, recipients: Recipients, envelope: &Envelope, channels: Option<&[String]>, queued: bool) {
        let mut captured = self.captured.write();
        for notifiable in recipients {
            let channels = match channels {
                Some(channels) if !channels.is_empty() => channels.to_vec(),
                _ => envelope.notification().via(&notifiable),
            };
            if channels.is_empty() {
                continue;
            }

            let locale = envelope
                .locale()
                .map(str::to_string)
                .or_else(|| notifiable.preferred_locale());
            captured.push(CapturedNotification {
                notifiable_key: notifiable.key(),
                notifiable,
                notification: envelope.clone(),
                notification_type: envelope.type_name().to_string(),
                channels,
                locale,
                timestamp: Utc::now(),
                queued,
            });
        }
    }

    // Queries

    pub fn all(&self) -> Vec<CapturedNotification> {
        self.captured.read().clone()
    }

    fn filtered<F>(&self, predicate: F) -> Vec<CapturedNotification>
    where
        F: Fn(&CapturedNotification) -> bool,
    {
        self.captured
            .read()
            .iter()
            .filter(|c| predicate(c))
            .cloned()
            .collect()
    }

    /// Captures of notification type `N`.
    pub fn of<N: Notification>(&self) -> Vec<CapturedNotification> {
        self.filtered(|c| c.is::<N>())
    }

    /// Captures whose type identifier equals `type_name`.
    pub fn of_type(&self, type_name: &str) -> Vec<CapturedNotification> {
        self.filtered(|c| c.notification_type == type_name)
    }

    /// Captures of `N` sent to `notifiable`.
    pub fn for_notifiable<N: Notification>(&self, notifiable: &Notifiable) -> Vec<CapturedNotification> {
        self.filtered(|c| c.is::<N>() && same_notifiable(&c.notifiable, notifiable))
    }

    pub fn on_channel(&self, channel: &str) -> Vec<CapturedNotification> {
        self.filtered(|c| c.has_channel(channel))
    }

    /// Captures sent to anonymous targets.
    pub fn on_demand(&self) -> Vec<CapturedNotification> {
        self.filtered(CapturedNotification::is_on_demand)
    }

    pub fn len(&self) -> usize {
        self.captured.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.captured.read().is_empty()
    }

    pub fn clear(&self) {
        self.captured.write().clear();
    }

    // Assertions

    pub fn assert_sent<N: Notification>(&self) {
        assert!(
            !self.of::<N>().is_empty(),
            "expected {} to be sent",
            std::any::type_name::<N>()
        );
    }

    /// The capture at `index` (in dispatch order) is an `N`.
    pub fn assert_sent_at<N: Notification>(&self, index: usize) {
        let captured = self.all();
        let Some(entry) = captured.get(index) else {
            panic!(
                "expected a notification at index {}, only {} captured",
                index,
                captured.len()
            );
        };
        assert!(
            entry.is::<N>(),
            "expected {} at index {}, found {}",
            std::any::type_name::<N>(),
            index,
            entry.notification_type
        );
    }

    pub fn assert_not_sent<N: Notification>(&self) {
        let count = self.of::<N>().len();
        assert!(
            count == 0,
            "expected {} not to be sent, it was sent {} time(s)",
            std::any::type_name::<N>(),
            count
        );
    }

    pub fn assert_nothing_sent(&self) {
        let count = self.len();
        assert!(count == 0, "expected no notifications, {} captured", count);
    }

    /// Total captures across all notification types.
    pub fn assert_count(&self, expected: usize) {
        let count = self.len();
        assert_eq!(count, expected, "expected {} notification(s), {} captured", expected, count);
    }

    pub fn assert_sent_to<N: Notification>(&self, notifiable: &Notifiable) {
        assert!(
            !self.for_notifiable::<N>(notifiable).is_empty(),
            "expected {} to be sent to {}",
            std::any::type_name::<N>(),
            notifiable.label()
        );
    }

    /// The `index`-th capture for `notifiable` is an `N`.
    pub fn assert_sent_to_at<N: Notification>(&self, notifiable: &Notifiable, index: usize) {
        let captured = self.filtered(|c| same_notifiable(&c.notifiable, notifiable));
        let Some(entry) = captured.get(index) else {
            panic!(
                "expected a notification at index {} for {}, only {} captured",
                index,
                notifiable.label(),
                captured.len()
            );
        };
        assert!(
            entry.is::<N>(),
            "expected {} at index {} for {}, found {}",
            std::any::type_name::<N>(),
            index,
            notifiable.label(),
            entry.notification_type
        );
    }

    pub fn assert_not_sent_to<N: Notification>(&self, notifiable: &Notifiable) {
        assert!(
            self.for_notifiable::<N>(notifiable).is_empty(),
            "expected {} not to be sent to {}",
            std::any::type_name::<N>(),
            notifiable.label()
        );
    }

    pub fn assert_sent_to_channel<N: Notification>(&self, channel: &str) {
        assert!(
            self.of::<N>().iter().any(|c| c.has_channel(channel)),
            "expected {} to be sent on channel '{}'",
            std::any::type_name::<N>(),
            channel
        );
    }

    /// `N` went to an anonymous target, optionally routed on `channel`.
    pub fn assert_on_demand_sent<N: Notification>(&self, channel: Option<&str>) {
        let found = self.of::<N>().iter().any(|c| {
            c.is_on_demand()
                && channel.is_none_or(|channel| {
                    c.has_channel(channel) && c.notifiable.route_for(channel).is_some()
                })
        });
        assert!(
            found,
            "expected {} to be sent on demand{}",
            std::any::type_name::<N>(),
            channel.map(|c| format!(" via '{}'", c)).unwrap_or_default()
        );
    }

    pub fn assert_sent_times<N: Notification>(&self, times: usize) {
        let count = self.of::<N>().len();
        assert_eq!(
            count,
            times,
            "expected {} to be sent {} time(s), sent {} time(s)",
            std::any::type_name::<N>(),
            times,
            count
        );
    }

    pub fn assert_sent_to_times<N: Notification>(&self, notifiable: &Notifiable, times: usize) {
        let count = self.for_notifiable::<N>(notifiable).len();
        assert_eq!(
            count,
            times,
            "expected {} to be sent to {} {} time(s), sent {} time(s)",
            std::any::type_name::<N>(),
            notifiable.label(),
            times,
            count
        );
    }

    /// Some captured `N` has `to_array` data containing `expected`.
    pub fn assert_data_contains<N: Notification>(&self, expected: Value) {
        let found = self.of::<N>().iter().any(|c| {
            let data = c.notification.notification().to_array(&c.notifiable);
            contains_subset(&data, &expected)
        });
        assert!(
            found,
            "expected {} data to contain {}",
            std::any::type_name::<N>(),
            expected
        );
    }
}

#[async_trait]
impl Sender for CapturingSender {
    async fn send(&self, recipients: Recipients, envelope: Envelope) -> Result<()> {
        let queued = envelope.is_queueable();
        self.record(recipients, &envelope, None, queued);
        Ok(())
    }

    async fn send_now(
        &self,
        recipients: Recipients,
        envelope: Envelope,
        channels: Option<Vec<String>>,
    ) -> Result<()> {
        self.record(recipients, &envelope, channels.as_deref(), false);
        Ok(())
    }
}
