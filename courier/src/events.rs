//! Dispatch lifecycle events.
//!
//! Listeners run synchronously in registration order and may stop a
//! `sending` event. Every dispatched event is also published as a
//! [`DispatchRecord`] on a broadcast channel for passive observers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tokio::sync::broadcast;

use crate::notifiable::Notifiable;
use crate::notification::Envelope;

/// Lifecycle stage of one channel attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DispatchEventKind {
    Sending,
    Sent,
    Failed,
}

impl DispatchEventKind {
    /// Event name as published on the bus.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Sending => "notification.sending",
            Self::Sent => "notification.sent",
            Self::Failed => "notification.failed",
        }
    }
}

/// Event passed to listeners.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    kind: DispatchEventKind,
    notifiable: Notifiable,
    envelope: Envelope,
    channel: String,
    response: Option<Value>,
    error: Option<String>,
    stopped: bool,
}

impl DispatchEvent {
    pub fn sending(notifiable: &Notifiable, envelope: &Envelope, channel: &str) -> Self {
        Self::new(DispatchEventKind::Sending, notifiable, envelope, channel)
    }

    pub fn sent(notifiable: &Notifiable, envelope: &Envelope, channel: &str, response: Value) -> Self {
        Self {
            response: Some(response),
            ..Self::new(DispatchEventKind::Sent, notifiable, envelope, channel)
        }
    }

    pub fn failed(notifiable: &Notifiable, envelope: &Envelope, channel: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(DispatchEventKind::Failed, notifiable, envelope, channel)
        }
    }

    fn new(kind: DispatchEventKind, notifiable: &Notifiable, envelope: &Envelope, channel: &str) -> Self {
        Self {
            kind,
            notifiable: notifiable.clone(),
            envelope: envelope.clone(),
            channel: channel.to_string(),
            response: None,
            error: None,
            stopped: false,
        }
    }

    pub fn kind(&self) -> DispatchEventKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.event_name()
    }

    pub fn notifiable(&self) -> &Notifiable {
        &self.notifiable
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Skip remaining listeners and, for `sending`, the delivery itself.
    pub fn stop_propagation(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn record(&self) -> DispatchRecord {
        DispatchRecord {
            kind: self.kind,
            notifiable: self.notifiable.label(),
            notification_id: self.envelope.id().map(|id| id.to_string()),
            notification_type: self.envelope.type_name().to_string(),
            channel: self.channel.clone(),
            response: self.response.clone(),
            error: self.error.clone(),
            stopped: self.stopped,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Serializable summary of a dispatched event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub kind: DispatchEventKind,
    pub notifiable: String,
    pub notification_id: Option<String>,
    pub notification_type: String,
    pub channel: String,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub stopped: bool,
    pub timestamp: String,
}

pub type Listener = Arc<dyn Fn(&mut DispatchEvent) + Send + Sync>;

/// Handle returned by [`EventBus::listen`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kind: Option<DispatchEventKind>,
    listener: Listener,
}

/// Synchronous listeners plus a broadcast feed of records.
pub struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<DispatchRecord>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Listen for one kind of event.
    pub fn listen<F>(&self, kind: DispatchEventKind, listener: F) -> ListenerId
    where
        F: Fn(&mut DispatchEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(listener))
    }

    /// Listen for every event.
    pub fn listen_all<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&mut DispatchEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(listener))
    }

    fn add(&self, kind: Option<DispatchEventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration { id, kind, listener });
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Subscribe to dispatch records.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchRecord> {
        self.event_tx.subscribe()
    }

    /// Run matching listeners until one stops the event, then publish it.
    pub fn dispatch(&self, mut event: DispatchEvent) -> DispatchEvent {
        let matching: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.kind.is_none_or(|kind| kind == event.kind))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in matching {
            listener(&mut event);
            if event.stopped {
                break;
            }
        }

        // No receivers is fine.
        let _ = self.event_tx.send(event.record());
        event
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifiable::EntityRecord;
    use crate::notification::Notification;
    use parking_lot::Mutex;

    struct Ping;

    impl Notification for Ping {
        fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
            vec!["database".to_string()]
        }
    }

    fn sending() -> DispatchEvent {
        let user = Notifiable::from(EntityRecord::new("Users", "1"));
        DispatchEvent::sending(&user, &Envelope::new(Ping), "database")
    }

    #[test]
    fn test_event_names() {
        assert_eq!(DispatchEventKind::Sending.event_name(), "notification.sending");
        assert_eq!(DispatchEventKind::Sent.event_name(), "notification.sent");
        assert_eq!(DispatchEventKind::Failed.event_name(), "notification.failed");
    }

    #[test]
    fn test_stop_skips_remaining_listeners() {
        let bus = EventBus::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = calls.clone();
        bus.listen(DispatchEventKind::Sending, move |event| {
            c.lock().push("first");
            event.stop_propagation();
        });
        let c = calls.clone();
        bus.listen_all(move |_| c.lock().push("second"));

        let event = bus.dispatch(sending());
        assert!(event.is_stopped());
        assert_eq!(*calls.lock(), vec!["first"]);
    }

    #[test]
    fn test_listener_kind_filter_and_removal() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicU64::new(0));

        let c = calls.clone();
        let id = bus.listen(DispatchEventKind::Sent, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispatch(sending());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(bus.remove(id));
        assert!(!bus.remove(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_records_are_broadcast() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.dispatch(sending());

        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind, DispatchEventKind::Sending);
        assert_eq!(record.notifiable, "Users:1");
        assert_eq!(record.channel, "database");
        assert!(!record.stopped);
    }
}
