//! Notifications and the envelope that carries them through dispatch.
//!
//! A [`Notification`] is an application value describing what to send and
//! through which channels. The engine never mutates it: per-dispatch state
//! (identity, locale, queue routing) lives on the [`Envelope`], and every
//! builder returns a new envelope that shares the same payload.

mod message;

pub use message::{Action, Address, Attachment, DatabaseMessage, MailLevel, MailMessage};

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::notifiable::{Notifiable, NotifiableEntity};
use crate::{Error, Result};

/// A notification that can be delivered to notifiables.
pub trait Notification: Any + Send + Sync {
    /// Channels this notification is delivered on for `notifiable`.
    /// An empty list skips the notifiable.
    fn via(&self, notifiable: &Notifiable) -> Vec<String>;

    /// Last-chance veto per channel.
    fn should_send(&self, _notifiable: &Notifiable, _channel: &str) -> bool {
        true
    }

    fn to_array(&self, _notifiable: &Notifiable) -> Value {
        Value::Object(Map::new())
    }

    /// Payload stored by the database channel.
    fn to_database(&self, notifiable: &Notifiable) -> Value {
        self.to_array(notifiable)
    }

    /// Mail content; `None` means nothing is sent on the mail channel.
    fn to_mail(&self, _notifiable: &Notifiable) -> Option<MailMessage> {
        None
    }

    /// Payload for pluggable channels. Channels fall back to `to_array`.
    fn to_channel(&self, _notifiable: &Notifiable, _channel: &str) -> Option<Value> {
        None
    }

    /// Type identifier stored with records and carried in queued payloads.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// The queueing capability, if this notification opts into it.
    fn should_queue(&self) -> Option<&dyn ShouldQueue> {
        None
    }

    /// Declared state for types registered with
    /// [`NotificationCodec::register_snapshot`](crate::codec::NotificationCodec::register_snapshot).
    fn snapshot(&self) -> Result<Value> {
        Err(Error::invalid_payload(format!(
            "{} does not declare serializable state",
            self.type_name()
        )))
    }
}

/// Marks a notification for background delivery, with optional defaults for
/// where the jobs go.
pub trait ShouldQueue {
    fn queue(&self) -> Option<String> {
        None
    }

    fn connection(&self) -> Option<String> {
        None
    }

    fn delay(&self) -> Option<Duration> {
        None
    }
}

/// Identity shared by every channel delivery of one notification to one notifiable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// A fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A notification plus the dispatch metadata attached to it.
#[derive(Clone)]
pub struct Envelope {
    id: Option<NotificationId>,
    locale: Option<String>,
    queue: Option<String>,
    connection: Option<String>,
    delay: Option<Duration>,
    payload: Arc<dyn Notification>,
}

impl Envelope {
    pub fn new<N: Notification>(notification: N) -> Self {
        Self::from_arc(Arc::new(notification))
    }

    pub fn from_arc(payload: Arc<dyn Notification>) -> Self {
        Self {
            id: None,
            locale: None,
            queue: None,
            connection: None,
            delay: None,
            payload,
        }
    }

    /// Pin the identity. The sender uses a pinned id instead of generating one.
    pub fn with_id(&self, id: impl Into<NotificationId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self.clone()
        }
    }

    pub fn with_locale(&self, locale: impl Into<String>) -> Self {
        Self {
            locale: Some(locale.into()),
            ..self.clone()
        }
    }

    pub fn on_queue(&self, queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..self.clone()
        }
    }

    pub fn on_connection(&self, connection: impl Into<String>) -> Self {
        Self {
            connection: Some(connection.into()),
            ..self.clone()
        }
    }

    pub fn with_delay(&self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self.clone()
        }
    }

    pub fn id(&self) -> Option<&NotificationId> {
        self.id.as_ref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn notification(&self) -> &dyn Notification {
        self.payload.as_ref()
    }

    pub fn payload(&self) -> &Arc<dyn Notification> {
        &self.payload
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    pub fn is_queueable(&self) -> bool {
        self.payload.should_queue().is_some()
    }

    /// The concrete notification, if it is an `N`.
    pub fn downcast_ref<N: Notification>(&self) -> Option<&N> {
        let any: &dyn Any = self.payload.as_ref();
        any.downcast_ref::<N>()
    }
}

impl<N: Notification> From<N> for Envelope {
    fn from(notification: N) -> Self {
        Self::new(notification)
    }
}

impl From<Arc<dyn Notification>> for Envelope {
    fn from(payload: Arc<dyn Notification>) -> Self {
        Self::from_arc(payload)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type", &self.type_name())
            .field("id", &self.id)
            .field("locale", &self.locale)
            .field("queue", &self.queue)
            .field("connection", &self.connection)
            .field("delay", &self.delay)
            .finish()
    }
}

pub(crate) const ENTITY_MARKER: &str = "__entity__";

/// Entity-valued notification state.
///
/// Serializes to the entity's plain-data snapshot and always comes back as
/// [`Embedded::Data`]: identity and behavior do not survive a queue trip.
#[derive(Clone)]
pub enum Embedded {
    Entity(Arc<dyn NotifiableEntity>),
    Data(Value),
}

impl Embedded {
    pub fn entity<E: NotifiableEntity>(entity: E) -> Self {
        Self::Entity(Arc::new(entity))
    }

    /// Plain data, whichever form this holds.
    pub fn data(&self) -> Value {
        match self {
            Self::Entity(entity) => entity.to_data(),
            Self::Data(data) => data.clone(),
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Self::Entity(_))
    }
}

impl Default for Embedded {
    fn default() -> Self {
        Self::Data(Value::Null)
    }
}

impl PartialEq for Embedded {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl fmt::Debug for Embedded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(entity) => f
                .debug_struct("Entity")
                .field("model", &entity.model())
                .field("key", &entity.key())
                .finish(),
            Self::Data(data) => f.debug_tuple("Data").field(data).finish(),
        }
    }
}

impl Serialize for Embedded {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Entity(entity) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry(ENTITY_MARKER, &true)?;
                map.serialize_entry("type", entity.model())?;
                map.serialize_entry("data", &entity.to_data())?;
                map.end()
            }
            Self::Data(data) => data.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Embedded {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let flattened = value
            .get(ENTITY_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if flattened {
            return Ok(Self::Data(value.get("data").cloned().unwrap_or(Value::Null)));
        }
        Ok(Self::Data(value))
    }
}
