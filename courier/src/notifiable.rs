//! Notification recipients.
//!
//! A recipient is either a persisted entity, addressable by model name and
//! primary key, or an anonymous target carrying ad-hoc routes per channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Model name reported for anonymous targets.
pub const ANONYMOUS_MODEL: &str = "Anonymous";

/// Capability: the recipient has a preferred locale.
pub trait LocaleAware {
    fn preferred_locale(&self) -> Option<String>;
}

/// A persisted entity that can receive notifications.
pub trait NotifiableEntity: Send + Sync + 'static {
    /// Model (table) name, e.g. `Users`.
    fn model(&self) -> &str;

    /// Primary key rendered as a string.
    fn key(&self) -> String;

    /// Plain-data snapshot of the entity.
    fn to_data(&self) -> Value;

    /// Channel-specific routing information, e.g. an address for `mail`.
    fn route_notification_for(&self, _channel: &str) -> Option<Value> {
        None
    }

    fn locale_aware(&self) -> Option<&dyn LocaleAware> {
        None
    }
}

/// Generic data-only entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    model: String,
    key: String,
    fields: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(model: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            key: key.into(),
            fields: Map::new(),
        }
    }

    /// Set a field, builder style.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn into_arc(self) -> Arc<dyn NotifiableEntity> {
        Arc::new(self)
    }
}

impl NotifiableEntity for EntityRecord {
    fn model(&self) -> &str {
        &self.model
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn to_data(&self) -> Value {
        let mut data = self.fields.clone();
        data.entry("id").or_insert_with(|| Value::String(self.key.clone()));
        Value::Object(data)
    }

    fn route_notification_for(&self, channel: &str) -> Option<Value> {
        self.fields
            .get("routes")
            .and_then(|routes| routes.get(channel))
            .cloned()
    }

    fn locale_aware(&self) -> Option<&dyn LocaleAware> {
        Some(self)
    }
}

impl LocaleAware for EntityRecord {
    fn preferred_locale(&self) -> Option<String> {
        self.fields
            .get("locale")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// An ephemeral recipient with routing information only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnonymousNotifiable {
    routes: BTreeMap<String, Value>,
}

impl AnonymousNotifiable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route for `channel`.
    ///
    /// The database channel needs a persisted owner, so routing to it fails.
    pub fn route(mut self, channel: impl Into<String>, route: impl Into<Value>) -> Result<Self> {
        let channel = channel.into();
        if channel == "database" {
            return Err(Error::invalid_argument(
                "The database channel does not support on-demand notifications",
            ));
        }
        self.routes.insert(channel, route.into());
        Ok(self)
    }

    pub fn route_for(&self, channel: &str) -> Option<&Value> {
        self.routes.get(channel)
    }

    pub fn routes(&self) -> &BTreeMap<String, Value> {
        &self.routes
    }
}

/// Recipient of a notification.
#[derive(Clone)]
pub enum Notifiable {
    Entity(Arc<dyn NotifiableEntity>),
    Anonymous(AnonymousNotifiable),
}

impl Notifiable {
    pub fn entity<E: NotifiableEntity>(entity: E) -> Self {
        Self::Entity(Arc::new(entity))
    }

    pub fn model(&self) -> &str {
        match self {
            Self::Entity(entity) => entity.model(),
            Self::Anonymous(_) => ANONYMOUS_MODEL,
        }
    }

    /// Primary key for entities; `None` for anonymous targets.
    pub fn key(&self) -> Option<String> {
        match self {
            Self::Entity(entity) => Some(entity.key()),
            Self::Anonymous(_) => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }

    pub fn as_entity(&self) -> Option<&Arc<dyn NotifiableEntity>> {
        match self {
            Self::Entity(entity) => Some(entity),
            Self::Anonymous(_) => None,
        }
    }

    /// Routing information for `channel`.
    pub fn route_for(&self, channel: &str) -> Option<Value> {
        match self {
            Self::Entity(entity) => entity.route_notification_for(channel),
            Self::Anonymous(anonymous) => anonymous.route_for(channel).cloned(),
        }
    }

    pub fn preferred_locale(&self) -> Option<String> {
        match self {
            Self::Entity(entity) => entity.locale_aware().and_then(|l| l.preferred_locale()),
            Self::Anonymous(_) => None,
        }
    }

    /// Plain data; anonymous targets expose their routes.
    pub fn to_data(&self) -> Value {
        match self {
            Self::Entity(entity) => entity.to_data(),
            Self::Anonymous(anonymous) => Value::Object(
                anonymous
                    .routes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }

    /// Stable label used in logs and event records.
    pub fn label(&self) -> String {
        match self {
            Self::Entity(entity) => format!("{}:{}", entity.model(), entity.key()),
            Self::Anonymous(_) => ANONYMOUS_MODEL.to_string(),
        }
    }
}

impl fmt::Debug for Notifiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(entity) => f
                .debug_struct("Entity")
                .field("model", &entity.model())
                .field("key", &entity.key())
                .finish(),
            Self::Anonymous(anonymous) => f.debug_tuple("Anonymous").field(anonymous).finish(),
        }
    }
}

impl From<AnonymousNotifiable> for Notifiable {
    fn from(value: AnonymousNotifiable) -> Self {
        Self::Anonymous(value)
    }
}

impl From<Arc<dyn NotifiableEntity>> for Notifiable {
    fn from(value: Arc<dyn NotifiableEntity>) -> Self {
        Self::Entity(value)
    }
}

impl From<EntityRecord> for Notifiable {
    fn from(value: EntityRecord) -> Self {
        Self::entity(value)
    }
}

/// One notifiable or an ordered collection of them.
#[derive(Debug, Clone, Default)]
pub struct Recipients(Vec<Notifiable>);

impl Recipients {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Notifiable> {
        self.0.iter()
    }
}

impl IntoIterator for Recipients {
    type Item = Notifiable;
    type IntoIter = std::vec::IntoIter<Notifiable>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Notifiable> for Recipients {
    fn from(value: Notifiable) -> Self {
        Self(vec![value])
    }
}

impl From<EntityRecord> for Recipients {
    fn from(value: EntityRecord) -> Self {
        Self(vec![value.into()])
    }
}

impl From<AnonymousNotifiable> for Recipients {
    fn from(value: AnonymousNotifiable) -> Self {
        Self(vec![value.into()])
    }
}

impl From<Arc<dyn NotifiableEntity>> for Recipients {
    fn from(value: Arc<dyn NotifiableEntity>) -> Self {
        Self(vec![value.into()])
    }
}

impl From<Vec<Notifiable>> for Recipients {
    fn from(value: Vec<Notifiable>) -> Self {
        Self(value)
    }
}

impl FromIterator<Notifiable> for Recipients {
    fn from_iter<I: IntoIterator<Item = Notifiable>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Loads notifiable entities by model name and key.
#[async_trait]
pub trait NotifiableResolver: Send + Sync {
    /// Fails with `NotFound` when the entity does not exist.
    async fn resolve(&self, model: &str, key: &str) -> Result<Notifiable>;
}

/// In-memory entity lookup.
#[derive(Default)]
pub struct EntityDirectory {
    entities: DashMap<(String, String), Arc<dyn NotifiableEntity>>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: Arc<dyn NotifiableEntity>) {
        self.entities
            .insert((entity.model().to_string(), entity.key()), entity);
    }

    pub fn remove(&self, model: &str, key: &str) -> bool {
        self.entities
            .remove(&(model.to_string(), key.to_string()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl NotifiableResolver for EntityDirectory {
    async fn resolve(&self, model: &str, key: &str) -> Result<Notifiable> {
        self.entities
            .get(&(model.to_string(), key.to_string()))
            .map(|entry| Notifiable::Entity(Arc::clone(entry.value())))
            .ok_or_else(|| Error::not_found(model, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> EntityRecord {
        EntityRecord::new("Users", "1")
            .field("email", "ada@example.com")
            .field("locale", "fr")
            .field("routes", json!({"sms": "+15550100"}))
    }

    #[test]
    fn test_anonymous_rejects_database_route() {
        let err = AnonymousNotifiable::new()
            .route("database", json!({"anything": true}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = AnonymousNotifiable::new().route("database", Value::Null).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_anonymous_routes() {
        let anonymous = AnonymousNotifiable::new()
            .route("mail", "ops@example.com")
            .unwrap()
            .route("webhook", "https://hooks.example.com/1")
            .unwrap();

        let notifiable = Notifiable::from(anonymous);
        assert!(notifiable.is_anonymous());
        assert_eq!(notifiable.model(), ANONYMOUS_MODEL);
        assert_eq!(notifiable.key(), None);
        assert_eq!(notifiable.route_for("mail"), Some(json!("ops@example.com")));
        assert_eq!(notifiable.route_for("sms"), None);
        assert_eq!(notifiable.preferred_locale(), None);
    }

    #[test]
    fn test_entity_record_capabilities() {
        let notifiable = Notifiable::from(user());
        assert_eq!(notifiable.model(), "Users");
        assert_eq!(notifiable.key().as_deref(), Some("1"));
        assert_eq!(notifiable.preferred_locale().as_deref(), Some("fr"));
        assert_eq!(notifiable.route_for("sms"), Some(json!("+15550100")));
        assert_eq!(notifiable.to_data()["email"], "ada@example.com");
        assert_eq!(notifiable.to_data()["id"], "1");
        assert_eq!(notifiable.label(), "Users:1");
    }

    #[test]
    fn test_recipients_preserve_order() {
        let recipients: Recipients = vec![
            Notifiable::from(EntityRecord::new("Users", "2")),
            Notifiable::from(EntityRecord::new("Users", "1")),
        ]
        .into();

        let keys: Vec<_> = recipients.into_iter().filter_map(|n| n.key()).collect();
        assert_eq!(keys, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_entity_directory_resolve() {
        let directory = EntityDirectory::new();
        directory.insert(user().into_arc());

        let found = directory.resolve("Users", "1").await.unwrap();
        assert_eq!(found.key().as_deref(), Some("1"));

        let err = directory.resolve("Users", "999").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
