//! Database notification channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Channel, ChannelContext, ChannelKind, ChannelSettings};
use crate::database::{NotificationRecord, NotificationRepository};
use crate::notifiable::Notifiable;
use crate::notification::{Envelope, NotificationId};
use crate::Result;

/// Stores one record per delivery.
pub struct DatabaseChannel {
    records: Arc<dyn NotificationRepository>,
}

impl DatabaseChannel {
    pub fn new(records: Arc<dyn NotificationRepository>) -> Self {
        Self { records }
    }

    fn build_record(&self, notifiable: &Notifiable, envelope: &Envelope) -> Option<NotificationRecord> {
        let entity = notifiable.as_entity()?;
        let id = envelope
            .id()
            .cloned()
            .unwrap_or_else(NotificationId::generate);
        let data = envelope.notification().to_database(notifiable);
        Some(NotificationRecord::new(
            id.as_str(),
            entity.model(),
            entity.key(),
            envelope.type_name(),
            &data,
        ))
    }
}

#[async_trait]
impl Channel for DatabaseChannel {
    async fn send(&self, notifiable: &Notifiable, envelope: &Envelope) -> Result<Option<Value>> {
        // Anonymous targets have no owner row.
        let Some(record) = self.build_record(notifiable, envelope) else {
            return Ok(None);
        };

        self.records.create(&record).await?;
        debug!(
            id = %record.id,
            notifiable = %notifiable.label(),
            "Stored database notification"
        );
        Ok(Some(serde_json::to_value(&record)?))
    }
}

impl ChannelKind for DatabaseChannel {
    fn build(context: &ChannelContext, _settings: &ChannelSettings) -> Result<Self> {
        Ok(Self::new(Arc::clone(&context.records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryNotificationRepository;
    use crate::notifiable::{AnonymousNotifiable, EntityRecord};
    use crate::notification::{DatabaseMessage, Notification};

    struct InvoicePaid;

    impl Notification for InvoicePaid {
        fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
            vec!["database".to_string()]
        }

        fn to_database(&self, _notifiable: &Notifiable) -> Value {
            DatabaseMessage::new().title("Invoice paid").into()
        }
    }

    #[tokio::test]
    async fn test_stores_record_with_envelope_id() {
        let repo = Arc::new(MemoryNotificationRepository::new());
        let channel = DatabaseChannel::new(repo.clone());
        let user = Notifiable::from(EntityRecord::new("Users", "42"));
        let envelope = Envelope::new(InvoicePaid).with_id("n-1");

        let response = channel.send(&user, &envelope).await.unwrap().unwrap();
        assert_eq!(response["id"], "n-1");

        let stored = repo.get("n-1").await.unwrap();
        assert_eq!(stored.model, "Users");
        assert_eq!(stored.foreign_key, "42");
        assert_eq!(stored.notification_type, envelope.type_name());
        assert_eq!(stored.data_json()["title"], "Invoice paid");
    }

    #[tokio::test]
    async fn test_anonymous_produces_no_record() {
        let repo = Arc::new(MemoryNotificationRepository::new());
        let channel = DatabaseChannel::new(repo.clone());
        let target = Notifiable::from(AnonymousNotifiable::new());

        let response = channel.send(&target, &Envelope::new(InvoicePaid)).await.unwrap();
        assert!(response.is_none());
        assert!(repo.is_empty());
    }
}
