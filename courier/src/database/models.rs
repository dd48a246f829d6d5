//! Notification database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use super::time::{ms_to_datetime, now_ms};

/// A notification delivered through the database channel.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    /// Model name of the owning notifiable.
    pub model: String,
    /// Primary key of the owning notifiable.
    pub foreign_key: String,
    /// Notification type identifier.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub notification_type: String,
    /// JSON payload.
    pub data: String,
    pub read_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationRecord {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        foreign_key: impl Into<String>,
        notification_type: impl Into<String>,
        data: &Value,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            model: model.into(),
            foreign_key: foreign_key.into(),
            notification_type: notification_type.into(),
            data: data.to_string(),
            read_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Decoded payload; malformed JSON reads as `Null`.
    pub fn data_json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or(Value::Null)
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    pub fn read_at_datetime(&self) -> Option<DateTime<Utc>> {
        self.read_at.map(ms_to_datetime)
    }

    pub fn created_at_datetime(&self) -> DateTime<Utc> {
        ms_to_datetime(self.created_at)
    }
}

/// Read-state filter for listing queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFilter {
    #[default]
    All,
    Read,
    Unread,
}

impl ReadFilter {
    pub fn matches(&self, record: &NotificationRecord) -> bool {
        match self {
            Self::All => true,
            Self::Read => record.is_read(),
            Self::Unread => !record.is_read(),
        }
    }

    pub(crate) fn sql_clause(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Read => " AND read_at IS NOT NULL",
            Self::Unread => " AND read_at IS NULL",
        }
    }
}
