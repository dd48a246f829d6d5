//! Notification repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::models::{NotificationRecord, ReadFilter};
use super::time::now_ms;
use crate::{Error, Result};

/// Notification record store.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, record: &NotificationRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<NotificationRecord>;
    /// Records owned by `(model, foreign_key)`, newest first.
    async fn list_for(
        &self,
        model: &str,
        foreign_key: &str,
        filter: ReadFilter,
    ) -> Result<Vec<NotificationRecord>>;

    /// Returns whether the record changed state.
    async fn mark_as_read(&self, id: &str) -> Result<bool>;
    /// Returns whether the record changed state.
    async fn mark_as_unread(&self, id: &str) -> Result<bool>;
    async fn mark_many_as_read(&self, ids: &[String]) -> Result<u64>;
    async fn mark_all_as_read(&self, model: &str, foreign_key: &str) -> Result<u64>;
    async fn count_unread(&self, model: &str, foreign_key: &str) -> Result<u64>;
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ensure_exists(&self, id: &str) -> Result<()> {
        let found: Option<(String,)> = sqlx::query_as("SELECT id FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        found
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Notification", id))
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn create(&self, record: &NotificationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, model, foreign_key, type, data, read_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.model)
        .bind(&record.foreign_key)
        .bind(&record.notification_type)
        .bind(&record.data)
        .bind(record.read_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationRecord> {
        sqlx::query_as::<_, NotificationRecord>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list_for(
        &self,
        model: &str,
        foreign_key: &str,
        filter: ReadFilter,
    ) -> Result<Vec<NotificationRecord>> {
        let sql = format!(
            "SELECT * FROM notifications WHERE model = ? AND foreign_key = ?{} ORDER BY created_at DESC, rowid DESC",
            filter.sql_clause()
        );
        let records = sqlx::query_as::<_, NotificationRecord>(&sql)
            .bind(model)
            .bind(foreign_key)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn mark_as_read(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE notifications SET read_at = ?, updated_at = ? WHERE id = ? AND read_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.ensure_exists(id).await?;
        Ok(false)
    }

    async fn mark_as_unread(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = NULL, updated_at = ? WHERE id = ? AND read_at IS NOT NULL",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.ensure_exists(id).await?;
        Ok(false)
    }

    async fn mark_many_as_read(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE notifications SET read_at = ?, updated_at = ? WHERE read_at IS NULL AND id IN ({})",
            placeholders
        );
        let now = now_ms();
        let mut query = sqlx::query(&sql).bind(now).bind(now);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn mark_all_as_read(&self, model: &str, foreign_key: &str) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notifications SET read_at = ?, updated_at = ?
            WHERE model = ? AND foreign_key = ? AND read_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(model)
        .bind(foreign_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_unread(&self, model: &str, foreign_key: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE model = ? AND foreign_key = ? AND read_at IS NULL",
        )
        .bind(model)
        .bind(foreign_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
