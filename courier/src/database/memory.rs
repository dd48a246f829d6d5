//! In-memory notification repository.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::models::{NotificationRecord, ReadFilter};
use super::repository::NotificationRepository;
use super::time::now_ms;
use crate::{Error, Result};

/// Notification records kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryNotificationRepository {
    records: RwLock<Vec<NotificationRecord>>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record, oldest first.
    pub fn all(&self) -> Vec<NotificationRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn update<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut NotificationRecord) -> bool,
    {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::not_found("Notification", id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, record: &NotificationRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::invalid_argument(format!(
                "Notification {} already exists",
                record.id
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list_for(
        &self,
        model: &str,
        foreign_key: &str,
        filter: ReadFilter,
    ) -> Result<Vec<NotificationRecord>> {
        let mut found: Vec<_> = self
            .records
            .read()
            .iter()
            .rev()
            .filter(|r| r.model == model && r.foreign_key == foreign_key && filter.matches(r))
            .cloned()
            .collect();
        // Stable sort keeps newest-inserted first among equal timestamps.
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn mark_as_read(&self, id: &str) -> Result<bool> {
        self.update(id, |record| {
            if record.read_at.is_some() {
                return false;
            }
            let now = now_ms();
            record.read_at = Some(now);
            record.updated_at = now;
            true
        })
    }

    async fn mark_as_unread(&self, id: &str) -> Result<bool> {
        self.update(id, |record| {
            if record.read_at.is_none() {
                return false;
            }
            record.read_at = None;
            record.updated_at = now_ms();
            true
        })
    }

    async fn mark_many_as_read(&self, ids: &[String]) -> Result<u64> {
        let now = now_ms();
        let mut changed = 0;
        for record in self.records.write().iter_mut() {
            if record.read_at.is_none() && ids.contains(&record.id) {
                record.read_at = Some(now);
                record.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_all_as_read(&self, model: &str, foreign_key: &str) -> Result<u64> {
        let now = now_ms();
        let mut changed = 0;
        for record in self.records.write().iter_mut() {
            if record.model == model && record.foreign_key == foreign_key && record.read_at.is_none()
            {
                record.read_at = Some(now);
                record.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn count_unread(&self, model: &str, foreign_key: &str) -> Result<u64> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.model == model && r.foreign_key == foreign_key && r.read_at.is_none())
            .count() as u64)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, key: &str) -> NotificationRecord {
        NotificationRecord::new(id, "Users", key, "app::Welcome", &json!({"id": id}))
    }

    #[tokio::test]
    async fn test_read_state_transitions() {
        let repo = MemoryNotificationRepository::new();
        repo.create(&record("a", "1")).await.unwrap();

        assert!(repo.mark_as_read("a").await.unwrap());
        assert!(!repo.mark_as_read("a").await.unwrap());
        assert!(repo.get("a").await.unwrap().is_read());

        assert!(repo.mark_as_unread("a").await.unwrap());
        assert!(!repo.mark_as_unread("a").await.unwrap());

        let err = repo.mark_as_read("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_bulk_operations_scope_to_owner() {
        let repo = MemoryNotificationRepository::new();
        for (id, key) in [("a", "1"), ("b", "1"), ("c", "2")] {
            repo.create(&record(id, key)).await.unwrap();
        }

        assert_eq!(repo.count_unread("Users", "1").await.unwrap(), 2);
        assert_eq!(repo.mark_all_as_read("Users", "1").await.unwrap(), 2);
        assert_eq!(repo.count_unread("Users", "1").await.unwrap(), 0);
        assert_eq!(repo.count_unread("Users", "2").await.unwrap(), 1);

        let ids = vec!["a".to_string(), "c".to_string()];
        assert_eq!(repo.mark_many_as_read(&ids).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_and_duplicates_rejected() {
        let repo = MemoryNotificationRepository::new();
        repo.create(&record("a", "1")).await.unwrap();
        repo.create(&record("b", "1")).await.unwrap();
        assert!(repo.create(&record("a", "1")).await.is_err());

        let listed = repo.list_for("Users", "1", ReadFilter::All).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
        assert_eq!(repo.len(), 1);
    }
}
