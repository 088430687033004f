use std::sync::atomic::Ordering;

use async_trait::async_trait;
use lineage_storage::{EntityId, MaterializedAnswer, StorageError, ViewStore};

use crate::store::{AnswerRow, InMemoryStore};

#[async_trait]
impl ViewStore for InMemoryStore {
    async fn upsert_answer(&self, answer: &MaterializedAnswer) -> Result<bool, StorageError> {
        let _conn = self.checkout().await?;
        if self.view_writes_failing() {
            return Err(StorageError::connection_error("view writes are failing"));
        }
        let mut tables = self.tables.write();
        if let Some(existing) = tables.answers.get_mut(&answer.entity_id) {
            if existing.answer.source_hash > answer.source_hash {
                tracing::debug!(
                    entity_id = %answer.entity_id,
                    existing = %existing.answer.source_hash,
                    incoming = %answer.source_hash,
                    "skipping older materialized answer"
                );
                return Ok(false);
            }
            existing.answer = answer.clone();
            return Ok(true);
        }
        let row_id = self.next_row_id.fetch_add(1, Ordering::Relaxed);
        tables.answers.insert(
            answer.entity_id.clone(),
            AnswerRow {
                row_id,
                answer: answer.clone(),
            },
        );
        Ok(true)
    }

    async fn delete_answer(&self, id: &EntityId) -> Result<bool, StorageError> {
        let _conn = self.checkout().await?;
        Ok(self.tables.write().answers.remove(id).is_some())
    }

    async fn get_answer(&self, id: &EntityId) -> Result<Option<MaterializedAnswer>, StorageError> {
        let _conn = self.checkout().await?;
        Ok(self
            .tables
            .read()
            .answers
            .get(id)
            .map(|row| row.answer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_storage::{EntityPath, SourceHash};
    use time::OffsetDateTime;

    fn answer(source_hash: u64, count: u64) -> MaterializedAnswer {
        MaterializedAnswer {
            entity_id: EntityId::new("e1"),
            path: EntityPath::parse("root").unwrap(),
            ancestors: vec![],
            descendant_count: count,
            computed_at: OffsetDateTime::now_utc(),
            source_hash: SourceHash(source_hash),
        }
    }

    #[tokio::test]
    async fn test_upsert_never_regresses() {
        let store = InMemoryStore::new();
        assert!(store.upsert_answer(&answer(5, 1)).await.unwrap());
        assert!(!store.upsert_answer(&answer(4, 2)).await.unwrap());
        assert!(store.upsert_answer(&answer(5, 3)).await.unwrap());

        let stored = store.get_answer(&"e1".into()).await.unwrap().unwrap();
        assert_eq!(stored.descendant_count, 3);
    }

    #[tokio::test]
    async fn test_delete_answer() {
        let store = InMemoryStore::new();
        store.upsert_answer(&answer(1, 0)).await.unwrap();
        assert!(store.delete_answer(&"e1".into()).await.unwrap());
        assert!(!store.delete_answer(&"e1".into()).await.unwrap());
        assert!(store.get_answer(&"e1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_view_writes_keep_last_row() {
        let store = InMemoryStore::new();
        store.upsert_answer(&answer(1, 0)).await.unwrap();

        store.fail_view_writes(true);
        assert!(store.upsert_answer(&answer(2, 7)).await.is_err());
        let stored = store.get_answer(&"e1".into()).await.unwrap().unwrap();
        assert_eq!(stored.descendant_count, 0);

        store.fail_view_writes(false);
        assert!(store.upsert_answer(&answer(2, 7)).await.unwrap());
    }
}
