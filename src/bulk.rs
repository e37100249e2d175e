//! Auditable bulk mutations with time-bounded undo.
//!
//! Every bulk action snapshots the `(status, tags)` of each affected chunk
//! before mutating, so `undo` can restore the exact prior state. Undo is
//! only honoured inside a fixed window; the audit row itself is immutable
//! apart from its `undone` flag.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::models::{BulkAction, BulkActionType, Chunk, ChunkPatch, ChunkSnapshot, ChunkStatus};
use crate::store::{union_tags, ChunkFilter, Page, Store, MAX_PAGE_LIMIT};

/// How long after a bulk action its undo stays valid.
const UNDO_WINDOW_MINUTES: i64 = 30;

pub struct BulkService {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl BulkService {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Apply `action_type` to every chunk matching `filter`. `tags` is
    /// required for `Tag` (set-union semantics) and ignored otherwise.
    pub async fn apply(
        &self,
        action_type: BulkActionType,
        filter: &ChunkFilter,
        tags: Option<&[String]>,
    ) -> Result<BulkAction> {
        if action_type == BulkActionType::Tag && tags.map(|t| t.is_empty()).unwrap_or(true) {
            return Err(Error::Validation(
                "bulk tag requires at least one tag".to_string(),
            ));
        }

        let chunks = self.collect_matching(filter).await?;
        let snapshots: Vec<ChunkSnapshot> = chunks
            .iter()
            .map(|c| ChunkSnapshot {
                id: c.id,
                status: c.status,
                tags: c.tags.clone(),
            })
            .collect();

        for chunk in &chunks {
            let updated = match action_type {
                BulkActionType::Tag => {
                    let merged = union_tags(&chunk.tags, tags.unwrap_or(&[]));
                    self.store
                        .update_chunk(
                            chunk.id,
                            &ChunkPatch {
                                tags: Some(merged),
                                ..Default::default()
                            },
                        )
                        .await?
                }
                BulkActionType::Archive => {
                    self.store
                        .update_chunk(
                            chunk.id,
                            &ChunkPatch {
                                status: Some(ChunkStatus::Archived),
                                ..Default::default()
                            },
                        )
                        .await?
                }
                BulkActionType::Delete => {
                    self.store
                        .update_chunk(
                            chunk.id,
                            &ChunkPatch {
                                status: Some(ChunkStatus::Deleted),
                                ..Default::default()
                            },
                        )
                        .await?
                }
                // Restore sends archived or deleted chunks back to the
                // inbox. The regression is legal here because it is
                // recorded in the audit log like any other bulk mutation.
                BulkActionType::Restore => {
                    self.store
                        .restore_chunk(&ChunkSnapshot {
                            id: chunk.id,
                            status: ChunkStatus::Inbox,
                            tags: chunk.tags.clone(),
                        })
                        .await?
                }
            };
            self.bus
                .publish(Event::chunk_updated(updated.id, updated.status));
        }

        let filter_json =
            serde_json::to_value(filter).unwrap_or_else(|_| serde_json::json!({}));
        let action = self
            .store
            .record_bulk_action(action_type, filter_json, &snapshots)
            .await?;
        info!(
            action_id = %action.id,
            action = %action_type,
            affected = action.affected_count,
            "bulk action applied"
        );
        Ok(action)
    }

    /// Reverse a bulk action, restoring each chunk's snapshot. Fails with
    /// a dedicated error once the undo window has passed.
    pub async fn undo(&self, action_id: Uuid) -> Result<usize> {
        let action = self.store.get_bulk_action(action_id).await?;
        if action.undone {
            return Err(Error::Conflict(format!(
                "bulk action {action_id} already undone"
            )));
        }
        if undo_window_expired(&action, Utc::now()) {
            return Err(Error::UndoWindowExpired(action_id));
        }

        for snapshot in &action.previous_state {
            let restored = self.store.restore_chunk(snapshot).await?;
            self.bus
                .publish(Event::chunk_updated(restored.id, restored.status));
        }
        self.store.mark_bulk_action_undone(action_id).await?;
        info!(%action_id, restored = action.previous_state.len(), "bulk action undone");
        Ok(action.previous_state.len())
    }

    async fn collect_matching(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>> {
        let mut all = Vec::new();
        let mut offset = 0i64;
        loop {
            let (page, total) = self
                .store
                .list_chunks(
                    filter,
                    Page {
                        limit: MAX_PAGE_LIMIT,
                        offset,
                    },
                )
                .await?;
            let fetched = page.len() as i64;
            all.extend(page);
            offset += fetched;
            if offset >= total || fetched == 0 {
                break;
            }
        }
        Ok(all)
    }
}

fn undo_window_expired(action: &BulkAction, now: chrono::DateTime<Utc>) -> bool {
    now.signed_duration_since(action.created_at) > Duration::minutes(UNDO_WINDOW_MINUTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkDraft;
    use crate::store::memory::MemoryStore;

    async fn seed(store: &MemoryStore, n: usize) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for i in 0..n {
            let chunk = store
                .create_chunk(&ChunkDraft {
                    content: format!("note {i}"),
                    tags: vec!["seed".to_string()],
                    ..Default::default()
                })
                .await
                .unwrap();
            ids.push(chunk.id);
        }
        ids
    }

    fn service(store: Arc<MemoryStore>) -> BulkService {
        BulkService::new(store, EventBus::new(512))
    }

    #[tokio::test]
    async fn test_bulk_archive_and_undo_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let ids = seed(&store, 100).await;
        let bulk = service(Arc::clone(&store));

        let filter = ChunkFilter {
            status: Some(ChunkStatus::Inbox),
            ..Default::default()
        };
        let action = bulk
            .apply(BulkActionType::Archive, &filter, None)
            .await
            .unwrap();
        assert_eq!(action.affected_count, 100);
        assert_eq!(action.previous_state.len(), 100);
        for id in &ids {
            assert_eq!(store.get_chunk(*id).await.unwrap().status, ChunkStatus::Archived);
        }

        let restored = bulk.undo(action.id).await.unwrap();
        assert_eq!(restored, 100);
        for id in &ids {
            let chunk = store.get_chunk(*id).await.unwrap();
            assert_eq!(chunk.status, ChunkStatus::Inbox);
            assert_eq!(chunk.tags, vec!["seed"]);
        }
    }

    #[tokio::test]
    async fn test_undo_twice_conflicts() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 3).await;
        let bulk = service(Arc::clone(&store));
        let action = bulk
            .apply(BulkActionType::Archive, &ChunkFilter::default(), None)
            .await
            .unwrap();
        bulk.undo(action.id).await.unwrap();
        let err = bulk.undo(action.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_bulk_tag_is_set_union() {
        let store = Arc::new(MemoryStore::new());
        let ids = seed(&store, 2).await;
        let bulk = service(Arc::clone(&store));
        bulk.apply(
            BulkActionType::Tag,
            &ChunkFilter::default(),
            Some(&["seed".to_string(), "triage".to_string()]),
        )
        .await
        .unwrap();
        for id in ids {
            let chunk = store.get_chunk(id).await.unwrap();
            assert_eq!(chunk.tags, vec!["seed", "triage"]);
        }
    }

    #[tokio::test]
    async fn test_bulk_tag_requires_tags() {
        let store = Arc::new(MemoryStore::new());
        let bulk = service(store);
        let err = bulk
            .apply(BulkActionType::Tag, &ChunkFilter::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_undo_window_boundary() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1).await;
        let bulk = service(Arc::clone(&store));
        let action = bulk
            .apply(BulkActionType::Archive, &ChunkFilter::default(), None)
            .await
            .unwrap();

        let created = action.created_at;
        assert!(!undo_window_expired(&action, created + Duration::minutes(29)));
        assert!(!undo_window_expired(&action, created + Duration::minutes(30)));
        assert!(undo_window_expired(&action, created + Duration::minutes(31)));
    }

    #[tokio::test]
    async fn test_bulk_restore_returns_archived_to_inbox() {
        let store = Arc::new(MemoryStore::new());
        let ids = seed(&store, 4).await;
        let bulk = service(Arc::clone(&store));
        bulk.apply(BulkActionType::Archive, &ChunkFilter::default(), None)
            .await
            .unwrap();
        bulk.apply(
            BulkActionType::Restore,
            &ChunkFilter {
                status: Some(ChunkStatus::Archived),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        for id in ids {
            assert_eq!(store.get_chunk(id).await.unwrap().status, ChunkStatus::Inbox);
        }
    }
}
