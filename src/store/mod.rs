//! Storage abstraction for Komorebi.
//!
//! The [`Store`] trait defines all data access needed by the capture and
//! compaction pipeline, enabling pluggable backends (SQLite, in-memory).
//! Storage is the source of truth: any cross-task ordering is established
//! by reading from here, not by in-memory state. The pipeline receives a
//! `Arc<dyn Store>` at construction; nothing looks storage up ambiently.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    BulkAction, BulkActionType, Chunk, ChunkDraft, ChunkPatch, ChunkSnapshot, ChunkStatus, Entity,
    EntityDraft, EntityType, Project,
};

/// Hard cap on page size for list and search operations.
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Pagination window. `limit` is clamped to [`MAX_PAGE_LIMIT`].
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
            offset: self.offset.max(0),
        }
    }
}

/// Structural filter for `list_chunks`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct ChunkFilter {
    pub status: Option<ChunkStatus>,
    pub project_id: Option<Uuid>,
    pub tag: Option<String>,
    pub source: Option<String>,
    pub trace_id: Option<String>,
}

/// Query for `search_chunks`. Text matching is case-insensitive substring
/// over `content` and `summary`; entity predicates use EXISTS semantics so
/// a chunk with several matching entities appears once.
#[derive(Debug, Clone, Default)]
pub struct ChunkSearch {
    pub query: Option<String>,
    pub status: Option<ChunkStatus>,
    pub project_id: Option<Uuid>,
    pub entity_type: Option<EntityType>,
    pub entity_value: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Partial update applied to a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

/// Filter for `list_entities_by_project`.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    pub entity_type: Option<EntityType>,
    pub min_confidence: Option<f64>,
    pub since: Option<DateTime<Utc>>,
}

/// Abstract storage backend.
///
/// Every operation fails with one of the semantic errors in
/// [`crate::error::Error`]; transient storage failures surface as
/// `StorageUnavailable` and are never swallowed.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- chunks ----

    /// Insert a new chunk with a fresh id and timestamps, status `inbox`.
    async fn create_chunk(&self, draft: &ChunkDraft) -> Result<Chunk>;

    async fn get_chunk(&self, id: Uuid) -> Result<Chunk>;

    /// Partial update. Changing `id` or `content` is impossible by
    /// construction of [`ChunkPatch`]; a status change that lowers the
    /// lifecycle rank fails with `Conflict`.
    async fn update_chunk(&self, id: Uuid, patch: &ChunkPatch) -> Result<Chunk>;

    /// Restore a chunk's `(status, tags)` from a bulk-action snapshot.
    /// This is the only path that may regress status.
    async fn restore_chunk(&self, snapshot: &ChunkSnapshot) -> Result<Chunk>;

    /// Stable ordering: `created_at DESC, id DESC`. Returns the page plus
    /// the total match count.
    async fn list_chunks(&self, filter: &ChunkFilter, page: Page) -> Result<(Vec<Chunk>, i64)>;

    async fn search_chunks(&self, search: &ChunkSearch, page: Page) -> Result<(Vec<Chunk>, i64)>;

    /// `(id, content)` of every non-deleted chunk, optionally scoped to a
    /// project. Feeds the TF-IDF similarity pass.
    async fn all_chunk_content(&self, project_id: Option<Uuid>) -> Result<Vec<(Uuid, String)>>;

    async fn count_by_status(&self) -> Result<Vec<(ChunkStatus, i64)>>;

    async fn oldest_inbox(&self) -> Result<Option<Chunk>>;

    /// Ids of every chunk still at `inbox`, oldest first. Startup scan
    /// re-enqueues these.
    async fn inbox_chunk_ids(&self) -> Result<Vec<Uuid>>;

    /// Chunks of a project at `processed`, oldest first. Compaction input.
    async fn processed_chunks(&self, project_id: Uuid) -> Result<Vec<Chunk>>;

    // ---- projects ----

    async fn create_project(&self, name: &str, description: Option<&str>) -> Result<Project>;

    async fn get_project(&self, id: Uuid) -> Result<Project>;

    async fn update_project(&self, id: Uuid, patch: &ProjectPatch) -> Result<Project>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Commit one completed compaction level as a single logical write:
    /// store the summary, bump `compaction_depth` (capped), advance
    /// `last_compaction_at`, and flip every included chunk to `compacted`.
    /// Either everything lands or nothing does.
    async fn complete_compaction(
        &self,
        project_id: Uuid,
        summary: &str,
        chunk_ids: &[Uuid],
        depth_cap: i64,
    ) -> Result<Project>;

    // ---- entities ----

    /// Insert entity candidates; rows whose `(chunk_id, type, value)`
    /// already exist are silently skipped. Returns the newly created rows.
    async fn bulk_create_entities(&self, drafts: &[EntityDraft]) -> Result<Vec<Entity>>;

    async fn list_entities_by_project(
        &self,
        project_id: Uuid,
        query: &EntityQuery,
        page: Page,
    ) -> Result<Vec<Entity>>;

    // ---- bulk-action audit log ----

    async fn record_bulk_action(
        &self,
        action_type: BulkActionType,
        filter_used: serde_json::Value,
        snapshots: &[ChunkSnapshot],
    ) -> Result<BulkAction>;

    async fn get_bulk_action(&self, id: Uuid) -> Result<BulkAction>;

    async fn mark_bulk_action_undone(&self, id: Uuid) -> Result<()>;
}

/// Validate a status transition against the monotonic lifecycle.
pub(crate) fn check_transition(from: ChunkStatus, to: ChunkStatus) -> Result<()> {
    if to.rank() < from.rank() {
        return Err(crate::error::Error::Conflict(format!(
            "status cannot regress from {from} to {to}"
        )));
    }
    Ok(())
}

/// Merge two tag sets, preserving first-seen order.
pub(crate) fn union_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = existing.to_vec();
    for tag in incoming {
        if !out.iter().any(|t| t == tag) {
            out.push(tag.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transition_forward_ok() {
        assert!(check_transition(ChunkStatus::Inbox, ChunkStatus::Processed).is_ok());
        assert!(check_transition(ChunkStatus::Processed, ChunkStatus::Processed).is_ok());
        assert!(check_transition(ChunkStatus::Inbox, ChunkStatus::Archived).is_ok());
    }

    #[test]
    fn test_check_transition_regression_conflicts() {
        let err = check_transition(ChunkStatus::Archived, ChunkStatus::Inbox).unwrap_err();
        assert!(matches!(err, crate::error::Error::Conflict(_)));
    }

    #[test]
    fn test_union_tags_dedupes_and_keeps_order() {
        let merged = union_tags(
            &["bug".to_string(), "auth".to_string()],
            &["auth".to_string(), "urgent".to_string()],
        );
        assert_eq!(merged, vec!["bug", "auth", "urgent"]);
    }

    #[test]
    fn test_page_clamp() {
        let page = Page {
            limit: 5000,
            offset: -3,
        }
        .clamped();
        assert_eq!(page.limit, MAX_PAGE_LIMIT);
        assert_eq!(page.offset, 0);
    }
}
