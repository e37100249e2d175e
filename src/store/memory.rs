//! In-memory [`Store`] implementation for tests and ephemeral runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Search is brute-force over all stored chunks, which is fine at the
//! corpus sizes this backend is meant for.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    BulkAction, BulkActionType, Chunk, ChunkDraft, ChunkPatch, ChunkSnapshot, ChunkStatus, Entity,
    EntityDraft, Project,
};

use super::{
    check_transition, ChunkFilter, ChunkSearch, EntityQuery, Page, ProjectPatch, Store,
};

/// In-memory store. Clone-free; share it behind `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<Uuid, Chunk>>,
    projects: RwLock<HashMap<Uuid, Project>>,
    entities: RwLock<Vec<Entity>>,
    bulk_actions: RwLock<HashMap<Uuid, BulkAction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_newest_first(items: &mut [Chunk]) {
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

fn matches_filter(chunk: &Chunk, filter: &ChunkFilter) -> bool {
    if let Some(status) = filter.status {
        if chunk.status != status {
            return false;
        }
    }
    if let Some(project_id) = filter.project_id {
        if chunk.project_id != Some(project_id) {
            return false;
        }
    }
    if let Some(ref tag) = filter.tag {
        if !chunk.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(ref source) = filter.source {
        if chunk.source.as_deref() != Some(source.as_str()) {
            return false;
        }
    }
    if let Some(ref trace_id) = filter.trace_id {
        if chunk.trace_id.as_deref() != Some(trace_id.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_chunk(&self, draft: &ChunkDraft) -> Result<Chunk> {
        let now = Utc::now();
        let chunk = Chunk {
            id: Uuid::new_v4(),
            content: draft.content.clone(),
            summary: None,
            project_id: draft.project_id,
            status: ChunkStatus::Inbox,
            tags: draft.tags.clone(),
            source: draft.source.clone(),
            token_count: None,
            created_at: now,
            updated_at: now,
            trace_id: draft.trace_id.clone(),
        };
        let mut chunks = self.chunks.write().unwrap();
        if chunks.contains_key(&chunk.id) {
            return Err(Error::Conflict(format!("chunk id collision: {}", chunk.id)));
        }
        chunks.insert(chunk.id, chunk.clone());
        Ok(chunk)
    }

    async fn get_chunk(&self, id: Uuid) -> Result<Chunk> {
        self.chunks
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("chunk", id))
    }

    async fn update_chunk(&self, id: Uuid, patch: &ChunkPatch) -> Result<Chunk> {
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks.get_mut(&id).ok_or_else(|| Error::not_found("chunk", id))?;

        if let Some(status) = patch.status {
            check_transition(chunk.status, status)?;
            chunk.status = status;
        }
        if let Some(ref summary) = patch.summary {
            chunk.summary = Some(summary.clone());
        }
        if let Some(ref tags) = patch.tags {
            chunk.tags = tags.clone();
        }
        if let Some(token_count) = patch.token_count {
            chunk.token_count = Some(token_count);
        }
        if let Some(project_id) = patch.project_id {
            chunk.project_id = project_id;
        }
        // updated_at never moves backwards
        chunk.updated_at = chunk.updated_at.max(Utc::now());
        Ok(chunk.clone())
    }

    async fn restore_chunk(&self, snapshot: &ChunkSnapshot) -> Result<Chunk> {
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks
            .get_mut(&snapshot.id)
            .ok_or_else(|| Error::not_found("chunk", snapshot.id))?;
        chunk.status = snapshot.status;
        chunk.tags = snapshot.tags.clone();
        chunk.updated_at = chunk.updated_at.max(Utc::now());
        Ok(chunk.clone())
    }

    async fn list_chunks(&self, filter: &ChunkFilter, page: Page) -> Result<(Vec<Chunk>, i64)> {
        let page = page.clamped();
        let chunks = self.chunks.read().unwrap();
        let mut matched: Vec<Chunk> = chunks
            .values()
            .filter(|c| matches_filter(c, filter))
            .cloned()
            .collect();
        let total = matched.len() as i64;
        sort_newest_first(&mut matched);
        let items = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn search_chunks(&self, search: &ChunkSearch, page: Page) -> Result<(Vec<Chunk>, i64)> {
        let page = page.clamped();
        let needle = search.query.as_ref().map(|q| q.to_lowercase());
        let entities = self.entities.read().unwrap();
        let chunks = self.chunks.read().unwrap();

        let mut matched: Vec<Chunk> = chunks
            .values()
            .filter(|c| {
                if let Some(ref needle) = needle {
                    let in_content = c.content.to_lowercase().contains(needle);
                    let in_summary = c
                        .summary
                        .as_ref()
                        .map(|s| s.to_lowercase().contains(needle))
                        .unwrap_or(false);
                    if !in_content && !in_summary {
                        return false;
                    }
                }
                if let Some(status) = search.status {
                    if c.status != status {
                        return false;
                    }
                }
                if let Some(project_id) = search.project_id {
                    if c.project_id != Some(project_id) {
                        return false;
                    }
                }
                if let Some(after) = search.created_after {
                    if c.created_at < after {
                        return false;
                    }
                }
                if let Some(before) = search.created_before {
                    if c.created_at > before {
                        return false;
                    }
                }
                if search.entity_type.is_some() || search.entity_value.is_some() {
                    let exists = entities.iter().any(|e| {
                        e.chunk_id == c.id
                            && search.entity_type.map(|t| e.entity_type == t).unwrap_or(true)
                            && search
                                .entity_value
                                .as_ref()
                                .map(|v| &e.value == v)
                                .unwrap_or(true)
                    });
                    if !exists {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        let total = matched.len() as i64;
        sort_newest_first(&mut matched);
        let items = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn all_chunk_content(&self, project_id: Option<Uuid>) -> Result<Vec<(Uuid, String)>> {
        let chunks = self.chunks.read().unwrap();
        let mut pairs: Vec<(Uuid, String)> = chunks
            .values()
            .filter(|c| c.status != ChunkStatus::Deleted)
            .filter(|c| project_id.map(|p| c.project_id == Some(p)).unwrap_or(true))
            .map(|c| (c.id, c.content.clone()))
            .collect();
        pairs.sort_by_key(|(id, _)| *id);
        Ok(pairs)
    }

    async fn count_by_status(&self) -> Result<Vec<(ChunkStatus, i64)>> {
        let chunks = self.chunks.read().unwrap();
        let mut counts: HashMap<ChunkStatus, i64> = HashMap::new();
        for chunk in chunks.values() {
            *counts.entry(chunk.status).or_insert(0) += 1;
        }
        let mut out: Vec<(ChunkStatus, i64)> = counts.into_iter().collect();
        out.sort_by_key(|(status, _)| status.rank());
        Ok(out)
    }

    async fn oldest_inbox(&self) -> Result<Option<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Inbox)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn inbox_chunk_ids(&self) -> Result<Vec<Uuid>> {
        let chunks = self.chunks.read().unwrap();
        let mut inbox: Vec<&Chunk> = chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Inbox)
            .collect();
        inbox.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(inbox.into_iter().map(|c| c.id).collect())
    }

    async fn processed_chunks(&self, project_id: Uuid) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        let mut processed: Vec<Chunk> = chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Processed && c.project_id == Some(project_id))
            .cloned()
            .collect();
        processed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(processed)
    }

    async fn create_project(&self, name: &str, description: Option<&str>) -> Result<Project> {
        if name.trim().is_empty() || name.len() > 255 {
            return Err(Error::Validation(
                "project name must be non-empty and at most 255 chars".to_string(),
            ));
        }
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(|d| d.to_string()),
            context_summary: None,
            compaction_depth: 0,
            last_compaction_at: None,
            created_at: now,
            updated_at: now,
        };
        self.projects
            .write()
            .unwrap()
            .insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.projects
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("project", id))
    }

    async fn update_project(&self, id: Uuid, patch: &ProjectPatch) -> Result<Project> {
        let mut projects = self.projects.write().unwrap();
        let project = projects
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("project", id))?;
        if let Some(ref name) = patch.name {
            if name.trim().is_empty() || name.len() > 255 {
                return Err(Error::Validation(
                    "project name must be non-empty and at most 255 chars".to_string(),
                ));
            }
            project.name = name.clone();
        }
        if let Some(ref description) = patch.description {
            project.description = description.clone();
        }
        project.updated_at = project.updated_at.max(Utc::now());
        Ok(project.clone())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let projects = self.projects.read().unwrap();
        let mut out: Vec<Project> = projects.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn complete_compaction(
        &self,
        project_id: Uuid,
        summary: &str,
        chunk_ids: &[Uuid],
        depth_cap: i64,
    ) -> Result<Project> {
        // Validate everything up front so the write is all-or-nothing.
        {
            let chunks = self.chunks.read().unwrap();
            for id in chunk_ids {
                let chunk = chunks.get(id).ok_or_else(|| Error::not_found("chunk", *id))?;
                check_transition(chunk.status, ChunkStatus::Compacted)?;
            }
        }

        let now = Utc::now();
        let project = {
            let mut projects = self.projects.write().unwrap();
            let project = projects
                .get_mut(&project_id)
                .ok_or_else(|| Error::not_found("project", project_id))?;
            project.context_summary = Some(summary.to_string());
            project.compaction_depth = (project.compaction_depth + 1).min(depth_cap);
            project.last_compaction_at = Some(now);
            project.updated_at = project.updated_at.max(now);
            project.clone()
        };

        let mut chunks = self.chunks.write().unwrap();
        for id in chunk_ids {
            if let Some(chunk) = chunks.get_mut(id) {
                chunk.status = ChunkStatus::Compacted;
                chunk.updated_at = chunk.updated_at.max(now);
            }
        }
        Ok(project)
    }

    async fn bulk_create_entities(&self, drafts: &[EntityDraft]) -> Result<Vec<Entity>> {
        let now = Utc::now();
        let mut entities = self.entities.write().unwrap();
        let mut created = Vec::new();
        for draft in drafts {
            let duplicate = entities.iter().any(|e| {
                e.chunk_id == draft.chunk_id
                    && e.entity_type == draft.entity_type
                    && e.value == draft.value
            });
            if duplicate {
                continue;
            }
            let entity = Entity {
                id: Uuid::new_v4(),
                chunk_id: draft.chunk_id,
                project_id: draft.project_id,
                entity_type: draft.entity_type,
                value: draft.value.clone(),
                context: draft.context.clone(),
                confidence: draft.confidence,
                created_at: now,
            };
            entities.push(entity.clone());
            created.push(entity);
        }
        Ok(created)
    }

    async fn list_entities_by_project(
        &self,
        project_id: Uuid,
        query: &EntityQuery,
        page: Page,
    ) -> Result<Vec<Entity>> {
        let page = page.clamped();
        let entities = self.entities.read().unwrap();
        let mut matched: Vec<Entity> = entities
            .iter()
            .filter(|e| e.project_id == Some(project_id))
            .filter(|e| query.entity_type.map(|t| e.entity_type == t).unwrap_or(true))
            .filter(|e| {
                query
                    .min_confidence
                    .map(|m| e.confidence >= m)
                    .unwrap_or(true)
            })
            .filter(|e| query.since.map(|s| e.created_at >= s).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn record_bulk_action(
        &self,
        action_type: BulkActionType,
        filter_used: serde_json::Value,
        snapshots: &[ChunkSnapshot],
    ) -> Result<BulkAction> {
        let action = BulkAction {
            id: Uuid::new_v4(),
            action_type,
            filter_used,
            affected_ids: snapshots.iter().map(|s| s.id).collect(),
            previous_state: snapshots.to_vec(),
            affected_count: snapshots.len() as i64,
            undone: false,
            created_at: Utc::now(),
        };
        self.bulk_actions
            .write()
            .unwrap()
            .insert(action.id, action.clone());
        Ok(action)
    }

    async fn get_bulk_action(&self, id: Uuid) -> Result<BulkAction> {
        self.bulk_actions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("bulk action", id))
    }

    async fn mark_bulk_action_undone(&self, id: Uuid) -> Result<()> {
        let mut actions = self.bulk_actions.write().unwrap();
        let action = actions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("bulk action", id))?;
        action.undone = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(content: &str) -> ChunkDraft {
        ChunkDraft {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get_chunk() {
        let store = MemoryStore::new();
        let chunk = store.create_chunk(&draft("hello world")).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Inbox);
        assert_eq!(chunk.content, "hello world");

        let loaded = store.get_chunk(chunk.id).await.unwrap();
        assert_eq!(loaded.content, "hello world");
        assert_eq!(loaded.created_at, chunk.created_at);
    }

    #[tokio::test]
    async fn test_update_rejects_status_regression() {
        let store = MemoryStore::new();
        let chunk = store.create_chunk(&draft("x")).await.unwrap();
        store
            .update_chunk(
                chunk.id,
                &ChunkPatch {
                    status: Some(ChunkStatus::Processed),
                    summary: Some("s".to_string()),
                    token_count: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update_chunk(
                chunk.id,
                &ChunkPatch {
                    status: Some(ChunkStatus::Inbox),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_restore_chunk_allows_regression() {
        let store = MemoryStore::new();
        let chunk = store.create_chunk(&draft("x")).await.unwrap();
        store
            .update_chunk(
                chunk.id,
                &ChunkPatch {
                    status: Some(ChunkStatus::Archived),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let restored = store
            .restore_chunk(&ChunkSnapshot {
                id: chunk.id,
                status: ChunkStatus::Inbox,
                tags: vec!["kept".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(restored.status, ChunkStatus::Inbox);
        assert_eq!(restored.tags, vec!["kept"]);
    }

    #[tokio::test]
    async fn test_entity_dedupe_is_idempotent() {
        let store = MemoryStore::new();
        let chunk = store.create_chunk(&draft("see https://example.com")).await.unwrap();
        let entity = EntityDraft {
            chunk_id: chunk.id,
            project_id: None,
            entity_type: crate::models::EntityType::Url,
            value: "https://example.com".to_string(),
            context: None,
            confidence: 0.95,
        };

        let first = store.bulk_create_entities(&[entity.clone()]).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.bulk_create_entities(&[entity]).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_search_entity_predicate_no_duplicates() {
        let store = MemoryStore::new();
        let chunk = store.create_chunk(&draft("two urls here")).await.unwrap();
        for url in ["https://a.example", "https://b.example"] {
            store
                .bulk_create_entities(&[EntityDraft {
                    chunk_id: chunk.id,
                    project_id: None,
                    entity_type: crate::models::EntityType::Url,
                    value: url.to_string(),
                    context: None,
                    confidence: 0.95,
                }])
                .await
                .unwrap();
        }

        let (items, total) = store
            .search_chunks(
                &ChunkSearch {
                    entity_type: Some(crate::models::EntityType::Url),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_compaction_caps_depth() {
        let store = MemoryStore::new();
        let project = store.create_project("p", None).await.unwrap();
        for _ in 0..5 {
            store
                .complete_compaction(project.id, "summary", &[], 3)
                .await
                .unwrap();
        }
        let loaded = store.get_project(project.id).await.unwrap();
        assert_eq!(loaded.compaction_depth, 3);
    }
}
