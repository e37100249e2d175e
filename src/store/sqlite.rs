//! SQLite-backed [`Store`] implementation.
//!
//! Wraps a [`SqlitePool`] and translates every `Store` method into SQL
//! against the schema created by [`crate::migrate`]. Uuids and statuses are
//! stored as TEXT, tags and audit snapshots as JSON TEXT, timestamps as
//! unix seconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    BulkAction, BulkActionType, Chunk, ChunkDraft, ChunkPatch, ChunkSnapshot, ChunkStatus, Entity,
    EntityDraft, Project,
};

use super::{
    check_transition, ChunkFilter, ChunkSearch, EntityQuery, Page, ProjectPatch, Store,
};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const CHUNK_COLUMNS: &str = "id, content, summary, project_id, status, tags, source, \
                             token_count, created_at, updated_at, trace_id";

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::StorageUnavailable(format!("bad uuid {raw}: {e}")))
}

fn parse_status(raw: &str) -> Result<ChunkStatus> {
    ChunkStatus::parse(raw)
        .ok_or_else(|| Error::StorageUnavailable(format!("unknown chunk status: {raw}")))
}

fn parse_tags(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let tags: String = row.try_get("tags")?;
    let project_id: Option<String> = row.try_get("project_id")?;
    Ok(Chunk {
        id: parse_uuid(&id)?,
        content: row.try_get("content")?,
        summary: row.try_get("summary")?,
        project_id: project_id.as_deref().map(parse_uuid).transpose()?,
        status: parse_status(&status)?,
        tags: parse_tags(&tags),
        source: row.try_get("source")?,
        token_count: row.try_get("token_count")?,
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
        trace_id: row.try_get("trace_id")?,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let id: String = row.try_get("id")?;
    let last_compaction_at: Option<i64> = row.try_get("last_compaction_at")?;
    Ok(Project {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        context_summary: row.try_get("context_summary")?,
        compaction_depth: row.try_get("compaction_depth")?,
        last_compaction_at: last_compaction_at.map(from_ts),
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
    })
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    let id: String = row.try_get("id")?;
    let chunk_id: String = row.try_get("chunk_id")?;
    let project_id: Option<String> = row.try_get("project_id")?;
    let entity_type: String = row.try_get("entity_type")?;
    Ok(Entity {
        id: parse_uuid(&id)?,
        chunk_id: parse_uuid(&chunk_id)?,
        project_id: project_id.as_deref().map(parse_uuid).transpose()?,
        entity_type: crate::models::EntityType::parse(&entity_type)
            .ok_or_else(|| Error::StorageUnavailable(format!("unknown entity type: {entity_type}")))?,
        value: row.try_get("value")?,
        context: row.try_get("context")?,
        confidence: row.try_get("confidence")?,
        created_at: from_ts(row.try_get("created_at")?),
    })
}

/// A bind value for dynamically assembled WHERE clauses.
enum Bind {
    Text(String),
    Int(i64),
}

fn apply_binds<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(s) => query.bind(s.as_str()),
            Bind::Int(i) => query.bind(*i),
        };
    }
    query
}

fn filter_clauses(filter: &ChunkFilter) -> (String, Vec<Bind>) {
    let mut sql = String::from(" WHERE 1=1");
    let mut binds = Vec::new();
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        binds.push(Bind::Text(status.as_str().to_string()));
    }
    if let Some(project_id) = filter.project_id {
        sql.push_str(" AND project_id = ?");
        binds.push(Bind::Text(project_id.to_string()));
    }
    if let Some(ref tag) = filter.tag {
        // Tags are a JSON array; match the quoted element.
        sql.push_str(" AND tags LIKE ?");
        binds.push(Bind::Text(format!("%\"{}\"%", tag.replace('%', ""))));
    }
    if let Some(ref source) = filter.source {
        sql.push_str(" AND source = ?");
        binds.push(Bind::Text(source.clone()));
    }
    if let Some(ref trace_id) = filter.trace_id {
        sql.push_str(" AND trace_id = ?");
        binds.push(Bind::Text(trace_id.clone()));
    }
    (sql, binds)
}

fn search_clauses(search: &ChunkSearch) -> (String, Vec<Bind>) {
    let mut sql = String::from(" WHERE 1=1");
    let mut binds = Vec::new();
    if let Some(ref query) = search.query {
        sql.push_str(
            " AND (LOWER(content) LIKE ? OR (summary IS NOT NULL AND LOWER(summary) LIKE ?))",
        );
        let pattern = format!("%{}%", query.to_lowercase());
        binds.push(Bind::Text(pattern.clone()));
        binds.push(Bind::Text(pattern));
    }
    if let Some(status) = search.status {
        sql.push_str(" AND status = ?");
        binds.push(Bind::Text(status.as_str().to_string()));
    }
    if let Some(project_id) = search.project_id {
        sql.push_str(" AND project_id = ?");
        binds.push(Bind::Text(project_id.to_string()));
    }
    if let Some(after) = search.created_after {
        sql.push_str(" AND created_at >= ?");
        binds.push(Bind::Int(after.timestamp()));
    }
    if let Some(before) = search.created_before {
        sql.push_str(" AND created_at <= ?");
        binds.push(Bind::Int(before.timestamp()));
    }
    if search.entity_type.is_some() || search.entity_value.is_some() {
        sql.push_str(" AND EXISTS (SELECT 1 FROM entities e WHERE e.chunk_id = chunks.id");
        if let Some(entity_type) = search.entity_type {
            sql.push_str(" AND e.entity_type = ?");
            binds.push(Bind::Text(entity_type.as_str().to_string()));
        }
        if let Some(ref value) = search.entity_value {
            sql.push_str(" AND e.value = ?");
            binds.push(Bind::Text(value.clone()));
        }
        sql.push(')');
    }
    (sql, binds)
}

#[async_trait]
impl Store for SqliteStore {
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

        let tags_json = serde_json::to_string(&chunk.tags)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO chunks (id, content, summary, project_id, status, tags, source,
                                token_count, created_at, updated_at, trace_id)
            VALUES (?, ?, NULL, ?, ?, ?, ?, NULL, ?, ?, ?)
            "#,
        )
        .bind(chunk.id.to_string())
        .bind(&chunk.content)
        .bind(chunk.project_id.map(|p| p.to_string()))
        .bind(chunk.status.as_str())
        .bind(&tags_json)
        .bind(&chunk.source)
        .bind(chunk.created_at.timestamp())
        .bind(chunk.updated_at.timestamp())
        .bind(&chunk.trace_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(chunk),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(Error::Conflict(format!("chunk id collision: {}", chunk.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_chunk(&self, id: Uuid) -> Result<Chunk> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => chunk_from_row(&row),
            None => Err(Error::not_found("chunk", id)),
        }
    }

    async fn update_chunk(&self, id: Uuid, patch: &ChunkPatch) -> Result<Chunk> {
        let current = self.get_chunk(id).await?;

        let status = match patch.status {
            Some(next) => {
                check_transition(current.status, next)?;
                next
            }
            None => current.status,
        };
        let summary = patch.summary.clone().or(current.summary);
        let tags = patch.tags.clone().unwrap_or(current.tags);
        let token_count = patch.token_count.or(current.token_count);
        let project_id = match patch.project_id {
            Some(next) => next,
            None => current.project_id,
        };
        let updated_at = current.updated_at.max(Utc::now());

        let tags_json =
            serde_json::to_string(&tags).map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE chunks
            SET summary = ?, status = ?, tags = ?, token_count = ?, project_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&summary)
        .bind(status.as_str())
        .bind(&tags_json)
        .bind(token_count)
        .bind(project_id.map(|p| p.to_string()))
        .bind(updated_at.timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        self.get_chunk(id).await
    }

    async fn restore_chunk(&self, snapshot: &ChunkSnapshot) -> Result<Chunk> {
        let tags_json = serde_json::to_string(&snapshot.tags)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE chunks SET status = ?, tags = ?, updated_at = MAX(updated_at, ?) WHERE id = ?",
        )
        .bind(snapshot.status.as_str())
        .bind(&tags_json)
        .bind(Utc::now().timestamp())
        .bind(snapshot.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("chunk", snapshot.id));
        }
        self.get_chunk(snapshot.id).await
    }

    async fn list_chunks(&self, filter: &ChunkFilter, page: Page) -> Result<(Vec<Chunk>, i64)> {
        let page = page.clamped();
        let (clauses, binds) = filter_clauses(filter);

        let count_sql = format!("SELECT COUNT(*) FROM chunks{clauses}");
        let total: i64 = apply_binds(sqlx::query(&count_sql), &binds)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        let list_sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks{clauses} \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let mut list_binds = binds;
        list_binds.push(Bind::Int(page.limit));
        list_binds.push(Bind::Int(page.offset));
        let rows = apply_binds(sqlx::query(&list_sql), &list_binds)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(chunk_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn search_chunks(&self, search: &ChunkSearch, page: Page) -> Result<(Vec<Chunk>, i64)> {
        let page = page.clamped();
        let (clauses, binds) = search_clauses(search);

        let count_sql = format!("SELECT COUNT(*) FROM chunks{clauses}");
        let total: i64 = apply_binds(sqlx::query(&count_sql), &binds)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        let list_sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks{clauses} \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let mut list_binds = binds;
        list_binds.push(Bind::Int(page.limit));
        list_binds.push(Bind::Int(page.offset));
        let rows = apply_binds(sqlx::query(&list_sql), &list_binds)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(chunk_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn all_chunk_content(&self, project_id: Option<Uuid>) -> Result<Vec<(Uuid, String)>> {
        let rows = match project_id {
            Some(project_id) => {
                sqlx::query(
                    "SELECT id, content FROM chunks WHERE status != 'deleted' AND project_id = ? \
                     ORDER BY id",
                )
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, content FROM chunks WHERE status != 'deleted' ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let content: String = row.try_get("content")?;
                Ok((parse_uuid(&id)?, content))
            })
            .collect()
    }

    async fn count_by_status(&self) -> Result<Vec<(ChunkStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM chunks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = Vec::new();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.push((parse_status(&status)?, n));
        }
        counts.sort_by_key(|(status, _)| status.rank());
        Ok(counts)
    }

    async fn oldest_inbox(&self) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE status = 'inbox' \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn inbox_chunk_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM chunks WHERE status = 'inbox' ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn processed_chunks(&self, project_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE status = 'processed' AND project_id = ? \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(project_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
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
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, context_summary, compaction_depth,
                                  last_compaction_at, created_at, updated_at)
            VALUES (?, ?, ?, NULL, 0, NULL, ?, ?)
            "#,
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.created_at.timestamp())
        .bind(project.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => project_from_row(&row),
            None => Err(Error::not_found("project", id)),
        }
    }

    async fn update_project(&self, id: Uuid, patch: &ProjectPatch) -> Result<Project> {
        let current = self.get_project(id).await?;
        let name = match patch.name {
            Some(ref name) => {
                if name.trim().is_empty() || name.len() > 255 {
                    return Err(Error::Validation(
                        "project name must be non-empty and at most 255 chars".to_string(),
                    ));
                }
                name.clone()
            }
            None => current.name,
        };
        let description = match patch.description {
            Some(ref description) => description.clone(),
            None => current.description,
        };
        sqlx::query(
            "UPDATE projects SET name = ?, description = ?, updated_at = MAX(updated_at, ?) \
             WHERE id = ?",
        )
        .bind(&name)
        .bind(&description)
        .bind(Utc::now().timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        self.get_project(id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn complete_compaction(
        &self,
        project_id: Uuid,
        summary: &str,
        chunk_ids: &[Uuid],
        depth_cap: i64,
    ) -> Result<Project> {
        let now = Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE projects
            SET context_summary = ?,
                compaction_depth = MIN(compaction_depth + 1, ?),
                last_compaction_at = ?,
                updated_at = MAX(updated_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(summary)
        .bind(depth_cap)
        .bind(now)
        .bind(now)
        .bind(project_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("project", project_id));
        }

        for chunk_id in chunk_ids {
            sqlx::query(
                "UPDATE chunks SET status = 'compacted', updated_at = MAX(updated_at, ?) \
                 WHERE id = ? AND status = 'processed'",
            )
            .bind(now)
            .bind(chunk_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        self.get_project(project_id).await
    }

    async fn bulk_create_entities(&self, drafts: &[EntityDraft]) -> Result<Vec<Entity>> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        let mut created = Vec::new();

        for draft in drafts {
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
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO entities
                    (id, chunk_id, project_id, entity_type, value, context, confidence, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entity.id.to_string())
            .bind(entity.chunk_id.to_string())
            .bind(entity.project_id.map(|p| p.to_string()))
            .bind(entity.entity_type.as_str())
            .bind(&entity.value)
            .bind(&entity.context)
            .bind(entity.confidence)
            .bind(entity.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                created.push(entity);
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(created)
    }

    async fn list_entities_by_project(
        &self,
        project_id: Uuid,
        query: &EntityQuery,
        page: Page,
    ) -> Result<Vec<Entity>> {
        let page = page.clamped();
        let mut sql = String::from("SELECT * FROM entities WHERE project_id = ?");
        let mut binds = vec![Bind::Text(project_id.to_string())];
        if let Some(entity_type) = query.entity_type {
            sql.push_str(" AND entity_type = ?");
            binds.push(Bind::Text(entity_type.as_str().to_string()));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND created_at >= ?");
            binds.push(Bind::Int(since.timestamp()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        binds.push(Bind::Int(page.limit));
        binds.push(Bind::Int(page.offset));

        let rows = apply_binds(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await?;
        let mut entities = rows
            .iter()
            .map(entity_from_row)
            .collect::<Result<Vec<_>>>()?;
        // REAL comparison with a bound f64 is unreliable across drivers;
        // filter in code instead.
        if let Some(min_confidence) = query.min_confidence {
            entities.retain(|e| e.confidence >= min_confidence);
        }
        Ok(entities)
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
        let affected_json = serde_json::to_string(&action.affected_ids)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        let previous_json = serde_json::to_string(&action.previous_state)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO bulk_actions
                (id, action_type, filter_used, affected_ids, previous_state,
                 affected_count, undone, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(action.id.to_string())
        .bind(action.action_type.as_str())
        .bind(action.filter_used.to_string())
        .bind(&affected_json)
        .bind(&previous_json)
        .bind(action.affected_count)
        .bind(action.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(action)
    }

    async fn get_bulk_action(&self, id: Uuid) -> Result<BulkAction> {
        let row = sqlx::query("SELECT * FROM bulk_actions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| Error::not_found("bulk action", id))?;

        let raw_id: String = row.try_get("id")?;
        let action_type: String = row.try_get("action_type")?;
        let filter_used: String = row.try_get("filter_used")?;
        let affected_ids: String = row.try_get("affected_ids")?;
        let previous_state: String = row.try_get("previous_state")?;
        let undone: i64 = row.try_get("undone")?;

        Ok(BulkAction {
            id: parse_uuid(&raw_id)?,
            action_type: BulkActionType::parse(&action_type).ok_or_else(|| {
                Error::StorageUnavailable(format!("unknown bulk action type: {action_type}"))
            })?,
            filter_used: serde_json::from_str(&filter_used)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?,
            affected_ids: serde_json::from_str(&affected_ids)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?,
            previous_state: serde_json::from_str(&previous_state)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?,
            affected_count: row.try_get("affected_count")?,
            undone: undone != 0,
            created_at: from_ts(row.try_get("created_at")?),
        })
    }

    async fn mark_bulk_action_undone(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE bulk_actions SET undone = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("bulk action", id));
        }
        Ok(())
    }
}
