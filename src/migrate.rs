//! Database schema migrations.
//!
//! Creates all required tables (chunks, projects, entities, bulk_actions)
//! and ensures idempotent execution. Designed to be run via `komo init`;
//! `komo serve` also runs it on startup so a fresh deployment needs no
//! separate step.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Projects table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            context_summary TEXT,
            compaction_depth INTEGER NOT NULL DEFAULT 0,
            last_compaction_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            summary TEXT,
            project_id TEXT,
            status TEXT NOT NULL DEFAULT 'inbox',
            tags TEXT NOT NULL DEFAULT '[]',
            source TEXT,
            token_count INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            trace_id TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Entities table. The UNIQUE key makes re-extraction idempotent.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            chunk_id TEXT NOT NULL,
            project_id TEXT,
            entity_type TEXT NOT NULL,
            value TEXT NOT NULL,
            context TEXT,
            confidence REAL NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(chunk_id, entity_type, value),
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Bulk-action audit log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bulk_actions (
            id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            filter_used TEXT NOT NULL DEFAULT '{}',
            affected_ids TEXT NOT NULL DEFAULT '[]',
            previous_state TEXT NOT NULL DEFAULT '[]',
            affected_count INTEGER NOT NULL,
            undone INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_status_created_at ON chunks(status, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_project_id ON chunks(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_chunk_id ON entities(chunk_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_project_type ON entities(project_id, entity_type)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bulk_actions_created_at ON bulk_actions(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
