//! Core data models used throughout Komorebi.
//!
//! These types represent the chunks, projects, entities, and audit records
//! that flow through the capture and compaction pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a chunk. Transitions are monotonic: a chunk only
/// moves forward through this sequence, except when a bulk-action undo
/// restores an earlier snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Inbox,
    Processed,
    Compacted,
    Archived,
    Deleted,
}

impl ChunkStatus {
    /// Position in the forward lifecycle. Used to reject regressions.
    pub fn rank(self) -> u8 {
        match self {
            ChunkStatus::Inbox => 0,
            ChunkStatus::Processed => 1,
            ChunkStatus::Compacted => 2,
            ChunkStatus::Archived => 3,
            ChunkStatus::Deleted => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Inbox => "inbox",
            ChunkStatus::Processed => "processed",
            ChunkStatus::Compacted => "compacted",
            ChunkStatus::Archived => "archived",
            ChunkStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbox" => Some(ChunkStatus::Inbox),
            "processed" => Some(ChunkStatus::Processed),
            "compacted" => Some(ChunkStatus::Compacted),
            "archived" => Some(ChunkStatus::Archived),
            "deleted" => Some(ChunkStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic captured unit: raw text plus processing metadata.
///
/// `content` is immutable after creation; `summary` and `token_count` are
/// written by the compactor when the chunk reaches `processed`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: Uuid,
    pub content: String,
    pub summary: Option<String>,
    pub project_id: Option<Uuid>,
    pub status: ChunkStatus,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub token_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optional cross-session grouping reference.
    pub trace_id: Option<String>,
}

/// Input to capture, before an id or timestamps exist.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDraft {
    pub content: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Partial update applied to a chunk. `id` and `content` are not
/// patchable; status changes must move forward in rank.
#[derive(Debug, Clone, Default)]
pub struct ChunkPatch {
    pub summary: Option<String>,
    pub status: Option<ChunkStatus>,
    pub tags: Option<Vec<String>>,
    pub token_count: Option<i64>,
    pub project_id: Option<Option<Uuid>>,
}

/// A grouping of chunks with a rolling, hierarchical summary.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Top-of-pyramid summary produced by compaction.
    pub context_summary: Option<String>,
    /// Completed reduction levels above the raw chunk tier. Capped.
    pub compaction_depth: i64,
    pub last_compaction_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of structured fact extracted from a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Error,
    Url,
    ToolId,
    Decision,
    CodeRef,
    SemanticTag,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Error => "ERROR",
            EntityType::Url => "URL",
            EntityType::ToolId => "TOOL_ID",
            EntityType::Decision => "DECISION",
            EntityType::CodeRef => "CODE_REF",
            EntityType::SemanticTag => "SEMANTIC_TAG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ERROR" => Some(EntityType::Error),
            "URL" => Some(EntityType::Url),
            "TOOL_ID" => Some(EntityType::ToolId),
            "DECISION" => Some(EntityType::Decision),
            "CODE_REF" => Some(EntityType::CodeRef),
            "SEMANTIC_TAG" => Some(EntityType::SemanticTag),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured fact extracted from a chunk. Immutable once written;
/// removed with its chunk.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: Uuid,
    pub chunk_id: Uuid,
    /// Denormalised for project-scoped filtering.
    pub project_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub value: String,
    /// Short window of surrounding text from the source chunk.
    pub context: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// A not-yet-persisted entity candidate.
#[derive(Debug, Clone)]
pub struct EntityDraft {
    pub chunk_id: Uuid,
    pub project_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub value: String,
    pub context: Option<String>,
    pub confidence: f64,
}

/// Kind of auditable batch mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkActionType {
    Tag,
    Archive,
    Delete,
    Restore,
}

impl BulkActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkActionType::Tag => "tag",
            BulkActionType::Archive => "archive",
            BulkActionType::Delete => "delete",
            BulkActionType::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tag" => Some(BulkActionType::Tag),
            "archive" => Some(BulkActionType::Archive),
            "delete" => Some(BulkActionType::Delete),
            "restore" => Some(BulkActionType::Restore),
            _ => None,
        }
    }
}

impl std::fmt::Display for BulkActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chunk snapshot taken before a bulk mutation, sufficient to reverse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub id: Uuid,
    pub status: ChunkStatus,
    pub tags: Vec<String>,
}

/// Audit record of a bulk mutation. Immutable except for `undone`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkAction {
    pub id: Uuid,
    pub action_type: BulkActionType,
    pub filter_used: serde_json::Value,
    pub affected_ids: Vec<Uuid>,
    pub previous_state: Vec<ChunkSnapshot>,
    pub affected_count: i64,
    pub undone: bool,
    pub created_at: DateTime<Utc>,
}
