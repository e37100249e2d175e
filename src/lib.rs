//! # Komorebi
//!
//! **A personal cognitive-infrastructure service: capture at typing speed,
//! compact in the background.**
//!
//! Komorebi ingests raw text chunks without blocking the writer,
//! progressively summarises them through a recursive map–reduce pipeline
//! backed by a local LLM, extracts structured entities, and aggregates
//! external tool output as new chunks through an MCP muxer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────┐   ┌───────────┐   ┌───────────┐
//! │ Capture │──▶│ Worker Pool  │──▶│ Compactor │──▶│  SQLite   │
//! │ (HTTP)  │   │ bounded FIFO │   │ Extractor │   │  (sqlx)   │
//! └────┬────┘   └──────────────┘   └─────┬─────┘   └───────────┘
//!      │                                 │
//!      │        ┌──────────────┐   ┌─────▼─────┐
//!      └───────▶│  Event Bus   │◀──│    MCP    │
//!               │  (SSE out)   │   │ registry  │
//!               └──────────────┘   └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Capture** validates a [`models::ChunkDraft`], persists it at
//!    `inbox`, and hands a work item to the pool — all inside the request.
//! 2. A **worker** runs the [`compactor`], which summarises the chunk
//!    (LLM, or a deterministic fallback when the model is offline) and
//!    advances it to `processed`.
//! 3. The [`extractor`] mines entities (errors, URLs, tool ids, tags) with
//!    schema-validated JSON extraction and a regex fallback.
//! 4. When a project accumulates enough processed material, the compactor
//!    folds summaries into a project context summary, recursing through
//!    bounded reduction levels.
//! 5. [`mcp`] sessions aggregate external tools; captured tool results
//!    re-enter the same pipeline as fresh chunks.
//! 6. Every transition fans out on the [`events`] bus to SSE subscribers.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`models`] | Core data types: `Chunk`, `Project`, `Entity`, `BulkAction` |
//! | [`error`] | Semantic error taxonomy |
//! | [`store`] | Repository trait plus SQLite and in-memory backends |
//! | [`events`] | Bounded pub/sub bus behind the SSE feed |
//! | [`llm`] | Local LLM client (Ollama-compatible HTTP) |
//! | [`capture`] | Non-blocking ingestion |
//! | [`worker`] | Bounded task queue and worker pool |
//! | [`compactor`] | Recursive map–reduce summarisation |
//! | [`extractor`] | Entity extraction with rule-based fallback |
//! | [`bulk`] | Auditable bulk mutations with timed undo |
//! | [`similarity`] | On-demand TF-IDF related-chunk ranking |
//! | [`mcp`] | MCP servers: config, stdio client, registry, service |
//! | [`app`] | Wiring of the full pipeline |
//! | [`server`] | Axum HTTP adapter and SSE endpoint |
//! | [`db`] | SQLite connection management |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod bulk;
pub mod capture;
pub mod compactor;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod extractor;
pub mod llm;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod server;
pub mod similarity;
pub mod store;
pub mod worker;
