//! Non-blocking capture.
//!
//! `capture` validates, persists the chunk at `inbox`, announces it on the
//! bus, hands a work item to the pool, and returns. Nothing downstream of
//! the storage write can fail the call except queue backpressure, and that
//! is checked before the write: a rejected capture leaves no orphan row.

use std::sync::Arc;

use tracing::debug;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::models::{Chunk, ChunkDraft};
use crate::store::Store;
use crate::worker::{Task, TaskQueue};

pub struct CaptureService {
    store: Arc<dyn Store>,
    bus: EventBus,
    queue: TaskQueue,
    max_content_bytes: usize,
}

impl CaptureService {
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        queue: TaskQueue,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            store,
            bus,
            queue,
            max_content_bytes: config.max_content_bytes,
        }
    }

    /// Accept a chunk. Synchronous work is validation plus one insert; all
    /// processing happens in the background.
    pub async fn capture(&self, draft: ChunkDraft) -> Result<Chunk> {
        if draft.content.trim().is_empty() {
            return Err(Error::Validation("content must not be empty".to_string()));
        }
        if draft.content.len() > self.max_content_bytes {
            return Err(Error::Validation(format!(
                "content exceeds {} bytes",
                self.max_content_bytes
            )));
        }

        // Claim a queue slot first; QueueFull must not leave a stored chunk
        // that was never enqueued.
        let permit = self.queue.reserve().await?;

        let chunk = self.store.create_chunk(&draft).await?;
        self.bus
            .publish(Event::chunk_created(chunk.id, chunk.project_id));
        permit.send(Task::ProcessChunk(chunk.id));

        debug!(chunk_id = %chunk.id, "chunk captured");
        Ok(chunk)
    }
}
