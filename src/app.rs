//! Service wiring.
//!
//! Builds the full pipeline — store, bus, worker pool, compactor,
//! extractor, capture, bulk actions, MCP — from a [`Config`] and hands the
//! assembled [`App`] to the CLI and HTTP layers. Storage and the LLM client
//! are injected, never looked up ambiently, so tests swap in in-memory and
//! scripted substitutes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bulk::BulkService;
use crate::capture::CaptureService;
use crate::compactor::Compactor;
use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::extractor::EntityExtractor;
use crate::llm::LlmClient;
use crate::mcp::{McpRegistry, McpService};
use crate::store::Store;
use crate::worker::{Task, TaskHandler, TaskQueue, WorkerPool};

/// Routes queued tasks to the compactor and extractor.
struct Pipeline {
    compactor: Arc<Compactor>,
    extractor: Arc<EntityExtractor>,
}

#[async_trait]
impl TaskHandler for Pipeline {
    async fn handle(&self, task: Task, cancel: &CancellationToken) -> Result<()> {
        match task {
            Task::ProcessChunk(id) => self.compactor.process_chunk(id, cancel).await,
            Task::ExtractEntities(id) => self.extractor.extract(id).await,
            Task::CompactProject(id) => self.compactor.compact_project(id, cancel).await,
        }
    }
}

/// The assembled service.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub capture: Arc<CaptureService>,
    pub bulk: Arc<BulkService>,
    pub compactor: Arc<Compactor>,
    pub mcp: Option<Arc<McpService>>,
    pub registry: Option<Arc<McpRegistry>>,
    queue: TaskQueue,
    pool: WorkerPool,
}

impl App {
    /// Wire everything up. `with_mcp` is off for one-shot CLI commands that
    /// have no business spawning tool servers.
    pub async fn start(
        config: Config,
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        with_mcp: bool,
    ) -> Result<App> {
        let bus = EventBus::new(config.events.subscriber_buffer);
        let mut pool = WorkerPool::new(&config.workers);
        let queue = pool.queue();

        let compactor = Arc::new(Compactor::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            bus.clone(),
            queue.clone(),
            config.compaction.clone(),
            config.llm.context_window_tokens,
        ));
        let extractor = Arc::new(EntityExtractor::new(
            Arc::clone(&store),
            llm,
            bus.clone(),
            config.extraction.clone(),
        ));
        pool.start_workers(Arc::new(Pipeline {
            compactor: Arc::clone(&compactor),
            extractor,
        }));

        let capture = Arc::new(CaptureService::new(
            Arc::clone(&store),
            bus.clone(),
            queue.clone(),
            &config.capture,
        ));
        let bulk = Arc::new(BulkService::new(Arc::clone(&store), bus.clone()));

        let (registry, mcp) = if with_mcp {
            let registry = McpRegistry::start(&config.mcp, bus.clone()).await?;
            let service = Arc::new(McpService::new(
                Arc::clone(&registry),
                Arc::clone(&capture),
            ));
            (Some(registry), Some(service))
        } else {
            (None, None)
        };

        let app = App {
            config,
            store,
            bus,
            capture,
            bulk,
            compactor,
            mcp,
            registry,
            queue,
            pool,
        };
        app.requeue_inbox().await?;
        Ok(app)
    }

    /// Re-enqueue chunks abandoned at `inbox` by a previous run. There is
    /// no durable queue; storage is the only record of unfinished work.
    async fn requeue_inbox(&self) -> Result<()> {
        let ids = self.store.inbox_chunk_ids().await?;
        if ids.is_empty() {
            return Ok(());
        }
        info!(count = ids.len(), "re-enqueuing inbox chunks");
        for id in ids {
            if let Err(e) = self.queue.enqueue(Task::ProcessChunk(id)).await {
                warn!(chunk_id = %id, "startup re-enqueue failed: {e}");
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop the workers within their grace window, then
    /// close every MCP session so no child outlives the process.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        if let Some(registry) = &self.registry {
            registry.shutdown_all().await;
        }
        info!("komorebi stopped");
    }
}
