//! Recursive map–reduce compaction.
//!
//! `process_chunk` turns raw captures into summarised, token-counted chunks;
//! `compact_project` folds processed summaries into a project-level context
//! summary, recursing through bounded reduction levels when the material
//! outgrows the context threshold. The pipeline never stalls on an LLM
//! outage: chunk processing falls back to a deterministic summary, and a
//! failed project compaction leaves storage untouched and reports a
//! `compaction.failed` event.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CompactionConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::llm::{estimate_tokens, LlmClient};
use crate::models::{ChunkPatch, ChunkStatus, Project};
use crate::store::Store;
use crate::worker::{Task, TaskQueue};

/// Separator between summaries fed into a reduce step.
const REDUCE_SEPARATOR: &str = "\n---\n";

/// Share of the model context window that triggers compaction.
const TRIGGER_WINDOW_SHARE: f64 = 0.75;

/// Token budget for a single chunk summary.
const SUMMARY_MAX_TOKENS: u32 = 240;

/// Token budget for reduce-level generations.
const REDUCE_MAX_TOKENS: u32 = 500;

pub struct Compactor {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    bus: EventBus,
    queue: TaskQueue,
    config: CompactionConfig,
    context_window_tokens: usize,
    project_locks: std::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        bus: EventBus,
        queue: TaskQueue,
        config: CompactionConfig,
        context_window_tokens: usize,
    ) -> Self {
        Self {
            store,
            llm,
            bus,
            queue,
            config,
            context_window_tokens,
            project_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Summarise one inbox chunk and advance it to `processed`. A chunk in
    /// any other status is left alone. Afterwards, entity extraction is
    /// queued and the project's compaction trigger is evaluated.
    pub async fn process_chunk(&self, chunk_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let chunk = self.store.get_chunk(chunk_id).await?;
        if chunk.status != ChunkStatus::Inbox {
            debug!(%chunk_id, status = %chunk.status, "process_chunk no-op");
            return Ok(());
        }

        let project = match chunk.project_id {
            Some(project_id) => Some(self.store.get_project(project_id).await?),
            None => None,
        };
        let anchor = project_anchor(project.as_ref());

        if cancel.is_cancelled() {
            debug!(%chunk_id, "abandoning before summarisation");
            return Ok(());
        }

        let summary = if self.llm.available().await {
            match self
                .llm
                .summarise(&chunk.content, SUMMARY_MAX_TOKENS, anchor.as_deref())
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(%chunk_id, "llm summarise failed, using fallback: {e}");
                    fallback_summary(&chunk.content, self.config.fallback_summary_chars)
                }
            }
        } else {
            fallback_summary(&chunk.content, self.config.fallback_summary_chars)
        };

        let updated = self
            .store
            .update_chunk(
                chunk_id,
                &ChunkPatch {
                    summary: Some(summary),
                    token_count: Some(estimate_tokens(&chunk.content)),
                    status: Some(ChunkStatus::Processed),
                    ..Default::default()
                },
            )
            .await?;
        self.bus
            .publish(Event::chunk_updated(chunk_id, updated.status));

        // Extraction is fire-and-forget; a full queue only delays it.
        if let Err(e) = self.queue.enqueue(Task::ExtractEntities(chunk_id)).await {
            warn!(%chunk_id, "could not queue entity extraction: {e}");
        }

        if let Some(project) = project {
            if self.should_compact(&project).await? {
                if let Err(e) = self.queue.enqueue(Task::CompactProject(project.id)).await {
                    warn!(project_id = %project.id, "could not queue compaction: {e}");
                }
            }
        }
        Ok(())
    }

    /// Compaction trigger heuristic: enough processed material (by token
    /// estimate or by count) and outside the cooldown window.
    pub async fn should_compact(&self, project: &Project) -> Result<bool> {
        if let Some(last) = project.last_compaction_at {
            let elapsed = Utc::now().signed_duration_since(last);
            if elapsed.num_seconds() < self.config.cooldown_secs as i64 {
                return Ok(false);
            }
        }

        let processed = self.store.processed_chunks(project.id).await?;
        if processed.len() < self.config.min_batch {
            return Ok(false);
        }

        let token_sum: i64 = processed
            .iter()
            .map(|c| c.token_count.unwrap_or_else(|| estimate_tokens(&c.content)))
            .sum();
        let budget = (self.context_window_tokens as f64 * TRIGGER_WINDOW_SHARE) as i64;

        Ok(token_sum > budget || processed.len() > self.config.trigger_chunk_count)
    }

    /// Fold a project's processed summaries into its context summary.
    ///
    /// Holds the project's compaction mutex for the whole call so two
    /// reductions can never interleave. The summary write and the chunk
    /// status sweep commit together; an LLM failure publishes
    /// `compaction.failed` and changes nothing.
    pub async fn compact_project(&self, project_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let lock = {
            let mut locks = self.project_locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(project_id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        let project = self.store.get_project(project_id).await?;
        let chunks = self.store.processed_chunks(project_id).await?;
        if chunks.len() < self.config.min_batch {
            debug!(%project_id, count = chunks.len(), "below minimum batch, skipping");
            return Ok(());
        }

        let anchor = project_anchor(Some(&project));
        let summaries: Vec<String> = chunks
            .iter()
            .map(|c| c.summary.clone().unwrap_or_else(|| c.content.clone()))
            .collect();
        let chunk_ids: Vec<Uuid> = chunks.iter().map(|c| c.id).collect();
        let joined = summaries.join(REDUCE_SEPARATOR);

        if cancel.is_cancelled() {
            debug!(%project_id, "abandoning compaction before reduction");
            return Ok(());
        }

        let reduced = if joined.len() > self.config.context_threshold_bytes {
            self.recursive_reduce(summaries, 0, anchor.as_deref(), cancel)
                .await
        } else {
            self.llm
                .generate(&final_reduce_prompt(&joined), anchor.as_deref(), REDUCE_MAX_TOKENS)
                .await
        };

        let summary = match reduced {
            Ok(summary) => summary,
            Err(e) => {
                warn!(%project_id, "compaction failed: {e}");
                self.bus
                    .publish(Event::compaction_failed(project_id, &e.to_string()));
                return Err(e);
            }
        };

        let updated = self
            .store
            .complete_compaction(
                project_id,
                &summary,
                &chunk_ids,
                self.config.max_depth as i64,
            )
            .await?;
        info!(
            %project_id,
            depth = updated.compaction_depth,
            chunks = chunk_ids.len(),
            "compaction level complete"
        );
        self.bus.publish(Event::compaction_level_complete(
            project_id,
            updated.compaction_depth,
            chunk_ids.len(),
        ));
        Ok(())
    }

    /// Reduce `texts` in batches, recursing while the concatenation still
    /// exceeds the context threshold. Depth is bounded: at the cap the last
    /// reduce is accepted even if oversize, so recursion always terminates.
    pub fn recursive_reduce<'a>(
        &'a self,
        texts: Vec<String>,
        depth: u32,
        anchor: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            debug!(depth, inputs = texts.len(), "reduce level");
            let mut mid_summaries = Vec::new();
            for batch in texts.chunks(self.config.reduce_batch) {
                if cancel.is_cancelled() {
                    return Err(Error::Unavailable("compaction cancelled"));
                }
                let prompt = batch_reduce_prompt(&batch.join(REDUCE_SEPARATOR));
                let summary = self.llm.generate(&prompt, anchor, REDUCE_MAX_TOKENS).await?;
                mid_summaries.push(summary);
            }

            let joined = mid_summaries.join(REDUCE_SEPARATOR);
            if joined.len() > self.config.context_threshold_bytes
                && depth + 1 < self.config.max_depth
            {
                return self
                    .recursive_reduce(mid_summaries, depth + 1, anchor, cancel)
                    .await;
            }

            self.llm
                .generate(&final_reduce_prompt(&joined), anchor, REDUCE_MAX_TOKENS)
                .await
        }
        .boxed()
    }
}

/// The preamble bound to every LLM prompt for a project, suppressing drift
/// between reduction levels. Composed once from project metadata and treated
/// as opaque text everywhere below.
pub(crate) fn project_anchor(project: Option<&Project>) -> Option<String> {
    project.map(|p| match p.description.as_deref() {
        Some(goal) => format!(
            "You are summarising material from the project \"{}\", whose goal is: {}. \
             Stay within that frame.",
            p.name, goal
        ),
        None => format!(
            "You are summarising material from the project \"{}\". Stay within that frame.",
            p.name
        ),
    })
}

fn batch_reduce_prompt(joined: &str) -> String {
    format!(
        "Merge the following summaries into one shorter summary. Preserve decisions, \
         errors, and identifiers.\n\n{joined}"
    )
}

fn final_reduce_prompt(joined: &str) -> String {
    format!(
        "Write a single project context summary from the notes below. Preserve decisions, \
         open questions, and identifiers.\n\n{joined}"
    )
}

/// Deterministic summary used when the LLM is offline: the first
/// `max_chars` characters of the content, trimmed back to a word boundary.
pub fn fallback_summary(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => cut[..pos].trim_end().to_string(),
        _ => cut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::events::EventKind;
    use crate::models::ChunkDraft;
    use crate::store::memory::MemoryStore;
    use crate::worker::{TaskHandler, WorkerPool};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted LLM: counts calls, optionally offline or failing.
    struct FakeLlm {
        online: AtomicBool,
        fail_generate: AtomicBool,
        generate_calls: AtomicUsize,
    }

    impl FakeLlm {
        fn online() -> Self {
            Self {
                online: AtomicBool::new(true),
                fail_generate: AtomicBool::new(false),
                generate_calls: AtomicUsize::new(0),
            }
        }

        fn offline() -> Self {
            let llm = Self::online();
            llm.online.store(false, Ordering::SeqCst);
            llm
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn available(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn summarise(
            &self,
            content: &str,
            _max_tokens: u32,
            _system: Option<&str>,
        ) -> Result<String> {
            if !self.online.load(Ordering::SeqCst) {
                return Err(Error::Unavailable("llm"));
            }
            Ok(format!("summary of: {}", fallback_summary(content, 40)))
        }

        async fn generate(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _max_tokens: u32,
        ) -> Result<String> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_generate.load(Ordering::SeqCst) {
                return Err(Error::Unavailable("llm"));
            }
            Ok("reduced summary".to_string())
        }

        async fn extract_entities(&self, _content: &str, _system: Option<&str>) -> Result<String> {
            Err(Error::Unavailable("llm"))
        }

        async fn stream_summary(
            &self,
            _content: &str,
        ) -> Result<BoxStream<'static, Result<String>>> {
            Err(Error::Unavailable("llm"))
        }
    }

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn handle(&self, _task: Task, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn compactor_with(
        store: Arc<MemoryStore>,
        llm: Arc<FakeLlm>,
        config: CompactionConfig,
    ) -> (Compactor, WorkerPool, EventBus) {
        let pool = WorkerPool::start(&WorkerConfig::default(), Arc::new(Noop));
        let bus = EventBus::new(64);
        let compactor = Compactor::new(
            store,
            llm,
            bus.clone(),
            pool.queue(),
            config,
            8192,
        );
        (compactor, pool, bus)
    }

    async fn seed_chunk(store: &MemoryStore, content: &str, project_id: Option<Uuid>) -> Uuid {
        store
            .create_chunk(&ChunkDraft {
                content: content.to_string(),
                project_id,
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_fallback_summary_word_boundary() {
        let content = "Error: NullPointer at line 42. See https://docs.example.com for details";
        let summary = fallback_summary(content, 40);
        assert!(summary.chars().count() <= 40);
        assert!(!summary.ends_with(' '));
        // Never cuts inside a word
        assert!(content.starts_with(&summary));
        assert!(content.as_bytes().get(summary.len()).map(|b| b.is_ascii_whitespace()).unwrap_or(true));
    }

    #[test]
    fn test_fallback_summary_short_content_untouched() {
        assert_eq!(fallback_summary("short note", 240), "short note");
    }

    #[tokio::test]
    async fn test_process_chunk_online() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        let (compactor, pool, bus) =
            compactor_with(Arc::clone(&store), llm, CompactionConfig::default());
        let mut sub = bus.subscribe();

        let id = seed_chunk(&store, "investigate flaky websocket reconnect", None).await;
        compactor
            .process_chunk(id, &CancellationToken::new())
            .await
            .unwrap();

        let chunk = store.get_chunk(id).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Processed);
        assert!(chunk.summary.as_deref().unwrap().starts_with("summary of:"));
        assert!(chunk.token_count.unwrap() > 0);

        let event = sub.recv().await;
        assert_eq!(event.kind, EventKind::ChunkUpdated);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_chunk_offline_uses_fallback() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::offline());
        let (compactor, pool, _bus) =
            compactor_with(Arc::clone(&store), llm, CompactionConfig::default());

        let content = format!("leading words {}", "x".repeat(500));
        let id = seed_chunk(&store, &content, None).await;
        compactor
            .process_chunk(id, &CancellationToken::new())
            .await
            .unwrap();

        let chunk = store.get_chunk(id).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Processed);
        let summary = chunk.summary.unwrap();
        assert!(summary.chars().count() <= 240);
        assert!(content.starts_with(&summary));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_chunk_is_noop_after_processed() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        let (compactor, pool, _bus) =
            compactor_with(Arc::clone(&store), llm, CompactionConfig::default());

        let id = seed_chunk(&store, "one", None).await;
        let cancel = CancellationToken::new();
        compactor.process_chunk(id, &cancel).await.unwrap();
        let first = store.get_chunk(id).await.unwrap();
        compactor.process_chunk(id, &cancel).await.unwrap();
        let second = store.get_chunk(id).await.unwrap();
        assert_eq!(first.summary, second.summary);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_compact_project_below_min_batch_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        let (compactor, pool, _bus) =
            compactor_with(Arc::clone(&store), Arc::clone(&llm), CompactionConfig::default());

        let project = store.create_project("tiny", None).await.unwrap();
        let cancel = CancellationToken::new();
        for i in 0..3 {
            let id = seed_chunk(&store, &format!("note {i}"), Some(project.id)).await;
            compactor.process_chunk(id, &cancel).await.unwrap();
        }
        compactor.compact_project(project.id, &cancel).await.unwrap();

        let loaded = store.get_project(project.id).await.unwrap();
        assert_eq!(loaded.compaction_depth, 0);
        assert!(loaded.context_summary.is_none());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_compact_project_single_level() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        let (compactor, pool, bus) =
            compactor_with(Arc::clone(&store), Arc::clone(&llm), CompactionConfig::default());
        let mut sub = bus.subscribe();

        let project = store.create_project("p", Some("ship the thing")).await.unwrap();
        let cancel = CancellationToken::new();
        let mut ids = Vec::new();
        for i in 0..6 {
            let id = seed_chunk(&store, &format!("note number {i}"), Some(project.id)).await;
            compactor.process_chunk(id, &cancel).await.unwrap();
            ids.push(id);
        }
        compactor.compact_project(project.id, &cancel).await.unwrap();

        let loaded = store.get_project(project.id).await.unwrap();
        assert_eq!(loaded.compaction_depth, 1);
        assert_eq!(loaded.context_summary.as_deref(), Some("reduced summary"));
        assert!(loaded.last_compaction_at.is_some());
        for id in ids {
            assert_eq!(store.get_chunk(id).await.unwrap().status, ChunkStatus::Compacted);
        }
        // Events: chunk.updated per chunk, then compaction.level.complete
        let mut saw_complete = false;
        while let Some(event) = sub.try_recv() {
            if event.kind == EventKind::CompactionLevelComplete {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversize_input_forces_recursive_levels() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::offline());
        let config = CompactionConfig {
            context_threshold_bytes: 2000,
            ..Default::default()
        };
        let (compactor, pool, _bus) =
            compactor_with(Arc::clone(&store), Arc::clone(&llm), config);

        let project = store.create_project("big", None).await.unwrap();
        let cancel = CancellationToken::new();
        // 50 chunks of ~1 KB; offline fallback keeps ~240 chars per summary,
        // so the joined text blows well past the 2 KB threshold.
        for i in 0..50 {
            let id = seed_chunk(
                &store,
                &format!("entry {i} {}", "lorem ipsum dolor sit amet ".repeat(40)),
                Some(project.id),
            )
            .await;
            compactor.process_chunk(id, &cancel).await.unwrap();
        }
        // Reduction itself needs the LLM.
        llm.online.store(true, Ordering::SeqCst);
        compactor.compact_project(project.id, &cancel).await.unwrap();

        let loaded = store.get_project(project.id).await.unwrap();
        assert!(loaded.compaction_depth >= 1);
        // 50 summaries in batches of 5 is 10 mid-level reduces plus at
        // least a final reduce.
        assert!(llm.generate_calls.load(Ordering::SeqCst) > 10);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_recursive_reduce_terminates_at_depth_cap() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        // Threshold of zero keeps every level "oversize"; only the depth
        // cap can stop recursion.
        let config = CompactionConfig {
            context_threshold_bytes: 0,
            max_depth: 3,
            ..Default::default()
        };
        let (compactor, pool, _bus) = compactor_with(store, Arc::clone(&llm), config);

        let texts: Vec<String> = (0..100).map(|i| format!("text {i}")).collect();
        let out = compactor
            .recursive_reduce(texts, 0, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "reduced summary");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_compaction_failure_leaves_project_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        llm.fail_generate.store(true, Ordering::SeqCst);
        let (compactor, pool, bus) =
            compactor_with(Arc::clone(&store), llm, CompactionConfig::default());
        let mut sub = bus.subscribe();

        let project = store.create_project("fragile", None).await.unwrap();
        let cancel = CancellationToken::new();
        let mut ids = Vec::new();
        for i in 0..6 {
            let id = seed_chunk(&store, &format!("note {i}"), Some(project.id)).await;
            compactor.process_chunk(id, &cancel).await.unwrap();
            ids.push(id);
        }
        let err = compactor.compact_project(project.id, &cancel).await;
        assert!(err.is_err());

        let loaded = store.get_project(project.id).await.unwrap();
        assert_eq!(loaded.compaction_depth, 0);
        assert!(loaded.context_summary.is_none());
        for id in ids {
            assert_eq!(store.get_chunk(id).await.unwrap().status, ChunkStatus::Processed);
        }
        let mut saw_failed = false;
        while let Some(event) = sub.try_recv() {
            if event.kind == EventKind::CompactionFailed {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_respects_cooldown_and_count() {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(FakeLlm::online());
        let config = CompactionConfig {
            trigger_chunk_count: 4,
            ..Default::default()
        };
        let (compactor, pool, _bus) =
            compactor_with(Arc::clone(&store), Arc::clone(&llm), config);

        let project = store.create_project("t", None).await.unwrap();
        let cancel = CancellationToken::new();
        for i in 0..5 {
            let id = seed_chunk(&store, &format!("note {i}"), Some(project.id)).await;
            compactor.process_chunk(id, &cancel).await.unwrap();
        }
        let loaded = store.get_project(project.id).await.unwrap();
        assert!(compactor.should_compact(&loaded).await.unwrap());

        // A just-compacted project sits in cooldown.
        compactor.compact_project(project.id, &cancel).await.unwrap();
        let after = store.get_project(project.id).await.unwrap();
        assert!(!compactor.should_compact(&after).await.unwrap());
        pool.shutdown().await;
    }
}
