//! Entity extraction.
//!
//! Asks the LLM for strict-JSON entities and falls back to rule-based
//! regexes whenever the model is offline or returns something unparseable.
//! Candidates below the confidence floor are discarded, duplicates within a
//! call collapse on `(type, value)`, and the storage layer's unique key
//! makes the whole pass idempotent. Extraction never touches chunk status.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compactor::project_anchor;
use crate::config::ExtractionConfig;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::llm::LlmClient;
use crate::models::{Chunk, EntityDraft, EntityType};
use crate::store::Store;

/// Confidence assigned to regex-extracted URLs.
const URL_CONFIDENCE: f64 = 0.95;

/// Confidence assigned to the stack-trace heuristic.
const ERROR_CONFIDENCE: f64 = 0.5;

/// Confidence assigned to quoted command lines.
const TOOL_ID_CONFIDENCE: f64 = 0.7;

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("static regex"))
}

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:\w+\s)?(?:[Ee]rror|ERROR|panicked at|Traceback|Exception)[:\s].*$")
            .expect("static regex")
    })
}

fn error_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][A-Za-z]*(?:Error|Exception)\b").expect("static regex"))
}

fn tool_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`\n]{2,120})`").expect("static regex"))
}

/// Shape the LLM is asked to return in JSON mode.
#[derive(Debug, Deserialize)]
struct LlmExtraction {
    #[serde(default)]
    errors: Vec<LlmCandidate>,
    #[serde(default)]
    urls: Vec<LlmCandidate>,
    #[serde(default)]
    tool_ids: Vec<LlmCandidate>,
    #[serde(default)]
    semantic_tags: Vec<LlmCandidate>,
}

#[derive(Debug, Deserialize)]
struct LlmCandidate {
    value: String,
    #[serde(default = "default_candidate_confidence")]
    confidence: f64,
}

fn default_candidate_confidence() -> f64 {
    0.8
}

/// One extraction candidate before persistence.
#[derive(Debug, Clone)]
struct Candidate {
    entity_type: EntityType,
    value: String,
    confidence: f64,
}

pub struct EntityExtractor {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    bus: EventBus,
    config: ExtractionConfig,
}

impl EntityExtractor {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        bus: EventBus,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            store,
            llm,
            bus,
            config,
        }
    }

    /// Extract and persist entities for one chunk, then publish
    /// `entities.extracted` with per-type counts.
    pub async fn extract(&self, chunk_id: Uuid) -> Result<()> {
        let chunk = self.store.get_chunk(chunk_id).await?;

        let (candidates, threshold) = if self.llm.available().await {
            let project = match chunk.project_id {
                Some(project_id) => self.store.get_project(project_id).await.ok(),
                None => None,
            };
            let anchor = project_anchor(project.as_ref());
            match self.llm.extract_entities(&chunk.content, anchor.as_deref()).await {
                Ok(raw) => match serde_json::from_str::<LlmExtraction>(&raw) {
                    Ok(extraction) => {
                        (llm_candidates(extraction), self.config.min_confidence)
                    }
                    Err(e) => {
                        warn!(%chunk_id, "unparseable extraction response ({e}): {raw}");
                        (rule_based_candidates(&chunk.content), self.config.fallback_min_confidence)
                    }
                },
                Err(e) => {
                    debug!(%chunk_id, "llm extraction unavailable, using rules: {e}");
                    (rule_based_candidates(&chunk.content), self.config.fallback_min_confidence)
                }
            }
        } else {
            (
                rule_based_candidates(&chunk.content),
                self.config.fallback_min_confidence,
            )
        };

        let drafts = self.to_drafts(&chunk, candidates, threshold);
        let created = self.store.bulk_create_entities(&drafts).await?;

        let mut counts: Vec<(&'static str, usize)> = Vec::new();
        for entity in &created {
            match counts.iter_mut().find(|(kind, _)| *kind == entity.entity_type.as_str()) {
                Some((_, n)) => *n += 1,
                None => counts.push((entity.entity_type.as_str(), 1)),
            }
        }
        self.bus.publish(Event::entities_extracted(chunk_id, &counts));
        debug!(%chunk_id, created = created.len(), "entities extracted");
        Ok(())
    }

    fn to_drafts(
        &self,
        chunk: &Chunk,
        candidates: Vec<Candidate>,
        threshold: f64,
    ) -> Vec<EntityDraft> {
        let mut seen: HashSet<(EntityType, String)> = HashSet::new();
        candidates
            .into_iter()
            .filter(|c| c.confidence >= threshold)
            .filter(|c| !c.value.trim().is_empty())
            .filter(|c| seen.insert((c.entity_type, c.value.clone())))
            .map(|c| EntityDraft {
                chunk_id: chunk.id,
                project_id: chunk.project_id,
                entity_type: c.entity_type,
                context: context_window(
                    &chunk.content,
                    &c.value,
                    self.config.context_window_chars,
                ),
                value: c.value,
                confidence: c.confidence,
            })
            .collect()
    }
}

fn llm_candidates(extraction: LlmExtraction) -> Vec<Candidate> {
    let mut out = Vec::new();
    let mut push = |list: Vec<LlmCandidate>, entity_type: EntityType| {
        for c in list {
            out.push(Candidate {
                entity_type,
                value: c.value,
                confidence: c.confidence.clamp(0.0, 1.0),
            });
        }
    };
    push(extraction.errors, EntityType::Error);
    push(extraction.urls, EntityType::Url);
    push(extraction.tool_ids, EntityType::ToolId);
    push(extraction.semantic_tags, EntityType::SemanticTag);
    out
}

fn rule_based_candidates(content: &str) -> Vec<Candidate> {
    let mut out = Vec::new();

    for m in url_re().find_iter(content) {
        out.push(Candidate {
            entity_type: EntityType::Url,
            value: m.as_str().trim_end_matches(['.', ',', ';']).to_string(),
            confidence: URL_CONFIDENCE,
        });
    }

    for m in error_line_re().find_iter(content) {
        let value: String = m.as_str().trim().chars().take(200).collect();
        out.push(Candidate {
            entity_type: EntityType::Error,
            value,
            confidence: ERROR_CONFIDENCE,
        });
    }
    for m in error_name_re().find_iter(content) {
        out.push(Candidate {
            entity_type: EntityType::Error,
            value: m.as_str().to_string(),
            confidence: ERROR_CONFIDENCE,
        });
    }

    for caps in tool_id_re().captures_iter(content) {
        if let Some(inner) = caps.get(1) {
            out.push(Candidate {
                entity_type: EntityType::ToolId,
                value: inner.as_str().trim().to_string(),
                confidence: TOOL_ID_CONFIDENCE,
            });
        }
    }

    out
}

/// Up to `width` characters of context centred on the first occurrence of
/// `value`, or nothing when the value never appears verbatim.
fn context_window(content: &str, value: &str, width: usize) -> Option<String> {
    let start = content.find(value)?;
    let half = width.saturating_sub(value.chars().count()) / 2;

    let prefix_start = content[..start]
        .char_indices()
        .rev()
        .nth(half.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let suffix_end = content[start + value.len()..]
        .char_indices()
        .nth(half)
        .map(|(i, _)| start + value.len() + i)
        .unwrap_or(content.len());

    Some(content[prefix_start..suffix_end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::ChunkDraft;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct ScriptedLlm {
        online: bool,
        response: Option<String>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn available(&self) -> bool {
            self.online
        }

        async fn summarise(&self, _: &str, _: u32, _: Option<&str>) -> Result<String> {
            Err(Error::Unavailable("llm"))
        }

        async fn generate(&self, _: &str, _: Option<&str>, _: u32) -> Result<String> {
            Err(Error::Unavailable("llm"))
        }

        async fn extract_entities(&self, _: &str, _: Option<&str>) -> Result<String> {
            self.response
                .clone()
                .ok_or(Error::Unavailable("llm"))
        }

        async fn stream_summary(&self, _: &str) -> Result<BoxStream<'static, Result<String>>> {
            Err(Error::Unavailable("llm"))
        }
    }

    #[test]
    fn test_rule_based_url_and_error() {
        let content = "Error: NullPointer at line 42. See https://docs.example.com";
        let candidates = rule_based_candidates(content);
        assert!(candidates
            .iter()
            .any(|c| c.entity_type == EntityType::Url
                && c.value == "https://docs.example.com"
                && c.confidence == 0.95));
        assert!(candidates
            .iter()
            .any(|c| c.entity_type == EntityType::Error && c.confidence == 0.5));
    }

    #[test]
    fn test_rule_based_tool_id_from_backticks() {
        let candidates = rule_based_candidates("ran `cargo build --release` twice");
        assert!(candidates
            .iter()
            .any(|c| c.entity_type == EntityType::ToolId && c.value == "cargo build --release"));
    }

    #[test]
    fn test_context_window_bounds() {
        let content = format!("{} https://example.com {}", "a".repeat(200), "b".repeat(200));
        let window = context_window(&content, "https://example.com", 100).unwrap();
        assert!(window.chars().count() <= 100 + "https://example.com".len());
        assert!(window.contains("https://example.com"));
    }

    #[test]
    fn test_context_window_missing_value() {
        assert_eq!(context_window("no match here", "absent", 100), None);
    }

    #[tokio::test]
    async fn test_llm_json_path_filters_low_confidence() {
        let response = serde_json::json!({
            "errors": [{"value": "OOMKilled", "confidence": 0.9}],
            "urls": [],
            "tool_ids": [{"value": "kubectl describe pod", "confidence": 0.3}],
            "semantic_tags": [{"value": "kubernetes", "confidence": 0.7}],
        })
        .to_string();
        let store = Arc::new(MemoryStore::new());
        let chunk = store
            .create_chunk(&ChunkDraft {
                content: "pod died: OOMKilled, kubernetes".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let extractor = EntityExtractor::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(ScriptedLlm {
                online: true,
                response: Some(response),
            }),
            bus,
            ExtractionConfig::default(),
        );
        extractor.extract(chunk.id).await.unwrap();

        // The 0.3-confidence tool id is below the 0.6 floor.
        let event = sub.recv().await;
        assert_eq!(event.kind, crate::events::EventKind::EntitiesExtracted);
        assert_eq!(event.payload["ERROR"], 1);
        assert_eq!(event.payload["SEMANTIC_TAG"], 1);
        assert!(event.payload.get("TOOL_ID").is_none());
    }

    #[tokio::test]
    async fn test_unparseable_llm_response_falls_back_to_rules() {
        let store = Arc::new(MemoryStore::new());
        let chunk = store
            .create_chunk(&ChunkDraft {
                content: "broken output but see https://fallback.example".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let extractor = EntityExtractor::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(ScriptedLlm {
                online: true,
                response: Some("sure! here are the entities you asked for".to_string()),
            }),
            bus,
            ExtractionConfig::default(),
        );
        extractor.extract(chunk.id).await.unwrap();

        let event = sub.recv().await;
        assert_eq!(event.payload["URL"], 1);
    }

    #[tokio::test]
    async fn test_offline_extraction_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let chunk = store
            .create_chunk(&ChunkDraft {
                content: "Error: NullPointer at line 42. See https://docs.example.com".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let extractor = EntityExtractor::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(ScriptedLlm {
                online: false,
                response: None,
            }),
            bus,
            ExtractionConfig::default(),
        );
        extractor.extract(chunk.id).await.unwrap();
        let first = sub.recv().await;
        assert_eq!(first.payload["URL"], 1);
        assert!(first.payload["ERROR"].as_u64().unwrap_or(0) >= 1);

        // Second run creates nothing new.
        extractor.extract(chunk.id).await.unwrap();
        let second = sub.recv().await;
        assert!(second.payload.as_object().unwrap().is_empty());
    }
}
