//! Configuration parsing and validation.
//!
//! Komorebi is configured via a TOML file (default: `komo.toml`). Every
//! operational knob lives in the file; a small set of environment variables
//! override the file for deployment ergonomics:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `DATABASE_URL` | `[db] url` |
//! | `LLM_HOST` | `[llm] host` |
//! | `LLM_MODEL` | `[llm] model` |
//! | `LLM_TIMEOUT_SECONDS` | `[llm] timeout_secs` |
//! | `MCP_CONFIG_PATH` | `[mcp] config_path` |
//! | `WORKER_COUNT` | `[workers] count` |
//! | `QUEUE_CAPACITY` | `[workers] queue_capacity` |
//! | `CONTEXT_THRESHOLD_BYTES` | `[compaction] context_threshold_bytes` |
//! | `MAX_COMPACTION_DEPTH` | `[compaction] max_depth` |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite database URL or bare path.
    #[serde(default = "default_db_url")]
    pub url: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
        }
    }
}

fn default_db_url() -> String {
    "data/komorebi.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_host")]
    pub host: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Upper bound on pooled idle connections to the inference server.
    #[serde(default = "default_llm_pool")]
    pub max_idle_connections: usize,
    /// Assumed model context window, in tokens. Drives the compaction trigger.
    #[serde(default = "default_context_window")]
    pub context_window_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: default_llm_host(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_idle_connections: default_llm_pool(),
            context_window_tokens: default_context_window(),
        }
    }
}

fn default_llm_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.2".to_string()
}
fn default_llm_timeout() -> u64 {
    30
}
fn default_llm_pool() -> usize {
    8
}
fn default_context_window() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long `enqueue` waits on a full queue before reporting QueueFull.
    #[serde(default = "default_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,
    /// Grace window for in-flight tasks on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            enqueue_wait_ms: default_enqueue_wait_ms(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_enqueue_wait_ms() -> u64 {
    50
}
fn default_shutdown_grace() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompactionConfig {
    /// Minimum processed chunks before a project compaction runs.
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
    /// Concatenated-summary size above which reduction recurses.
    #[serde(default = "default_context_threshold")]
    pub context_threshold_bytes: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Reduce batch size at each level of the pyramid.
    #[serde(default = "default_reduce_batch")]
    pub reduce_batch: usize,
    /// Cooldown after a compaction before the trigger fires again.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Processed-chunk count that forces the trigger regardless of tokens.
    #[serde(default = "default_trigger_count")]
    pub trigger_chunk_count: usize,
    /// Length of the deterministic fallback summary when the LLM is offline.
    #[serde(default = "default_fallback_chars")]
    pub fallback_summary_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_batch: default_min_batch(),
            context_threshold_bytes: default_context_threshold(),
            max_depth: default_max_depth(),
            reduce_batch: default_reduce_batch(),
            cooldown_secs: default_cooldown(),
            trigger_chunk_count: default_trigger_count(),
            fallback_summary_chars: default_fallback_chars(),
        }
    }
}

fn default_min_batch() -> usize {
    5
}
fn default_context_threshold() -> usize {
    12_000
}
fn default_max_depth() -> u32 {
    3
}
fn default_reduce_batch() -> usize {
    5
}
fn default_cooldown() -> u64 {
    300
}
fn default_trigger_count() -> usize {
    20
}
fn default_fallback_chars() -> usize {
    240
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Confidence floor for LLM-extracted entities.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Confidence floor applied when the LLM is offline and the rule-based
    /// path runs. A deployment-wide choice, not a per-call one.
    #[serde(default = "default_fallback_confidence")]
    pub fallback_min_confidence: f64,
    /// Width of the context window stored with each entity.
    #[serde(default = "default_context_chars")]
    pub context_window_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            fallback_min_confidence: default_fallback_confidence(),
            context_window_chars: default_context_chars(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.6
}
fn default_fallback_confidence() -> f64 {
    0.5
}
fn default_context_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Maximum accepted content size in bytes.
    #[serde(default = "default_max_content")]
    pub max_content_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content(),
        }
    }
}

fn default_max_content() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Per-subscriber buffer size; the oldest event is dropped on overflow.
    #[serde(default = "default_event_buffer")]
    pub subscriber_buffer: usize,
    /// SSE keep-alive comment interval.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_event_buffer(),
            keepalive_secs: default_keepalive(),
        }
    }
}

fn default_event_buffer() -> usize {
    100
}
fn default_keepalive() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpConfig {
    /// Path to the declarative servers file (JSON).
    #[serde(default = "default_mcp_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Grace window between the shutdown request and a forced kill.
    #[serde(default = "default_mcp_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            config_path: default_mcp_path(),
            call_timeout_secs: default_call_timeout(),
            shutdown_grace_secs: default_mcp_grace(),
        }
    }
}

fn default_mcp_path() -> PathBuf {
    PathBuf::from("mcp_servers.json")
}
fn default_call_timeout() -> u64 {
    30
}
fn default_mcp_grace() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".to_string(),
        }
    }
}

/// Load configuration from a TOML file, apply environment overrides, and
/// validate. A missing file yields the built-in defaults (still subject to
/// the environment).
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config)?;

    if config.workers.count == 0 {
        anyhow::bail!("workers.count must be > 0");
    }
    if config.workers.queue_capacity == 0 {
        anyhow::bail!("workers.queue_capacity must be > 0");
    }
    if config.compaction.min_batch < 2 {
        anyhow::bail!("compaction.min_batch must be >= 2");
    }
    if config.compaction.reduce_batch < 2 {
        anyhow::bail!("compaction.reduce_batch must be >= 2");
    }
    if !(0.0..=1.0).contains(&config.extraction.min_confidence) {
        anyhow::bail!("extraction.min_confidence must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.extraction.fallback_min_confidence) {
        anyhow::bail!("extraction.fallback_min_confidence must be in [0.0, 1.0]");
    }
    if config.capture.max_content_bytes == 0 {
        anyhow::bail!("capture.max_content_bytes must be > 0");
    }

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.db.url = v;
    }
    if let Ok(v) = std::env::var("LLM_HOST") {
        config.llm.host = v;
    }
    if let Ok(v) = std::env::var("LLM_MODEL") {
        config.llm.model = v;
    }
    if let Ok(v) = std::env::var("LLM_TIMEOUT_SECONDS") {
        config.llm.timeout_secs = v
            .parse()
            .with_context(|| format!("LLM_TIMEOUT_SECONDS is not a number: {v}"))?;
    }
    if let Ok(v) = std::env::var("MCP_CONFIG_PATH") {
        config.mcp.config_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("WORKER_COUNT") {
        config.workers.count = v
            .parse()
            .with_context(|| format!("WORKER_COUNT is not a number: {v}"))?;
    }
    if let Ok(v) = std::env::var("QUEUE_CAPACITY") {
        config.workers.queue_capacity = v
            .parse()
            .with_context(|| format!("QUEUE_CAPACITY is not a number: {v}"))?;
    }
    if let Ok(v) = std::env::var("CONTEXT_THRESHOLD_BYTES") {
        config.compaction.context_threshold_bytes = v
            .parse()
            .with_context(|| format!("CONTEXT_THRESHOLD_BYTES is not a number: {v}"))?;
    }
    if let Ok(v) = std::env::var("MAX_COMPACTION_DEPTH") {
        config.compaction.max_depth = v
            .parse()
            .with_context(|| format!("MAX_COMPACTION_DEPTH is not a number: {v}"))?;
    }
    Ok(())
}
