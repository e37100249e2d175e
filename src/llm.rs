//! Local LLM client.
//!
//! Talks to an Ollama-compatible inference server over HTTP. The client owns
//! a pooled connection set and a short-lived health cache; callers treat
//! `Unavailable` as a signal to degrade (fallback summaries, rule-based
//! extraction), never to retry in a loop.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// Approximate chars-per-token ratio used for budget estimates.
const CHARS_PER_TOKEN: usize = 4;

/// How long a health probe result stays valid.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(5);

/// Rough token estimate for trigger heuristics and `token_count`.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() / CHARS_PER_TOKEN).max(1) as i64
}

/// Interface to the local model. All operations may suspend and are
/// cancelled by dropping the future.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Lightweight health probe, cached for a few seconds.
    async fn available(&self) -> bool;

    async fn summarise(
        &self,
        content: &str,
        max_tokens: u32,
        system: Option<&str>,
    ) -> Result<String>;

    async fn generate(&self, prompt: &str, system: Option<&str>, max_tokens: u32)
        -> Result<String>;

    /// JSON-mode extraction. Returns the raw JSON text; the caller parses.
    async fn extract_entities(&self, content: &str, system: Option<&str>) -> Result<String>;

    /// Incremental summary tokens for UI feedback. Finite, not restartable.
    async fn stream_summary(&self, content: &str) -> Result<BoxStream<'static, Result<String>>>;
}

/// HTTP client for an Ollama-compatible server.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout_secs: u64,
    health: Mutex<Option<(Instant, bool)>>,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.max_idle_connections)
            .build()
            .map_err(|e| {
                debug!("reqwest client build failed: {e}");
                Error::Unavailable("llm client init")
            })?;
        Ok(Self {
            client,
            base_url: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
            health: Mutex::new(None),
        })
    }

    fn map_request_error(&self, operation: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                operation: operation.to_string(),
                seconds: self.timeout_secs,
            }
        } else {
            debug!(operation, "llm request failed: {err}");
            Error::Unavailable("llm")
        }
    }

    async fn generate_raw(
        &self,
        prompt: &str,
        system: Option<&str>,
        max_tokens: u32,
        json_mode: bool,
    ) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": max_tokens },
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if json_mode {
            body["format"] = json!("json");
        }

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_request_error("generate", e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.map_request_error("generate", e))?;
        if !status.is_success() {
            debug!(%status, "llm returned error body: {text}");
            return Err(Error::Unavailable("llm"));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidResponse(format!("non-JSON generate response: {e}")))?;
        parsed["response"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::InvalidResponse("generate response missing 'response'".into()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn available(&self) -> bool {
        {
            let cached = self.health.lock().unwrap();
            if let Some((at, ok)) = *cached {
                if at.elapsed() < HEALTH_CACHE_TTL {
                    return ok;
                }
            }
        }

        let probe = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        let ok = matches!(probe, Ok(resp) if resp.status().is_success());

        *self.health.lock().unwrap() = Some((Instant::now(), ok));
        ok
    }

    async fn summarise(
        &self,
        content: &str,
        max_tokens: u32,
        system: Option<&str>,
    ) -> Result<String> {
        let prompt = format!(
            "Summarise the following note in at most {max_tokens} tokens. \
             Keep concrete identifiers (errors, URLs, names) intact.\n\n{content}"
        );
        self.generate_raw(&prompt, system, max_tokens, false).await
    }

    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        max_tokens: u32,
    ) -> Result<String> {
        self.generate_raw(prompt, system, max_tokens, false).await
    }

    async fn extract_entities(&self, content: &str, system: Option<&str>) -> Result<String> {
        let prompt = format!(
            "Extract structured entities from the text below. Respond with a single JSON \
             object of the shape {{\"errors\": [], \"urls\": [], \"tool_ids\": [], \
             \"semantic_tags\": []}} where every element is \
             {{\"value\": string, \"confidence\": number between 0 and 1}}.\n\n{content}"
        );
        self.generate_raw(&prompt, system, 500, true).await
    }

    async fn stream_summary(&self, content: &str) -> Result<BoxStream<'static, Result<String>>> {
        let body = json!({
            "model": self.model,
            "prompt": format!("Summarise the following note.\n\n{content}"),
            "stream": true,
        });

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_request_error("stream_summary", e))?;
        if !resp.status().is_success() {
            return Err(Error::Unavailable("llm"));
        }

        // The server emits one JSON object per line; tokens arrive in the
        // "response" field and the final object carries "done": true.
        let byte_stream = resp.bytes_stream();
        let stream = futures::stream::unfold(
            (byte_stream, String::new(), false),
            |(mut bytes, mut buffer, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let parsed: Value = match serde_json::from_str(line) {
                            Ok(v) => v,
                            Err(e) => {
                                return Some((
                                    Err(Error::InvalidResponse(format!(
                                        "bad stream frame: {e}"
                                    ))),
                                    (bytes, buffer, true),
                                ));
                            }
                        };
                        let finished = parsed["done"].as_bool().unwrap_or(false);
                        let token = parsed["response"].as_str().unwrap_or("").to_string();
                        if token.is_empty() && finished {
                            return None;
                        }
                        return Some((Ok(token), (bytes, buffer, finished)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(e)) => {
                            debug!("llm stream interrupted: {e}");
                            return Some((Err(Error::Unavailable("llm")), (bytes, buffer, true)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
