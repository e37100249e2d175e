//! Tool invocation with optional result capture.
//!
//! The service resolves a session by name, invokes the tool, and — when
//! asked — turns the tool result into a fresh `inbox` chunk that re-enters
//! the normal capture pipeline, tagged with its origin.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::capture::CaptureService;
use crate::error::{Error, Result};
use crate::models::ChunkDraft;

use super::client::{SessionState, ToolDescriptor};
use super::registry::McpRegistry;

pub struct McpService {
    registry: Arc<McpRegistry>,
    capture: Arc<CaptureService>,
}

/// Result of a tool call, plus the captured chunk when requested.
#[derive(Debug)]
pub struct ToolCallOutcome {
    pub result: Value,
    pub captured_chunk_id: Option<Uuid>,
}

impl McpService {
    pub fn new(registry: Arc<McpRegistry>, capture: Arc<CaptureService>) -> Self {
        Self { registry, capture }
    }

    /// Every tool of every live session, flattened to
    /// `(server_name, tool)`.
    pub async fn list_tools(&self) -> Vec<(String, ToolDescriptor)> {
        let mut out = Vec::new();
        for (name, _) in self.registry.list().await {
            if let Some(session) = self.registry.get(&name).await {
                if session.state() == SessionState::Ready {
                    for tool in session.tools() {
                        out.push((name.clone(), tool));
                    }
                }
            }
        }
        out
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        capture: bool,
        project_id: Option<Uuid>,
    ) -> Result<ToolCallOutcome> {
        let session = self
            .registry
            .get(server)
            .await
            .ok_or_else(|| Error::ServerNotReady(server.to_string()))?;
        if session.state() != SessionState::Ready {
            return Err(Error::ServerNotReady(server.to_string()));
        }

        let result = session.call_tool(tool, arguments).await?;

        let captured_chunk_id = if capture {
            let content = result_text(&result);
            if content.trim().is_empty() {
                debug!(server, tool, "tool result empty, nothing to capture");
                None
            } else {
                let chunk = self
                    .capture
                    .capture(ChunkDraft {
                        content,
                        project_id,
                        tags: vec![tool.to_string()],
                        source: Some(format!("mcp:{server}:{tool}")),
                        trace_id: None,
                    })
                    .await?;
                Some(chunk.id)
            }
        } else {
            None
        };

        Ok(ToolCallOutcome {
            result,
            captured_chunk_id,
        })
    }
}

/// Extract a text view of a tool result, walking the response shapes MCP
/// servers actually produce; anything unrecognised is JSON-stringified.
pub fn result_text(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(Value::Array(content)) = map.get("content") {
                let texts: Vec<String> = content.iter().filter_map(item_text).collect();
                if !texts.is_empty() {
                    return texts.join("\n");
                }
            }
            result.to_string()
        }
        Value::Array(items) => {
            let texts: Vec<String> = items.iter().filter_map(item_text).collect();
            if texts.is_empty() {
                result.to_string()
            } else {
                texts.join("\n")
            }
        }
        other => other.to_string(),
    }
}

fn item_text(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => match (map.get("type"), map.get("text")) {
            (Some(Value::String(kind)), Some(Value::String(text))) if kind == "text" => {
                Some(text.clone())
            }
            _ => None,
        },
        _ => None,
    }
}
