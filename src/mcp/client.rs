//! Stdio JSON-RPC client for a single MCP server.
//!
//! One session owns one child process. Frames are newline-delimited
//! JSON-RPC 2.0 on the child's stdin/stdout; stderr is drained into the
//! log. Request ids are monotonic per session and correlated to callers
//! through a pending-call map; the single reader task completes or fails
//! every pending entry, so a crashed child can never strand a caller.
//!
//! The child's environment is the parent's environment with the server's
//! resolved overrides merged on top. `PATH` must survive that merge:
//! overrides add variables, they never replace the whole environment.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};

use super::config::McpServerConfig;

/// Sliding window for the malformed-frame circuit breaker.
const MALFORMED_WINDOW: Duration = Duration::from_secs(10);

/// Malformed frames within the window that close the session.
const MALFORMED_LIMIT: usize = 5;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    /// Alive but without a usable tool catalogue.
    Degraded,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool advertised by the server's `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

struct Shared {
    name: String,
    state: StdMutex<SessionState>,
    pending: PendingMap,
    last_heartbeat: StdMutex<Instant>,
    bus: EventBus,
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            info!(server = %self.name, state = %next, "mcp session state");
            self.bus
                .publish(Event::mcp_status_changed(&self.name, next.as_str()));
        }
    }

    fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::TransportLost(reason.to_string())));
        }
    }
}

/// A live MCP session.
pub struct McpClient {
    shared: Arc<Shared>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    tools: StdMutex<Vec<ToolDescriptor>>,
    call_timeout: Duration,
    shutdown_grace: Duration,
}

impl McpClient {
    /// Spawn the server and complete the handshake:
    /// `initialize` → `tools/list` → `ready`.
    pub async fn connect(
        config: &McpServerConfig,
        resolved_env: HashMap<String, String>,
        bus: EventBus,
        call_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Result<Arc<Self>> {
        let mut command = tokio::process::Command::new(&config.command);
        command
            .args(&config.args)
            .envs(resolved_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Validation(format!(
                "cannot spawn mcp server '{}' ({}): {e}",
                config.name, config.command
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TransportLost("child stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::TransportLost("child stderr not piped".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::TransportLost("child stdin not piped".to_string()))?;

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            state: StdMutex::new(SessionState::Connecting),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            last_heartbeat: StdMutex::new(Instant::now()),
            bus,
        });
        shared
            .bus
            .publish(Event::mcp_status_changed(&shared.name, "connecting"));

        tokio::spawn(drain_stderr(config.name.clone(), stderr));
        tokio::spawn(reader_loop(Arc::clone(&shared), stdout));

        let client = Arc::new(Self {
            shared,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(0),
            tools: StdMutex::new(Vec::new()),
            call_timeout,
            shutdown_grace,
        });

        match client.handshake().await {
            Ok(()) => Ok(client),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": {"name": "komorebi", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {}},
            }),
        )
        .await?;

        match self.request("tools/list", json!({})).await {
            Ok(result) => {
                let tools: Vec<ToolDescriptor> = result
                    .get("tools")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| Error::InvalidResponse(format!("bad tools/list: {e}")))?
                    .unwrap_or_default();
                debug!(server = %self.shared.name, tools = tools.len(), "tool catalogue loaded");
                *self.tools.lock().unwrap() = tools;
                self.shared.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(server = %self.shared.name, "tools/list failed: {e}");
                self.shared.set_state(SessionState::Degraded);
                Ok(())
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().unwrap().clone()
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.shared.last_heartbeat.lock().unwrap()
    }

    /// Invoke a tool. Timeouts cancel the pending entry and surface as
    /// `ToolTimeout`; a dead transport surfaces as `TransportLost`.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        match self
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await
        {
            Err(Error::Timeout { .. }) => Err(Error::ToolTimeout(tool.to_string())),
            other => other,
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.state() == SessionState::Closed {
            return Err(Error::TransportLost("session closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let mut line = frame.to_string();
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            let stdin = stdin
                .as_mut()
                .ok_or_else(|| Error::TransportLost("stdin closed".to_string()))?;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(Error::TransportLost(format!("write failed: {e}")));
            }
            if let Err(e) = stdin.flush().await {
                self.shared.pending.lock().unwrap().remove(&id);
                return Err(Error::TransportLost(format!("flush failed: {e}")));
            }
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::TransportLost("session closed".to_string())),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(Error::Timeout {
                    operation: format!("mcp {method}"),
                    seconds: self.call_timeout.as_secs(),
                })
            }
        }
    }

    /// Shut the session down: best-effort `shutdown` request, close stdin,
    /// wait out the grace window, then force-terminate. Never leaves a
    /// zombie behind.
    pub async fn close(&self) {
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            self.request("shutdown", Value::Null),
        )
        .await;

        // Dropping stdin sends EOF; well-behaved servers exit on it.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.shared.name, %status, "mcp server exited");
                }
                Ok(Err(e)) => {
                    warn!(server = %self.shared.name, "wait failed: {e}");
                }
                Err(_) => {
                    warn!(server = %self.shared.name, "grace expired, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.shared.fail_pending("session closed");
        self.shared.set_state(SessionState::Closed);
    }
}

async fn drain_stderr(name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %name, "stderr: {line}");
    }
}

async fn reader_loop(shared: Arc<Shared>, stdout: tokio::process::ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    let mut malformed: VecDeque<Instant> = VecDeque::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => {
                        *shared.last_heartbeat.lock().unwrap() = Instant::now();
                        dispatch(&shared, message);
                    }
                    Err(e) => {
                        warn!(server = %shared.name, "malformed frame ({e}): {line}");
                        let now = Instant::now();
                        malformed.push_back(now);
                        while let Some(front) = malformed.front() {
                            if now.duration_since(*front) > MALFORMED_WINDOW {
                                malformed.pop_front();
                            } else {
                                break;
                            }
                        }
                        if malformed.len() >= MALFORMED_LIMIT {
                            warn!(server = %shared.name, "too many malformed frames, closing");
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                debug!(server = %shared.name, "stdout closed");
                break;
            }
            Err(e) => {
                warn!(server = %shared.name, "read failed: {e}");
                break;
            }
        }
    }

    shared.fail_pending("transport lost");
    shared.set_state(SessionState::Closed);
}

fn dispatch(shared: &Shared, message: Value) {
    match message.get("id").and_then(Value::as_u64) {
        Some(id) => {
            let sender = shared.pending.lock().unwrap().remove(&id);
            match sender {
                Some(tx) => {
                    let outcome = match message.get("error") {
                        Some(error) if !error.is_null() => {
                            let code = error["code"].as_i64().unwrap_or(0);
                            let msg = error["message"].as_str().unwrap_or("unknown");
                            Err(Error::InvalidResponse(format!("rpc error {code}: {msg}")))
                        }
                        _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
                None => {
                    debug!(server = %shared.name, id, "response for unknown request id");
                }
            }
        }
        None => {
            // Server-initiated notification; nothing subscribes yet.
            debug!(
                server = %shared.name,
                method = message["method"].as_str().unwrap_or("?"),
                "notification"
            );
        }
    }
}
