//! MCP server registry: configuration loading, parallel startup, and the
//! live session map.
//!
//! Startup is parallel across servers — ordering between them is
//! meaningless and a slow `npx` install must not delay its neighbours. One
//! server failing to start (bad command, missing secret, unknown secret
//! scheme) is logged and skipped; the rest come up normally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::McpConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;

use super::client::{McpClient, SessionState};
use super::config::{load_servers, resolve_env, McpServerConfig};

pub struct McpRegistry {
    /// One mutex guards map mutation; each session guards itself.
    sessions: Mutex<HashMap<String, Arc<McpClient>>>,
    configs: HashMap<String, McpServerConfig>,
    bus: EventBus,
    call_timeout: Duration,
    shutdown_grace: Duration,
}

impl McpRegistry {
    /// Load the servers file and start every enabled server in parallel.
    pub async fn start(config: &McpConfig, bus: EventBus) -> Result<Arc<Self>> {
        let servers = load_servers(&config.config_path)?;
        let registry = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            configs: servers
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
            bus,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        });

        let startups = servers
            .into_iter()
            .filter(|s| !s.disabled)
            .map(|server| {
                let registry = Arc::clone(&registry);
                async move {
                    match registry.start_one(&server).await {
                        Ok(()) => {}
                        Err(e) => {
                            warn!(server = %server.name, "mcp server failed to start: {e}");
                        }
                    }
                }
            });
        futures::future::join_all(startups).await;

        let live = registry.sessions.lock().await.len();
        info!(live, "mcp registry started");
        Ok(registry)
    }

    async fn start_one(&self, server: &McpServerConfig) -> Result<()> {
        let env = resolve_env(&server.env)?;
        let client = McpClient::connect(
            server,
            env,
            self.bus.clone(),
            self.call_timeout,
            self.shutdown_grace,
        )
        .await?;
        self.sessions
            .lock()
            .await
            .insert(server.name.clone(), client);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<McpClient>> {
        self.sessions.lock().await.get(name).cloned()
    }

    /// Name and state of every known server, configured or live.
    pub async fn list(&self) -> Vec<(String, SessionState)> {
        let sessions = self.sessions.lock().await;
        let mut out: Vec<(String, SessionState)> = self
            .configs
            .keys()
            .map(|name| {
                let state = sessions
                    .get(name)
                    .map(|c| c.state())
                    .unwrap_or(SessionState::Closed);
                (name.clone(), state)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Tear down the named session (if any) and start it again from its
    /// configuration.
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let config = self
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ServerNotReady(name.to_string()))?;

        if let Some(existing) = self.sessions.lock().await.remove(name) {
            existing.close().await;
        }
        self.start_one(&config).await
    }

    /// Close every live session. Called on shutdown; after it returns no
    /// child process is left running.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<McpClient>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, client)| client).collect()
        };
        futures::future::join_all(drained.iter().map(|client| client.close())).await;
        info!("mcp registry shut down");
    }
}
