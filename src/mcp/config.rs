//! MCP servers file parsing and secret resolution.
//!
//! The file is JSON, loaded once at startup:
//!
//! ```json
//! {
//!   "servers": [
//!     {
//!       "name": "github",
//!       "command": "npx",
//!       "args": ["-y", "@modelcontextprotocol/server-github"],
//!       "env": {"GITHUB_TOKEN": "env://GITHUB_TOKEN"},
//!       "disabled": false
//!     }
//!   ]
//! }
//! ```
//!
//! Env values may be literals or secret URIs: `env://NAME` reads the
//! process environment, `keyring://service/user` reads the host keyring.
//! Any other scheme is a configuration error for that server alone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Declarative connection descriptor for one MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: Vec<McpServerConfig>,
}

/// Load and validate the servers file. Duplicate names are rejected; a
/// missing file means no servers.
pub fn load_servers(path: &Path) -> Result<Vec<McpServerConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Validation(format!("cannot read {}: {e}", path.display())))?;
    let file: ServersFile = serde_json::from_str(&content)
        .map_err(|e| Error::Validation(format!("invalid servers file {}: {e}", path.display())))?;

    let mut seen = std::collections::HashSet::new();
    for server in &file.servers {
        if server.name.trim().is_empty() {
            return Err(Error::Validation("server name must not be empty".to_string()));
        }
        if !seen.insert(server.name.clone()) {
            return Err(Error::Validation(format!(
                "duplicate server name: {}",
                server.name
            )));
        }
    }
    Ok(file.servers)
}

/// Resolve one env value, expanding secret URIs.
pub fn resolve_secret(value: &str) -> Result<String> {
    if let Some(name) = value.strip_prefix("env://") {
        return std::env::var(name)
            .map_err(|_| Error::Validation(format!("secret env://{name} is not set")));
    }
    if let Some(rest) = value.strip_prefix("keyring://") {
        let (service, user) = rest.split_once('/').ok_or_else(|| {
            Error::Validation(format!(
                "keyring secret must be keyring://service/user, got keyring://{rest}"
            ))
        })?;
        let entry = keyring::Entry::new(service, user)
            .map_err(|e| Error::Validation(format!("keyring entry {service}/{user}: {e}")))?;
        return match entry.get_password() {
            Ok(password) => Ok(password),
            Err(keyring::Error::NoEntry) => Err(Error::Validation(format!(
                "keyring secret {service}/{user} not found"
            ))),
            Err(e) => Err(Error::Validation(format!(
                "keyring lookup {service}/{user} failed: {e}"
            ))),
        };
    }
    // Any other URI-looking value is an unsupported secret scheme; failing
    // loudly here beats handing a raw URI to the child as a credential.
    if let Some((scheme, _)) = value.split_once("://") {
        if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(Error::Validation(format!(
                "unknown secret scheme '{scheme}://'; use env:// or keyring://"
            )));
        }
    }
    Ok(value.to_string())
}

/// Resolve a server's whole env map. The first failing value aborts this
/// server's startup; other servers are unaffected.
pub fn resolve_env(env: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    env.iter()
        .map(|(k, v)| Ok((k.clone(), resolve_secret(v)?)))
        .collect()
}
