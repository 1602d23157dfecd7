//! Per-agent auth-profile stores.
//!
//! Each agent directory may hold an `auth-profiles.json` store. The secrets
//! core only interprets the `key`/`keyRef` and `token`/`tokenRef` fields of
//! each profile; the rest of the store schema is opaque and preserved
//! verbatim, so stores are handled as raw JSON documents.

use crate::config::{resolve_user_path, AgentsConfig, Config};
use anyhow::{Context, Result};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Store file name inside an agent directory.
pub const AUTH_PROFILES_FILE: &str = "auth-profiles.json";

/// Id of the default agent.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Standard-layout directory for an agent: `<stateDir>/agents/<id>/agent`.
pub fn agent_dir_for(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join("agents").join(agent_id).join("agent")
}

/// The default agent's directory.
pub fn default_agent_dir(state_dir: &Path) -> PathBuf {
    agent_dir_for(state_dir, DEFAULT_AGENT_ID)
}

/// Load the auth store of one agent directory. An absent store is `None`.
pub fn load_auth_store(agent_dir: &Path) -> Result<Option<Value>> {
    let path = agent_dir.join(AUTH_PROFILES_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Cannot read auth store '{}'", path.display()));
        }
    };
    let store = serde_json::from_str(&content)
        .with_context(|| format!("Cannot parse auth store '{}'", path.display()))?;
    Ok(Some(store))
}

/// Agent directories the runtime resolves secrets for: the default agent
/// plus every entry in `agents.list`, de-duplicated.
pub fn resolved_agent_dirs(config: &Config) -> Vec<PathBuf> {
    let mut dirs = vec![default_agent_dir(&config.state_dir)];
    for entry in &config.agents.list {
        let dir = match entry.agent_dir.as_deref() {
            Some(custom) => resolve_user_path(custom),
            None => agent_dir_for(&config.state_dir, &entry.id),
        };
        dirs.push(dir);
    }
    dedup_paths(dirs)
}

/// All auth-store files a migration must consider: the default store, every
/// store under the standard `<stateDir>/agents/*/agent` layout, and every
/// store pointed to by per-agent directories in config. Only existing files
/// are returned, de-duplicated by canonicalized absolute path.
pub fn discover_auth_store_paths(state_dir: &Path, agents: &AgentsConfig) -> Vec<PathBuf> {
    let mut candidates = vec![default_agent_dir(state_dir).join(AUTH_PROFILES_FILE)];

    if let Ok(entries) = std::fs::read_dir(state_dir.join("agents")) {
        for entry in entries.filter_map(|e| e.ok()) {
            let store = entry.path().join("agent").join(AUTH_PROFILES_FILE);
            candidates.push(store);
        }
    }

    for entry in &agents.list {
        let dir = match entry.agent_dir.as_deref() {
            Some(custom) => resolve_user_path(custom),
            None => agent_dir_for(state_dir, &entry.id),
        };
        candidates.push(dir.join(AUTH_PROFILES_FILE));
    }

    dedup_paths(candidates.into_iter().filter(|p| p.is_file()).collect())
}

/// Pointer scope for an auth store: the agent directory name when the store
/// sits under the standard layout, else a short hash of its path.
pub fn auth_store_scope(state_dir: &Path, store_path: &Path) -> String {
    if let Ok(rest) = store_path.strip_prefix(state_dir.join("agents")) {
        let components: Vec<&str> = rest
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        if let [agent_id, "agent", AUTH_PROFILES_FILE] = components.as_slice() {
            return (*agent_id).to_string();
        }
    }
    let digest = Sha1::digest(store_path.to_string_lossy().as_bytes());
    format!("path-{}", &hex::encode(digest)[..8])
}

/// De-duplicate by canonicalized absolute path, preserving order. Paths that
/// do not exist yet fall back to their lexical form.
fn dedup_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for path in paths {
        let key = path
            .canonicalize()
            .unwrap_or_else(|_| path.clone())
            .to_string_lossy()
            .into_owned();
        if seen.insert(key) {
            result.push(path);
        }
    }
    result
}
