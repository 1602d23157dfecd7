mod io;
mod types;
mod validation;

pub use io::*;
pub use types::*;
pub use validation::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Default config file name searched in the working directory.
pub const CONFIG_FILE_NAME: &str = "openclaw.json";

/// Loaded gateway configuration.
///
/// The secrets core walks the raw document by site, so the full schema stays
/// a `serde_json::Value`; only the subtrees the core interprets (`secrets`,
/// `agents`) are deserialized into typed form.
#[derive(Debug, Clone)]
pub struct Config {
    /// The raw config document.
    pub doc: serde_json::Value,
    /// Typed `secrets` subtree.
    pub secrets: SecretsConfig,
    /// Typed `agents` subtree.
    pub agents: AgentsConfig,
    /// Path the document was loaded from (or would be written to).
    pub path: PathBuf,
    /// State directory for persistent data.
    pub state_dir: PathBuf,
}

impl Config {
    /// Load configuration from file and defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(find_config_file)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

        let doc = if config_path.exists() {
            info!("Loading config from {}", config_path.display());
            read_config_file_snapshot(&config_path)?
        } else {
            info!("No config file found, using defaults");
            serde_json::json!({})
        };

        Self::from_value(doc, config_path)
    }

    /// Build a `Config` from an already-parsed document.
    pub fn from_value(doc: serde_json::Value, path: PathBuf) -> Result<Self> {
        let secrets = parse_secrets_subtree(&doc)?;
        let agents = parse_agents_subtree(&doc)?;
        Ok(Self {
            doc,
            secrets,
            agents,
            path,
            state_dir: resolve_state_dir(),
        })
    }

    /// Directory containing the config file.
    pub fn config_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Deserialize the `secrets` subtree of a config document.
pub fn parse_secrets_subtree(doc: &serde_json::Value) -> Result<SecretsConfig> {
    match doc.get("secrets") {
        Some(subtree) => serde_json::from_value(subtree.clone())
            .context("Invalid secrets configuration subtree"),
        None => Ok(SecretsConfig::default()),
    }
}

/// Deserialize the `agents` subtree of a config document.
pub fn parse_agents_subtree(doc: &serde_json::Value) -> Result<AgentsConfig> {
    match doc.get("agents") {
        Some(subtree) => serde_json::from_value(subtree.clone())
            .context("Invalid agents configuration subtree"),
        None => Ok(AgentsConfig::default()),
    }
}

/// Find the configuration file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    let home_config = resolve_state_dir().join(CONFIG_FILE_NAME);
    if home_config.exists() {
        return Some(home_config);
    }

    None
}

/// Resolve the state directory for persistent data.
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OPENCLAW_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::home_dir()
        .map(|h| h.join(".openclaw"))
        .unwrap_or_else(|| PathBuf::from(".openclaw"))
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn resolve_user_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
