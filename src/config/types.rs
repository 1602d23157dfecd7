use serde::{Deserialize, Serialize};

/// Default timeout for sops invocations, in milliseconds.
pub const DEFAULT_SOPS_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Secrets Configuration
// ============================================================================

/// The `secrets` subtree of the gateway config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretsConfig {
    #[serde(default)]
    pub sources: SecretSourcesConfig,
}

/// Declared secret sources. Env resolution works even without the marker;
/// file resolution requires a configured sops entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretSourcesConfig {
    pub env: Option<EnvSourceConfig>,
    pub file: Option<FileSourceConfig>,
}

/// Marker for the process-environment source: `{ "type": "env" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
}

/// Encrypted-file source: `{ "type": "sops", "path": ..., "timeoutMs": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub path: String,
    pub timeout_ms: Option<f64>,
}

impl FileSourceConfig {
    /// Normalized sops timeout: positive values pass through (truncated to
    /// whole milliseconds), everything else falls back to the default.
    pub fn normalized_timeout_ms(&self) -> u64 {
        normalize_timeout_ms(self.timeout_ms)
    }
}

pub fn normalize_timeout_ms(raw: Option<f64>) -> u64 {
    match raw {
        Some(ms) if ms.is_finite() && ms >= 1.0 => ms as u64,
        _ => DEFAULT_SOPS_TIMEOUT_MS,
    }
}

// ============================================================================
// Agents Configuration
// ============================================================================

/// The `agents` subtree, reduced to the fields the secrets core needs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub list: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    pub agent_dir: Option<String>,
}
