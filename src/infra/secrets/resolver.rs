//! Secret reference resolution.
//!
//! A `SecretRef` names a value in the process environment or in the
//! sops-encrypted secrets file. Resolution is eager and fail-fast; the
//! decrypted payload is memoized so one snapshot pass decrypts at most once
//! no matter how many file references it contains.

use super::pointer::{read_json_pointer, OnMissing};
use super::sops::{sops_decrypt, SopsRequest};
use crate::config::{resolve_user_path, SecretsConfig};
use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Naming rule for environment secret ids.
pub const ENV_ID_RULE: &str = "^[A-Z][A-Z0-9_]{0,127}$";

static ENV_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(ENV_ID_RULE).unwrap());

/// Default message for a missing sops binary; callers can override it.
pub const MISSING_SOPS_MESSAGE: &str =
    "sops binary not found on PATH. Install sops 3.9.0 or newer to resolve file secret references.";

// ============================================================================
// SecretRef
// ============================================================================

/// A declarative reference to a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SecretRef {
    /// Process-environment variable, e.g. `{ source: "env", id: "OPENAI_API_KEY" }`.
    Env { id: String },
    /// JSON pointer into the decrypted secrets payload, e.g.
    /// `{ source: "file", id: "/providers/openai/apiKey" }`.
    File { id: String },
}

impl SecretRef {
    /// Parse a config value as a SecretRef.
    ///
    /// Only an object with exactly a `source` of `"env"` or `"file"` and a
    /// string `id` qualifies; any other shape is not a SecretRef. Shape is
    /// checked here, naming rules in [`SecretRef::validate`].
    pub fn parse(value: &Value) -> Option<SecretRef> {
        let map = value.as_object()?;
        if map.len() != 2 {
            return None;
        }
        let source = map.get("source")?.as_str()?;
        let id = map.get("id")?.as_str()?.to_string();
        match source {
            "env" => Some(SecretRef::Env { id }),
            "file" => Some(SecretRef::File { id }),
            _ => None,
        }
    }

    /// Re-check naming rules at the point of use.
    pub fn validate(&self) -> Result<()> {
        match self {
            SecretRef::Env { id } => {
                if !ENV_ID_RE.is_match(id) {
                    bail!(
                        "Invalid env secret reference id \"{id}\": ids must match {ENV_ID_RULE} \
                         (for example OPENAI_API_KEY)"
                    );
                }
            }
            SecretRef::File { id } => {
                if !id.starts_with('/') {
                    bail!(
                        "Invalid file secret reference id \"{id}\": ids must be absolute JSON \
                         pointers starting with \"/\" (for example /providers/openai/apiKey)"
                    );
                }
            }
        }
        Ok(())
    }

    /// `source:id` form used in error messages.
    pub fn describe(&self) -> String {
        match self {
            SecretRef::Env { id } => format!("env:{id}"),
            SecretRef::File { id } => format!("file:{id}"),
        }
    }

    /// The config-value form of this reference.
    pub fn to_value(&self) -> Value {
        match self {
            SecretRef::Env { id } => serde_json::json!({ "source": "env", "id": id }),
            SecretRef::File { id } => serde_json::json!({ "source": "file", "id": id }),
        }
    }
}

// ============================================================================
// Resolution context and cache
// ============================================================================

/// Per-pass resolve cache. The decrypted payload is populated on first use
/// and shared by every file reference in the pass; concurrent resolutions
/// wait on the same in-flight decrypt instead of spawning their own.
#[derive(Default)]
pub struct SecretRefResolveCache {
    file_payload: tokio::sync::OnceCell<Value>,
}

impl SecretRefResolveCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Inputs for one resolution.
pub struct SecretResolveContext<'a> {
    /// The `secrets` config subtree.
    pub secrets: &'a SecretsConfig,
    /// Caller-supplied environment; falls back to the process environment.
    pub env: Option<&'a HashMap<String, String>>,
    /// Sops config file passed to every tool invocation when present.
    pub sops_config_path: Option<&'a Path>,
    /// Override for the missing-binary error text.
    pub missing_binary_message: Option<&'a str>,
}

impl<'a> SecretResolveContext<'a> {
    pub fn new(secrets: &'a SecretsConfig) -> Self {
        Self {
            secrets,
            env: None,
            sops_config_path: None,
            missing_binary_message: None,
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve a reference to an opaque JSON value.
pub async fn resolve_secret_ref_value(
    secret_ref: &SecretRef,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
) -> Result<Value> {
    secret_ref.validate()?;
    match secret_ref {
        SecretRef::Env { id } => resolve_env_ref(id, ctx),
        SecretRef::File { id } => resolve_file_ref(id, ctx, cache).await,
    }
}

/// Resolve a reference that must produce a non-empty string.
pub async fn resolve_secret_ref_string(
    secret_ref: &SecretRef,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
) -> Result<String> {
    let value = resolve_secret_ref_value(secret_ref, ctx, cache).await?;
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => bail!(
            "Secret reference \"{}\" resolved to a non-string or empty value.",
            secret_ref.describe()
        ),
    }
}

fn resolve_env_ref(id: &str, ctx: &SecretResolveContext<'_>) -> Result<Value> {
    let value = match ctx.env.and_then(|env| env.get(id).cloned()) {
        Some(v) => Some(v),
        None => std::env::var(id).ok(),
    };
    match value {
        Some(v) if !v.is_empty() => Ok(Value::String(v)),
        _ => bail!("Environment variable \"{id}\" is missing or empty."),
    }
}

async fn resolve_file_ref(
    id: &str,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
) -> Result<Value> {
    let Some(file) = ctx.secrets.sources.file.as_ref() else {
        bail!(
            "secrets.sources.file is not configured; file secret references cannot be resolved."
        );
    };
    if file.source_type != "sops" {
        bail!(
            "Unsupported secrets file source type \"{}\": only \"sops\" is supported.",
            file.source_type
        );
    }

    let path = resolve_user_path(&file.path);
    let request = SopsRequest {
        timeout_ms: file.normalized_timeout_ms(),
        missing_binary_message: ctx.missing_binary_message.unwrap_or(MISSING_SOPS_MESSAGE),
        config_path: ctx.sops_config_path,
    };

    let payload = cache
        .file_payload
        .get_or_try_init(|| async {
            let payload = sops_decrypt(&path, &request).await?;
            if !payload.is_object() {
                bail!("sops decrypt failed: decrypted payload is not a JSON object");
            }
            Ok::<Value, anyhow::Error>(payload)
        })
        .await?;

    match read_json_pointer(payload, id, OnMissing::Absent)? {
        Some(value) => Ok(value.clone()),
        None => bail!(
            "Secret reference \"file:{id}\" not found in decrypted payload ({}).",
            path.display()
        ),
    }
}
