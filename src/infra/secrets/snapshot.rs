//! Runtime snapshot construction.
//!
//! Walks a validated config document and the per-agent auth stores, replaces
//! every secret reference with its resolved plaintext value, and returns a
//! fully-materialized snapshot. Never writes to disk; auth-store mutations
//! live only in the returned snapshot.

use super::pointer::escape_pointer_token;
use super::resolver::{
    resolve_secret_ref_string, resolve_secret_ref_value, SecretRef, SecretRefResolveCache,
    SecretResolveContext,
};
use crate::config::parse_secrets_subtree;
use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Warning code: a reference and a plaintext sibling were both present; the
/// reference won.
pub const SECRETS_REF_OVERRIDES_PLAINTEXT: &str = "SECRETS_REF_OVERRIDES_PLAINTEXT";

/// Non-fatal finding recorded while building a snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWarning {
    pub code: String,
    pub message: String,
    pub site: String,
}

/// One materialized auth store.
#[derive(Debug, Clone)]
pub struct AuthStoreSnapshot {
    pub agent_dir: PathBuf,
    pub store: Value,
}

/// Immutable, fully-resolved view of config and auth stores.
#[derive(Debug)]
pub struct RuntimeSnapshot {
    /// Config with every recognized secret reference replaced by plaintext.
    pub config: Value,
    /// Auth stores with `keyRef`/`tokenRef` replaced by literal `key`/`token`.
    pub auth_stores: Vec<AuthStoreSnapshot>,
    /// Ordered non-fatal warnings.
    pub warnings: Vec<SnapshotWarning>,
    /// Monotonic timestamp used to order activations.
    pub resolved_at: Instant,
}

/// Inputs for [`prepare_snapshot`].
pub struct PrepareSnapshotParams<'a> {
    pub config: &'a Value,
    /// Sops config file (`.sops.yaml`) passed to every tool invocation.
    pub sops_config_path: Option<&'a Path>,
    /// Caller-supplied environment; falls back to the process environment.
    pub env: Option<&'a HashMap<String, String>>,
    pub agent_dirs: &'a [PathBuf],
    pub missing_binary_message: Option<&'a str>,
}

/// Build a runtime snapshot.
///
/// All resolutions share one cache, so the encrypted payload is decrypted at
/// most once per call. The first resolution failure aborts construction.
pub async fn prepare_snapshot(
    params: PrepareSnapshotParams<'_>,
    load_auth_store: impl Fn(&Path) -> Result<Option<Value>>,
) -> Result<RuntimeSnapshot> {
    let mut next = params.config.clone();
    let secrets = parse_secrets_subtree(&next)?;
    let cache = SecretRefResolveCache::new();
    let mut ctx = SecretResolveContext::new(&secrets);
    ctx.env = params.env;
    ctx.sops_config_path = params.sops_config_path;
    ctx.missing_binary_message = params.missing_binary_message;

    let mut warnings = Vec::new();

    resolve_api_key_sites(&mut next, "/models/providers", &ctx, &cache).await?;
    resolve_api_key_sites(&mut next, "/skills/entries", &ctx, &cache).await?;
    resolve_googlechat_sites(&mut next, &ctx, &cache, &mut warnings).await?;

    let mut auth_stores = Vec::new();
    for agent_dir in params.agent_dirs {
        let Some(store) = load_auth_store(agent_dir)? else {
            continue;
        };
        let resolved =
            resolve_auth_store(store, agent_dir, &ctx, &cache, &mut warnings).await?;
        auth_stores.push(AuthStoreSnapshot {
            agent_dir: agent_dir.clone(),
            store: resolved,
        });
    }

    Ok(RuntimeSnapshot {
        config: next,
        auth_stores,
        warnings,
        resolved_at: Instant::now(),
    })
}

/// Resolve `<base>/<id>/apiKey` sites (model providers and skill entries).
/// The reference sits in the `apiKey` field itself; there is no plaintext
/// sibling at these sites.
async fn resolve_api_key_sites(
    next: &mut Value,
    base_ptr: &str,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
) -> Result<()> {
    let keys: Vec<String> = match next.pointer(base_ptr).and_then(Value::as_object) {
        Some(map) => map.keys().cloned().collect(),
        None => return Ok(()),
    };

    for key in keys {
        let ptr = format!("{base_ptr}/{}/apiKey", escape_pointer_token(&key));
        let Some(secret_ref) = next.pointer(&ptr).and_then(SecretRef::parse) else {
            continue;
        };
        let resolved = resolve_secret_ref_string(&secret_ref, ctx, cache).await?;
        if let Some(slot) = next.pointer_mut(&ptr) {
            *slot = Value::String(resolved);
        }
    }
    Ok(())
}

/// Resolve Google Chat service-account sites, top-level and per-account.
async fn resolve_googlechat_sites(
    next: &mut Value,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
    warnings: &mut Vec<SnapshotWarning>,
) -> Result<()> {
    let mut sites: Vec<(String, String)> = Vec::new();
    if next.pointer("/channels/googlechat").and_then(Value::as_object).is_some() {
        sites.push((
            "/channels/googlechat".to_string(),
            "channels.googlechat".to_string(),
        ));
    }
    if let Some(accounts) = next
        .pointer("/channels/googlechat/accounts")
        .and_then(Value::as_object)
    {
        for account_id in accounts.keys() {
            sites.push((
                format!(
                    "/channels/googlechat/accounts/{}",
                    escape_pointer_token(account_id)
                ),
                format!("channels.googlechat.accounts.{account_id}"),
            ));
        }
    }

    for (obj_ptr, site_prefix) in sites {
        resolve_service_account_site(next, &obj_ptr, &site_prefix, ctx, cache, warnings).await?;
    }
    Ok(())
}

async fn resolve_service_account_site(
    next: &mut Value,
    obj_ptr: &str,
    site_prefix: &str,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
    warnings: &mut Vec<SnapshotWarning>,
) -> Result<()> {
    let Some(obj) = next.pointer(obj_ptr).and_then(Value::as_object) else {
        return Ok(());
    };

    let site = format!("{site_prefix}.serviceAccount");
    if let Some(secret_ref) = obj.get("serviceAccountRef").and_then(SecretRef::parse) {
        let had_plaintext = obj
            .get("serviceAccount")
            .map(is_plaintext_service_account)
            .unwrap_or(false);
        let resolved = resolve_service_account_value(&secret_ref, ctx, cache).await?;
        if let Some(obj) = next.pointer_mut(obj_ptr).and_then(Value::as_object_mut) {
            if had_plaintext {
                warnings.push(SnapshotWarning {
                    code: SECRETS_REF_OVERRIDES_PLAINTEXT.to_string(),
                    message: format!(
                        "Secret reference serviceAccountRef overrides the plaintext value at {site}"
                    ),
                    site: site.clone(),
                });
            }
            obj.insert("serviceAccount".to_string(), resolved);
            obj.remove("serviceAccountRef");
        }
    } else if let Some(secret_ref) = obj.get("serviceAccount").and_then(SecretRef::parse) {
        let resolved = resolve_service_account_value(&secret_ref, ctx, cache).await?;
        if let Some(obj) = next.pointer_mut(obj_ptr).and_then(Value::as_object_mut) {
            obj.insert("serviceAccount".to_string(), resolved);
        }
    }
    Ok(())
}

/// Service accounts may resolve to a JSON object (the key file) or to a
/// non-empty string; anything else is rejected.
async fn resolve_service_account_value(
    secret_ref: &SecretRef,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
) -> Result<Value> {
    let value = resolve_secret_ref_value(secret_ref, ctx, cache).await?;
    match &value {
        Value::String(s) if !s.is_empty() => Ok(value),
        Value::Object(_) => Ok(value),
        _ => bail!(
            "Secret reference \"{}\" resolved to a non-string or empty value.",
            secret_ref.describe()
        ),
    }
}

fn is_plaintext_service_account(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty(),
        Value::Object(_) => SecretRef::parse(value).is_none(),
        _ => false,
    }
}

/// Resolve `keyRef`/`tokenRef` fields inside one auth store. The mutated
/// store lives only in the snapshot; the on-disk file is untouched.
async fn resolve_auth_store(
    mut store: Value,
    agent_dir: &Path,
    ctx: &SecretResolveContext<'_>,
    cache: &SecretRefResolveCache,
    warnings: &mut Vec<SnapshotWarning>,
) -> Result<Value> {
    struct Pending {
        profile_id: String,
        secret_ref: SecretRef,
        ref_field: &'static str,
        plain_field: &'static str,
        had_plaintext: bool,
    }

    let mut pending = Vec::new();
    if let Some(profiles) = store.get("profiles").and_then(Value::as_object) {
        for (profile_id, profile) in profiles {
            let Some(profile) = profile.as_object() else {
                continue;
            };
            let (ref_field, plain_field) = match profile.get("type").and_then(Value::as_str) {
                Some("api_key") => ("keyRef", "key"),
                Some("token") => ("tokenRef", "token"),
                _ => continue,
            };
            let Some(secret_ref) = profile.get(ref_field).and_then(SecretRef::parse) else {
                continue;
            };
            let had_plaintext = profile
                .get(plain_field)
                .and_then(Value::as_str)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            pending.push(Pending {
                profile_id: profile_id.clone(),
                secret_ref,
                ref_field,
                plain_field,
                had_plaintext,
            });
        }
    }

    for item in pending {
        let resolved = resolve_secret_ref_string(&item.secret_ref, ctx, cache).await?;
        let Some(profile) = store
            .get_mut("profiles")
            .and_then(|p| p.get_mut(&item.profile_id))
            .and_then(Value::as_object_mut)
        else {
            continue;
        };
        if item.had_plaintext {
            warnings.push(SnapshotWarning {
                code: SECRETS_REF_OVERRIDES_PLAINTEXT.to_string(),
                message: format!(
                    "Secret reference {} overrides the plaintext {} of auth profile \"{}\" in {}",
                    item.ref_field,
                    item.plain_field,
                    item.profile_id,
                    agent_dir.display()
                ),
                site: format!("authProfiles.{}.{}", item.profile_id, item.plain_field),
            });
        }
        profile.insert(item.plain_field.to_string(), Value::String(resolved));
        profile.remove(item.ref_field);
    }

    Ok(store)
}

/// True when any value reachable from `value` parses as a secret reference.
/// Snapshots must never contain one.
pub fn contains_secret_ref(value: &Value) -> bool {
    if SecretRef::parse(value).is_some() {
        return true;
    }
    match value {
        Value::Object(map) => map.values().any(contains_secret_ref),
        Value::Array(items) => items.iter().any(contains_secret_ref),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn no_auth_stores(_: &Path) -> Result<Option<Value>> {
        Ok(None)
    }

    #[tokio::test]
    async fn env_ref_resolves_into_provider_api_key() {
        let config = json!({
            "models": {
                "providers": {
                    "openai": {"apiKey": {"source": "env", "id": "OPENAI_API_KEY"}}
                }
            }
        });
        let env = env_map(&[("OPENAI_API_KEY", "sk-env-openai")]);

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&env),
                agent_dirs: &[],
                missing_binary_message: None,
            },
            no_auth_stores,
        )
        .await
        .unwrap();

        assert_eq!(
            snapshot.config["models"]["providers"]["openai"]["apiKey"],
            "sk-env-openai"
        );
        assert!(snapshot.warnings.is_empty());
        assert!(!contains_secret_ref(&snapshot.config));
    }

    #[tokio::test]
    async fn skill_entry_api_key_resolves() {
        let config = json!({
            "skills": {
                "entries": {
                    "review-pr": {"apiKey": {"source": "env", "id": "SKILL_KEY"}}
                }
            }
        });
        let env = env_map(&[("SKILL_KEY", "sk-skill")]);

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&env),
                agent_dirs: &[],
                missing_binary_message: None,
            },
            no_auth_stores,
        )
        .await
        .unwrap();

        assert_eq!(
            snapshot.config["skills"]["entries"]["review-pr"]["apiKey"],
            "sk-skill"
        );
    }

    #[tokio::test]
    async fn service_account_ref_wins_over_plaintext() {
        let config = json!({
            "channels": {
                "googlechat": {
                    "serviceAccount": "stale-plaintext",
                    "serviceAccountRef": {"source": "env", "id": "GCHAT_SA"}
                }
            }
        });
        let env = env_map(&[("GCHAT_SA", "resolved-sa")]);

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&env),
                agent_dirs: &[],
                missing_binary_message: None,
            },
            no_auth_stores,
        )
        .await
        .unwrap();

        let gchat = &snapshot.config["channels"]["googlechat"];
        assert_eq!(gchat["serviceAccount"], "resolved-sa");
        assert!(gchat.get("serviceAccountRef").is_none());
        assert_eq!(snapshot.warnings.len(), 1);
        assert_eq!(snapshot.warnings[0].code, SECRETS_REF_OVERRIDES_PLAINTEXT);
        assert_eq!(snapshot.warnings[0].site, "channels.googlechat.serviceAccount");
    }

    #[tokio::test]
    async fn per_account_service_accounts_resolve() {
        let config = json!({
            "channels": {
                "googlechat": {
                    "accounts": {
                        "support": {
                            "serviceAccountRef": {"source": "env", "id": "SUPPORT_SA"}
                        }
                    }
                }
            }
        });
        let env = env_map(&[("SUPPORT_SA", "support-sa-json")]);

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&env),
                agent_dirs: &[],
                missing_binary_message: None,
            },
            no_auth_stores,
        )
        .await
        .unwrap();

        let account = &snapshot.config["channels"]["googlechat"]["accounts"]["support"];
        assert_eq!(account["serviceAccount"], "support-sa-json");
        assert!(account.get("serviceAccountRef").is_none());
        assert!(snapshot.warnings.is_empty());
    }

    #[tokio::test]
    async fn auth_profile_ref_overrides_plaintext_key() {
        let config = json!({});
        let env = env_map(&[("OPENAI_API_KEY", "sk-env-openai")]);
        let agent_dir = PathBuf::from("/tmp/agents/main/agent");
        let agent_dirs = vec![agent_dir.clone()];

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&env),
                agent_dirs: &agent_dirs,
                missing_binary_message: None,
            },
            |_dir: &Path| {
                Ok(Some(json!({
                    "profiles": {
                        "openai": {
                            "type": "api_key",
                            "key": "old",
                            "keyRef": {"source": "env", "id": "OPENAI_API_KEY"}
                        }
                    }
                })))
            },
        )
        .await
        .unwrap();

        assert_eq!(snapshot.auth_stores.len(), 1);
        let profile = &snapshot.auth_stores[0].store["profiles"]["openai"];
        assert_eq!(profile["key"], "sk-env-openai");
        assert!(profile.get("keyRef").is_none());
        assert_eq!(snapshot.warnings.len(), 1);
        assert_eq!(snapshot.warnings[0].code, SECRETS_REF_OVERRIDES_PLAINTEXT);
        assert_eq!(snapshot.warnings[0].site, "authProfiles.openai.key");
        assert!(!contains_secret_ref(&snapshot.auth_stores[0].store));
    }

    #[tokio::test]
    async fn token_profiles_resolve_symmetrically() {
        let config = json!({});
        let env = env_map(&[("GH_TOKEN", "ghp-resolved")]);
        let agent_dirs = vec![PathBuf::from("/tmp/agents/main/agent")];

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&env),
                agent_dirs: &agent_dirs,
                missing_binary_message: None,
            },
            |_dir: &Path| {
                Ok(Some(json!({
                    "profiles": {
                        "github": {
                            "type": "token",
                            "tokenRef": {"source": "env", "id": "GH_TOKEN"}
                        }
                    }
                })))
            },
        )
        .await
        .unwrap();

        let profile = &snapshot.auth_stores[0].store["profiles"]["github"];
        assert_eq!(profile["token"], "ghp-resolved");
        assert!(profile.get("tokenRef").is_none());
        assert!(snapshot.warnings.is_empty());
    }

    #[tokio::test]
    async fn absent_auth_stores_yield_no_entry() {
        let config = json!({});
        let agent_dirs = vec![PathBuf::from("/tmp/agents/a"), PathBuf::from("/tmp/agents/b")];

        let snapshot = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: None,
                agent_dirs: &agent_dirs,
                missing_binary_message: None,
            },
            |dir: &Path| {
                if dir.ends_with("b") {
                    Ok(Some(json!({"profiles": {}})))
                } else {
                    Ok(None)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(snapshot.auth_stores.len(), 1);
        assert!(snapshot.auth_stores[0].agent_dir.ends_with("b"));
    }

    #[tokio::test]
    async fn first_failure_aborts_construction() {
        let config = json!({
            "models": {
                "providers": {
                    "openai": {"apiKey": {"source": "env", "id": "OPENCLAW_MISSING_KEY_XYZ"}}
                }
            }
        });

        let err = prepare_snapshot(
            PrepareSnapshotParams {
                config: &config,
                sops_config_path: None,
                env: Some(&HashMap::new()),
                agent_dirs: &[],
                missing_binary_message: None,
            },
            no_auth_stores,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Environment variable \"OPENCLAW_MISSING_KEY_XYZ\" is missing or empty."
        );
    }

    #[test]
    fn secret_ref_detector_walks_nested_values() {
        assert!(contains_secret_ref(&json!({
            "a": [{"source": "env", "id": "X"}]
        })));
        assert!(!contains_secret_ref(&json!({
            "a": {"source": "env", "id": "X", "extra": true}
        })));
    }
}
