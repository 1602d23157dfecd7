//! Plaintext-to-reference migration.
//!
//! Planning walks the config, the auth stores, and the current encrypted
//! payload entirely in memory and produces a [`MigrationPlan`] describing
//! every intended change. Applying the plan backs up every target first,
//! performs the writes in a fixed order (payload, config, auth stores, env
//! file), and rolls back from the backup manifest on any failure.

use super::backup::{
    allocate_backup_id, backup_root, create_backup, load_manifest, prune_old_backups,
    restore_from_manifest,
};
use super::env_file::scrub_env_contents;
use super::pointer::{escape_pointer_token, read_json_pointer, set_json_pointer, OnMissing};
use super::resolver::{SecretRef, MISSING_SOPS_MESSAGE};
use super::sops::{find_sops_config, sops_decrypt, sops_encrypt, SopsRequest};
use crate::agents::{auth_store_scope, discover_auth_store_paths};
use crate::config::{
    existing_file_mode, parse_agents_subtree, parse_secrets_subtree, read_config_file_snapshot,
    resolve_user_path, validate_config_object, write_file_atomic, write_json_file_atomic,
    DEFAULT_SOPS_TIMEOUT_MS,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Env-file keys eligible for scrubbing. Only lines whose key is listed here
/// and whose value exactly equals a migrated plaintext value are removed.
pub const KNOWN_SECRET_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GROQ_API_KEY",
    "GEMINI_API_KEY",
    "DISCORD_BOT_TOKEN",
    "TELEGRAM_BOT_TOKEN",
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
];

/// Caller-resolved inputs for one migration run.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub scrub_env: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCounters {
    pub config_refs: usize,
    pub auth_profile_refs: usize,
    pub plaintext_removed: usize,
    /// Payload writes where the stored value actually changed.
    pub secrets_written: usize,
    pub env_entries_removed: usize,
    pub auth_stores_changed: usize,
}

#[derive(Debug, Clone)]
pub struct PlannedAuthStore {
    pub path: PathBuf,
    pub scope: String,
    pub next_store: Value,
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct PlannedEnvFile {
    pub path: PathBuf,
    pub next_contents: String,
}

/// Every intended change of one migration, computed without touching disk.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub config_path: PathBuf,
    pub next_config: Value,
    pub config_changed: bool,
    pub payload_path: PathBuf,
    pub next_payload: Value,
    pub payload_changed: bool,
    pub sops_config_path: Option<PathBuf>,
    pub timeout_ms: u64,
    pub auth_stores: Vec<PlannedAuthStore>,
    pub env_file: Option<PlannedEnvFile>,
    pub counters: MigrationCounters,
    pub migrated_values: HashSet<String>,
    /// Files the apply step will write (or create), in write order.
    pub backup_targets: Vec<PathBuf>,
    pub changed: bool,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub counters: MigrationCounters,
}

/// Result of restoring a backup.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub backup_id: String,
    pub restored_files: Vec<String>,
    pub deleted_files: Vec<String>,
}

// ============================================================================
// Planning
// ============================================================================

struct PlanState {
    next_payload: Value,
    counters: MigrationCounters,
    migrated_values: HashSet<String>,
    /// A file reference was created or a payload value written, so the
    /// config must carry a file source after this migration.
    uses_file_source: bool,
}

impl PlanState {
    /// Write `value` at `pointer` unless the payload already holds an equal
    /// value; only actual changes count as secrets written.
    fn write_payload(&mut self, pointer: &str, value: Value) -> Result<()> {
        self.uses_file_source = true;
        let existing = read_json_pointer(&self.next_payload, pointer, OnMissing::Absent)?;
        if existing == Some(&value) {
            return Ok(());
        }
        set_json_pointer(&mut self.next_payload, pointer, value)?;
        self.counters.secrets_written += 1;
        Ok(())
    }
}

/// Build a migration plan for the current on-disk state.
pub async fn build_migration_plan(settings: &MigrationSettings) -> Result<MigrationPlan> {
    // 1. Read and validate the config; planning refuses malformed input.
    let original_config = if settings.config_path.exists() {
        read_config_file_snapshot(&settings.config_path)?
    } else {
        json!({})
    };
    validate_config_object(&original_config)?;
    let secrets_cfg = parse_secrets_subtree(&original_config)?;
    let agents_cfg = parse_agents_subtree(&original_config)?;

    let mut next_config = original_config.clone();

    // 2. Determine the file source: the configured sops entry, or the
    //    default path under the state directory.
    let (payload_path, timeout_ms, file_source_configured) = match &secrets_cfg.sources.file {
        Some(file) => (
            resolve_user_path(&file.path),
            file.normalized_timeout_ms(),
            true,
        ),
        None => (
            settings.state_dir.join("secrets.enc.json"),
            DEFAULT_SOPS_TIMEOUT_MS,
            false,
        ),
    };

    // 3. Sops config discovery keeps tool behavior independent of cwd.
    let config_dir = settings
        .config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let sops_config_path = find_sops_config(&config_dir);

    // 4. Load the current payload; an absent file is an empty object.
    let original_payload = if payload_path.is_file() {
        let request = SopsRequest {
            timeout_ms,
            missing_binary_message: MISSING_SOPS_MESSAGE,
            config_path: sops_config_path.as_deref(),
        };
        let payload = sops_decrypt(&payload_path, &request).await?;
        if !payload.is_object() {
            bail!("sops decrypt failed: decrypted payload is not a JSON object");
        }
        payload
    } else {
        json!({})
    };

    let mut state = PlanState {
        next_payload: original_payload.clone(),
        counters: MigrationCounters::default(),
        migrated_values: HashSet::new(),
        uses_file_source: false,
    };

    // 5. Config sites.
    migrate_api_key_sites(&mut next_config, "/models/providers", "/providers", &mut state)?;
    migrate_api_key_sites(&mut next_config, "/skills/entries", "/skills/entries", &mut state)?;
    migrate_googlechat_sites(&mut next_config, &mut state)?;

    // 6. Auth-profile stores.
    let mut planned_stores = Vec::new();
    for store_path in discover_auth_store_paths(&settings.state_dir, &agents_cfg) {
        let content = std::fs::read_to_string(&store_path)
            .with_context(|| format!("Cannot read auth store '{}'", store_path.display()))?;
        let original_store: Value = serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse auth store '{}'", store_path.display()))?;
        let scope = auth_store_scope(&settings.state_dir, &store_path);
        let next_store = migrate_auth_store(&original_store, &scope, &mut state)?;
        let changed = next_store != original_store;
        if changed {
            state.counters.auth_stores_changed += 1;
        }
        planned_stores.push(PlannedAuthStore {
            path: store_path,
            scope,
            next_store,
            changed,
        });
    }

    // 7. A migration that created file references must leave a resolvable
    //    config behind.
    if state.uses_file_source && !file_source_configured {
        set_json_pointer(
            &mut next_config,
            "/secrets/sources/file",
            json!({
                "type": "sops",
                "path": payload_path.to_string_lossy(),
                "timeoutMs": DEFAULT_SOPS_TIMEOUT_MS,
            }),
        )?;
    }

    // 8. Structural equality decides what gets rewritten.
    let config_changed = next_config != original_config;
    let payload_changed = state.next_payload != original_payload;

    // 9. Env scrub.
    let env_path = config_dir.join(".env");
    let env_file = if settings.scrub_env && !state.migrated_values.is_empty() && env_path.is_file()
    {
        let raw = std::fs::read_to_string(&env_path)
            .with_context(|| format!("Cannot read env file '{}'", env_path.display()))?;
        let scrubbed = scrub_env_contents(&raw, &state.migrated_values, KNOWN_SECRET_ENV_VARS);
        state.counters.env_entries_removed = scrubbed.removed;
        if scrubbed.contents != raw {
            Some(PlannedEnvFile {
                path: env_path,
                next_contents: scrubbed.contents,
            })
        } else {
            None
        }
    } else {
        None
    };

    // 10. Backup targets, in write order.
    let mut backup_targets = Vec::new();
    if payload_changed {
        backup_targets.push(payload_path.clone());
    }
    if config_changed {
        backup_targets.push(settings.config_path.clone());
    }
    for store in planned_stores.iter().filter(|s| s.changed) {
        backup_targets.push(store.path.clone());
    }
    if let Some(env) = &env_file {
        backup_targets.push(env.path.clone());
    }

    let changed = !backup_targets.is_empty();
    debug!(
        "Migration plan: changed={changed}, {} payload write(s), {} config ref(s), {} auth ref(s)",
        state.counters.secrets_written, state.counters.config_refs, state.counters.auth_profile_refs
    );

    Ok(MigrationPlan {
        config_path: settings.config_path.clone(),
        next_config,
        config_changed,
        payload_path,
        next_payload: state.next_payload,
        payload_changed,
        sops_config_path,
        timeout_ms,
        auth_stores: planned_stores,
        env_file,
        counters: state.counters,
        migrated_values: state.migrated_values,
        backup_targets,
        changed,
    })
}

/// Migrate `<base>/<id>/apiKey` sites (providers, skill entries).
fn migrate_api_key_sites(
    next_config: &mut Value,
    base_config_ptr: &str,
    base_payload_ptr: &str,
    state: &mut PlanState,
) -> Result<()> {
    let keys: Vec<String> = match next_config.pointer(base_config_ptr).and_then(Value::as_object) {
        Some(map) => map.keys().cloned().collect(),
        None => return Ok(()),
    };

    for key in keys {
        let escaped = escape_pointer_token(&key);
        let config_ptr = format!("{base_config_ptr}/{escaped}/apiKey");
        let Some(current) = next_config.pointer(&config_ptr) else {
            continue;
        };
        if SecretRef::parse(current).is_some() {
            continue;
        }
        let Some(plaintext) = current.as_str() else {
            continue;
        };
        let trimmed = plaintext.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }

        let payload_ptr = format!("{base_payload_ptr}/{escaped}/apiKey");
        state.write_payload(&payload_ptr, Value::String(trimmed.clone()))?;
        if let Some(slot) = next_config.pointer_mut(&config_ptr) {
            *slot = SecretRef::File { id: payload_ptr }.to_value();
        }
        state.counters.config_refs += 1;
        state.migrated_values.insert(trimmed);
    }
    Ok(())
}

/// Migrate Google Chat service accounts, top-level and per-account.
fn migrate_googlechat_sites(next_config: &mut Value, state: &mut PlanState) -> Result<()> {
    let mut sites: Vec<(String, String)> = Vec::new();
    if next_config
        .pointer("/channels/googlechat")
        .and_then(Value::as_object)
        .is_some()
    {
        sites.push((
            "/channels/googlechat".to_string(),
            "/channels/googlechat/serviceAccount".to_string(),
        ));
    }
    if let Some(accounts) = next_config
        .pointer("/channels/googlechat/accounts")
        .and_then(Value::as_object)
    {
        for account_id in accounts.keys() {
            let escaped = escape_pointer_token(account_id);
            sites.push((
                format!("/channels/googlechat/accounts/{escaped}"),
                format!("/channels/googlechat/accounts/{escaped}/serviceAccount"),
            ));
        }
    }

    for (obj_ptr, payload_ptr) in sites {
        migrate_service_account_site(next_config, &obj_ptr, &payload_ptr, state)?;
    }
    Ok(())
}

fn migrate_service_account_site(
    next_config: &mut Value,
    obj_ptr: &str,
    payload_ptr: &str,
    state: &mut PlanState,
) -> Result<()> {
    let Some(obj) = next_config.pointer(obj_ptr).and_then(Value::as_object) else {
        return Ok(());
    };
    let has_ref_sibling = obj
        .get("serviceAccountRef")
        .and_then(SecretRef::parse)
        .is_some();
    let service_account = obj.get("serviceAccount").cloned();

    // An explicit ref sibling wins: drop a lingering plaintext value and
    // leave the ref untouched.
    if has_ref_sibling {
        let is_plaintext = service_account
            .as_ref()
            .map(|sa| match sa {
                Value::String(s) => !s.trim().is_empty(),
                Value::Object(map) => !map.is_empty() && SecretRef::parse(sa).is_none(),
                _ => false,
            })
            .unwrap_or(false);
        if is_plaintext {
            if let Some(obj) = next_config.pointer_mut(obj_ptr).and_then(Value::as_object_mut) {
                obj.remove("serviceAccount");
                state.counters.plaintext_removed += 1;
            }
        }
        return Ok(());
    }

    let migrated = match service_account {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                state.migrated_values.insert(trimmed.to_string());
                Some(Value::String(trimmed.to_string()))
            }
        }
        // Objects are cloned into the payload byte-preserving; a ref stored
        // directly in serviceAccount is already migrated.
        Some(ref sa @ Value::Object(ref map)) => {
            if map.is_empty() || SecretRef::parse(sa).is_some() {
                None
            } else {
                Some(sa.clone())
            }
        }
        _ => None,
    };

    if let Some(value) = migrated {
        state.write_payload(payload_ptr, value)?;
        if let Some(obj) = next_config.pointer_mut(obj_ptr).and_then(Value::as_object_mut) {
            obj.insert(
                "serviceAccountRef".to_string(),
                SecretRef::File {
                    id: payload_ptr.to_string(),
                }
                .to_value(),
            );
            obj.remove("serviceAccount");
        }
        state.counters.config_refs += 1;
    }
    Ok(())
}

/// Migrate one auth store, returning the rewritten store.
fn migrate_auth_store(original: &Value, scope: &str, state: &mut PlanState) -> Result<Value> {
    let mut next = original.clone();
    let profile_ids: Vec<String> = match next.get("profiles").and_then(Value::as_object) {
        Some(map) => map.keys().cloned().collect(),
        None => return Ok(next),
    };

    for profile_id in profile_ids {
        let Some(profile) = next
            .get("profiles")
            .and_then(|p| p.get(&profile_id))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let (ref_field, plain_field) = match profile.get("type").and_then(Value::as_str) {
            Some("api_key") => ("keyRef", "key"),
            Some("token") => ("tokenRef", "token"),
            _ => continue,
        };

        let has_ref = profile.get(ref_field).and_then(SecretRef::parse).is_some();
        let plaintext = profile
            .get(plain_field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if has_ref {
            if plaintext.is_some() {
                if let Some(profile) = next
                    .get_mut("profiles")
                    .and_then(|p| p.get_mut(&profile_id))
                    .and_then(Value::as_object_mut)
                {
                    profile.remove(plain_field);
                    state.counters.plaintext_removed += 1;
                }
            }
            continue;
        }

        let Some(plaintext) = plaintext else {
            continue;
        };
        let payload_ptr = format!(
            "/auth-profiles/{}/{}/{}",
            escape_pointer_token(scope),
            escape_pointer_token(&profile_id),
            plain_field
        );
        state.write_payload(&payload_ptr, Value::String(plaintext.clone()))?;
        if let Some(profile) = next
            .get_mut("profiles")
            .and_then(|p| p.get_mut(&profile_id))
            .and_then(Value::as_object_mut)
        {
            profile.insert(
                ref_field.to_string(),
                SecretRef::File { id: payload_ptr }.to_value(),
            );
            profile.remove(plain_field);
        }
        state.counters.auth_profile_refs += 1;
        state.migrated_values.insert(plaintext);
    }
    Ok(next)
}

// ============================================================================
// Apply and rollback
// ============================================================================

/// Apply a plan: back up every target, write in order, roll back on failure.
pub async fn apply_migration_plan(
    plan: &MigrationPlan,
    settings: &MigrationSettings,
) -> Result<MigrationOutcome> {
    if !plan.changed {
        return Ok(MigrationOutcome {
            changed: false,
            backup_id: None,
            counters: plan.counters.clone(),
        });
    }

    let root = backup_root(&settings.state_dir);
    let backup_id = allocate_backup_id(&root, Utc::now());
    let manifest = create_backup(&root, &backup_id, &plan.backup_targets)?;
    info!("Created secrets-migrate backup {backup_id}");

    if let Err(error) = perform_writes(plan).await {
        let backup_dir = root.join(&backup_id);
        if let Err(restore_error) = restore_from_manifest(&manifest, &backup_dir) {
            bail!(
                "Secrets migration failed and was rolled back from backup {backup_id}: {error} \
                 (restore also failed: {restore_error})"
            );
        }
        bail!("Secrets migration failed and was rolled back from backup {backup_id}: {error}");
    }

    prune_old_backups(&root)?;
    Ok(MigrationOutcome {
        changed: true,
        backup_id: Some(backup_id),
        counters: plan.counters.clone(),
    })
}

/// Write order: encrypted payload, config, auth stores, env file. The
/// payload must land before any file that references it.
async fn perform_writes(plan: &MigrationPlan) -> Result<()> {
    if plan.payload_changed {
        let request = SopsRequest {
            timeout_ms: plan.timeout_ms,
            missing_binary_message: MISSING_SOPS_MESSAGE,
            config_path: plan.sops_config_path.as_deref(),
        };
        sops_encrypt(&plan.payload_path, &plan.next_payload, &request).await?;
    }
    if plan.config_changed {
        let mode = existing_file_mode(&plan.config_path);
        write_json_file_atomic(&plan.config_path, &plan.next_config, mode)?;
    }
    for store in plan.auth_stores.iter().filter(|s| s.changed) {
        write_json_file_atomic(&store.path, &store.next_store, Some(0o600))?;
    }
    if let Some(env) = &plan.env_file {
        let mode = existing_file_mode(&env.path);
        write_file_atomic(&env.path, env.next_contents.as_bytes(), mode)?;
    }
    Ok(())
}

/// Restore a backup by id. Never mutates the backup, so calling twice is safe.
pub fn rollback_migration(state_dir: &Path, backup_id: &str) -> Result<RollbackOutcome> {
    let backup_dir = backup_root(state_dir).join(backup_id);
    let manifest = load_manifest(&backup_dir)?;
    let stats = restore_from_manifest(&manifest, &backup_dir)?;
    info!(
        "Restored backup {backup_id}: {} file(s) restored, {} deleted",
        stats.restored_files.len(),
        stats.deleted_files.len()
    );
    Ok(RollbackOutcome {
        backup_id: backup_id.to_string(),
        restored_files: stats.restored_files,
        deleted_files: stats.deleted_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{default_agent_dir, AUTH_PROFILES_FILE};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        settings: MigrationSettings,
        config_dir: PathBuf,
    }

    fn fixture(config: &Value) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("cfg");
        let state_dir = dir.path().join("state");
        fs::create_dir_all(&config_dir).unwrap();
        fs::create_dir_all(&state_dir).unwrap();
        let config_path = config_dir.join("openclaw.json");
        fs::write(&config_path, serde_json::to_string_pretty(config).unwrap()).unwrap();
        Fixture {
            _dir: dir,
            settings: MigrationSettings {
                config_path,
                state_dir,
                scrub_env: true,
            },
            config_dir,
        }
    }

    fn file_ref(id: &str) -> Value {
        json!({"source": "file", "id": id})
    }

    #[tokio::test]
    async fn provider_plaintext_becomes_file_ref() {
        let fx = fixture(&json!({
            "models": {"providers": {"openai": {"apiKey": "sk-openai-plaintext"}}}
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        assert!(plan.changed);
        assert_eq!(
            plan.next_config["models"]["providers"]["openai"]["apiKey"],
            file_ref("/providers/openai/apiKey")
        );
        assert_eq!(
            plan.next_payload["providers"]["openai"]["apiKey"],
            "sk-openai-plaintext"
        );
        assert_eq!(plan.counters.config_refs, 1);
        assert_eq!(plan.counters.secrets_written, 1);
        assert!(plan.migrated_values.contains("sk-openai-plaintext"));
        // No file source was configured, so one is synthesized.
        assert_eq!(plan.next_config["secrets"]["sources"]["file"]["type"], "sops");
        assert_eq!(
            plan.next_config["secrets"]["sources"]["file"]["timeoutMs"],
            5000
        );
        assert_eq!(
            plan.next_config["secrets"]["sources"]["file"]["path"],
            fx.settings
                .state_dir
                .join("secrets.enc.json")
                .to_string_lossy()
                .into_owned()
        );
    }

    #[tokio::test]
    async fn planning_never_touches_disk() {
        let config = json!({
            "models": {"providers": {"openai": {"apiKey": "sk-openai-plaintext"}}}
        });
        let fx = fixture(&config);
        let before = fs::read_to_string(&fx.settings.config_path).unwrap();

        let plan = build_migration_plan(&fx.settings).await.unwrap();
        assert!(plan.changed);

        assert_eq!(fs::read_to_string(&fx.settings.config_path).unwrap(), before);
        assert!(!plan.payload_path.exists());
    }

    #[tokio::test]
    async fn already_migrated_config_is_unchanged() {
        let fx = fixture(&json!({
            "models": {"providers": {"openai": {"apiKey": {"source": "file", "id": "/providers/openai/apiKey"}}}},
            "secrets": {"sources": {"file": {"type": "sops", "path": "/tmp/openclaw-tests-absent-payload.enc.json"}}}
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        assert!(!plan.changed);
        assert!(!plan.config_changed);
        assert!(!plan.payload_changed);
        assert_eq!(plan.counters, MigrationCounters::default());
        assert!(plan.backup_targets.is_empty());
    }

    #[tokio::test]
    async fn env_refs_are_left_alone() {
        let fx = fixture(&json!({
            "models": {"providers": {"openai": {"apiKey": {"source": "env", "id": "OPENAI_API_KEY"}}}}
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();
        assert!(!plan.changed);
    }

    #[tokio::test]
    async fn skill_entries_migrate_with_escaped_keys() {
        let fx = fixture(&json!({
            "skills": {"entries": {"review/pr": {"apiKey": "sk-skill-plaintext"}}}
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        assert_eq!(
            plan.next_config["skills"]["entries"]["review/pr"]["apiKey"],
            file_ref("/skills/entries/review~1pr/apiKey")
        );
        assert_eq!(
            plan.next_payload["skills"]["entries"]["review/pr"]["apiKey"],
            "sk-skill-plaintext"
        );
    }

    #[tokio::test]
    async fn googlechat_string_and_object_accounts_migrate() {
        let fx = fixture(&json!({
            "channels": {
                "googlechat": {
                    "serviceAccount": {"client_email": "svc@example.com", "private_key": "----"},
                    "accounts": {
                        "support": {"serviceAccount": "sa-json-string"}
                    }
                }
            }
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        let gchat = &plan.next_config["channels"]["googlechat"];
        assert_eq!(
            gchat["serviceAccountRef"],
            file_ref("/channels/googlechat/serviceAccount")
        );
        assert!(gchat.get("serviceAccount").is_none());
        assert_eq!(
            plan.next_payload["channels"]["googlechat"]["serviceAccount"]["client_email"],
            "svc@example.com"
        );

        let account = &gchat["accounts"]["support"];
        assert_eq!(
            account["serviceAccountRef"],
            file_ref("/channels/googlechat/accounts/support/serviceAccount")
        );
        assert_eq!(
            plan.next_payload["channels"]["googlechat"]["accounts"]["support"]["serviceAccount"],
            "sa-json-string"
        );
        assert_eq!(plan.counters.config_refs, 2);
        // The object value is not a string and cannot appear in the env file.
        assert!(plan.migrated_values.contains("sa-json-string"));
        assert_eq!(plan.migrated_values.len(), 1);
    }

    #[tokio::test]
    async fn ref_sibling_drops_lingering_plaintext() {
        let fx = fixture(&json!({
            "channels": {
                "googlechat": {
                    "serviceAccount": "stale-plaintext",
                    "serviceAccountRef": {"source": "file", "id": "/channels/googlechat/serviceAccount"}
                }
            },
            "secrets": {"sources": {"file": {"type": "sops", "path": "/tmp/openclaw-tests-absent-payload.enc.json"}}}
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        let gchat = &plan.next_config["channels"]["googlechat"];
        assert!(gchat.get("serviceAccount").is_none());
        assert_eq!(
            gchat["serviceAccountRef"],
            file_ref("/channels/googlechat/serviceAccount")
        );
        assert_eq!(plan.counters.plaintext_removed, 1);
        assert_eq!(plan.counters.config_refs, 0);
        assert!(plan.config_changed);
        assert!(!plan.payload_changed);
    }

    #[tokio::test]
    async fn auth_store_profiles_migrate_with_scope() {
        let fx = fixture(&json!({}));
        let agent_dir = default_agent_dir(&fx.settings.state_dir);
        fs::create_dir_all(&agent_dir).unwrap();
        fs::write(
            agent_dir.join(AUTH_PROFILES_FILE),
            serde_json::to_string_pretty(&json!({
                "profiles": {
                    "openai": {"type": "api_key", "key": "sk-auth-plaintext"},
                    "github": {"type": "token", "token": "ghp-plaintext"},
                    "oauth": {"type": "oauth", "refreshToken": "untouched"}
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        assert_eq!(plan.auth_stores.len(), 1);
        let store = &plan.auth_stores[0];
        assert!(store.changed);
        assert_eq!(store.scope, "main");

        let openai = &store.next_store["profiles"]["openai"];
        assert_eq!(openai["keyRef"], file_ref("/auth-profiles/main/openai/key"));
        assert!(openai.get("key").is_none());

        let github = &store.next_store["profiles"]["github"];
        assert_eq!(
            github["tokenRef"],
            file_ref("/auth-profiles/main/github/token")
        );
        assert!(github.get("token").is_none());

        // Unknown profile types are preserved verbatim.
        assert_eq!(
            store.next_store["profiles"]["oauth"]["refreshToken"],
            "untouched"
        );

        assert_eq!(plan.next_payload["auth-profiles"]["main"]["openai"]["key"], "sk-auth-plaintext");
        assert_eq!(plan.next_payload["auth-profiles"]["main"]["github"]["token"], "ghp-plaintext");
        assert_eq!(plan.counters.auth_profile_refs, 2);
        assert_eq!(plan.counters.auth_stores_changed, 1);
        assert!(plan.migrated_values.contains("sk-auth-plaintext"));
        assert!(plan.migrated_values.contains("ghp-plaintext"));
    }

    #[tokio::test]
    async fn auth_profile_with_ref_drops_plaintext_only() {
        let fx = fixture(&json!({
            "secrets": {"sources": {"file": {"type": "sops", "path": "/tmp/openclaw-tests-absent-payload.enc.json"}}}
        }));
        let agent_dir = default_agent_dir(&fx.settings.state_dir);
        fs::create_dir_all(&agent_dir).unwrap();
        fs::write(
            agent_dir.join(AUTH_PROFILES_FILE),
            serde_json::to_string_pretty(&json!({
                "profiles": {
                    "openai": {
                        "type": "api_key",
                        "key": "lingering",
                        "keyRef": {"source": "env", "id": "OPENAI_API_KEY"}
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        let store = &plan.auth_stores[0];
        assert!(store.changed);
        let profile = &store.next_store["profiles"]["openai"];
        assert!(profile.get("key").is_none());
        assert_eq!(profile["keyRef"], json!({"source": "env", "id": "OPENAI_API_KEY"}));
        assert_eq!(plan.counters.plaintext_removed, 1);
        assert_eq!(plan.counters.auth_profile_refs, 0);
        assert!(!plan.payload_changed);
    }

    #[tokio::test]
    async fn env_scrub_is_planned_conservatively() {
        let fx = fixture(&json!({
            "models": {"providers": {"openai": {"apiKey": "sk-openai-plaintext"}}},
            "skills": {"entries": {"review-pr": {"apiKey": "sk-skill-plaintext"}}}
        }));
        fs::write(
            fx.config_dir.join(".env"),
            "OPENAI_API_KEY=sk-openai-plaintext\nSKILL_KEY=sk-skill-plaintext\nUNRELATED=value\n",
        )
        .unwrap();

        let plan = build_migration_plan(&fx.settings).await.unwrap();

        let env = plan.env_file.as_ref().unwrap();
        assert_eq!(
            env.next_contents,
            "SKILL_KEY=sk-skill-plaintext\nUNRELATED=value\n"
        );
        assert_eq!(plan.counters.env_entries_removed, 1);
        assert!(plan.backup_targets.contains(&env.path));
    }

    #[tokio::test]
    async fn env_scrub_can_be_disabled() {
        let mut_fx = {
            let mut fx = fixture(&json!({
                "models": {"providers": {"openai": {"apiKey": "sk-openai-plaintext"}}}
            }));
            fx.settings.scrub_env = false;
            fx
        };
        fs::write(
            mut_fx.config_dir.join(".env"),
            "OPENAI_API_KEY=sk-openai-plaintext\n",
        )
        .unwrap();

        let plan = build_migration_plan(&mut_fx.settings).await.unwrap();
        assert!(plan.env_file.is_none());
        assert_eq!(plan.counters.env_entries_removed, 0);
    }

    #[tokio::test]
    async fn distinct_pointers_count_separately() {
        // The same plaintext behind two providers lands at two payload
        // pointers, so both writes count.
        let fx = fixture(&json!({
            "models": {"providers": {
                "a": {"apiKey": "sk-shared"},
                "b": {"apiKey": "sk-shared"}
            }}
        }));

        let plan = build_migration_plan(&fx.settings).await.unwrap();
        assert_eq!(plan.counters.secrets_written, 2);
        assert_eq!(plan.counters.config_refs, 2);
    }

    #[tokio::test]
    async fn invalid_config_refuses_to_plan() {
        let fx = fixture(&json!({
            "models": {"providers": {"openai": {"apiKey": {"source": "env", "id": "bad-id"}}}}
        }));

        let err = build_migration_plan(&fx.settings).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Configuration validation failed"));
        assert!(message.contains("/models/providers/openai/apiKey"));
    }

    #[tokio::test]
    async fn dry_run_apply_of_unchanged_plan_is_a_no_op() {
        let fx = fixture(&json!({}));
        let plan = build_migration_plan(&fx.settings).await.unwrap();
        assert!(!plan.changed);

        let outcome = apply_migration_plan(&plan, &fx.settings).await.unwrap();
        assert!(!outcome.changed);
        assert!(outcome.backup_id.is_none());
        assert!(!backup_root(&fx.settings.state_dir).exists());
    }
}
