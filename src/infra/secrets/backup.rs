//! Backup manifests for migration writes.
//!
//! Before a migration touches disk, every target file is copied into a
//! per-run backup directory and recorded in `manifest.json`. Restoring the
//! manifest reconstructs the pre-apply state: entries that existed are
//! copied back with their mode, entries recorded as absent are deleted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Number of migration backups retained.
pub const BACKUP_RETENTION: usize = 20;

/// Manifest file name inside a backup directory.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: String,
    pub created_at: String,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Absolute path of the original file.
    pub path: String,
    /// Whether the file existed at backup time. Restoring an absent entry
    /// deletes the current file.
    pub existed: bool,
    /// File name of the copy inside the backup directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    /// Unix permission bits of the original.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Outcome of a manifest restore.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStats {
    pub restored_files: Vec<String>,
    pub deleted_files: Vec<String>,
}

/// Root directory holding migration backups.
pub fn backup_root(state_dir: &Path) -> PathBuf {
    state_dir.join("backups").join("secrets-migrate")
}

/// Allocate a unique backup id of the form `YYYYMMDDThhmmssZ`, appending a
/// numeric disambiguator while a directory with that id already exists.
pub fn allocate_backup_id(root: &Path, now: DateTime<Utc>) -> String {
    let base = now.format("%Y%m%dT%H%M%SZ").to_string();
    if !root.join(&base).exists() {
        return base;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base}-{counter}");
        if !root.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Copy every target into `<root>/<backup_id>/` and write the manifest.
pub fn create_backup(root: &Path, backup_id: &str, targets: &[PathBuf]) -> Result<BackupManifest> {
    let backup_dir = root.join(backup_id);
    std::fs::create_dir_all(&backup_dir)
        .with_context(|| format!("Cannot create backup directory '{}'", backup_dir.display()))?;

    let mut entries = Vec::with_capacity(targets.len());
    for (index, target) in targets.iter().enumerate() {
        if target.exists() {
            let file_name = target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file");
            let copy_name = format!("{index:02}-{file_name}");
            let copy_path = backup_dir.join(&copy_name);
            std::fs::copy(target, &copy_path).with_context(|| {
                format!(
                    "Cannot back up '{}' to '{}'",
                    target.display(),
                    copy_path.display()
                )
            })?;
            let mode = file_mode(target);
            if let Some(mode) = mode {
                restore_mode(&copy_path, mode);
            }
            entries.push(BackupEntry {
                path: target.to_string_lossy().into_owned(),
                existed: true,
                backup_path: Some(copy_name),
                mode,
            });
        } else {
            entries.push(BackupEntry {
                path: target.to_string_lossy().into_owned(),
                existed: false,
                backup_path: None,
                mode: None,
            });
        }
    }

    let manifest = BackupManifest {
        version: 1,
        backup_id: backup_id.to_string(),
        created_at: Utc::now().to_rfc3339(),
        entries,
    };
    let content = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(backup_dir.join(MANIFEST_FILE), content)
        .with_context(|| format!("Cannot write manifest for backup '{backup_id}'"))?;
    Ok(manifest)
}

/// Load the manifest of an existing backup directory.
pub fn load_manifest(backup_dir: &Path) -> Result<BackupManifest> {
    let path = backup_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Cannot read backup manifest '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Cannot parse backup manifest '{}'", path.display()))
}

/// Put every manifest entry back: copy existing entries over their targets
/// (restoring mode), delete targets recorded as absent. Never mutates the
/// backup itself, so restoring twice is safe.
pub fn restore_from_manifest(manifest: &BackupManifest, backup_dir: &Path) -> Result<RestoreStats> {
    let mut stats = RestoreStats::default();
    for entry in &manifest.entries {
        let target = PathBuf::from(&entry.path);
        if entry.existed {
            let copy_name = entry.backup_path.as_deref().with_context(|| {
                format!("Backup entry for '{}' has no backup copy recorded", entry.path)
            })?;
            let copy_path = backup_dir.join(copy_name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::copy(&copy_path, &target).with_context(|| {
                format!(
                    "Cannot restore '{}' from '{}'",
                    target.display(),
                    copy_path.display()
                )
            })?;
            if let Some(mode) = entry.mode {
                restore_mode(&target, mode);
            }
            stats.restored_files.push(entry.path.clone());
        } else {
            match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Cannot delete '{}' during restore", target.display())
                    });
                }
            }
            stats.deleted_files.push(entry.path.clone());
        }
    }
    Ok(stats)
}

/// Keep the most recent [`BACKUP_RETENTION`] backups by id sort order.
pub fn prune_old_backups(root: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Cannot list backup root '{}'", root.display()));
        }
    };

    let mut ids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .collect();
    ids.sort();
    if ids.len() <= BACKUP_RETENTION {
        return Ok(());
    }

    let stale = ids.len() - BACKUP_RETENTION;
    for id in ids.into_iter().take(stale) {
        let dir = root.join(&id);
        debug!("Pruning old secrets-migrate backup {id}");
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!("Failed to prune backup '{}': {e}", dir.display());
        }
    }
    Ok(())
}

fn file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).ok().map(|m| m.mode() & 0o7777)
    }
    #[cfg(not(unix))]
    None
}

fn restore_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}
