use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maximum size for a config file (10 MB).
pub const MAX_CONFIG_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Parse a JSON5 configuration string.
pub fn parse_config_json5(content: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = json5::from_str(content)?;
    Ok(value)
}

/// Read a configuration file with security hardening.
///
/// Security checks:
/// - File size guardrail (`MAX_CONFIG_FILE_BYTES`)
/// - Hardlink detection (rejects files with nlink > 1)
/// - Symlink rejection on the final component (O_NOFOLLOW semantics on Unix)
pub fn read_config_file_snapshot(path: &Path) -> Result<serde_json::Value> {
    // 1. Check file metadata before reading.
    let metadata = std::fs::symlink_metadata(path)
        .with_context(|| format!("Cannot stat config file '{}'", path.display()))?;

    // 2. Reject symlinks at the final path component (O_NOFOLLOW equivalent).
    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        bail!(
            "Config file '{}' is a symlink — refusing to follow for security",
            path.display()
        );
    }

    // 3. Resolve to canonical path and re-stat.
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Cannot canonicalize config path '{}'", path.display()))?;
    let real_metadata = std::fs::metadata(&canonical)
        .with_context(|| format!("Cannot stat canonical config path '{}'", canonical.display()))?;

    // 4. Size guardrail.
    if real_metadata.len() > MAX_CONFIG_FILE_BYTES {
        bail!(
            "Config file '{}' is {} bytes, exceeds limit of {} bytes",
            path.display(),
            real_metadata.len(),
            MAX_CONFIG_FILE_BYTES,
        );
    }

    // 5. Reject hardlinked files (nlink > 1).
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if real_metadata.is_file() && real_metadata.nlink() > 1 {
            bail!(
                "Config file '{}' has {} hard links — refusing to read \
                 (hardlinks can alias files outside workspace)",
                path.display(),
                real_metadata.nlink(),
            );
        }
    }

    // 6. Read content from canonical path.
    let content = std::fs::read_to_string(&canonical)
        .with_context(|| format!("Failed to read config file '{}'", canonical.display()))?;

    parse_config_json5(&content)
}

/// Atomically write bytes to a file: tempfile in the target directory, then
/// rename over the destination. `mode` applies on Unix before the rename.
pub fn write_file_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Cannot create directory '{}'", dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| -> Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = options
            .open(&tmp)
            .with_context(|| format!("Cannot create tempfile '{}'", tmp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("Cannot write tempfile '{}'", tmp.display()))?;
        file.sync_all().ok();
        drop(file);
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Cannot rename tempfile over '{}'", path.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Atomically write a JSON document, pretty-printed with a trailing newline.
pub fn write_json_file_atomic(
    path: &Path,
    value: &serde_json::Value,
    mode: Option<u32>,
) -> Result<()> {
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    write_file_atomic(path, content.as_bytes(), mode)
}

/// The file mode of an existing file, if any (Unix permission bits only).
pub fn existing_file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).ok().map(|m| m.mode() & 0o7777)
    }
    #[cfg(not(unix))]
    None
}

// ============================================================================
// Tests
// ============================================================================
