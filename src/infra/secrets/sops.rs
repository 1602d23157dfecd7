//! Typed façade over the `sops` subprocess.
//!
//! Decrypts and encrypts JSON documents with a bounded timeout and bounded
//! output size. Encryption goes through a `0600` plaintext tempfile that is
//! removed on every exit path, and the encrypted result is renamed over the
//! target atomically.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Maximum output captured from a sops invocation (10 MiB).
pub const MAX_SOPS_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Options shared by both driver operations.
#[derive(Debug, Clone)]
pub struct SopsRequest<'a> {
    /// Timeout for the subprocess, in milliseconds.
    pub timeout_ms: u64,
    /// Error text to surface when the binary is not installed.
    pub missing_binary_message: &'a str,
    /// Optional sops config file, passed as `--config` before the operation
    /// arguments so behavior is independent of the working directory.
    pub config_path: Option<&'a Path>,
}

/// Resolve the sops binary name. `OPENCLAW_SOPS_BIN` overrides the default
/// PATH lookup (sops 3.9.0 or newer is expected).
pub fn sops_binary() -> String {
    std::env::var("OPENCLAW_SOPS_BIN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "sops".to_string())
}

/// Locate the sops config file next to the gateway config: `.sops.yaml`
/// first, then `.sops.yml`.
pub fn find_sops_config(config_dir: &Path) -> Option<PathBuf> {
    for name in [".sops.yaml", ".sops.yml"] {
        let candidate = config_dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn decrypt_args(path: &Path, config_path: Option<&Path>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config) = config_path {
        args.push("--config".to_string());
        args.push(config.to_string_lossy().into_owned());
    }
    args.extend([
        "--decrypt".to_string(),
        "--output-type".to_string(),
        "json".to_string(),
        path.to_string_lossy().into_owned(),
    ]);
    args
}

fn encrypt_args(input: &Path, output: &Path, config_path: Option<&Path>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config) = config_path {
        args.push("--config".to_string());
        args.push(config.to_string_lossy().into_owned());
    }
    args.extend([
        "--encrypt".to_string(),
        "--input-type".to_string(),
        "json".to_string(),
        "--output-type".to_string(),
        "json".to_string(),
        "--output".to_string(),
        output.to_string_lossy().into_owned(),
        input.to_string_lossy().into_owned(),
    ]);
    args
}

/// Decrypt `path` and parse the plaintext as JSON.
pub async fn sops_decrypt(path: &Path, req: &SopsRequest<'_>) -> Result<serde_json::Value> {
    let output = run_sops(&decrypt_args(path, req.config_path), "decrypt", path, req).await?;
    serde_json::from_slice(&output)
        .map_err(|e| anyhow!("sops decrypt failed for {}: {e}", path.display()))
}

/// Encrypt `payload` into `path`.
///
/// The plaintext is staged in a `0600` tempfile beside the target; the
/// encrypted output is staged the same way and renamed over `path`. Both
/// tempfiles are removed on every exit path.
pub async fn sops_encrypt(
    path: &Path,
    payload: &serde_json::Value,
    req: &SopsRequest<'_>,
) -> Result<()> {
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
        .unwrap_or("secrets.enc.json");
    let token = uuid::Uuid::new_v4().simple().to_string();
    let pid = std::process::id();
    let tmp_plain = dir.join(format!(".{file_name}.{pid}.{token}.plain.json"));
    let tmp_enc = dir.join(format!(".{file_name}.{pid}.{token}.enc.json"));

    let result = encrypt_via_tempfiles(path, payload, &tmp_plain, &tmp_enc, req).await;

    let _ = std::fs::remove_file(&tmp_plain);
    let _ = std::fs::remove_file(&tmp_enc);
    result
}

async fn encrypt_via_tempfiles(
    path: &Path,
    payload: &serde_json::Value,
    tmp_plain: &Path,
    tmp_enc: &Path,
    req: &SopsRequest<'_>,
) -> Result<()> {
    let plaintext = serde_json::to_vec_pretty(payload)?;
    write_private_file(tmp_plain, &plaintext)
        .with_context(|| format!("Cannot stage plaintext for {}", path.display()))?;

    run_sops(
        &encrypt_args(tmp_plain, tmp_enc, req.config_path),
        "encrypt",
        path,
        req,
    )
    .await?;

    std::fs::rename(tmp_enc, path)
        .with_context(|| format!("sops encrypt failed for {}: cannot rename output", path.display()))?;
    set_private_mode(path);
    Ok(())
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

fn set_private_mode(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
}

async fn run_sops(
    args: &[String],
    op: &str,
    path: &Path,
    req: &SopsRequest<'_>,
) -> Result<Vec<u8>> {
    let binary = sops_binary();
    debug!("Running {binary} {op} for {}", path.display());

    let mut cmd = Command::new(&binary);
    cmd.args(args);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let result = tokio::time::timeout(Duration::from_millis(req.timeout_ms), cmd.output()).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("{}", req.missing_binary_message);
        }
        Ok(Err(e)) => {
            bail!("sops {op} failed for {}: {e}", path.display());
        }
        Err(_) => {
            bail!(
                "sops {op} timed out after {}ms for {}",
                req.timeout_ms,
                path.display()
            );
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let mut message = format!("sops {op} failed for {}: {stderr}", path.display());
        if op == "encrypt" && stderr.to_lowercase().contains("creation rule") {
            message.push_str(&format!(
                " — add a creation rule covering {} to .sops.yaml (or set SOPS_AGE_RECIPIENTS) and retry",
                path.display()
            ));
        }
        bail!(message);
    }

    if output.stdout.len() > MAX_SOPS_OUTPUT_BYTES {
        bail!(
            "sops {op} failed for {}: output exceeds {} bytes",
            path.display(),
            MAX_SOPS_OUTPUT_BYTES
        );
    }

    Ok(output.stdout)
}
