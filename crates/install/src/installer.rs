//! Atomic, content-hash-gated installation of the shim binary.
//!
//! The sidecar `tmux.exe.sha256` owns the "currently installed"
//! fingerprint: matching hashes skip the write entirely, so repeated host
//! startups never touch the binary that live shims may be executing.
//! Writes go through a temp file in the target directory plus rename.

use std::io::Write;
use std::path::{Path, PathBuf};

use mytx_common::paths;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::registry::{self, RegistryError};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("LOCALAPPDATA is not set; cannot resolve the shim install directory")]
    MissingLocalAppData,
    #[error("failed to {operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "no shim source found: no embedded payload, no tmux-shim.exe beside the executable, \
         and no buildable workspace"
    )]
    NoSource,
    #[error("building the shim failed: {0}")]
    Build(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of one install pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    /// Whether the binary was (re)written.
    pub installed: bool,
    /// Whether the user PATH gained the install directory.
    pub path_updated: bool,
    pub message: String,
}

/// Install or refresh the shim under `%LOCALAPPDATA%\myT-x\bin` and make
/// sure the directory is on the user PATH.
pub fn ensure_shim_installed(workspace_root: Option<&Path>) -> Result<InstallResult, InstallError> {
    let bin_dir = paths::bin_dir().map_err(|_| InstallError::MissingLocalAppData)?;
    std::fs::create_dir_all(&bin_dir).map_err(|source| InstallError::Io {
        operation: "create",
        path: bin_dir.clone(),
        source,
    })?;

    let target = bin_dir.join(paths::SHIM_FILE_NAME);
    let sidecar = bin_dir.join(format!("{}{}", paths::SHIM_FILE_NAME, paths::SHIM_HASH_SUFFIX));

    let bytes = resolve_shim_source(workspace_root)?;
    let source_hash = sha256_hex(&bytes);

    let installed = install_shim_if_changed(&sidecar, &source_hash, &target, || {
        write_atomic(&target, &bytes)
    })?;
    if installed {
        tracing::info!(target = %target.display(), "installed shim binary");
    }

    let path_updated = registry::ensure_path_contains(&bin_dir.to_string_lossy())?;
    let message = match (installed, path_updated) {
        (_, true) => format!(
            "shim installed at {}; PATH updated, open a new terminal to pick it up",
            target.display()
        ),
        (true, false) => format!("shim refreshed at {}", target.display()),
        (false, false) => format!("shim up to date at {}", target.display()),
    };

    Ok(InstallResult {
        installed,
        path_updated,
        message,
    })
}

/// True when the shim binary is missing, or its directory is absent from
/// the user PATH in the registry.
pub fn needs_shim_install() -> bool {
    let Ok(target) = paths::shim_target() else {
        return true;
    };
    if !target.is_file() {
        return true;
    }
    needs_path_registration()
}

#[cfg(windows)]
fn needs_path_registration() -> bool {
    let Ok(bin_dir) = paths::bin_dir() else {
        return true;
    };
    match registry_path_contains(&bin_dir.to_string_lossy()) {
        Ok(present) => !present,
        Err(err) => {
            tracing::warn!(error = %err, "PATH registration check failed");
            false
        }
    }
}

#[cfg(not(windows))]
fn needs_path_registration() -> bool {
    false
}

#[cfg(windows)]
fn registry_path_contains(dir: &str) -> Result<bool, RegistryError> {
    let Some(mut key) = registry::win::EnvironmentKey::open_existing()? else {
        return Ok(false);
    };
    let (raw, _) = registry::read_path_value(&mut key.path_source())?;
    Ok(registry::contains_path_entry(
        &registry::decode_path_value(&raw),
        dir,
    ))
}

/// Write only when the sidecar fingerprint disagrees with the source.
/// Returns whether the writer ran. On a failed write the sidecar keeps its
/// previous content so the next pass retries.
fn install_shim_if_changed(
    sidecar: &Path,
    source_hash: &str,
    target: &Path,
    write: impl FnOnce() -> Result<(), InstallError>,
) -> Result<bool, InstallError> {
    if !source_hash.is_empty() && target.is_file() {
        if let Ok(existing) = std::fs::read_to_string(sidecar) {
            if existing.trim() == source_hash {
                return Ok(false);
            }
        }
    }

    write()?;

    if !source_hash.is_empty() {
        std::fs::write(sidecar, source_hash).map_err(|source| InstallError::Io {
            operation: "write",
            path: sidecar.to_path_buf(),
            source,
        })?;
    }
    Ok(true)
}

fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), InstallError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let io = |operation: &'static str, source: std::io::Error| InstallError::Io {
        operation,
        path: target.to_path_buf(),
        source,
    };

    // temp in the target directory so the rename stays on one filesystem;
    // a failed write drops the temp file on the floor, never the target
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io("create temp for", e))?;
    temp.write_all(bytes).map_err(|e| io("write temp for", e))?;
    temp.persist(target)
        .map_err(|e| io("rename temp over", e.error))?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("{hash:x}")
}

/// Resolve the shim payload: embedded bytes, then a `tmux-shim.exe` next
/// to the current executable, then a workspace build.
fn resolve_shim_source(workspace_root: Option<&Path>) -> Result<Vec<u8>, InstallError> {
    if let Some(bytes) = embedded_shim_bytes() {
        return Ok(bytes.to_vec());
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let adjacent = dir.join("tmux-shim.exe");
            if adjacent.is_file() {
                return std::fs::read(&adjacent).map_err(|source| InstallError::Io {
                    operation: "read",
                    path: adjacent,
                    source,
                });
            }
        }
    }

    if let Some(root) = workspace_root {
        if root.join("Cargo.toml").is_file() {
            return build_shim(root);
        }
    }

    Err(InstallError::NoSource)
}

#[cfg(feature = "embedded-shim")]
fn embedded_shim_bytes() -> Option<&'static [u8]> {
    Some(include_bytes!(env!("MYTX_EMBEDDED_SHIM")))
}

#[cfg(not(feature = "embedded-shim"))]
fn embedded_shim_bytes() -> Option<&'static [u8]> {
    None
}

fn build_shim(root: &Path) -> Result<Vec<u8>, InstallError> {
    let output = std::process::Command::new("cargo")
        .args(["build", "--release", "-p", "mytx-shim", "--bin", "tmux"])
        .current_dir(root)
        .output()
        .map_err(|source| InstallError::Io {
            operation: "run cargo build in",
            path: root.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(InstallError::Build(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let binary_name = if cfg!(windows) { "tmux.exe" } else { "tmux" };
    let built = root.join("target").join("release").join(binary_name);
    std::fs::read(&built).map_err(|source| InstallError::Io {
        operation: "read",
        path: built,
        source,
    })
}
