//! Idempotent removal of legacy myT-x installs.
//!
//! Earlier releases installed under `%LOCALAPPDATA%\github.com\my-take-dev\
//! myT-x` and test runs occasionally leaked temp directories into the user
//! PATH. Startup sweeps both away. Every failure here is logged and
//! swallowed: cleanup must never block the host from starting.

use std::path::{Path, PathBuf};

use crate::process_path::remove_process_path_entry;

/// Legacy install roots, as subpaths under `%LOCALAPPDATA%`.
const LEGACY_BASE_SUBPATHS: &[&str] = &["github.com/my-take-dev/myT-x"];

/// Files a legacy install may have left behind, relative to its base.
const LEGACY_FILES: &[&str] = &[
    "bin/tmux.exe",
    "bin/tmux.exe.sha256",
    "config.yaml",
    "shim-debug.log",
];

/// Lowercased substrings identifying stale test-temp PATH entries.
const STALE_PATH_MARKERS: &[&str] = &["mytx-path-test-"];

/// Run the full cleanup. Infallible by contract.
pub fn run_legacy_cleanup() {
    for subpath in LEGACY_BASE_SUBPATHS {
        if let Err(err) = cleanup_legacy_install(subpath) {
            tracing::warn!(subpath, error = %format!("{err:#}"), "legacy cleanup failed");
        }
    }
    sweep_stale_registry_entries();
}

fn cleanup_legacy_install(subpath: &str) -> anyhow::Result<()> {
    let Some(local) = local_app_data() else {
        return Ok(()); // nothing to clean without a profile
    };
    let base = join_subpath(&local, subpath);
    let legacy_bin = base.join("bin");

    purge_registry_entry(&legacy_bin);
    remove_legacy_files(&base);
    remove_empty_parents(&legacy_bin, &local);
    remove_process_path_entry(&legacy_bin.to_string_lossy());

    Ok(())
}

#[cfg(windows)]
fn purge_registry_entry(legacy_bin: &Path) {
    use crate::registry::{
        choose_value_type, contains_path_entry, decode_path_value, read_path_value,
        remove_path_entries, win::EnvironmentKey, ENSURE_PATH_MUTEX,
    };

    let _guard = ENSURE_PATH_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let dir = legacy_bin.to_string_lossy();

    let result = (|| -> Result<bool, crate::registry::RegistryError> {
        let Some(mut key) = EnvironmentKey::open_existing()? else {
            return Ok(false); // no Environment key, nothing to purge
        };
        let (raw, value_type) = read_path_value(&mut key.path_source())?;
        let current = decode_path_value(&raw);
        if !contains_path_entry(&current, &dir) {
            return Ok(false);
        }
        let Some(updated) = remove_path_entries(&current, &dir) else {
            return Ok(false);
        };
        key.write_path(&updated, choose_value_type(value_type, &updated))?;
        Ok(true)
    })();

    match result {
        Ok(true) => {
            tracing::info!(dir = %dir, "removed legacy install from user PATH");
            if let Err(err) = crate::broadcast::notify_environment_change() {
                tracing::warn!(error = %err, "environment change broadcast failed");
            }
        }
        Ok(false) => {}
        Err(err) => tracing::warn!(dir = %dir, error = %err, "legacy PATH purge failed"),
    }
}

#[cfg(not(windows))]
fn purge_registry_entry(_legacy_bin: &Path) {}

fn remove_legacy_files(base: &Path) {
    for relative in LEGACY_FILES {
        let path = join_subpath(base, relative);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed legacy file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "legacy file removal failed"),
        }
    }

    // rotated debug logs: shim-debug-<unix>.log
    if let Ok(entries) = std::fs::read_dir(base) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("shim-debug-") && name.ends_with(".log") {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %err, "rotated log removal failed");
                }
            }
        }
    }
}

/// Walk up from `start`, removing directories as long as they are empty,
/// stopping at (and never touching) `stop` and the filesystem root.
fn remove_empty_parents(start: &Path, stop: &Path) {
    let mut current = Some(start.to_path_buf());
    while let Some(dir) = current {
        if dir == stop || dir.parent().is_none() {
            break;
        }
        match std::fs::remove_dir(&dir) {
            Ok(()) => tracing::info!(dir = %dir.display(), "removed empty legacy directory"),
            Err(_) => break, // not empty, already gone, or not ours to remove
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}

#[cfg(windows)]
fn sweep_stale_registry_entries() {
    use crate::registry::{
        choose_value_type, decode_path_value, read_path_value, remove_path_entries_matching,
        win::EnvironmentKey, ENSURE_PATH_MUTEX,
    };

    let _guard = ENSURE_PATH_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let result = (|| -> Result<usize, crate::registry::RegistryError> {
        let Some(mut key) = EnvironmentKey::open_existing()? else {
            return Ok(0);
        };
        let (raw, value_type) = read_path_value(&mut key.path_source())?;
        let current = decode_path_value(&raw);
        let Some((updated, removed)) = remove_path_entries_matching(&current, is_stale_entry)
        else {
            return Ok(0);
        };
        key.write_path(&updated, choose_value_type(value_type, &updated))?;
        Ok(removed)
    })();

    match result {
        Ok(0) => {}
        Ok(removed) => {
            tracing::info!(removed, "purged stale test-temp PATH entries");
            if let Err(err) = crate::broadcast::notify_environment_change() {
                tracing::warn!(error = %err, "environment change broadcast failed");
            }
        }
        Err(err) => tracing::warn!(error = %err, "stale PATH sweep failed"),
    }
}

#[cfg(not(windows))]
fn sweep_stale_registry_entries() {}

#[cfg_attr(not(windows), allow(dead_code))]
fn is_stale_entry(entry: &str) -> bool {
    let lowered = entry.to_lowercase();
    STALE_PATH_MARKERS.iter().any(|m| lowered.contains(m))
}

fn local_app_data() -> Option<PathBuf> {
    let raw = std::env::var("LOCALAPPDATA").unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Join a `/`-separated subpath using native components.
fn join_subpath(base: &Path, subpath: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for component in subpath.split('/') {
        if !component.is_empty() {
            path.push(component);
        }
    }
    path
}
