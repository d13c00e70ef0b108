//! In-memory counterpart of the registry PATH update.
//!
//! Newly installed binaries must be resolvable in the current process
//! without a restart. Runs under the same mutex as the registry update so
//! the two never race.

use crate::registry::{contains_path_entry_sep, ENSURE_PATH_MUTEX};

/// Append `dir` to the process `PATH` unless already present. Returns
/// whether the variable changed; blank input is refused.
pub fn ensure_process_path_contains(dir: &str) -> bool {
    let _guard = ENSURE_PATH_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let dir = dir.trim();
    if dir.is_empty() {
        return false;
    }

    let separator = if cfg!(windows) { ';' } else { ':' };
    let current = std::env::var("PATH").unwrap_or_default();
    if contains_path_entry_sep(&current, dir, separator) {
        return false;
    }

    let trimmed = current.trim_end_matches(separator);
    let updated = if trimmed.is_empty() {
        dir.to_string()
    } else {
        format!("{trimmed}{separator}{dir}")
    };
    std::env::set_var("PATH", updated);
    true
}

/// Remove every `dir` entry from the process `PATH`. Returns whether the
/// variable changed.
pub fn remove_process_path_entry(dir: &str) -> bool {
    let _guard = ENSURE_PATH_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let dir = dir.trim();
    if dir.is_empty() {
        return false;
    }

    let separator = if cfg!(windows) { ';' } else { ':' };
    let current = std::env::var("PATH").unwrap_or_default();
    if !contains_path_entry_sep(&current, dir, separator) {
        return false;
    }

    let needle = crate::registry::normalize_entry(dir);
    let kept: Vec<&str> = current
        .split(separator)
        .filter(|entry| {
            !entry.trim().is_empty() && crate::registry::normalize_entry(entry) != needle
        })
        .collect();
    std::env::set_var("PATH", kept.join(&separator.to_string()));
    true
}
