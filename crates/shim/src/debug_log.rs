//! Appending debug log with size-triggered rotation and capped pruning.
//!
//! The shim is short-lived and frequently spawned, so the log must tolerate
//! concurrent writers: rotation renames race (rename-collision retry),
//! rotated generations are pruned lazily behind a per-directory counter,
//! and every failure degrades to a throttled stderr fallback instead of
//! surfacing to the invocation.
//!
//! The prune path never calls back into this logger: its diagnostics go
//! through an explicitly passed stderr writer, which structurally rules out
//! `log -> rotate -> prune -> log` recursion.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use mytx_common::paths;
use once_cell::sync::Lazy;

const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;
/// Env override for tests; mirrors the production default otherwise.
const MAX_BYTES_VAR: &str = "MYTX_SHIM_LOG_MAX_BYTES";
const ROTATED_KEEP: usize = 32;
const ROTATED_PREFIX: &str = "shim-debug-";
const ROTATED_SUFFIX: &str = ".log";
const RENAME_RETRIES: u32 = 4;
const ROTATION_SUFFIX_WINDOW: u64 = 64;
const FALLBACK_MESSAGE_CAP: u32 = 3;

#[derive(Default)]
struct FallbackState {
    unavailable_logged: bool,
    messages: u32,
}

// Fallback throttling and the prune counter use independent locks so the
// two paths cannot deadlock against each other.
static FALLBACK: Lazy<Mutex<FallbackState>> = Lazy::new(Mutex::default);
static ROTATION_COUNTS: Lazy<Mutex<HashMap<PathBuf, usize>>> = Lazy::new(Mutex::default);

/// Append one timestamped line to the shim debug log. Never fails the
/// caller: on any error the line goes to the throttled stderr fallback.
pub fn debug_log(message: &str) {
    if let Err(err) = try_write(message) {
        fallback_log(message, &format!("{err:#}"));
    }
}

fn try_write(message: &str) -> Result<()> {
    let path = paths::debug_log_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path has no parent directory"))?;
    fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;

    rotate_if_needed(&path, &mut prune_stderr_line)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "[{}] {}", timestamp(), message)?;
    Ok(())
}

fn max_bytes() -> u64 {
    std::env::var(MAX_BYTES_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_BYTES)
}

fn rotate_if_needed(path: &Path, warn: &mut dyn FnMut(&str)) -> Result<()> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(()); // nothing to rotate yet
    };
    if meta.len() < max_bytes() {
        return Ok(());
    }
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path has no parent directory"))?;

    let now = unix_now();
    let mut offset = free_suffix_offset(dir, now)
        .ok_or_else(|| anyhow!("no free rotation slot within {ROTATION_SUFFIX_WINDOW} names"))?;
    let mut target = rotated_path(dir, now + offset);

    let mut retries = 0;
    loop {
        match fs::rename(path, &target) {
            Ok(()) => break,
            // another shim already rotated the active log out from under us
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && retries < RENAME_RETRIES => {
                retries += 1;
                offset += 1;
                if offset >= ROTATION_SUFFIX_WINDOW {
                    bail!("no free rotation slot within {ROTATION_SUFFIX_WINDOW} names");
                }
                target = rotated_path(dir, now + offset);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("rotating to {}", target.display()))
            }
        }
    }

    maybe_prune(dir, warn);
    Ok(())
}

fn free_suffix_offset(dir: &Path, base: u64) -> Option<u64> {
    (0..ROTATION_SUFFIX_WINDOW).find(|k| !rotated_path(dir, base + k).exists())
}

fn rotated_path(dir: &Path, stamp: u64) -> PathBuf {
    dir.join(format!("{ROTATED_PREFIX}{stamp}{ROTATED_SUFFIX}"))
}

/// Count rotations per directory and prune only once the counter passes
/// the retention cap, so the directory scan stays off the hot path.
fn maybe_prune(dir: &Path, warn: &mut dyn FnMut(&str)) {
    let mut counts = ROTATION_COUNTS.lock().unwrap_or_else(|e| e.into_inner());
    let count = match counts.get(dir) {
        Some(previous) => previous + 1,
        None => count_rotated(dir),
    };
    counts.insert(dir.to_path_buf(), count);

    if count > ROTATED_KEEP {
        prune_rotated(dir, warn);
        counts.insert(dir.to_path_buf(), ROTATED_KEEP);
    }
}

fn count_rotated(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| parse_rotated_stamp(&e.file_name().to_string_lossy()).is_some())
        .count()
}

/// Remove rotated generations past the newest [`ROTATED_KEEP`].
/// Diagnostics go through `warn` only; this path must not call
/// [`debug_log`].
fn prune_rotated(dir: &Path, warn: &mut dyn FnMut(&str)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn(&format!("cannot scan {}: {err}", dir.display()));
            return;
        }
    };

    let mut rotated: Vec<(u64, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(ROTATED_PREFIX) || !name.ends_with(ROTATED_SUFFIX) {
            continue;
        }
        match parse_rotated_stamp(&name) {
            Some(stamp) => rotated.push((stamp, entry.path())),
            None => warn(&format!("skipping unparseable rotated log {name}")),
        }
    }

    rotated.sort_by(|a, b| b.0.cmp(&a.0));

    let mut failures = Vec::new();
    for (_, path) in rotated.iter().skip(ROTATED_KEEP) {
        if let Err(err) = fs::remove_file(path) {
            failures.push(format!("{}: {err}", path.display()));
        }
    }
    if !failures.is_empty() {
        warn(&format!("failed removing rotated logs: {}", failures.join("; ")));
    }
}

fn parse_rotated_stamp(name: &str) -> Option<u64> {
    let stamp = name
        .strip_prefix(ROTATED_PREFIX)?
        .strip_suffix(ROTATED_SUFFIX)?;
    if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stamp.parse().ok()
}

/// Stderr line writer for the prune path.
fn prune_stderr_line(message: &str) {
    eprintln!("[{}] myT-x shim log prune: {message}", timestamp());
}

/// Stderr-only degradation: the "logging unavailable" notice prints once
/// per process, and at most [`FALLBACK_MESSAGE_CAP`] messages follow.
fn fallback_log(message: &str, reason: &str) {
    let mut state = FALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    if !state.unavailable_logged {
        eprintln!("[{}] myT-x shim: logging unavailable: {reason}", timestamp());
        state.unavailable_logged = true;
    }
    if state.messages < FALLBACK_MESSAGE_CAP {
        eprintln!("[{}] {message}", timestamp());
        state.messages += 1;
    }
}

fn timestamp() -> String {
    let now: chrono::DateTime<chrono::Utc> = SystemTime::now().into();
    now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn reset_state_for_tests() {
    *FALLBACK.lock().unwrap_or_else(|e| e.into_inner()) = FallbackState::default();
    ROTATION_COUNTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
