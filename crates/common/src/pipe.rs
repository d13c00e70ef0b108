//! Per-user IPC endpoint naming.
//!
//! The host binds one endpoint per Windows user so concurrent sessions on a
//! shared machine never cross-talk. Usernames go through a conservative
//! sanitizer before they reach the pipe namespace. Off Windows the same name
//! addresses a unix-domain socket under the temp directory, which keeps the
//! whole IPC stack exercisable on non-Windows CI hosts.

use std::path::PathBuf;

/// Prefix of every Windows named-pipe path.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

const ENDPOINT_BASE: &str = "mytx-tmux";

/// Collapse any character outside `[A-Za-z0-9._-]` to `_`. Empty or
/// whitespace-only input maps to the sentinel `unknown`.
pub fn sanitize_user(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The invoking user, sanitized. `USERNAME` wins on Windows; `USER` is the
/// unix spelling.
pub fn current_user() -> String {
    let raw = std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default();
    sanitize_user(&raw)
}

/// Bare endpoint name, stable per user on one machine.
pub fn endpoint_name_for(user: &str) -> String {
    format!("{ENDPOINT_BASE}-{}", sanitize_user(user))
}

/// Full transport address for the current user.
///
/// Windows: `\\.\pipe\mytx-tmux-<user>`. Elsewhere: a socket path in the
/// temp directory carrying the same name.
pub fn default_endpoint() -> String {
    endpoint_for(&current_user())
}

/// Full transport address for an explicit user name.
pub fn endpoint_for(user: &str) -> String {
    let name = endpoint_name_for(user);
    if cfg!(windows) {
        format!("{PIPE_PREFIX}{name}")
    } else {
        socket_path(&name).to_string_lossy().into_owned()
    }
}

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}
