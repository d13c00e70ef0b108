//! Git execution with bounded concurrency and lock-conflict retry.
//!
//! Worktree orchestration fans out git traffic from many tasks at once;
//! a process-wide semaphore caps it at four concurrent commands, and
//! transient `index.lock` conflicts retry with exponential backoff.
//! Cancellation is observable at acquisition, between attempts and during
//! backoff waits. The child environment is locale-neutralized so stderr
//! classification sees English messages.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const MAX_CONCURRENT_GIT_COMMANDS: usize = 4;
pub const SEMAPHORE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_GIT_RETRIES: u32 = 10;
const RETRY_BASE_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_MAX_INTERVAL: Duration = Duration::from_millis(1600);

const LOCALE_KEYS: &[&str] = &["LC_ALL", "LC_MESSAGES", "LANG"];

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

// Process-wide: concurrent git traffic from unrelated repos shares this
// bound.
static GIT_SEMAPHORE: Lazy<Semaphore> =
    Lazy::new(|| Semaphore::new(MAX_CONCURRENT_GIT_COMMANDS));

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git: no command given")]
    NoCommand,
    #[error("git: timed out waiting for a concurrency slot")]
    SemaphoreTimeout,
    #[error("git: cancelled")]
    Cancelled,
    #[error("git: cancelled during backoff")]
    CancelledDuringBackoff,
    #[error("git {verb}: {message}")]
    Failed { verb: String, message: String },
    #[error("git {verb}: lock conflict persisted after {attempts} attempts: {message}")]
    RetryExhausted {
        verb: String,
        attempts: u32,
        message: String,
    },
}

/// Run `git <args>` in `dir`, returning stdout on success.
pub async fn run(
    cancel: &CancellationToken,
    dir: &Path,
    args: &[String],
    extra_env: &[(String, String)],
) -> Result<Vec<u8>, GitError> {
    run_program("git", cancel, dir, args, extra_env).await
}

async fn run_program(
    program: &str,
    cancel: &CancellationToken,
    dir: &Path,
    args: &[String],
    extra_env: &[(String, String)],
) -> Result<Vec<u8>, GitError> {
    if args.is_empty() {
        return Err(GitError::NoCommand);
    }
    if cancel.is_cancelled() {
        return Err(GitError::Cancelled);
    }

    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GitError::Cancelled),
        permit = GIT_SEMAPHORE.acquire() => permit.map_err(|_| GitError::Cancelled)?,
        _ = tokio::time::sleep(SEMAPHORE_ACQUIRE_TIMEOUT) => return Err(GitError::SemaphoreTimeout),
    };

    let verb = args[0].clone();
    let mut last_message = String::new();

    for attempt in 0..MAX_GIT_RETRIES {
        let message = match execute(program, dir, args, extra_env).await {
            Ok(output) if output.status.success() => return Ok(output.stdout),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if stderr.is_empty() {
                    format!("exit status {}", output.status.code().unwrap_or(-1))
                } else {
                    stderr
                }
            }
            Err(err) => err.to_string(),
        };

        if cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        if !is_lock_conflict(&message) {
            return Err(GitError::Failed { verb, message });
        }

        tracing::debug!(verb = %verb, attempt, "git lock conflict, backing off");
        last_message = message;
        if attempt + 1 == MAX_GIT_RETRIES {
            break; // the last attempt gets no backoff wait
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(GitError::CancelledDuringBackoff),
            _ = tokio::time::sleep(backoff_delay(attempt)) => {}
        }
    }

    Err(GitError::RetryExhausted {
        verb,
        attempts: MAX_GIT_RETRIES,
        message: last_message,
    })
}

async fn execute(
    program: &str,
    dir: &Path,
    args: &[String],
    extra_env: &[(String, String)],
) -> std::io::Result<std::process::Output> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .envs(child_env(extra_env));
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);
    command.output().await
}

/// Process environment plus caller entries, locale-neutralized.
fn child_env(extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    for (key, value) in extra {
        match env.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value.clone(),
            None => env.push((key.clone(), value.clone())),
        }
    }
    neutralize_locale(&mut env);
    env
}

/// Force `LC_ALL`, `LC_MESSAGES` and `LANG` to `C`. The key match is
/// case-insensitive on Windows (the first match is rewritten in place),
/// exact elsewhere.
fn neutralize_locale(env: &mut Vec<(String, String)>) {
    for key in LOCALE_KEYS {
        let found = env.iter_mut().find(|(existing, _)| {
            if cfg!(windows) {
                existing.eq_ignore_ascii_case(key)
            } else {
                existing == key
            }
        });
        match found {
            Some(entry) => entry.1 = "C".to_string(),
            None => env.push((key.to_string(), "C".to_string())),
        }
    }
}

/// A stderr message counts as a lock-file conflict iff it names
/// `index.lock`, or reports a create failure on an existing file.
fn is_lock_conflict(message: &str) -> bool {
    message.contains("index.lock")
        || (message.contains("Unable to create") && message.contains("File exists"))
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    RETRY_BASE_INTERVAL
        .saturating_mul(factor)
        .min(RETRY_MAX_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_args_fail_fast() {
        let cancel = CancellationToken::new();
        let err = run(&cancel, Path::new("."), &[], &[]).await.unwrap_err();
        assert!(matches!(err, GitError::NoCommand));
    }

    #[tokio::test]
    async fn pre_cancelled_context_fails_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run(&cancel, Path::new("."), &["status".into()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Cancelled));
    }

    #[test]
    fn lock_conflict_classification() {
        assert!(is_lock_conflict(
            "fatal: Unable to create '/repo/.git/index.lock': File exists"
        ));
        assert!(is_lock_conflict("error: could not write index.lock"));
        assert!(is_lock_conflict(
            "fatal: Unable to create '/repo/.git/refs.lock': File exists"
        ));
        assert!(!is_lock_conflict("fatal: not a git repository"));
        assert!(!is_lock_conflict("fatal: Unable to create directory"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(5), Duration::from_millis(1600));
        assert_eq!(backoff_delay(9), Duration::from_millis(1600));
    }

    #[test]
    fn locale_neutralization_appends_missing_keys() {
        let mut env = vec![("PATH".to_string(), "/usr/bin".to_string())];
        neutralize_locale(&mut env);
        for key in LOCALE_KEYS {
            assert!(
                env.iter().any(|(k, v)| k == key && v == "C"),
                "{key} missing"
            );
        }
        assert!(env.iter().any(|(k, _)| k == "PATH"));
    }

    #[test]
    fn locale_neutralization_overwrites_existing_values() {
        let mut env = vec![
            ("LANG".to_string(), "de_DE.UTF-8".to_string()),
            ("LC_ALL".to_string(), "de_DE.UTF-8".to_string()),
        ];
        neutralize_locale(&mut env);
        assert!(env.iter().any(|(k, v)| k == "LANG" && v == "C"));
        assert!(env.iter().any(|(k, v)| k == "LC_ALL" && v == "C"));
    }

    #[cfg(windows)]
    #[test]
    fn locale_match_is_case_insensitive_on_windows() {
        let mut env = vec![("Lang".to_string(), "de_DE".to_string())];
        neutralize_locale(&mut env);
        assert!(env.iter().any(|(k, v)| k == "Lang" && v == "C"));
        assert_eq!(env.iter().filter(|(k, _)| k.eq_ignore_ascii_case("LANG")).count(), 1);
    }

    #[cfg(not(windows))]
    #[test]
    fn locale_match_is_exact_off_windows() {
        let mut env = vec![("Lang".to_string(), "de_DE".to_string())];
        neutralize_locale(&mut env);
        // mixed-case entry preserved; canonical key appended
        assert!(env.iter().any(|(k, v)| k == "Lang" && v == "de_DE"));
        assert!(env.iter().any(|(k, v)| k == "LANG" && v == "C"));
    }

    #[cfg(unix)]
    mod with_fake_git {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        /// Fake git that fails with a lock conflict until the counter file
        /// reaches `succeed_at`, then prints `ok`.
        fn write_fake_git(dir: &Path, succeed_at: u32) -> std::path::PathBuf {
            let script = dir.join("fake-git.sh");
            let body = format!(
                "#!/bin/sh\n\
                 n=$(cat \"$FAKE_GIT_STATE\" 2>/dev/null || echo 0)\n\
                 n=$((n+1))\n\
                 echo \"$n\" > \"$FAKE_GIT_STATE\"\n\
                 if [ \"$n\" -lt {succeed_at} ]; then\n\
                   echo \"fatal: Unable to create '/repo/.git/index.lock': File exists\" >&2\n\
                   exit 128\n\
                 fi\n\
                 echo ok\n"
            );
            std::fs::write(&script, body).unwrap();
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
            script
        }

        #[tokio::test]
        async fn lock_conflicts_retry_with_backoff_until_success() {
            let temp = tempfile::tempdir().unwrap();
            let script = write_fake_git(temp.path(), 3);
            let state = temp.path().join("state");
            let cancel = CancellationToken::new();
            let env = vec![(
                "FAKE_GIT_STATE".to_string(),
                state.to_string_lossy().into_owned(),
            )];

            let started = Instant::now();
            let stdout = run_program(
                &script.to_string_lossy(),
                &cancel,
                temp.path(),
                &["frob".to_string()],
                &env,
            )
            .await
            .unwrap();
            let elapsed = started.elapsed();

            assert_eq!(stdout, b"ok\n");
            let attempts: u32 = std::fs::read_to_string(&state).unwrap().trim().parse().unwrap();
            assert_eq!(attempts, 3);
            // two backoff waits at ~100ms and ~200ms
            assert!(elapsed >= Duration::from_millis(140), "elapsed {elapsed:?}");
        }

        #[tokio::test]
        async fn non_lock_failures_do_not_retry() {
            let temp = tempfile::tempdir().unwrap();
            let script = temp.path().join("fail-git.sh");
            std::fs::write(
                &script,
                "#!/bin/sh\necho 'fatal: not a git repository' >&2\nexit 128\n",
            )
            .unwrap();
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();

            let cancel = CancellationToken::new();
            let err = run_program(
                &script.to_string_lossy(),
                &cancel,
                temp.path(),
                &["status".to_string()],
                &[],
            )
            .await
            .unwrap_err();

            match err {
                GitError::Failed { verb, message } => {
                    assert_eq!(verb, "status");
                    assert!(message.contains("not a git repository"));
                }
                other => panic!("expected Failed, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn cancellation_interrupts_backoff() {
            let temp = tempfile::tempdir().unwrap();
            let script = write_fake_git(temp.path(), 1000);
            let state = temp.path().join("state");
            let cancel = CancellationToken::new();
            let env = vec![(
                "FAKE_GIT_STATE".to_string(),
                state.to_string_lossy().into_owned(),
            )];

            let canceller = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                canceller.cancel();
            });

            let err = run_program(
                &script.to_string_lossy(),
                &cancel,
                temp.path(),
                &["frob".to_string()],
                &env,
            )
            .await
            .unwrap_err();

            assert!(matches!(
                err,
                GitError::Cancelled | GitError::CancelledDuringBackoff
            ));
        }

        #[tokio::test]
        #[ignore = "takes ~10s of backoff waits"]
        async fn lock_conflicts_exhaust_after_max_retries() {
            let temp = tempfile::tempdir().unwrap();
            let script = write_fake_git(temp.path(), 1000);
            let state = temp.path().join("state");
            let cancel = CancellationToken::new();
            let env = vec![(
                "FAKE_GIT_STATE".to_string(),
                state.to_string_lossy().into_owned(),
            )];

            let err = run_program(
                &script.to_string_lossy(),
                &cancel,
                temp.path(),
                &["frob".to_string()],
                &env,
            )
            .await
            .unwrap_err();

            match err {
                GitError::RetryExhausted { attempts, .. } => {
                    assert_eq!(attempts, MAX_GIT_RETRIES)
                }
                other => panic!("expected RetryExhausted, got {other:?}"),
            }
            let observed: u32 = std::fs::read_to_string(&state).unwrap().trim().parse().unwrap();
            assert_eq!(observed, MAX_GIT_RETRIES);
        }
    }
}
