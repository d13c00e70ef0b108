//! Shell-normalization transform stage.
//!
//! Windows-only: Unix-shell constructs in the request's args are lifted
//! into request fields for the process-creation commands and rewritten to
//! PowerShell syntax for `send-keys`. On other platforms the stage reports
//! no change.

use mytx_common::{FlagValue, TmuxRequest};

use crate::shellparse::{parse_unix_command, translate_send_keys_args};

/// Apply the shell transform in place; returns whether anything changed.
pub fn apply(req: &mut TmuxRequest) -> bool {
    if !cfg!(windows) {
        return false;
    }
    match req.command.as_str() {
        "new-session" | "new-window" | "split-window" => apply_process_command(req),
        "send-keys" => apply_send_keys(req),
        _ => false,
    }
}

fn apply_process_command(req: &mut TmuxRequest) -> bool {
    let work_dir = req.flag_str("-c").unwrap_or_default().to_string();
    let parsed = parse_unix_command(&req.args, &work_dir);
    let mut changed = false;

    if parsed.work_dir != work_dir {
        req.flags
            .insert("-c".to_string(), FlagValue::Str(parsed.work_dir.clone()));
        changed = true;
    }
    for (key, value) in &parsed.extra_env {
        // inferred env never overwrites what the caller already set
        if !req.env.contains_key(key) {
            req.env.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    if parsed.clean_args != req.args {
        req.args = parsed.clean_args.clone();
        changed = true;
    }
    changed
}

fn apply_send_keys(req: &mut TmuxRequest) -> bool {
    let translated = translate_send_keys_args(&req.args);
    if translated == req.args {
        return false;
    }
    req.args = translated;
    true
}
