//! Model-name rewrite transform stage.
//!
//! Rewrites `--model` arguments per the configured rules: a per-agent
//! override selected through `--agent-name` wins; the `from`/`to` fallback
//! only fires when no override replaced anything. The rewrite itself is a
//! pure function; the stage entry point adds the platform gate and the
//! cached config loader.

use std::sync::Arc;

use mytx_common::TmuxRequest;

use crate::model_config::{self, AgentModelConfig, ModelConfigError};

const MODEL_FLAG: &str = "--model";
const AGENT_NAME_FLAG: &str = "--agent-name";

/// Apply the model transform using the process-wide cached config.
pub fn apply(req: &mut TmuxRequest) -> Result<bool, ModelConfigError> {
    apply_with(req, model_config::load_cached)
}

/// Apply with an explicit loader; the seam used by tests.
pub fn apply_with<F>(req: &mut TmuxRequest, loader: F) -> Result<bool, ModelConfigError>
where
    F: FnOnce() -> Result<Option<Arc<AgentModelConfig>>, ModelConfigError>,
{
    if !cfg!(windows) {
        return Ok(false);
    }
    if !matches!(
        req.command.as_str(),
        "new-session" | "split-window" | "send-keys"
    ) || req.args.is_empty()
    {
        return Ok(false);
    }

    let Some(config) = loader()? else {
        return Ok(false);
    };
    if config.is_empty() {
        return Ok(false);
    }

    match rewrite_model_args(&req.args, &config) {
        Some(rewritten) => {
            req.args = rewritten;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Pure rewrite over a copy of the args; `None` when nothing changed.
pub fn rewrite_model_args(args: &[String], config: &AgentModelConfig) -> Option<Vec<String>> {
    let mut out = args.to_vec();

    if let Some(target) = selected_override(args, config) {
        if rewrite_models(&mut out, &|_current| Some(target.clone())) {
            return Some(out);
        }
    }

    if config.has_fallback() {
        let from = config.from.trim();
        let to = config.to.trim().to_string();
        if rewrite_models(&mut out, &|current| {
            current.eq_ignore_ascii_case(from).then(|| to.clone())
        }) {
            return Some(out);
        }
    }

    None
}

/// The first `--agent-name` candidate matching any override (checked in
/// override order) selects that override's model.
fn selected_override(args: &[String], config: &AgentModelConfig) -> Option<String> {
    for candidate in agent_name_candidates(args) {
        let lowered = candidate.to_lowercase();
        for rule in &config.overrides {
            let pattern = rule.name_pattern.trim().to_lowercase();
            if !pattern.is_empty() && lowered.contains(&pattern) {
                return Some(rule.model.clone());
            }
        }
    }
    None
}

/// Extract `--agent-name` values in argument order, supporting the
/// tokenized pair, inline-equals and inline-space surface forms.
fn agent_name_candidates(args: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == AGENT_NAME_FLAG {
            if let Some(next) = args.get(i + 1) {
                if let Some(value) = accept_value(next) {
                    candidates.push(value);
                    i += 2;
                    continue;
                }
            }
        } else {
            for m in find_inline_flag_values(arg, AGENT_NAME_FLAG) {
                candidates.push(m.value);
            }
        }
        i += 1;
    }
    candidates
}

/// Rewrite every `--model` occurrence whose current value `replace`
/// accepts. Returns whether any replacement happened.
fn rewrite_models(args: &mut [String], replace: &dyn Fn(&str) -> Option<String>) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < args.len() {
        if args[i] == MODEL_FLAG {
            if let Some(next) = args.get(i + 1) {
                if let Some(current) = accept_value(next) {
                    if let Some(target) = replace(&current) {
                        args[i + 1] = target;
                        changed = true;
                    }
                    i += 2;
                    continue;
                }
            }
        } else if let Some(rewritten) = rewrite_inline_models(&args[i], replace) {
            args[i] = rewritten;
            changed = true;
        }
        i += 1;
    }
    changed
}

/// Replace `--model` values embedded in a longer argument string, keeping
/// the surrounding quoting intact. `None` when nothing matched.
fn rewrite_inline_models(arg: &str, replace: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    let matches = find_inline_flag_values(arg, MODEL_FLAG);
    if matches.is_empty() {
        return None;
    }

    let mut rebuilt = String::with_capacity(arg.len());
    let mut cursor = 0;
    let mut changed = false;
    for m in matches {
        let Some(target) = replace(&m.value) else {
            continue;
        };
        rebuilt.push_str(&arg[cursor..m.value_start]);
        match m.quote {
            Some(q) => {
                rebuilt.push(q);
                rebuilt.push_str(&target);
                rebuilt.push(q);
            }
            None => rebuilt.push_str(&target),
        }
        cursor = m.value_end;
        changed = true;
    }
    if !changed {
        return None;
    }
    rebuilt.push_str(&arg[cursor..]);
    Some(rebuilt)
}

struct InlineMatch {
    /// Byte offset of the value (including its opening quote, if any).
    value_start: usize,
    /// Byte offset one past the value (including its closing quote).
    value_end: usize,
    value: String,
    quote: Option<char>,
}

/// Find `<flag>=VALUE` and `<flag> VALUE` occurrences inside `arg`, where
/// the flag stands on a word boundary. Blank values and values that look
/// like another flag are skipped.
fn find_inline_flag_values(arg: &str, flag: &str) -> Vec<InlineMatch> {
    let bytes = arg.as_bytes();
    let mut out = Vec::new();
    let mut search_from = 0;

    while let Some(rel) = arg[search_from..].find(flag) {
        let start = search_from + rel;
        let after = start + flag.len();
        search_from = after;

        let on_word_start = start == 0 || bytes[start - 1].is_ascii_whitespace();
        if !on_word_start {
            continue;
        }
        let sep = match arg[after..].chars().next() {
            Some('=') => '=',
            Some(c) if c.is_ascii_whitespace() => ' ',
            _ => continue,
        };

        let mut value_start = after + 1;
        if sep == ' ' {
            // skip the whitespace run between flag and value
            value_start = after
                + arg[after..]
                    .find(|c: char| !c.is_ascii_whitespace())
                    .unwrap_or(arg.len() - after);
            if value_start >= arg.len() {
                continue;
            }
        }

        let (value, value_end, quote) = match arg[value_start..].chars().next() {
            Some(q @ ('\'' | '"')) => {
                let inner_start = value_start + 1;
                let Some(close) = arg[inner_start..].find(q) else {
                    continue;
                };
                (
                    arg[inner_start..inner_start + close].to_string(),
                    inner_start + close + 1,
                    Some(q),
                )
            }
            Some(_) => {
                let end = arg[value_start..]
                    .find(|c: char| c.is_ascii_whitespace())
                    .map(|off| value_start + off)
                    .unwrap_or(arg.len());
                (arg[value_start..end].to_string(), end, None)
            }
            None => continue,
        };

        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.starts_with('-') {
            continue;
        }
        out.push(InlineMatch {
            value_start,
            value_end,
            value: trimmed.to_string(),
            quote,
        });
        search_from = value_end;
    }
    out
}

/// Unquote and validate a candidate flag value from its own token: blank
/// values and values that begin with `-` are rejected.
fn accept_value(token: &str) -> Option<String> {
    let mut value = token.trim();
    if value.len() >= 2
        && ((value.starts_with('\'') && value.ends_with('\''))
            || (value.starts_with('"') && value.ends_with('"')))
    {
        value = &value[1..value.len() - 1];
    }
    let value = value.trim();
    if value.is_empty() || value.starts_with('-') {
        return None;
    }
    Some(value.to_string())
}
