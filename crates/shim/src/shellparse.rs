//! Unix-shell argument recognition and Windows-shell translation.
//!
//! Orchestration clients build command lines for a POSIX shell: a working
//! directory change, inline environment assignments, then a (often quoted)
//! executable, as in `cd /w && KEY=V 'prog' args`. The host runs commands through
//! the Windows shell, so these constructs are either lifted out into request
//! fields (process-creation commands) or rewritten into PowerShell syntax
//! (`send-keys`).
//!
//! Everything here is a pure function over its inputs; the platform-gated
//! mutation lives in the transform layer.

use std::collections::BTreeMap;

/// What [`parse_unix_command`] recognized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellParseResult {
    /// Args with the recognized prefix constructs stripped and the
    /// executable unquoted for Windows invocation.
    pub clean_args: Vec<String>,
    /// Extracted working directory, or the caller's `work_dir` when the
    /// command carries no `cd`.
    pub work_dir: String,
    /// Inline environment assignments, unquoted.
    pub extra_env: BTreeMap<String, String>,
}

/// Recognize `cd X && KEY=V prog …` prefixes in process-creation args.
///
/// Accepts either a token vector or a single command-line string (the form
/// tmux callers usually pass); the output keeps the input's shape.
pub fn parse_unix_command(args: &[String], work_dir: &str) -> ShellParseResult {
    let mut result = ShellParseResult {
        clean_args: args.to_vec(),
        work_dir: work_dir.to_string(),
        extra_env: BTreeMap::new(),
    };
    if args.is_empty() {
        return result;
    }

    if args.len() == 1 && args[0].contains(char::is_whitespace) {
        parse_command_string(&args[0], &mut result);
    } else {
        parse_token_vector(args, &mut result);
    }
    result
}

fn parse_token_vector(args: &[String], result: &mut ShellParseResult) {
    let mut idx = 0;

    if args.len() >= 3 && args[0] == "cd" && args[2] == "&&" {
        result.work_dir = unquote(&args[1]).to_string();
        idx = 3;
    }
    while idx < args.len() {
        match env_assignment(&args[idx]) {
            Some((key, value)) => {
                result.extra_env.insert(key, value);
                idx += 1;
            }
            None => break,
        }
    }

    let mut rest: Vec<String> = args[idx..].to_vec();
    if let Some(first) = rest.first_mut() {
        let unquoted = unquote(first);
        if unquoted != first.as_str() {
            *first = unquoted.to_string();
        }
    }
    result.clean_args = rest;
}

fn parse_command_string(command: &str, result: &mut ShellParseResult) {
    let tokens = split_command_line(command);
    let mut idx = 0;

    if tokens.len() >= 3 && tokens[0] == "cd" && tokens[2] == "&&" {
        result.work_dir = unquote(&tokens[1]).to_string();
        idx = 3;
    }
    while idx < tokens.len() {
        match env_assignment(&tokens[idx]) {
            Some((key, value)) => {
                result.extra_env.insert(key, value);
                idx += 1;
            }
            None => break,
        }
    }

    let leading_quoted = tokens.get(idx).map(|t| is_quoted(t)).unwrap_or(false);
    if idx == 0 && result.extra_env.is_empty() && !leading_quoted {
        return; // nothing recognized; leave the original string alone
    }

    let rest = &tokens[idx..];
    let rebuilt = match rest.split_first() {
        // a quoted executable needs the call operator to run under PowerShell
        Some((first, tail)) if is_quoted(first) => {
            let mut line = format!("& {first}");
            for tok in tail {
                line.push(' ');
                line.push_str(tok);
            }
            line
        }
        _ => rest.join(" "),
    };
    result.clean_args = vec![rebuilt];
}

/// Rewrite `send-keys` payloads from POSIX-shell to PowerShell syntax.
///
/// `cd X && KEY=V 'prog' args` becomes `cd X; $env:KEY='V'; & 'prog' args`.
/// Strings without shell constructs (key names like `Enter`) pass through
/// untouched.
pub fn translate_send_keys_args(args: &[String]) -> Vec<String> {
    args.iter().map(|arg| translate_send_keys_arg(arg)).collect()
}

fn translate_send_keys_arg(arg: &str) -> String {
    let segments = split_on_and_chains(arg);
    let mut out: Vec<String> = Vec::new();
    let mut changed = segments.len() > 1;

    for segment in &segments {
        let tokens = split_command_line(segment);
        if tokens.first().map(String::as_str) == Some("cd") {
            out.push(tokens.join(" "));
            continue;
        }

        let mut idx = 0;
        while idx < tokens.len() {
            match env_assignment(&tokens[idx]) {
                Some((key, value)) => {
                    out.push(format!("$env:{key}={}", quote_ps(&value)));
                    changed = true;
                    idx += 1;
                }
                None => break,
            }
        }

        let rest = &tokens[idx..];
        match rest.split_first() {
            Some((first, tail)) if is_quoted(first) => {
                let mut line = format!("& {first}");
                for tok in tail {
                    line.push(' ');
                    line.push_str(tok);
                }
                out.push(line);
                changed = true;
            }
            Some(_) => out.push(rest.join(" ")),
            None => {}
        }
    }

    if changed {
        out.join("; ")
    } else {
        arg.to_string()
    }
}

/// Single-quote a value for PowerShell, doubling embedded quotes.
fn quote_ps(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `KEY=VALUE` where KEY is a valid shell identifier. Quoted tokens are
/// never assignments.
fn env_assignment(token: &str) -> Option<(String, String)> {
    if is_quoted(token) {
        return None;
    }
    let (key, value) = token.split_once('=')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), unquote(value).to_string()))
}

fn is_quoted(token: &str) -> bool {
    token.len() >= 2
        && ((token.starts_with('\'') && token.ends_with('\''))
            || (token.starts_with('"') && token.ends_with('"')))
}

fn unquote(token: &str) -> &str {
    if is_quoted(token) {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

/// Split on `&&` outside quotes, trimming each segment.
fn split_on_and_chains(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    current.push(c);
                } else if c == '&' && chars.peek() == Some(&'&') {
                    chars.next();
                    segments.push(current.trim().to_string());
                    current.clear();
                } else {
                    current.push(c);
                }
            }
        }
    }
    segments.push(current.trim().to_string());
    segments.retain(|s| !s.is_empty());
    segments
}

/// Whitespace tokenizer that keeps quoted spans (quotes included) intact.
fn split_command_line(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    current.push(c);
                } else if c.is_whitespace() {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push(c);
                }
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
