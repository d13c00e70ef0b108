//! Tokenizes shim argv into a [`TmuxRequest`].
//!
//! Flags parse until `--` or the first positional token; combined bool
//! flags (`-dPh`) expand when every character is a declared bool flag.
//! Required-flag and positional-count rules run after tokenization.

use mytx_common::{FlagValue, TmuxRequest};
use thiserror::Error;

use crate::spec::{command_spec, CommandSpec, FlagKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no command given")]
    CommandRequired,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command}: unsupported flag {flag}")]
    UnsupportedFlag { command: String, flag: String },
    #[error("{command}: flag {flag} requires a value")]
    MissingValue { command: String, flag: String },
    #[error("{command}: flag {flag} expects an integer, got {value:?}")]
    ExpectsInteger {
        command: String,
        flag: String,
        value: String,
    },
    #[error("{command}: flag {flag} must be non-negative")]
    MustBeNonNegative { command: String, flag: String },
    #[error("{command}: invalid environment variable {value:?}, expected KEY=VALUE")]
    InvalidEnv { command: String, value: String },
    #[error("{command}: required flag {flag} missing or blank")]
    RequiredFlag { command: String, flag: String },
    #[error("{command}: {message}")]
    Positionals { command: String, message: String },
}

/// Parse `argv[1..]` (everything after the program name).
pub fn parse(argv: &[String]) -> Result<TmuxRequest, ParseError> {
    let command = argv.first().map(|s| s.trim()).unwrap_or("");
    if command.is_empty() {
        return Err(ParseError::CommandRequired);
    }
    let spec = command_spec(command).ok_or_else(|| ParseError::UnknownCommand(command.into()))?;

    let mut req = TmuxRequest::new(command);
    let mut i = 1;
    let mut flags_done = false;

    while i < argv.len() {
        let token = &argv[i];
        i += 1;

        if flags_done {
            req.args.push(token.clone());
            continue;
        }
        if token == "--" {
            // remaining tokens are positional; a bare trailing -- adds nothing
            flags_done = true;
            continue;
        }
        if token.len() < 2 || !token.starts_with('-') {
            // "-" alone and non-dash tokens start the positional tail
            flags_done = true;
            req.args.push(token.clone());
            continue;
        }

        match spec.flag_kind(token) {
            Some(FlagKind::Bool) => {
                req.flags.insert(token.clone(), FlagValue::Bool(true));
            }
            Some(FlagKind::Str) => {
                let value = take_value(command, token, argv, &mut i)?;
                req.flags.insert(token.clone(), FlagValue::Str(value));
            }
            Some(FlagKind::Int) => {
                let value = take_value(command, token, argv, &mut i)?;
                let parsed: i64 = value.trim().parse().map_err(|_| ParseError::ExpectsInteger {
                    command: command.into(),
                    flag: token.clone(),
                    value: value.clone(),
                })?;
                if size_flag(token) && parsed < 0 {
                    return Err(ParseError::MustBeNonNegative {
                        command: command.into(),
                        flag: token.clone(),
                    });
                }
                req.flags.insert(token.clone(), FlagValue::Int(parsed));
            }
            Some(FlagKind::Env) => {
                let value = take_value(command, token, argv, &mut i)?;
                let (key, val) = split_env(&value).ok_or_else(|| ParseError::InvalidEnv {
                    command: command.into(),
                    value: value.clone(),
                })?;
                req.env.insert(key, val);
            }
            None => expand_combined_bools(command, spec, token, &mut req)?,
        }
    }

    check_required(command, &req)?;
    Ok(req)
}

fn take_value(
    command: &str,
    flag: &str,
    argv: &[String],
    i: &mut usize,
) -> Result<String, ParseError> {
    let value = argv.get(*i).cloned().ok_or_else(|| ParseError::MissingValue {
        command: command.into(),
        flag: flag.into(),
    })?;
    *i += 1;
    Ok(value)
}

/// Only the first `=` splits key from value, so values may contain `=`.
fn split_env(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn size_flag(token: &str) -> bool {
    matches!(token, "-x" | "-y")
}

/// `-abc` expands to `-a -b -c` iff every character is a declared bool flag
/// on this command.
fn expand_combined_bools(
    command: &str,
    spec: &CommandSpec,
    token: &str,
    req: &mut TmuxRequest,
) -> Result<(), ParseError> {
    let chars: Vec<char> = token[1..].chars().collect();
    if chars.len() < 2 || !chars.iter().all(|c| spec.is_bool_flag_char(*c)) {
        return Err(ParseError::UnsupportedFlag {
            command: command.into(),
            flag: token.into(),
        });
    }
    for c in chars {
        req.flags.insert(format!("-{c}"), FlagValue::Bool(true));
    }
    Ok(())
}

fn check_required(command: &str, req: &TmuxRequest) -> Result<(), ParseError> {
    match command {
        "has-session" | "kill-session" | "kill-window" | "select-window" | "attach-session" => {
            require_flag_str(command, req, "-t")
        }
        "new-window" => {
            require_flag_str(command, req, "-t")?;
            // -n names the child session in myT-x semantics
            require_flag_str(command, req, "-n")
        }
        "display-message" => {
            if req.flag_bool("-p") {
                Ok(())
            } else {
                Err(ParseError::RequiredFlag {
                    command: command.into(),
                    flag: "-p".into(),
                })
            }
        }
        "rename-session" | "rename-window" => {
            require_flag_str(command, req, "-t")?;
            match req.args.as_slice() {
                [name] if !name.trim().is_empty() => Ok(()),
                _ => Err(ParseError::Positionals {
                    command: command.into(),
                    message: "expected exactly one non-blank new name".into(),
                }),
            }
        }
        "set-environment" => {
            if req.flag_bool("-u") {
                match req.args.as_slice() {
                    [key] if !key.trim().is_empty() => Ok(()),
                    _ => Err(ParseError::Positionals {
                        command: command.into(),
                        message: "-u expects exactly one variable name".into(),
                    }),
                }
            } else {
                match req.args.as_slice() {
                    // the value may legitimately be an empty string
                    [key, _value] if !key.trim().is_empty() => Ok(()),
                    _ => Err(ParseError::Positionals {
                        command: command.into(),
                        message: "expected a variable name and a value".into(),
                    }),
                }
            }
        }
        _ => Ok(()),
    }
}

fn require_flag_str(command: &str, req: &TmuxRequest, flag: &str) -> Result<(), ParseError> {
    match req.flag_str(flag) {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(ParseError::RequiredFlag {
            command: command.into(),
            flag: flag.into(),
        }),
    }
}
