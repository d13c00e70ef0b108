//! Static table of supported tmux commands and their flag schemas.
//!
//! Only whitelisted commands cross the IPC boundary. Each command maps its
//! flag tokens to a [`FlagKind`]; required-flag rules live in the parser,
//! next to the positional-argument rules they interact with.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// How a flag consumes tokens and what value it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    /// Presence sets `true`; consumes nothing.
    Bool,
    /// Consumes the next token verbatim.
    Str,
    /// Consumes the next token, parsed as signed decimal.
    Int,
    /// Consumes the next token, shaped `KEY=VALUE`.
    Env,
}

/// Flag schema for one supported command.
#[derive(Debug)]
pub struct CommandSpec {
    flags: &'static [(&'static str, FlagKind)],
}

impl CommandSpec {
    pub fn flag_kind(&self, token: &str) -> Option<FlagKind> {
        self.flags
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, kind)| *kind)
    }

    /// True when `-<c>` is declared as a bool flag, the condition for the
    /// character to participate in combined-flag expansion.
    pub fn is_bool_flag_char(&self, c: char) -> bool {
        self.flags
            .iter()
            .any(|(name, kind)| *kind == FlagKind::Bool && name.len() == 2 && name.ends_with(c))
    }
}

/// Supported commands in canonical order. Must enumerate exactly the same
/// set as [`command_spec`]'s table; the mismatch check runs when the table
/// is first touched and panics on programmer error.
pub const COMMAND_ORDER: &[&str] = &[
    "new-session",
    "has-session",
    "split-window",
    "send-keys",
    "select-pane",
    "list-sessions",
    "kill-session",
    "list-panes",
    "display-message",
    "attach-session",
    "kill-pane",
    "rename-session",
    "resize-pane",
    "show-environment",
    "set-environment",
    "list-windows",
    "rename-window",
    "new-window",
    "kill-window",
    "select-window",
];

use self::FlagKind::{Bool, Env, Int, Str};

static COMMAND_SPECS: Lazy<HashMap<&'static str, CommandSpec>> = Lazy::new(|| {
    let table: &[(&str, &'static [(&str, FlagKind)])] = &[
        (
            "new-session",
            &[
                ("-d", Bool),
                ("-P", Bool),
                ("-F", Str),
                ("-s", Str),
                ("-n", Str),
                ("-x", Int),
                ("-y", Int),
                ("-c", Str),
                ("-e", Env),
            ],
        ),
        ("has-session", &[("-t", Str)]),
        (
            "split-window",
            &[
                ("-h", Bool),
                ("-v", Bool),
                ("-d", Bool),
                ("-P", Bool),
                ("-F", Str),
                ("-t", Str),
                ("-c", Str),
                ("-e", Env),
                ("-l", Str),
                ("-p", Str),
            ],
        ),
        ("send-keys", &[("-t", Str), ("-l", Bool)]),
        (
            "select-pane",
            &[
                ("-t", Str),
                ("-T", Str),
                ("-U", Bool),
                ("-D", Bool),
                ("-L", Bool),
                ("-R", Bool),
            ],
        ),
        ("list-sessions", &[("-F", Str)]),
        ("kill-session", &[("-t", Str)]),
        ("list-panes", &[("-t", Str), ("-s", Bool), ("-F", Str)]),
        ("display-message", &[("-p", Bool), ("-t", Str)]),
        ("attach-session", &[("-t", Str)]),
        ("kill-pane", &[("-t", Str)]),
        ("rename-session", &[("-t", Str)]),
        (
            "resize-pane",
            &[
                ("-t", Str),
                ("-x", Int),
                ("-y", Int),
                ("-U", Bool),
                ("-D", Bool),
                ("-L", Bool),
                ("-R", Bool),
                ("-Z", Bool),
            ],
        ),
        ("show-environment", &[("-t", Str), ("-g", Bool)]),
        ("set-environment", &[("-t", Str), ("-u", Bool), ("-g", Bool)]),
        ("list-windows", &[("-t", Str), ("-a", Bool), ("-F", Str)]),
        ("rename-window", &[("-t", Str)]),
        (
            "new-window",
            &[
                ("-d", Bool),
                ("-P", Bool),
                ("-F", Str),
                ("-n", Str),
                ("-t", Str),
                ("-c", Str),
                ("-e", Env),
            ],
        ),
        ("kill-window", &[("-t", Str)]),
        ("select-window", &[("-t", Str)]),
    ];

    let mut specs = HashMap::with_capacity(table.len());
    for &(command, flags) in table {
        specs.insert(command, CommandSpec { flags });
    }

    // command_order and the spec table must cover exactly the same set.
    assert_eq!(
        specs.len(),
        COMMAND_ORDER.len(),
        "command spec table and command order disagree in size"
    );
    for command in COMMAND_ORDER {
        assert!(
            specs.contains_key(command),
            "command {command} is ordered but has no spec"
        );
    }

    specs
});

/// Look up the flag schema for a command; `None` for anything outside the
/// whitelist.
pub fn command_spec(command: &str) -> Option<&'static CommandSpec> {
    COMMAND_SPECS.get(command)
}
