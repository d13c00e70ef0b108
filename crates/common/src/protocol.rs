//! Request/response envelope exchanged between the shim and the host router.
//!
//! One JSON object per direction per connection. Flag values serialize as
//! their natural JSON types (bool, string, integer) so the payload stays
//! readable in logs and foreign tooling can produce it without knowing the
//! Rust types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of fields in the wire form of [`TmuxRequest`]. A unit test pins
/// the serialized shape to this count so envelope changes are deliberate.
pub const REQUEST_FIELD_COUNT: usize = 5;

/// A typed tmux flag value.
///
/// `untagged` keeps the wire form natural: `true`, `80` and `"demo:0.0"`
/// round-trip to the matching variant without a discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Command envelope sent from the shim to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TmuxRequest {
    /// Lowercase tmux verb from the supported-command whitelist.
    pub command: String,
    /// Flag token (`-t`) to typed value. Keys are unique; order carries no
    /// meaning, so a sorted map keeps serialization deterministic.
    #[serde(default)]
    pub flags: BTreeMap<String, FlagValue>,
    /// Positional tail after flags, including any post-`--` remainder.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment requested via `-e KEY=VALUE` flags.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// The invoker's pane id (`TMUX_PANE`), empty when absent.
    #[serde(default)]
    pub caller_pane: String,
}

impl TmuxRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// String value of a flag, if present with that kind.
    pub fn flag_str(&self, token: &str) -> Option<&str> {
        self.flags.get(token).and_then(FlagValue::as_str)
    }

    /// True when a bool flag is present and set.
    pub fn flag_bool(&self, token: &str) -> bool {
        self.flags
            .get(token)
            .and_then(FlagValue::as_bool)
            .unwrap_or(false)
    }

    pub fn flag_int(&self, token: &str) -> Option<i64> {
        self.flags.get(token).and_then(FlagValue::as_int)
    }
}

/// Reply envelope. `exit_code` 0 means success; stdout/stderr are text,
/// mirrored verbatim by the shim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TmuxResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl TmuxResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn error(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> TmuxRequest {
        let mut req = TmuxRequest::new("split-window");
        req.flags.insert("-h".into(), FlagValue::Bool(true));
        req.flags.insert("-t".into(), FlagValue::Str("demo:0.0".into()));
        req.flags.insert("-x".into(), FlagValue::Int(80));
        req.args = vec!["claude".into(), "--agent-mode".into()];
        req.env
            .insert("CLAUDE_CODE_AGENT_ID".into(), "researcher-1".into());
        req.caller_pane = "%0".into();
        req
    }

    #[test]
    fn request_roundtrips_through_json() {
        let req = sample_request();
        let json = serde_json::to_string(&req).unwrap();
        let back: TmuxRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn flag_values_use_natural_json_types() {
        let json = serde_json::to_value(sample_request()).unwrap();
        let flags = &json["flags"];
        assert_eq!(flags["-h"], serde_json::json!(true));
        assert_eq!(flags["-t"], serde_json::json!("demo:0.0"));
        assert_eq!(flags["-x"], serde_json::json!(80));
    }

    #[test]
    fn request_wire_form_has_exactly_five_fields() {
        let json = serde_json::to_value(sample_request()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), REQUEST_FIELD_COUNT);
        for key in ["command", "flags", "args", "env", "caller_pane"] {
            assert!(obj.contains_key(key), "missing envelope field {key}");
        }
    }

    #[test]
    fn minimal_request_deserializes_with_defaults() {
        let req: TmuxRequest = serde_json::from_str(r#"{"command":"has-session"}"#).unwrap();
        assert_eq!(req.command, "has-session");
        assert!(req.flags.is_empty());
        assert!(req.args.is_empty());
        assert!(req.env.is_empty());
        assert_eq!(req.caller_pane, "");
    }

    #[test]
    fn response_roundtrips() {
        let resp = TmuxResponse {
            exit_code: 3,
            stdout: "out".into(),
            stderr: "err".into(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(resp, serde_json::from_str(&json).unwrap());
    }
}
