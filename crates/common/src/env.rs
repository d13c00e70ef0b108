//! Environment derivation for agent-team sessions.

use std::collections::BTreeMap;

/// Session-name tag injected into every agent-team session.
pub const SESSION_TAG_VAR: &str = "MYTX_SESSION";

/// Variables injected into sessions created in agent-team mode. User config
/// may add entries on top but never replaces these (see
/// [`merge_env_fill_only`]).
pub fn agent_team_env_vars(session_name: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("CLAUDECODE".to_string(), "1".to_string());
    vars.insert(
        "CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS".to_string(),
        "1".to_string(),
    );
    vars.insert(SESSION_TAG_VAR.to_string(), session_name.to_string());
    vars
}

/// Fill-only merge: keys already present in `base` keep their value.
/// Returns the number of entries actually inserted.
pub fn merge_env_fill_only(
    base: &mut BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> usize {
    let mut inserted = 0;
    for (key, value) in extra {
        if !base.contains_key(key) {
            base.insert(key.clone(), value.clone());
            inserted += 1;
        }
    }
    inserted
}

/// Make a raw name usable as a session name: `.` and `:` become `-`, runs of
/// `-` collapse, leading/trailing `-` are trimmed. An empty result falls
/// back to `default` passed through the same rule, and finally to the
/// literal `session` so the result is never empty.
pub fn sanitize_session_name(raw: &str, default: &str) -> String {
    let cleaned = sanitize_once(raw);
    if !cleaned.is_empty() {
        return cleaned;
    }
    let fallback = sanitize_once(default);
    if !fallback.is_empty() {
        return fallback;
    }
    "session".to_string()
}

fn sanitize_once(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let mapped = if matches!(c, '.' | ':') { '-' } else { c };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}
