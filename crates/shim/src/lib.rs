//! myT-x tmux shim.
//!
//! Installed as `tmux.exe` so that tmux-oriented orchestration tools keep
//! working on Windows: every invocation is parsed against a whitelist of
//! tmux commands, normalized for the Windows shell, optionally rewritten
//! per the agent-model config, then forwarded to the long-running host
//! router over the per-user named pipe. Stdout, stderr and the exit code
//! mirror the router's response.

use mytx_common::pipe;

pub mod client;
pub mod debug_log;
pub mod model_config;
pub mod parser;
pub mod shellparse;
pub mod spec;
pub mod transform;

use crate::debug_log::debug_log;

/// Version banner answered locally; orchestrators probe `tmux -V` before a
/// host is running.
const VERSION_BANNER: &str = "tmux 3.4 (myT-x shim)";

/// Run one shim invocation over `argv[1..]`; returns the process exit code.
pub fn run_shim(args: &[String]) -> i32 {
    if let [first, ..] = args {
        if matches!(first.as_str(), "-V" | "-version" | "--version") {
            println!("{VERSION_BANNER}");
            return 0;
        }
    }

    debug_log(&format!("invoked: tmux {}", args.join(" ")));

    let mut request = match parser::parse(args) {
        Ok(request) => request,
        Err(err) => {
            debug_log(&format!("parse failed: {err}"));
            eprintln!("tmux: {err}");
            return 1;
        }
    };
    request.caller_pane = std::env::var("TMUX_PANE").unwrap_or_default();

    run_transforms(&mut request);

    let endpoint = pipe::default_endpoint();
    match client::send(&endpoint, &request) {
        Ok(response) => {
            if !response.stdout.is_empty() {
                print!("{}", response.stdout);
                let _ = std::io::Write::flush(&mut std::io::stdout());
            }
            if !response.stderr.is_empty() {
                eprint!("{}", response.stderr);
            }
            response.exit_code
        }
        Err(err) if client::is_connection_error(&err) => {
            debug_log(&format!("connect failed: {err}"));
            eprintln!("tmux: no server running on {endpoint}");
            1
        }
        Err(err) => {
            debug_log(&format!("ipc failed: {err}"));
            eprintln!("tmux: {err}");
            1
        }
    }
}

/// Run both transform stages under snapshot protection. Transform failures
/// are local only: the request is rolled back, the failure is logged, and
/// the invocation continues to the IPC send.
fn run_transforms(request: &mut mytx_common::TmuxRequest) {
    match transform::run_stage("shell", request, |req| Ok(transform::shell::apply(req))) {
        Ok(changed) => {
            if changed {
                debug_log("shell transform rewrote the request");
            }
        }
        Err(err) => debug_log(&format!("{err}; request restored")),
    }

    match transform::run_stage("model", request, |req| {
        transform::model::apply(req).map_err(anyhow::Error::from)
    }) {
        Ok(changed) => {
            if changed {
                debug_log("model transform rewrote the request");
            }
        }
        Err(err) => debug_log(&format!("{err}; request restored")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_failures_leave_the_request_intact() {
        let mut request = mytx_common::TmuxRequest::new("split-window");
        request.args = vec!["claude".into()];
        let before = request.clone();
        run_transforms(&mut request);
        // no config and no shell constructs: nothing may change
        if cfg!(not(windows)) {
            assert_eq!(request, before);
        }
    }
}
