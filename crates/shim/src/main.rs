//! myT-x tmux shim binary.
//!
//! Installed as `tmux.exe` under `%LOCALAPPDATA%\myT-x\bin` and invoked by
//! third-party tools that expect a tmux on PATH. All logic lives in the
//! library; the binary only maps the result to a process exit code.

use std::process::ExitCode;

use mytx_shim::run_shim;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    ExitCode::from(run_shim(&args) as u8)
}
