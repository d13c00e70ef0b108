//! Installation and PATH plumbing for the myT-x shim.
//!
//! Runs at host startup: legacy installs are cleaned away, the shim binary
//! is (re)installed only when its content hash changed, and the install
//! directory is registered on the user PATH, registry and process copies
//! both, serialized behind one process-wide mutex.

pub mod broadcast;
pub mod cleanup;
pub mod installer;
pub mod process_path;
pub mod registry;

pub use cleanup::run_legacy_cleanup;
pub use installer::{ensure_shim_installed, needs_shim_install, InstallResult};
