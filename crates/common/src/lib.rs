//! Shared building blocks for the myT-x Windows tmux compatibility layer.
//!
//! The shim binary, the host router and the installer all speak the same
//! request/response envelope and resolve the same per-user endpoint and
//! `%LOCALAPPDATA%` paths. This crate owns those contracts so the two
//! processes cannot drift apart.

pub mod env;
pub mod paths;
pub mod pipe;
pub mod protocol;

pub use protocol::{FlagValue, TmuxRequest, TmuxResponse};
