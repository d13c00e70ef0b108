//! Host-side foundation of the myT-x tmux compatibility layer.
//!
//! The long-running application embeds [`server::PipeServer`] with its own
//! [`router::Router`] implementation; this crate owns the transport, the
//! dispatch seam and the git concurrency limiter, not the session state.

pub mod git;
pub mod router;
pub mod server;

pub use router::{execute_router_request, Router};
pub use server::PipeServer;
