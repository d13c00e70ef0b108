//! Router contract and the dispatch indirection in front of it.
//!
//! The router owns session/pane state and is opaque to this crate: it
//! consumes a [`TmuxRequest`] and produces a [`TmuxResponse`]. The server
//! reaches it through a process-level function variable so the embedding
//! application can interpose cross-cutting logging, and tests can
//! substitute a stub without a live router.

use std::sync::RwLock;

use mytx_common::{TmuxRequest, TmuxResponse};
use once_cell::sync::Lazy;

/// Executes tmux commands against the current session/pane state.
pub trait Router: Send + Sync {
    fn handle(&self, request: &TmuxRequest) -> TmuxResponse;
}

/// Signature of the dispatch indirection.
pub type ExecuteRouterRequestFn = fn(&dyn Router, &TmuxRequest) -> TmuxResponse;

fn dispatch_direct(router: &dyn Router, request: &TmuxRequest) -> TmuxResponse {
    router.handle(request)
}

static EXECUTE_ROUTER_REQUEST: Lazy<RwLock<ExecuteRouterRequestFn>> =
    Lazy::new(|| RwLock::new(dispatch_direct));

/// Dispatch one request through the current indirection. Safe to call from
/// any number of server tasks concurrently.
pub fn execute_router_request(router: &dyn Router, request: &TmuxRequest) -> TmuxResponse {
    let dispatch = *EXECUTE_ROUTER_REQUEST
        .read()
        .unwrap_or_else(|e| e.into_inner());
    dispatch(router, request)
}

/// Replace the dispatch function, returning the previous one so teardown
/// can restore it.
///
/// Rewriting is a test-setup operation only: it is not safe to race this
/// against live dispatch.
pub fn set_execute_router_request(dispatch: ExecuteRouterRequestFn) -> ExecuteRouterRequestFn {
    let mut slot = EXECUTE_ROUTER_REQUEST
        .write()
        .unwrap_or_else(|e| e.into_inner());
    std::mem::replace(&mut *slot, dispatch)
}
