//! JSON-RPC facade over the agent service.
//!
//! Requests are `{method, params, id}`; responses are
//! `{id, success, result?, error?: {code, message}}`. Served over HTTP as
//! `POST /rpc`, with `GET /health` for liveness checks.

pub mod compat;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use handlers::{dispatch, HandlerState};
pub use server::{build_router, start, ServerConfig, ServerHandle};
