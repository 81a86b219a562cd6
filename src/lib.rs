//! SSH connection establishment with ProxyJump chaining, host trust and
//! interactive authentication, exposed as MCP tools.
//!
//! - [`ssh`]: the connection engine
//! - [`mcp`]: MCP tools driving the engine

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod mcp;
pub mod ssh;
