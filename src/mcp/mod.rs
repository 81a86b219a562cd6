//! MCP surface for the connection engine.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Serializable response types for MCP tools
//! - `schema`: JSON Schema helpers
//! - `error`: Tool-level errors
//! - `broker`: Pending prompts answered through tool calls
//! - `storage`: Attempt and session storage
//! - `commands`: MCP tool implementations

pub(crate) mod broker;
pub mod commands;
pub(crate) mod error;
pub mod schema;
pub(crate) mod storage;
pub mod types;

pub use commands::McpSSHCommands;
