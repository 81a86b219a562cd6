//! Storage abstractions for session and attempt management.
//!
//! This module provides trait-based storage abstractions that enable:
//! - Dependency injection for testability
//! - Lock-free concurrent access via DashMap implementations
//! - Clean separation between storage and business logic

mod attempt;
mod session;
mod traits;

pub use attempt::ATTEMPT_STORAGE;
pub use session::SESSION_STORAGE;
pub use traits::{AttemptRecord, AttemptState, AttemptStorage, SessionStorage};
