//! SSH connection establishment engine.
//!
//! Components, leaf first:
//!
//! - [`resolver`]: effective per-hop parameters from caller options,
//!   ssh_config ([`ssh_config`]) and persisted settings
//! - [`trust`]: host key verification against known_hosts ([`known_hosts`])
//! - [`auth`]: ordered public-key, keyboard-interactive and password probes
//! - [`chain`]: per-hop state machine that recurses through ProxyJump hosts
//! - [`engine`]: the entry point, with retries on network failures
//!
//! All human interaction goes through [`prompt::UserInputService`];
//! [`transport`] plugs russh in behind the [`chain::Connector`] seam.

pub mod auth;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod hop;
pub mod known_hosts;
pub mod prompt;
pub mod resolver;
pub mod ssh_config;
pub mod transport;
pub mod trust;

pub use chain::SSH_PROXY_JUMP_MAX_DEPTH;
pub use engine::{AttemptContext, Connection, Engine};
pub use error::{ConnectError, DebugContext, ErrorKind};
pub use hop::HopIdentity;
pub use prompt::{PromptError, UserInputRequest, UserInputResponse, UserInputService};
pub use resolver::{ConnKeywords, ConnectionParameters, PersistedSettings, Resolver};
pub use transport::{RusshConnector, SshTransport};
