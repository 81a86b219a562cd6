//! Chain-aware errors for connection establishment.
//!
//! Every failure that leaves the engine is a [`ConnectError`]: an
//! [`ErrorKind`] describing what went wrong plus the [`DebugContext`] of the
//! hop that was being established when it happened. Only
//! [`ErrorKind::Network`] is considered transient; everything else (trust,
//! credentials, cancellation, config) fails immediately.
//!
//! # Display
//!
//! ```text
//! connecting to admin@bastion:2222 (jump depth 0): network error: connection refused
//! connecting from admin@bastion:2222 to db.internal (jump depth 1): host key for db.internal has changed ...
//! ```

use std::fmt;

use super::hop::HopIdentity;

/// What went wrong while establishing one hop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// ssh_config, persisted settings, or a hop string could not be interpreted
    #[error("configuration error: {0}")]
    Config(String),

    /// No known_hosts file could be read or written
    #[error("known_hosts unavailable: {0}")]
    TrustStoreUnavailable(String),

    /// The server presented a key different from the recorded one
    #[error(
        "host key for {host} has changed (presented {fingerprint}); \
         remove the stale entry from your known_hosts file to continue"
    )]
    HostKeyMismatch { host: String, fingerprint: String },

    /// The presented key is listed as @revoked
    #[error("host key for {host} is revoked ({fingerprint})")]
    HostKeyRevoked { host: String, fingerprint: String },

    /// Every candidate of an authentication method was tried and failed
    #[error("authentication failed: {0}")]
    CredentialExhausted(String),

    /// The server accepted none of the offered methods
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The user declined, ignored, or cancelled a prompt
    #[error("cancelled by user: {0}")]
    UserCancelled(String),

    /// Dial or handshake failure
    #[error("network error: {0}")]
    Network(String),

    /// Too many nested ProxyJump hops
    #[error("ProxyJump depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// The server sent something the engine cannot work with
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ErrorKind {
    /// Attach the hop currently being established.
    pub fn in_context(self, context: &DebugContext) -> ConnectError {
        ConnectError::new(context.clone(), self)
    }

    /// Network failures are the only kind worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Network(_))
    }
}

/// Which hop was being established, for error messages and logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugContext {
    /// Label of the transport the hop runs through, `None` for a direct dial
    pub current: Option<String>,
    /// Hop identity as requested
    pub next: HopIdentity,
    /// `user@host:port` once parameters are resolved
    pub resolved: Option<String>,
    /// Jump counter at this hop
    pub depth: u32,
}

impl DebugContext {
    pub fn new(current: Option<String>, next: HopIdentity, depth: u32) -> Self {
        Self {
            current,
            next,
            resolved: None,
            depth,
        }
    }

    fn target_label(&self) -> String {
        match &self.resolved {
            Some(resolved) => resolved.clone(),
            None => self.next.to_string(),
        }
    }
}

impl fmt::Display for DebugContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.current {
            None => write!(
                f,
                "connecting to {} (jump depth {})",
                self.target_label(),
                self.depth
            ),
            Some(current) => write!(
                f,
                "connecting from {} to {} (jump depth {})",
                current,
                self.target_label(),
                self.depth
            ),
        }
    }
}

/// A failure together with the hop it happened on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{context}: {kind}")]
pub struct ConnectError {
    pub context: DebugContext,
    pub kind: ErrorKind,
}

impl ConnectError {
    pub fn new(context: DebugContext, kind: ErrorKind) -> Self {
        Self { context, kind }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_user_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::UserCancelled(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Message fragments that mark a transport failure as a network problem.
///
/// Handshake errors surface from the SSH library as free text; anything that
/// does not look like a connectivity problem is reported as a protocol error.
const NETWORK_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "connection aborted",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "failed to lookup address",
    "name or service not known",
    "broken pipe",
    "disconnect",
    "unexpected eof",
    "channel open failure",
];

/// Classify a transport-level failure message as network or protocol.
///
/// # Arguments
///
/// * `message` - Error text produced while dialing or handshaking
///
/// # Returns
///
/// [`ErrorKind::Network`] if the message matches a known connectivity
/// pattern (case-insensitive), otherwise [`ErrorKind::Protocol`].
pub fn classify_transport_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if NETWORK_ERRORS.iter().any(|pattern| lower.contains(pattern)) {
        ErrorKind::Network(message.to_string())
    } else {
        ErrorKind::Protocol(message.to_string())
    }
}
