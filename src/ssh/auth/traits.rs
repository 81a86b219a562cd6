//! Seams between the authentication probes and the SSH session.

use std::sync::Arc;

use async_trait::async_trait;
use russh::CryptoVec;
use russh::keys::{HashAlg, PrivateKey, PublicKey};

use crate::ssh::error::{ConnectError, ErrorKind};

/// A public-key credential ready to be offered to the server.
#[derive(Debug, Clone)]
pub enum Credential {
    /// A key held by the agent; the agent signs
    Agent(PublicKey),
    /// A decrypted identity file
    Key { path: String, key: Arc<PrivateKey> },
}

impl Credential {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Credential::Agent(key) => format!("agent key {} {}", key.algorithm(), key.comment()),
            Credential::Key { path, .. } => format!("identity file {}", path),
        }
    }
}

/// What the server said to a keyboard-interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbdReply {
    Success,
    Failure,
    InfoRequest {
        name: String,
        instructions: String,
        questions: Vec<String>,
        echos: Vec<bool>,
    },
}

/// The authentication half of an SSH session after the handshake.
///
/// `Err` is reserved for transport failures; a rejected credential is
/// `Ok(false)`.
#[async_trait]
pub trait AuthSession: Send {
    async fn offer_publickey(&mut self, user: &str, credential: &Credential) -> Result<bool, ErrorKind>;

    async fn offer_password(&mut self, user: &str, password: &str) -> Result<bool, ErrorKind>;

    async fn keyboard_interactive_start(&mut self, user: &str) -> Result<KbdReply, ErrorKind>;

    async fn keyboard_interactive_respond(&mut self, answers: Vec<String>) -> Result<KbdReply, ErrorKind>;
}

/// A local SSH agent.
#[async_trait]
pub trait KeyAgent: Send + Sync {
    /// Keys the agent can sign with, in the agent's order.
    async fn identities(&self) -> Result<Vec<PublicKey>, String>;

    /// Hand a decrypted key to the agent.
    async fn add_identity(&self, key: &PrivateKey) -> Result<(), String>;

    /// Sign an authentication request with one of the agent's keys.
    async fn sign(
        &self,
        key: &PublicKey,
        hash_alg: Option<HashAlg>,
        data: CryptoVec,
    ) -> Result<CryptoVec, russh::keys::Error>;
}

/// Result of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server accepted; authentication is done
    Accepted,
    /// The server refused this credential
    Rejected,
    /// No credential was offered this round (bad key file, wrong passphrase)
    Skipped,
}

/// One authentication method and its candidate loop.
#[async_trait]
pub trait AuthProbe: Send {
    /// Make one attempt.
    ///
    /// Returns [`ErrorKind::CredentialExhausted`] when no candidates remain
    /// and [`ErrorKind::UserCancelled`] when the human stopped the attempt.
    async fn attempt(&mut self, session: &mut dyn AuthSession, user: &str) -> Result<ProbeOutcome, ConnectError>;

    /// SSH method name.
    fn name(&self) -> &'static str;

    /// How many attempts this method gets.
    fn retry_budget(&self) -> usize;
}
