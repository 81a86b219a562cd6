//! Authenticator: ordered, retryable authentication probes for one hop.
//!
//! # Available Probes
//!
//! - [`PublicKeyProbe`]: agent keys, then identity files (passphrase prompts)
//! - [`KeyboardInteractiveProbe`]: server challenges answered by the user
//! - [`PasswordProbe`]: one password prompt
//!
//! # Example
//!
//! ```ignore
//! let mut chain = AuthChain::build_methods(&params, &debug, &prompter, agent, signers);
//! chain.authenticate(&mut session, &params.user).await?;
//! ```

mod agent;
mod credentials;
mod keyboard;
mod password;
mod publickey;
mod traits;

use std::sync::Arc;

use russh::keys::PublicKey;
use tracing::{debug, info};

use crate::ssh::error::{ConnectError, DebugContext, ErrorKind};
use crate::ssh::prompt::Prompter;
use crate::ssh::resolver::ConnectionParameters;

pub use agent::{AgentSigner, SocketAgent};
pub use credentials::{CredentialState, IdentityFile};
pub use keyboard::{KEYBOARD_INTERACTIVE_TITLE, KeyboardInteractiveProbe};
pub use password::{PASSWORD_TITLE, PasswordProbe};
pub use publickey::{PASSPHRASE_TITLE, ProbeStep, PublicKeyProbe};
pub use traits::{AuthProbe, AuthSession, Credential, KbdReply, KeyAgent, ProbeOutcome};

/// Probes tried in order until one is accepted.
pub struct AuthChain {
    probes: Vec<Box<dyn AuthProbe>>,
    agent: Option<Arc<dyn KeyAgent>>,
    debug: DebugContext,
}

impl AuthChain {
    /// Create an empty chain.
    pub fn new(debug: DebugContext) -> Self {
        Self {
            probes: Vec::new(),
            agent: None,
            debug,
        }
    }

    /// Agent that signs for offered agent keys.
    pub fn with_agent(mut self, agent: Option<Arc<dyn KeyAgent>>) -> Self {
        self.agent = agent;
        self
    }

    pub fn agent(&self) -> Option<Arc<dyn KeyAgent>> {
        self.agent.clone()
    }

    pub fn with_probe(mut self, probe: impl AuthProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    /// Build the probes for a hop from its resolved parameters.
    ///
    /// Methods follow `PreferredAuthentications`; a method is only added if
    /// its enable flag is set, and the interactive ones are dropped in batch
    /// mode. Unknown method names are ignored.
    pub fn build_methods(
        params: &ConnectionParameters,
        debug: &DebugContext,
        prompter: &Prompter,
        agent: Option<Arc<dyn KeyAgent>>,
        agent_signers: Vec<PublicKey>,
    ) -> Self {
        let mut chain = Self::new(debug.clone()).with_agent(agent.clone());
        let remote = params.label();
        let mut signers = Some(agent_signers);

        for method in &params.preferred_authentications {
            match method.as_str() {
                "publickey" if params.pubkey_authentication => {
                    // a repeated entry gets no second probe
                    let Some(signers) = signers.take() else {
                        continue;
                    };
                    let state = CredentialState::load(&params.identity_files, signers);
                    chain = chain.with_probe(PublicKeyProbe::new(
                        state,
                        params.batch_mode,
                        params.add_keys_to_agent,
                        agent.clone(),
                        prompter.clone(),
                        debug.clone(),
                    ));
                }
                "keyboard-interactive" if params.kbd_interactive_authentication && !params.batch_mode => {
                    chain = chain.with_probe(KeyboardInteractiveProbe::new(
                        remote.clone(),
                        prompter.clone(),
                        debug.clone(),
                    ));
                }
                "password" if params.password_authentication && !params.batch_mode => {
                    chain = chain.with_probe(PasswordProbe::new(
                        remote.clone(),
                        prompter.clone(),
                        debug.clone(),
                    ));
                }
                other => debug!("Authentication method {} not used", other),
            }
        }
        chain
    }

    /// Check if the chain has any probes.
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Method names in the order they will be tried.
    pub fn method_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|probe| probe.name()).collect()
    }

    /// Run the probes until the server accepts one.
    ///
    /// A rejected or skipped candidate moves on within the probe's budget;
    /// an exhausted probe moves on to the next method. Cancellation and
    /// transport failures end authentication immediately.
    pub async fn authenticate(&mut self, session: &mut dyn AuthSession, user: &str) -> Result<(), ConnectError> {
        if self.probes.is_empty() {
            return Err(ErrorKind::Auth("no authentication methods enabled".to_string()).in_context(&self.debug));
        }

        let mut last_error = None;
        for probe in &mut self.probes {
            let name = probe.name();
            let budget = probe.retry_budget();
            debug!("Trying authentication method {} (up to {} attempt(s))", name, budget);

            let mut exhausted = false;
            for _ in 0..budget {
                match probe.attempt(session, user).await {
                    Ok(ProbeOutcome::Accepted) => {
                        info!("Authenticated {} with {}", user, name);
                        return Ok(());
                    }
                    Ok(ProbeOutcome::Rejected) => debug!("Server rejected {} attempt", name),
                    Ok(ProbeOutcome::Skipped) => debug!("Skipped {} candidate", name),
                    Err(e) if matches!(e.kind(), ErrorKind::CredentialExhausted(_)) => {
                        last_error = Some(e);
                        exhausted = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !exhausted {
                last_error = Some(
                    ErrorKind::CredentialExhausted(format!("{} attempts used up", name)).in_context(&self.debug),
                );
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ErrorKind::Auth("no authentication method succeeded".to_string()).in_context(&self.debug)
        }))
    }
}
