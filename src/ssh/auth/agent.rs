//! SSH agent reached over its Unix socket.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::{HashAlg, PrivateKey, PublicKey, ssh_key};
use russh::{AgentAuthError, CryptoVec, Signer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ssh::config::expand_home;

use super::traits::KeyAgent;

type DynAgentClient = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Agent client behind the `IdentityAgent` socket.
pub struct SocketAgent {
    client: Mutex<DynAgentClient>,
}

impl SocketAgent {
    /// Connect to the agent socket.
    ///
    /// An empty path or a socket that does not answer means no agent; the
    /// failure is logged and `None` returned.
    pub async fn connect(socket: &str) -> Option<Arc<Self>> {
        if socket.is_empty() {
            return None;
        }
        let path = expand_home(socket)?;

        #[cfg(unix)]
        {
            match AgentClient::connect_uds(&path).await {
                Ok(client) => {
                    info!("Connected to SSH agent at {}", path.display());
                    Some(Arc::new(Self {
                        client: Mutex::new(client.dynamic()),
                    }))
                }
                Err(e) => {
                    warn!("Cannot connect to SSH agent at {}: {}", path.display(), e);
                    None
                }
            }
        }

        #[cfg(not(unix))]
        {
            warn!("SSH agent sockets are not supported on this platform ({})", path.display());
            None
        }
    }
}

#[async_trait]
impl KeyAgent for SocketAgent {
    async fn identities(&self) -> Result<Vec<PublicKey>, String> {
        let keys = self
            .client
            .lock()
            .await
            .request_identities()
            .await
            .map_err(|e| format!("Failed to list agent keys: {}", e))?;
        debug!("Agent offers {} key(s)", keys.len());
        Ok(keys)
    }

    async fn add_identity(&self, key: &PrivateKey) -> Result<(), String> {
        self.client
            .lock()
            .await
            .add_identity(key, &[])
            .await
            .map_err(|e| format!("Failed to add key to agent: {}", e))
    }

    async fn sign(
        &self,
        key: &PublicKey,
        hash_alg: Option<HashAlg>,
        data: CryptoVec,
    ) -> Result<CryptoVec, russh::keys::Error> {
        self.client.lock().await.sign_request(key, hash_alg, data).await
    }
}

/// Lets russh ask the agent for signatures during publickey auth.
///
/// The key is cloned before the future is built so the future owns
/// everything it holds across the await.
pub struct AgentSigner {
    agent: Arc<dyn KeyAgent>,
}

impl AgentSigner {
    pub fn new(agent: Arc<dyn KeyAgent>) -> Self {
        Self { agent }
    }
}

impl Signer for AgentSigner {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        let agent = Arc::clone(&self.agent);
        async move {
            agent
                .sign(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}
