//! russh-backed [`Connector`]: TCP dials, direct-tcpip tunnels, handshakes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::{self, Algorithm, PrivateKeyWithHashAlg};
use russh::Disconnect;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{AgentSigner, AuthSession, Credential, KbdReply, KeyAgent, SocketAgent};
use super::chain::{Connector, Dialed, HopSetup};
use super::error::{ConnectError, ErrorKind, classify_transport_error};
use super::known_hosts::HostKey;
use super::trust::HostKeyVerifier;

/// Error type of [`HopHandler`]: a transport failure or a trust verdict.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("{0}")]
    Trust(ErrorKind),
}

/// russh client handler for one hop; checks the host key.
pub struct HopHandler {
    host: String,
    port: u16,
    remote: String,
    verifier: HostKeyVerifier,
    host_key_seen: CancellationToken,
}

impl client::Handler for HopHandler {
    type Error = HandlerError;

    async fn check_server_key(&mut self, server_public_key: &keys::PublicKey) -> Result<bool, Self::Error> {
        self.host_key_seen.cancel();
        let key = HostKey::from(server_public_key);
        self.verifier
            .verify(&self.host, self.port, &self.remote, &key)
            .await
            .map_err(HandlerError::Trust)?;
        Ok(true)
    }
}

/// Reorder the default host key algorithms so the ones already trusted for
/// the host come first.
pub(crate) fn preferred_host_keys(known: &[String]) -> Vec<Algorithm> {
    let mut algorithms = russh::Preferred::default().key.to_vec();
    algorithms.sort_by_key(|algorithm| {
        let key_type = match algorithm {
            Algorithm::Rsa { .. } => "ssh-rsa",
            other => other.as_str(),
        };
        !known.iter().any(|k| k == key_type)
    });
    algorithms
}

/// Build russh client configuration for one hop.
///
/// Keepalive every 30 seconds with at most 3 unanswered keepalives; no
/// inactivity timeout so established sessions stay open.
pub(crate) fn build_client_config(known_algorithms: &[String]) -> Arc<client::Config> {
    let preferred = russh::Preferred {
        key: preferred_host_keys(known_algorithms).into(),
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

fn transport_error(e: impl fmt::Display) -> ErrorKind {
    classify_transport_error(&e.to_string())
}

/// An authenticated SSH session, possibly tunnelled through `parent`.
pub struct SshTransport {
    handle: client::Handle<HopHandler>,
    parent: Option<Arc<SshTransport>>,
    label: String,
    remote: String,
}

impl SshTransport {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Address the session was dialed at.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn parent(&self) -> Option<&Arc<SshTransport>> {
        self.parent.as_ref()
    }

    /// Labels from the first jump host down to this session.
    pub fn route(&self) -> Vec<String> {
        let mut route = match &self.parent {
            Some(parent) => parent.route(),
            None => Vec::new(),
        };
        route.push(self.label.clone());
        route
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Close this session. Jump hosts close once their last user is gone.
    pub async fn disconnect(&self) -> Result<(), String> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| format!("Failed to disconnect {}: {}", self.label, e))
    }
}

impl fmt::Display for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTransport")
            .field("label", &self.label)
            .field("remote", &self.remote)
            .field("parent", &self.parent.as_ref().map(|p| p.label.clone()))
            .finish()
    }
}

/// [`AuthSession`] over a russh handle.
struct RusshAuthSession<'a> {
    handle: &'a mut client::Handle<HopHandler>,
    agent: Option<Arc<dyn KeyAgent>>,
}

fn kbd_reply(response: KeyboardInteractiveAuthResponse) -> KbdReply {
    match response {
        KeyboardInteractiveAuthResponse::Success => KbdReply::Success,
        KeyboardInteractiveAuthResponse::Failure { .. } => KbdReply::Failure,
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => KbdReply::InfoRequest {
            name,
            instructions,
            questions: prompts.iter().map(|p| p.prompt.clone()).collect(),
            echos: prompts.iter().map(|p| p.echo).collect(),
        },
    }
}

#[async_trait]
impl AuthSession for RusshAuthSession<'_> {
    async fn offer_publickey(&mut self, user: &str, credential: &Credential) -> Result<bool, ErrorKind> {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = self.handle.best_supported_rsa_hash().await.ok().flatten().flatten();

        match credential {
            Credential::Key { key, .. } => {
                let result = self
                    .handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg))
                    .await
                    .map_err(transport_error)?;
                Ok(result.success())
            }
            Credential::Agent(public_key) => {
                let Some(agent) = &self.agent else {
                    return Ok(false);
                };
                let mut signer = AgentSigner::new(Arc::clone(agent));
                match self
                    .handle
                    .authenticate_publickey_with(user, public_key.clone(), hash_alg, &mut signer)
                    .await
                {
                    Ok(result) => Ok(result.success()),
                    Err(e) => {
                        warn!("Agent could not sign with {}: {:?}", credential.describe(), e);
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn offer_password(&mut self, user: &str, password: &str) -> Result<bool, ErrorKind> {
        let result = self
            .handle
            .authenticate_password(user, password)
            .await
            .map_err(transport_error)?;
        Ok(result.success())
    }

    async fn keyboard_interactive_start(&mut self, user: &str) -> Result<KbdReply, ErrorKind> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map_err(transport_error)?;
        Ok(kbd_reply(response))
    }

    async fn keyboard_interactive_respond(&mut self, answers: Vec<String>) -> Result<KbdReply, ErrorKind> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(answers)
            .await
            .map_err(transport_error)?;
        Ok(kbd_reply(response))
    }
}

/// Connects hops with russh.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    type Transport = SshTransport;

    async fn agent(&self, socket: &str) -> Option<Arc<dyn KeyAgent>> {
        let agent: Arc<dyn KeyAgent> = SocketAgent::connect(socket).await?;
        Some(agent)
    }

    async fn dial(&self, parent: Option<&SshTransport>, host: &str, port: u16) -> Result<Dialed, ErrorKind> {
        match parent {
            None => {
                let stream = TcpStream::connect((host, port)).await.map_err(transport_error)?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                let remote = match stream.peer_addr() {
                    Ok(addr) => addr.to_string(),
                    Err(_) => format!("{}:{}", host, port),
                };
                Ok(Dialed {
                    stream: Box::new(stream),
                    remote,
                })
            }
            Some(parent) => {
                let channel = parent
                    .handle
                    .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
                    .await
                    .map_err(|e| {
                        ErrorKind::Network(format!("channel open failure via {}: {}", parent.label, e))
                    })?;
                Ok(Dialed {
                    stream: Box::new(channel.into_stream()),
                    remote: format!("{}:{} via {}", host, port, parent.label),
                })
            }
        }
    }

    async fn handshake(
        &self,
        dialed: Dialed,
        parent: Option<Arc<SshTransport>>,
        setup: HopSetup,
    ) -> Result<SshTransport, ConnectError> {
        let HopSetup {
            params,
            verifier,
            mut auth,
            debug: debug_ctx,
            host_key_seen,
        } = setup;

        let known = verifier.host_key_algorithms(&params.hostname, params.port);
        let config = build_client_config(&known);
        let handler = HopHandler {
            host: params.hostname.clone(),
            port: params.port,
            remote: dialed.remote.clone(),
            verifier,
            host_key_seen,
        };

        let mut handle = client::connect_stream(config, dialed.stream, handler)
            .await
            .map_err(|e| match e {
                HandlerError::Trust(kind) => kind.in_context(&debug_ctx),
                HandlerError::Ssh(e) => transport_error(e).in_context(&debug_ctx),
            })?;
        debug!("{}: handshake complete, authenticating", debug_ctx);

        let agent = auth.agent();
        let result = {
            let mut session = RusshAuthSession {
                handle: &mut handle,
                agent,
            };
            auth.authenticate(&mut session, &params.user).await
        };
        if let Err(e) = result {
            if let Err(close) = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "English")
                .await
            {
                debug!("Failed to close unauthenticated session: {}", close);
            }
            return Err(e);
        }

        let label = params.label();
        info!("SSH session established to {} ({})", label, dialed.remote);
        Ok(SshTransport {
            handle,
            parent,
            label,
            remote: dialed.remote,
        })
    }
}
