//! Tunnel Chainer: establishes one hop, recursing through its ProxyJumps.
//!
//! Each hop runs through an explicit state machine:
//!
//! ```text
//! ResolveConfig -> ConnectJumps -> BuildTrust -> BuildAuth
//!     -> DialParentOrDirect -> Handshake -> Done
//! ```
//!
//! Every state checks the attempt's cancellation token and every failure is
//! wrapped with the hop's [`DebugContext`]. Errors coming back from a
//! recursive jump already carry their own context and are passed through
//! untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{AuthChain, KeyAgent};
use super::error::{ConnectError, DebugContext, ErrorKind};
use super::hop::HopIdentity;
use super::prompt::Prompter;
use super::resolver::{ConnKeywords, ConnectionParameters, Resolver};
use super::trust::HostKeyVerifier;

/// Deepest ProxyJump nesting accepted before giving up.
pub const SSH_PROXY_JUMP_MAX_DEPTH: u32 = 10;

/// Byte stream a handshake can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A raw connection to the next hop.
pub struct Dialed {
    pub stream: BoxedStream,
    /// Address actually reached, for prompts and logs
    pub remote: String,
}

impl fmt::Debug for Dialed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialed").field("remote", &self.remote).finish()
    }
}

/// Everything the handshake needs for one hop.
pub struct HopSetup {
    pub params: ConnectionParameters,
    pub verifier: HostKeyVerifier,
    pub auth: AuthChain,
    pub debug: DebugContext,
    /// Fired by the connector once the server's host key arrives. The
    /// connect timeout stops applying from then on, so host key and
    /// authentication prompts are bounded only by the prompt timeout.
    pub host_key_seen: CancellationToken,
}

/// The SSH implementation behind the chainer.
#[async_trait]
pub trait Connector: Send + Sync {
    /// An authenticated session that can open channels to further hops.
    type Transport: fmt::Display + Send + Sync + 'static;

    /// Connect to the agent socket; `None` when there is no usable agent.
    async fn agent(&self, socket: &str) -> Option<Arc<dyn KeyAgent>>;

    /// Open a byte stream to `host:port`, through `parent` when given.
    async fn dial(&self, parent: Option<&Self::Transport>, host: &str, port: u16) -> Result<Dialed, ErrorKind>;

    /// Run the SSH handshake and authentication over `dialed`.
    ///
    /// The returned transport keeps `parent` alive.
    async fn handshake(
        &self,
        dialed: Dialed,
        parent: Option<Arc<Self::Transport>>,
        setup: HopSetup,
    ) -> Result<Self::Transport, ConnectError>;
}

enum HopState<T> {
    ResolveConfig {
        parent: Option<Arc<T>>,
    },
    ConnectJumps {
        params: ConnectionParameters,
        parent: Option<Arc<T>>,
    },
    BuildTrust {
        params: ConnectionParameters,
        parent: Option<Arc<T>>,
    },
    BuildAuth {
        params: ConnectionParameters,
        parent: Option<Arc<T>>,
        verifier: HostKeyVerifier,
    },
    DialParentOrDirect {
        params: ConnectionParameters,
        parent: Option<Arc<T>>,
        verifier: HostKeyVerifier,
        auth: AuthChain,
    },
    Handshake {
        params: ConnectionParameters,
        parent: Option<Arc<T>>,
        verifier: HostKeyVerifier,
        auth: AuthChain,
        dialed: Dialed,
    },
    Done(Arc<T>),
}

impl<T> HopState<T> {
    fn name(&self) -> &'static str {
        match self {
            HopState::ResolveConfig { .. } => "ResolveConfig",
            HopState::ConnectJumps { .. } => "ConnectJumps",
            HopState::BuildTrust { .. } => "BuildTrust",
            HopState::BuildAuth { .. } => "BuildAuth",
            HopState::DialParentOrDirect { .. } => "DialParentOrDirect",
            HopState::Handshake { .. } => "Handshake",
            HopState::Done(_) => "Done",
        }
    }
}

/// Runs hops for one connection attempt.
pub struct Chainer<C: Connector> {
    connector: Arc<C>,
    resolver: Arc<Resolver>,
    prompter: Prompter,
    cancel: CancellationToken,
    connect_timeout: Duration,
    privileged: bool,
}

impl<C: Connector + 'static> Chainer<C> {
    pub fn new(
        connector: Arc<C>,
        resolver: Arc<Resolver>,
        prompter: Prompter,
        cancel: CancellationToken,
        connect_timeout: Duration,
        privileged: bool,
    ) -> Self {
        Self {
            connector,
            resolver,
            prompter,
            cancel,
            connect_timeout,
            privileged,
        }
    }

    /// Establish `target`, dialing through `parent` when given.
    ///
    /// Returns the transport and the jump depth it was established at.
    pub fn connect_hop(
        &self,
        target: HopIdentity,
        parent: Option<Arc<C::Transport>>,
        depth: u32,
        caller: ConnKeywords,
    ) -> BoxFuture<'_, Result<(Arc<C::Transport>, u32), ConnectError>> {
        Box::pin(self.run_hop(target, parent, depth, caller))
    }

    async fn run_hop(
        &self,
        target: HopIdentity,
        parent: Option<Arc<C::Transport>>,
        depth: u32,
        caller: ConnKeywords,
    ) -> Result<(Arc<C::Transport>, u32), ConnectError> {
        let mut debug_ctx = DebugContext::new(parent.as_ref().map(|p| p.to_string()), target.clone(), depth);
        if depth > SSH_PROXY_JUMP_MAX_DEPTH {
            return Err(ErrorKind::DepthExceeded {
                depth,
                max: SSH_PROXY_JUMP_MAX_DEPTH,
            }
            .in_context(&debug_ctx));
        }

        let mut state = HopState::ResolveConfig { parent };
        loop {
            debug!("{}: {}", debug_ctx, state.name());
            if self.cancel.is_cancelled() {
                return Err(cancelled(&debug_ctx));
            }

            state = match state {
                HopState::ResolveConfig { parent } => {
                    let params = self
                        .resolver
                        .resolve(&caller, &target)
                        .map_err(|kind| kind.in_context(&debug_ctx))?;
                    debug_ctx.resolved = Some(params.label());
                    HopState::ConnectJumps { params, parent }
                }

                HopState::ConnectJumps { params, mut parent } => {
                    let mut jump_num = depth;
                    for jump in &params.proxy_jump {
                        let hop: HopIdentity = jump.parse().map_err(|kind: ErrorKind| kind.in_context(&debug_ctx))?;
                        jump_num = jump_num.saturating_add(1);
                        // jump hosts only get their own ssh_config settings
                        let (transport, _) = self
                            .connect_hop(hop, parent.take(), jump_num, ConnKeywords::default())
                            .await?;
                        debug_ctx.current = Some(transport.to_string());
                        parent = Some(transport);
                    }
                    HopState::BuildTrust { params, parent }
                }

                HopState::BuildTrust { params, parent } => {
                    let verifier = HostKeyVerifier::build(&params, self.privileged, self.prompter.clone())
                        .map_err(|kind| kind.in_context(&debug_ctx))?;
                    HopState::BuildAuth {
                        params,
                        parent,
                        verifier,
                    }
                }

                HopState::BuildAuth {
                    params,
                    parent,
                    verifier,
                } => {
                    let agent = self
                        .guard(&debug_ctx, async { Ok(self.connector.agent(&params.identity_agent).await) })
                        .await?;
                    let signers = match &agent {
                        Some(agent) => match agent.identities().await {
                            Ok(keys) => keys,
                            Err(e) => {
                                warn!("{}: ignoring agent: {}", debug_ctx, e);
                                Vec::new()
                            }
                        },
                        None => Vec::new(),
                    };
                    let auth = AuthChain::build_methods(&params, &debug_ctx, &self.prompter, agent, signers);
                    HopState::DialParentOrDirect {
                        params,
                        parent,
                        verifier,
                        auth,
                    }
                }

                HopState::DialParentOrDirect {
                    params,
                    parent,
                    verifier,
                    auth,
                } => {
                    let timeout = self.connect_timeout;
                    let dial = self.connector.dial(parent.as_deref(), &params.hostname, params.port);
                    let dialed = self
                        .guard(&debug_ctx, async {
                            match tokio::time::timeout(timeout, dial).await {
                                Ok(result) => result.map_err(|kind| kind.in_context(&debug_ctx)),
                                Err(_) => Err(ErrorKind::Network(format!("dial timed out after {:?}", timeout))
                                    .in_context(&debug_ctx)),
                            }
                        })
                        .await?;
                    HopState::Handshake {
                        params,
                        parent,
                        verifier,
                        auth,
                        dialed,
                    }
                }

                HopState::Handshake {
                    params,
                    parent,
                    verifier,
                    auth,
                    dialed,
                } => {
                    let host_key_seen = CancellationToken::new();
                    let setup = HopSetup {
                        params,
                        verifier,
                        auth,
                        debug: debug_ctx.clone(),
                        host_key_seen: host_key_seen.clone(),
                    };
                    let handshake = self.connector.handshake(dialed, parent, setup);
                    let transport = self
                        .guard(&debug_ctx, self.bounded_handshake(&debug_ctx, handshake, host_key_seen))
                        .await?;
                    HopState::Done(Arc::new(transport))
                }

                HopState::Done(transport) => {
                    info!("Connected to {} (jump depth {})", transport, depth);
                    return Ok((transport, depth));
                }
            };
        }
    }

    /// Drive `handshake`, failing with a network error when the server's host
    /// key has not arrived within the connect timeout.
    async fn bounded_handshake<T, F>(
        &self,
        debug_ctx: &DebugContext,
        handshake: F,
        host_key_seen: CancellationToken,
    ) -> Result<T, ConnectError>
    where
        F: Future<Output = Result<T, ConnectError>>,
    {
        let timeout = self.connect_timeout;
        tokio::pin!(handshake);
        tokio::select! {
            biased;
            result = &mut handshake => return result,
            _ = host_key_seen.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                return Err(ErrorKind::Network(format!("handshake timed out after {:?}", timeout))
                    .in_context(debug_ctx));
            }
        }
        debug!("{}: host key received, waiting for authentication", debug_ctx);
        handshake.await
    }

    /// Run `step` unless the attempt is cancelled first.
    async fn guard<T, F>(&self, debug_ctx: &DebugContext, step: F) -> Result<T, ConnectError>
    where
        F: Future<Output = Result<T, ConnectError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled(debug_ctx)),
            result = step => result,
        }
    }
}

fn cancelled(debug_ctx: &DebugContext) -> ConnectError {
    ErrorKind::UserCancelled("connection attempt cancelled".to_string()).in_context(debug_ctx)
}
