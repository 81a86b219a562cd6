//! Connection Orchestrator: the public entry point of the engine.
//!
//! ## Retry Strategy
//!
//! [`Engine::connect_with_retry`] repeats whole attempts with exponential
//! backoff and jitter via the `backon` crate:
//!
//! - **Initial delay**: [`EngineSettings::retry_delay`]
//! - **Maximum delay**: capped at [`MAX_RETRY_DELAY_SECS`]
//! - **Maximum retries**: [`EngineSettings::max_retries`]
//!
//! Only network failures are retried. Trust, credential, cancellation,
//! configuration and depth errors fail on the first attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::chain::{Chainer, Connector};
use super::config::{EngineSettings, MAX_RETRY_DELAY_SECS};
use super::error::{ConnectError, DebugContext, ErrorKind};
use super::hop::HopIdentity;
use super::prompt::{Prompter, UserInputService};
use super::resolver::{ConnKeywords, Resolver};
use super::trust::is_privileged_user;

/// Everything one attempt needs from the caller.
#[derive(Clone)]
pub struct AttemptContext {
    /// Where interactive questions go
    pub input: Arc<dyn UserInputService>,
    /// Cancels prompts and dials of this attempt
    pub cancel: CancellationToken,
}

impl AttemptContext {
    pub fn new(input: Arc<dyn UserInputService>, cancel: CancellationToken) -> Self {
        Self { input, cancel }
    }
}

/// A connected chain and how it was reached.
#[derive(Debug)]
pub struct Connection<T> {
    pub transport: Arc<T>,
    /// Jump depth of the final hop
    pub depth: u32,
    /// Attempts that failed before this one
    pub retries: u32,
}

/// Resolves, authenticates and chains connections.
pub struct Engine<C: Connector> {
    connector: Arc<C>,
    resolver: Arc<Resolver>,
    settings: EngineSettings,
    privileged: bool,
}

impl<C: Connector + 'static> Engine<C> {
    pub fn new(connector: C, resolver: Resolver, settings: EngineSettings) -> Self {
        Self {
            connector: Arc::new(connector),
            resolver: Arc::new(resolver),
            settings,
            privileged: is_privileged_user(),
        }
    }

    /// Treat the local account as privileged (or not) for known_hosts selection.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Parse the requested target, letting the caller's user and port fill
    /// whatever the target string leaves out.
    pub fn target_hop(target: &str, caller: &ConnKeywords) -> Result<HopIdentity, ConnectError> {
        let mut hop: HopIdentity = target.parse().map_err(|kind: ErrorKind| {
            kind.in_context(&DebugContext::new(
                None,
                HopIdentity::new("", target, 0),
                0,
            ))
        })?;
        if hop.user.is_empty() {
            hop.user = caller.user.clone();
        }
        if hop.port == 0 {
            hop.port = caller.port;
        }
        Ok(hop)
    }

    /// Run one connection attempt to `target`.
    ///
    /// ssh_config is re-read first so edits made between attempts apply.
    pub async fn connect(
        &self,
        target: &str,
        caller: &ConnKeywords,
        ctx: &AttemptContext,
    ) -> Result<(Arc<C::Transport>, u32), ConnectError> {
        let hop = Self::target_hop(target, caller)?;
        self.resolver.store().reload();

        let prompter = Prompter::new(ctx.input.clone(), ctx.cancel.clone(), self.settings.prompt_timeout);
        let chainer = Chainer::new(
            self.connector.clone(),
            self.resolver.clone(),
            prompter,
            ctx.cancel.clone(),
            self.settings.connect_timeout,
            self.privileged,
        );
        chainer.connect_hop(hop, None, 0, caller.clone()).await
    }

    /// [`Engine::connect`] with retries on network failures.
    pub async fn connect_with_retry(
        &self,
        target: &str,
        caller: &ConnKeywords,
        ctx: &AttemptContext,
    ) -> Result<Connection<C::Transport>, ConnectError> {
        // Track retry attempts using atomic counter
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_delay)
            .with_max_delay(Duration::from_secs(MAX_RETRY_DELAY_SECS))
            .with_max_times(self.settings.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("Connection retry attempt {} to {}", current_attempt, target);
            }
            self.connect(target, caller, ctx).await
        })
        .retry(backoff)
        .when(|e: &ConnectError| {
            let retryable = e.is_retryable() && !ctx.cancel.is_cancelled();
            if !retryable {
                warn!("Connection to {} failed with non-retryable error: {}", target, e);
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("Connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        let retries = total_attempts.saturating_sub(1);

        match result {
            Ok((transport, depth)) => {
                if retries > 0 {
                    info!("Connection to {} succeeded after {} retry attempt(s)", target, retries);
                }
                Ok(Connection {
                    transport,
                    depth,
                    retries,
                })
            }
            Err(e) => {
                error!(
                    "Connection to {} failed after {} attempt(s). Last error: {}",
                    target, total_attempts, e
                );
                Err(e)
            }
        }
    }
}
