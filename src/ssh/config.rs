//! Configuration resolution for the connection engine.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Dial and handshake timeout per hop, in seconds |
//! | `SSH_PROMPT_TIMEOUT` | 60s | How long a user prompt waits for an answer, in seconds |
//! | `SSH_MAX_RETRIES` | 3 | Maximum retry attempts for network failures |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `SSH_CONFIG_FILES` | `~/.ssh/config:/etc/ssh/ssh_config` | Colon separated ssh_config files |
//! | `SSHLINK_SETTINGS` | `~/.config/sshlink/connections.json` | Persisted per-connection settings |

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default time a prompt waits for the user, in seconds
pub(crate) const DEFAULT_PROMPT_TIMEOUT_SECS: u64 = 60;

/// Default maximum retry attempts for SSH connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap in seconds (10 seconds)
pub(crate) const MAX_RETRY_DELAY_SECS: u64 = 10;

/// ssh_config files read when nothing else is configured, in lookup order
pub(crate) const DEFAULT_SSH_CONFIG_FILES: &[&str] = &["~/.ssh/config", "/etc/ssh/ssh_config"];

/// Persisted settings file used when nothing else is configured
pub(crate) const DEFAULT_SETTINGS_FILE: &str = "~/.config/sshlink/connections.json";

/// Environment variable name for SSH connection timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";

/// Environment variable name for the prompt timeout
pub(crate) const PROMPT_TIMEOUT_ENV_VAR: &str = "SSH_PROMPT_TIMEOUT";

/// Environment variable name for SSH max retries
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";

/// Environment variable name for SSH retry delay in milliseconds
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";

/// Environment variable name for the ssh_config file list
pub(crate) const SSH_CONFIG_FILES_ENV_VAR: &str = "SSH_CONFIG_FILES";

/// Environment variable name for the persisted settings file
pub(crate) const SETTINGS_FILE_ENV_VAR: &str = "SSHLINK_SETTINGS";

/// Resolve the connection timeout value with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    // Priority 1: Use parameter if provided
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    // Priority 2: Use environment variable if set
    if let Ok(env_timeout) = env::var(CONNECT_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    // Priority 3: Default value
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Resolve the prompt timeout value with priority: parameter -> env var -> default
pub(crate) fn resolve_prompt_timeout(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(PROMPT_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
        && timeout > 0
    {
        return timeout;
    }

    DEFAULT_PROMPT_TIMEOUT_SECS
}

/// Resolve the max retries value with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    // Priority 1: Use parameter if provided
    if let Some(max_retries) = max_retries_param {
        return max_retries;
    }

    // Priority 2: Use environment variable if set
    if let Ok(env_retries) = env::var(MAX_RETRIES_ENV_VAR)
        && let Ok(retries) = env_retries.parse::<u32>()
    {
        return retries;
    }

    // Priority 3: Default value
    DEFAULT_MAX_RETRIES
}

/// Resolve the retry delay value with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay_ms(retry_delay_param: Option<u64>) -> u64 {
    if let Some(delay) = retry_delay_param {
        return delay;
    }

    if let Ok(env_delay) = env::var(RETRY_DELAY_MS_ENV_VAR)
        && let Ok(delay) = env_delay.parse::<u64>()
    {
        return delay;
    }

    DEFAULT_RETRY_DELAY_MS
}

/// Resolve the ssh_config file list: env var (colon separated) -> default.
///
/// Entries are returned unexpanded; `~` is resolved by the store when it
/// reads them.
pub(crate) fn resolve_ssh_config_files() -> Vec<String> {
    if let Ok(files) = env::var(SSH_CONFIG_FILES_ENV_VAR) {
        let files: Vec<String> = files
            .split(':')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();
        if !files.is_empty() {
            return files;
        }
    }

    DEFAULT_SSH_CONFIG_FILES
        .iter()
        .map(|f| f.to_string())
        .collect()
}

/// Resolve the persisted settings path: env var -> default.
pub(crate) fn resolve_settings_file() -> Option<PathBuf> {
    if let Ok(path) = env::var(SETTINGS_FILE_ENV_VAR)
        && !path.trim().is_empty()
    {
        return expand_home(path.trim());
    }

    expand_home(DEFAULT_SETTINGS_FILE)
}

/// Expand a leading `~` or `~/` to the current user's home directory.
///
/// Paths without a leading tilde are returned unchanged. Returns `None` when
/// the path needs the home directory and it cannot be determined, or when the
/// path names another user's home (`~other/...`).
pub fn expand_home(path: &str) -> Option<PathBuf> {
    if path == "~" {
        return dirs::home_dir();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return dirs::home_dir().map(|home| home.join(rest));
    }
    if path.starts_with('~') {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}

/// Timeouts and retry policy shared by every connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on dialing plus handshaking a single hop
    pub connect_timeout: Duration,
    /// Upper bound on waiting for one user answer
    pub prompt_timeout: Duration,
    /// Retries after the first attempt, network failures only
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt up to [`MAX_RETRY_DELAY_SECS`]
    pub retry_delay: Duration,
}

impl EngineSettings {
    /// Build settings from explicit overrides, falling back to env vars and defaults.
    pub fn resolve(
        connect_timeout: Option<u64>,
        max_retries: Option<u32>,
        retry_delay_ms: Option<u64>,
    ) -> Self {
        Self {
            connect_timeout: Duration::from_secs(resolve_connect_timeout(connect_timeout)),
            prompt_timeout: Duration::from_secs(resolve_prompt_timeout(None)),
            max_retries: resolve_max_retries(max_retries),
            retry_delay: Duration::from_millis(resolve_retry_delay_ms(retry_delay_ms)),
        }
    }

    /// Settings taken purely from the environment.
    pub fn from_env() -> Self {
        Self::resolve(None, None, None)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            prompt_timeout: Duration::from_secs(DEFAULT_PROMPT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}
