//! Config Resolver: merges caller options, ssh_config and persisted settings.
//!
//! # Precedence
//!
//! | Field | Winner |
//! |-------|--------|
//! | user | caller > ssh_config > local OS user |
//! | hostname | ssh_config > caller |
//! | port | caller unless 0/22, then ssh_config unless 22, then 22 |
//! | identity files | persisted ++ caller ++ ssh_config (duplicates kept) |
//! | everything else | ssh_config only |
//!
//! Caller-supplied policy (batch mode, method flags, proxy jumps, known hosts
//! files, agent settings) is never honoured.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ErrorKind;
use super::hop::HopIdentity;
use super::ssh_config::{SshConfigStore, trim_quotes};

/// Default SSH port; also the "nothing special requested" sentinel.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One source's view of the connection keywords.
///
/// Used for caller options, values read from ssh_config, and saved
/// per-connection settings alike. Empty strings, empty lists and port `0`
/// mean "not supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnKeywords {
    pub user: String,
    pub hostname: String,
    pub port: u16,
    pub identity_files: Vec<String>,
    pub batch_mode: bool,
    pub pubkey_authentication: bool,
    pub password_authentication: bool,
    pub kbd_interactive_authentication: bool,
    pub preferred_authentications: Vec<String>,
    pub add_keys_to_agent: bool,
    pub identity_agent: String,
    pub proxy_jump: Vec<String>,
    pub user_known_hosts_files: Vec<String>,
    pub global_known_hosts_files: Vec<String>,
}

/// Effective settings for one hop. Built once, never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub user: String,
    pub hostname: String,
    pub port: u16,
    pub identity_files: Vec<String>,
    pub batch_mode: bool,
    pub pubkey_authentication: bool,
    pub password_authentication: bool,
    pub kbd_interactive_authentication: bool,
    pub preferred_authentications: Vec<String>,
    pub add_keys_to_agent: bool,
    /// Agent socket path, empty when there is no agent
    pub identity_agent: String,
    pub proxy_jump: Vec<String>,
    pub user_known_hosts_files: Vec<String>,
    pub global_known_hosts_files: Vec<String>,
}

impl ConnectionParameters {
    /// `user@host:port`, used in logs and error context.
    pub fn label(&self) -> String {
        HopIdentity::new(self.user.clone(), self.hostname.clone(), self.port).to_string()
    }
}

/// Merge keyword sources into effective parameters.
///
/// # Arguments
///
/// * `caller` - Options supplied with the request (only user, hostname, port
///   and identity files are honoured)
/// * `config` - Keywords read from ssh_config for the hop
/// * `saved` - Persisted settings for the hop, if any
/// * `local_user` - Fallback login name
pub fn combine(
    caller: &ConnKeywords,
    config: &ConnKeywords,
    saved: Option<&ConnKeywords>,
    local_user: &str,
) -> ConnectionParameters {
    let user = [caller.user.as_str(), config.user.as_str()]
        .into_iter()
        .find(|u| !u.is_empty())
        .unwrap_or(local_user)
        .to_string();

    let hostname = if config.hostname.is_empty() {
        caller.hostname.clone()
    } else {
        config.hostname.clone()
    };

    let port = if caller.port != 0 && caller.port != DEFAULT_SSH_PORT {
        caller.port
    } else if config.port != 0 && config.port != DEFAULT_SSH_PORT {
        config.port
    } else {
        DEFAULT_SSH_PORT
    };

    let mut identity_files = Vec::new();
    if let Some(saved) = saved {
        identity_files.extend(saved.identity_files.iter().cloned());
    }
    identity_files.extend(caller.identity_files.iter().cloned());
    identity_files.extend(config.identity_files.iter().cloned());

    ConnectionParameters {
        user,
        hostname,
        port,
        identity_files,
        batch_mode: config.batch_mode,
        pubkey_authentication: config.pubkey_authentication,
        password_authentication: config.password_authentication,
        kbd_interactive_authentication: config.kbd_interactive_authentication,
        preferred_authentications: config.preferred_authentications.clone(),
        add_keys_to_agent: config.add_keys_to_agent,
        identity_agent: config.identity_agent.clone(),
        proxy_jump: config.proxy_jump.clone(),
        user_known_hosts_files: config.user_known_hosts_files.clone(),
        global_known_hosts_files: config.global_known_hosts_files.clone(),
    }
}

/// Read-only snapshot of saved per-connection settings.
///
/// Stored as a JSON object keyed by the hop string (`user@host:port`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedSettings {
    connections: HashMap<String, ConnKeywords>,
}

impl PersistedSettings {
    /// Load a snapshot; a missing file yields an empty snapshot.
    pub fn load(path: &Path) -> Result<Self, ErrorKind> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No persisted settings at {}", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(ErrorKind::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    err
                )));
            }
        };
        serde_json::from_str(&content).map_err(|e| {
            ErrorKind::Config(format!("malformed settings in {}: {}", path.display(), e))
        })
    }

    pub fn insert(&mut self, canonical: impl Into<String>, keywords: ConnKeywords) {
        self.connections.insert(canonical.into(), keywords);
    }

    pub fn get(&self, canonical: &str) -> Option<&ConnKeywords> {
        self.connections.get(canonical)
    }
}

fn yes(value: &str) -> bool {
    trim_quotes(value).trim().eq_ignore_ascii_case("yes")
}

fn not_no(value: &str) -> bool {
    !trim_quotes(value).trim().eq_ignore_ascii_case("no")
}

/// Resolves hop identities into effective parameters.
#[derive(Debug, Clone)]
pub struct Resolver {
    store: Arc<SshConfigStore>,
    settings: Arc<PersistedSettings>,
    local_user: String,
}

impl Resolver {
    pub fn new(store: Arc<SshConfigStore>, settings: Arc<PersistedSettings>) -> Self {
        Self {
            store,
            settings,
            local_user: whoami::username(),
        }
    }

    /// Override the fallback login name.
    pub fn with_local_user(mut self, user: impl Into<String>) -> Self {
        self.local_user = user.into();
        self
    }

    pub fn store(&self) -> &SshConfigStore {
        &self.store
    }

    /// Read every keyword the engine uses for `host` from ssh_config.
    pub fn config_keywords(&self, host: &str) -> Result<ConnKeywords, ErrorKind> {
        let store = &self.store;
        let get = |keyword: &str| store.get_strict(host, keyword).map_err(ErrorKind::from);

        let port_value = get("Port")?;
        let port = trim_quotes(&port_value)
            .parse::<u16>()
            .map_err(|e| ErrorKind::Config(format!("invalid Port {:?}: {}", port_value, e)))?;

        let identity_files = store
            .get_all(host, "IdentityFile")?
            .iter()
            .map(|f| trim_quotes(f).to_string())
            .collect();

        let preferred_authentications = trim_quotes(&get("PreferredAuthentications")?)
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .collect();

        let proxy_jump = trim_quotes(&get("ProxyJump")?)
            .split(',')
            .map(str::trim)
            .filter(|j| !j.is_empty() && !j.eq_ignore_ascii_case("none"))
            .map(String::from)
            .collect();

        let mut identity_agent = trim_quotes(&get("IdentityAgent")?).to_string();
        if identity_agent.is_empty()
            && let Ok(sock) = env::var("SSH_AUTH_SOCK")
        {
            identity_agent = sock;
        }
        if identity_agent.eq_ignore_ascii_case("none") {
            identity_agent.clear();
        }

        let split_files = |value: String| -> Vec<String> {
            value
                .split_whitespace()
                .map(|f| trim_quotes(f).to_string())
                .collect()
        };

        Ok(ConnKeywords {
            user: trim_quotes(&get("User")?).to_string(),
            hostname: trim_quotes(&get("HostName")?).to_string(),
            port,
            identity_files,
            batch_mode: yes(&get("BatchMode")?),
            pubkey_authentication: not_no(&get("PubkeyAuthentication")?),
            password_authentication: not_no(&get("PasswordAuthentication")?),
            kbd_interactive_authentication: not_no(&get("KbdInteractiveAuthentication")?),
            preferred_authentications,
            add_keys_to_agent: yes(&get("AddKeysToAgent")?),
            identity_agent,
            proxy_jump,
            user_known_hosts_files: split_files(get("UserKnownHostsFile")?),
            global_known_hosts_files: split_files(get("GlobalKnownHostsFile")?),
        })
    }

    /// Effective parameters for `hop` given the caller's options.
    ///
    /// The hop's own user, host and port replace whatever the caller passed
    /// for those fields; persisted settings are looked up by the hop string.
    pub fn resolve(
        &self,
        caller: &ConnKeywords,
        hop: &HopIdentity,
    ) -> Result<ConnectionParameters, ErrorKind> {
        let config = self.config_keywords(&hop.host)?;

        let mut flags = caller.clone();
        flags.user = hop.user.clone();
        flags.hostname = hop.host.clone();
        flags.port = hop.port;

        let saved = self.settings.get(&hop.to_string());
        let params = combine(&flags, &config, saved, &self.local_user);
        debug!(
            "Resolved {} to {} ({} identity files, {} jumps)",
            hop,
            params.label(),
            params.identity_files.len(),
            params.proxy_jump.len()
        );
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::tests::{ENV_TEST_MUTEX, remove_env, set_env};
    use tempfile::TempDir;

    fn keywords(user: &str, hostname: &str, port: u16) -> ConnKeywords {
        ConnKeywords {
            user: user.into(),
            hostname: hostname.into(),
            port,
            ..Default::default()
        }
    }

    fn resolver_for(dir: &TempDir, config: &str) -> Resolver {
        let path = dir.path().join("config");
        fs::write(&path, config).unwrap();
        let store = SshConfigStore::load(vec![path.to_string_lossy().into_owned()]);
        Resolver::new(Arc::new(store), Arc::new(PersistedSettings::default())).with_local_user("osuser")
    }

    mod combine_precedence {
        use super::*;

        #[test]
        fn test_port_default_sentinels_never_override_config() {
            let config = keywords("", "", 2222);
            for caller_port in [0, 22] {
                let params = combine(&keywords("", "h", caller_port), &config, None, "me");
                assert_eq!(params.port, 2222, "caller port {}", caller_port);
            }
        }

        #[test]
        fn test_port_explicit_caller_wins() {
            let params = combine(&keywords("", "h", 2200), &keywords("", "", 2222), None, "me");
            assert_eq!(params.port, 2200);
        }

        #[test]
        fn test_port_falls_back_to_22() {
            for (caller, config) in [(0, 0), (0, 22), (22, 22), (22, 0)] {
                let params = combine(&keywords("", "h", caller), &keywords("", "", config), None, "me");
                assert_eq!(params.port, 22);
            }
        }

        #[test]
        fn test_user_precedence() {
            let config = keywords("cfg", "", 0);
            assert_eq!(combine(&keywords("cli", "h", 0), &config, None, "os").user, "cli");
            assert_eq!(combine(&keywords("", "h", 0), &config, None, "os").user, "cfg");
            assert_eq!(
                combine(&keywords("", "h", 0), &ConnKeywords::default(), None, "os").user,
                "os"
            );
        }

        #[test]
        fn test_hostname_config_rewrites_alias() {
            let params = combine(&keywords("", "db", 0), &keywords("", "10.0.0.5", 0), None, "os");
            assert_eq!(params.hostname, "10.0.0.5");
            let params = combine(&keywords("", "db", 0), &ConnKeywords::default(), None, "os");
            assert_eq!(params.hostname, "db");
        }

        #[test]
        fn test_identity_files_concatenated_with_duplicates() {
            let saved = ConnKeywords {
                identity_files: vec!["~/.ssh/id_saved".into()],
                ..Default::default()
            };
            let caller = ConnKeywords {
                identity_files: vec!["~/.ssh/id_ed25519".into()],
                ..keywords("", "h", 0)
            };
            let config = ConnKeywords {
                identity_files: vec!["~/.ssh/id_ed25519".into()],
                ..Default::default()
            };
            let params = combine(&caller, &config, Some(&saved), "os");
            assert_eq!(
                params.identity_files,
                vec!["~/.ssh/id_saved", "~/.ssh/id_ed25519", "~/.ssh/id_ed25519"]
            );
        }

        #[test]
        fn test_caller_policy_ignored() {
            let caller = ConnKeywords {
                batch_mode: true,
                password_authentication: true,
                proxy_jump: vec!["evil-jump".into()],
                identity_agent: "/tmp/caller.sock".into(),
                user_known_hosts_files: vec!["/dev/null".into()],
                ..keywords("", "h", 0)
            };
            let config = ConnKeywords {
                pubkey_authentication: true,
                ..Default::default()
            };
            let params = combine(&caller, &config, None, "os");
            assert!(!params.batch_mode);
            assert!(!params.password_authentication);
            assert!(params.proxy_jump.is_empty());
            assert!(params.identity_agent.is_empty());
            assert!(params.user_known_hosts_files.is_empty());
        }

        #[test]
        fn test_label() {
            let params = combine(&keywords("ann", "h", 2022), &ConnKeywords::default(), None, "os");
            assert_eq!(params.label(), "ann@h:2022");
        }
    }

    mod config_keywords {
        use super::*;

        #[test]
        fn test_reads_all_keywords() {
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(
                &dir,
                "Host db\n  HostName \"10.0.0.5\"\n  User dba\n  Port 2022\n  IdentityFile ~/.ssh/id_db\n  \
                 BatchMode yes\n  PasswordAuthentication no\n  PreferredAuthentications publickey,password\n  \
                 AddKeysToAgent yes\n  IdentityAgent /tmp/agent.sock\n  ProxyJump jump1, admin@jump2:2222\n  \
                 UserKnownHostsFile ~/.ssh/kh \"/tmp/kh2\"\n",
            );
            let kw = resolver.config_keywords("db").unwrap();
            assert_eq!(kw.hostname, "10.0.0.5");
            assert_eq!(kw.user, "dba");
            assert_eq!(kw.port, 2022);
            assert_eq!(kw.identity_files, vec!["~/.ssh/id_db"]);
            assert!(kw.batch_mode);
            assert!(!kw.password_authentication);
            assert!(kw.pubkey_authentication);
            assert!(kw.kbd_interactive_authentication);
            assert_eq!(kw.preferred_authentications, vec!["publickey", "password"]);
            assert!(kw.add_keys_to_agent);
            assert_eq!(kw.identity_agent, "/tmp/agent.sock");
            assert_eq!(kw.proxy_jump, vec!["jump1", "admin@jump2:2222"]);
            assert_eq!(kw.user_known_hosts_files, vec!["~/.ssh/kh", "/tmp/kh2"]);
            assert_eq!(
                kw.global_known_hosts_files,
                vec!["/etc/ssh/ssh_known_hosts", "/etc/ssh/ssh_known_hosts2"]
            );
        }

        #[test]
        fn test_proxy_jump_none_dropped() {
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(&dir, "Host db\n  ProxyJump none\n");
            assert!(resolver.config_keywords("db").unwrap().proxy_jump.is_empty());
        }

        #[test]
        fn test_proxy_jump_none_any_case_dropped() {
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(&dir, "Host db\n  ProxyJump NONE\nHost web\n  ProxyJump None\n");
            assert!(resolver.config_keywords("db").unwrap().proxy_jump.is_empty());
            assert!(resolver.config_keywords("web").unwrap().proxy_jump.is_empty());
        }

        #[test]
        fn test_addkeystoagent_ask_is_not_yes() {
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(&dir, "Host db\n  AddKeysToAgent ask\n");
            assert!(!resolver.config_keywords("db").unwrap().add_keys_to_agent);
        }

        #[test]
        fn test_identity_agent_falls_back_to_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(&dir, "Host db\n  User x\n");
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env("SSH_AUTH_SOCK", "/tmp/from-env.sock");
            }
            let kw = resolver.config_keywords("db").unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env("SSH_AUTH_SOCK");
            }
            assert_eq!(kw.identity_agent, "/tmp/from-env.sock");
        }

        #[test]
        fn test_malformed_config_aborts() {
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(&dir, "Host db\n  Port twenty\n");
            assert!(matches!(
                resolver.config_keywords("db"),
                Err(ErrorKind::Config(_))
            ));
        }
    }

    mod resolve {
        use super::*;

        #[test]
        fn test_hop_fields_replace_caller_fields() {
            let dir = TempDir::new().unwrap();
            let resolver = resolver_for(&dir, "Host db\n  Port 2022\n");
            let caller = ConnKeywords {
                identity_files: vec!["/keys/caller".into()],
                ..keywords("ignored", "ignored", 9999)
            };
            let params = resolver
                .resolve(&caller, &HopIdentity::new("", "db", 0))
                .unwrap();
            assert_eq!(params.user, "osuser");
            assert_eq!(params.hostname, "db");
            assert_eq!(params.port, 2022);
            assert_eq!(params.identity_files[0], "/keys/caller");
        }

        #[test]
        fn test_persisted_identity_files_first() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("config");
            fs::write(&path, "Host db\n  IdentityFile /keys/config\n").unwrap();
            let store = SshConfigStore::load(vec![path.to_string_lossy().into_owned()]);
            let mut settings = PersistedSettings::default();
            settings.insert(
                "ann@db",
                ConnKeywords {
                    identity_files: vec!["/keys/saved".into()],
                    ..Default::default()
                },
            );
            let resolver = Resolver::new(Arc::new(store), Arc::new(settings));
            let params = resolver
                .resolve(&ConnKeywords::default(), &HopIdentity::new("ann", "db", 0))
                .unwrap();
            assert_eq!(params.identity_files, vec!["/keys/saved", "/keys/config"]);
        }
    }

    mod persisted_settings {
        use super::*;

        #[test]
        fn test_missing_file_is_empty() {
            let dir = TempDir::new().unwrap();
            let settings = PersistedSettings::load(&dir.path().join("none.json")).unwrap();
            assert!(settings.get("a@b").is_none());
        }

        #[test]
        fn test_parses_snake_case_fields() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("connections.json");
            fs::write(
                &path,
                r#"{"ann@db:2022": {"identity_files": ["~/.ssh/id_db"], "batch_mode": true}}"#,
            )
            .unwrap();
            let settings = PersistedSettings::load(&path).unwrap();
            let saved = settings.get("ann@db:2022").unwrap();
            assert_eq!(saved.identity_files, vec!["~/.ssh/id_db"]);
            assert!(saved.batch_mode);
        }

        #[test]
        fn test_malformed_file_is_config_error() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("connections.json");
            fs::write(&path, "{not json").unwrap();
            assert!(matches!(
                PersistedSettings::load(&path),
                Err(ErrorKind::Config(_))
            ));
        }
    }
}
