//! OpenSSH `known_hosts` files.
//!
//! Parses the one-line-per-entry format (`[@marker] hostnames keytype base64key
//! [comment]`), answers lookups across several files, and appends new
//! entries. Existing lines are never rewritten.
//!
//! Hashed host names (`|1|salt|hmac`, as written with `HashKnownHosts yes`)
//! match by recomputing HMAC-SHA1 of the normalized host. `@cert-authority`
//! lines are parsed but never match a plain host.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::resolver::DEFAULT_SSH_PORT;
use super::ssh_config::wildcard_match;

/// A host key as presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Algorithm name, e.g. `ssh-ed25519`
    pub key_type: String,
    /// Base64 of the wire-format key blob
    pub blob: String,
}

impl HostKey {
    pub fn new(key_type: impl Into<String>, blob: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            blob: blob.into(),
        }
    }

    /// `SHA256:<unpadded base64>` of the key blob, as printed by `ssh-keygen -l`.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.blob)
    }
}

impl From<&PublicKey> for HostKey {
    fn from(key: &PublicKey) -> Self {
        Self {
            key_type: key.algorithm().as_str().to_string(),
            blob: BASE64.encode(key.public_key_bytes()),
        }
    }
}

fn fingerprint_of(blob: &str) -> String {
    match BASE64.decode(blob) {
        Ok(bytes) => {
            let hash = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "SHA256:<invalid key>".to_string(),
    }
}

/// Host name as written in known_hosts: `host` on port 22, else `[host]:port`.
pub fn normalize(host: &str, port: u16) -> String {
    if port == 0 || port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// The line appended when a new host key is accepted.
pub fn format_line(host: &str, port: u16, key: &HostKey) -> String {
    format!("{} {} {}", normalize(host, port), key.key_type, key.blob)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    None,
    Revoked,
    CertAuthority,
}

/// One recorded key for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownKey {
    pub path: PathBuf,
    pub line: usize,
    pub key_type: String,
    pub blob: String,
}

impl KnownKey {
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.blob)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    marker: Marker,
    /// Lowercased host patterns, `[host]:22` folded to `host`; hashed ones verbatim
    patterns: Vec<String>,
    key: KnownKey,
}

impl Entry {
    fn matches(&self, normalized: &str) -> bool {
        let mut positive = false;
        for pattern in &self.patterns {
            if pattern.starts_with('|') {
                if hashed_match(pattern, normalized) {
                    positive = true;
                }
                continue;
            }
            let (negated, glob) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            };
            if wildcard_match(glob, normalized) {
                if negated {
                    return false;
                }
                positive = true;
            }
        }
        positive
    }
}

/// Check a `|1|<base64 salt>|<base64 hmac>` pattern against `normalized`.
fn hashed_match(pattern: &str, normalized: &str) -> bool {
    let Some((salt, hash)) = pattern.strip_prefix("|1|").and_then(|rest| rest.split_once('|')) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (BASE64.decode(salt), BASE64.decode(hash)) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    mac.update(normalized.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

/// Failure to load one known_hosts file.
#[derive(Debug, thiserror::Error)]
pub enum KnownHostsError {
    #[error("cannot read {}: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("{}:{line}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl KnownHostsError {
    /// The file that failed to load.
    pub fn path(&self) -> &Path {
        match self {
            KnownHostsError::Unreadable { path, .. } | KnownHostsError::Malformed { path, .. } => path,
        }
    }
}

/// Outcome of looking up a presented key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Match,
    Revoked,
    /// No key recorded for this host in any file
    Unknown,
    /// The host is known under other keys
    Mismatch { known: Vec<KnownKey> },
}

/// Entries loaded from several known_hosts files.
#[derive(Debug, Clone, Default)]
pub struct KnownHostsDb {
    entries: Vec<Entry>,
}

impl KnownHostsDb {
    /// Load every file, failing on the first one that cannot be used.
    ///
    /// A missing file counts as unreadable so callers can drop it and retry
    /// with the rest.
    pub fn open(paths: &[PathBuf]) -> Result<Self, KnownHostsError> {
        let mut db = Self::default();
        for path in paths {
            let content = fs::read_to_string(path).map_err(|source| KnownHostsError::Unreadable {
                path: path.clone(),
                source,
            })?;
            db.entries.extend(parse(path, &content)?);
        }
        Ok(db)
    }

    /// Look `key` up for `host:port`.
    ///
    /// Revocation is checked first and applies regardless of host name.
    pub fn check(&self, host: &str, port: u16, key: &HostKey) -> HostKeyStatus {
        let revoked = self
            .entries
            .iter()
            .any(|e| e.marker == Marker::Revoked && e.key.blob == key.blob);
        if revoked {
            return HostKeyStatus::Revoked;
        }

        let known: Vec<KnownKey> = self
            .host_entries(host, port)
            .map(|e| e.key.clone())
            .collect();
        if known
            .iter()
            .any(|k| k.key_type == key.key_type && k.blob == key.blob)
        {
            HostKeyStatus::Match
        } else if known.is_empty() {
            HostKeyStatus::Unknown
        } else {
            HostKeyStatus::Mismatch { known }
        }
    }

    /// Key types already trusted for `host:port`, in file order, deduplicated.
    pub fn algorithms_for(&self, host: &str, port: u16) -> Vec<String> {
        let mut algorithms: Vec<String> = Vec::new();
        for entry in self.host_entries(host, port) {
            if !algorithms.contains(&entry.key.key_type) {
                algorithms.push(entry.key.key_type.clone());
            }
        }
        algorithms
    }

    fn host_entries(&self, host: &str, port: u16) -> impl Iterator<Item = &Entry> {
        let normalized = normalize(&host.to_lowercase(), port);
        self.entries
            .iter()
            .filter(move |e| e.marker == Marker::None && e.matches(&normalized))
    }
}

fn parse(path: &Path, content: &str) -> Result<Vec<Entry>, KnownHostsError> {
    let mut entries = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = |reason: &str| KnownHostsError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            reason: reason.to_string(),
        };

        let mut fields = line.split_whitespace().peekable();
        let marker = match fields.peek() {
            Some(&"@revoked") => Marker::Revoked,
            Some(&"@cert-authority") => Marker::CertAuthority,
            Some(m) if m.starts_with('@') => return Err(malformed("unknown marker")),
            _ => Marker::None,
        };
        if marker != Marker::None {
            fields.next();
        }

        let (Some(hosts), Some(key_type), Some(blob)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("expected hostnames, key type and key"));
        };
        if BASE64.decode(blob).is_err() {
            return Err(malformed("key is not valid base64"));
        }

        let patterns = hosts
            .split(',')
            .filter(|h| !h.is_empty())
            .map(|h| {
                // salt and hmac are case-sensitive base64
                if h.starts_with('|') {
                    return h.to_string();
                }
                let h = h.to_lowercase();
                match h.strip_suffix(":22") {
                    Some(bracketed) if bracketed.starts_with('[') && bracketed.ends_with(']') => {
                        bracketed[1..bracketed.len() - 1].to_string()
                    }
                    _ => h,
                }
            })
            .collect();

        entries.push(Entry {
            marker,
            patterns,
            key: KnownKey {
                path: path.to_path_buf(),
                line: index + 1,
                key_type: key_type.to_string(),
                blob: blob.to_string(),
            },
        });
    }
    Ok(entries)
}

/// Open `path` for appending, creating it and its directory if needed.
///
/// The directory is created with mode 0700 and the file with 0644.
pub fn open_for_append(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(parent)?;
    }

    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path)
}

/// Write one entry to an open known_hosts file and close it.
pub fn append_line(mut file: fs::File, line: &str) -> io::Result<()> {
    writeln!(file, "{}", line)?;
    file.flush()?;
    drop(file);
    debug!("Appended known_hosts entry: {}", line);
    Ok(())
}
