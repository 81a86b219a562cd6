//! Pattern-matching OpenSSH client config store.
//!
//! Reads `ssh_config(5)` files and answers keyword lookups for a host the way
//! the OpenSSH client does: blocks are scanned in file order and the first
//! obtained value wins. The store is an explicit instance; [`SshConfigStore::reload`]
//! re-reads the same files in place.
//!
//! # Supported syntax
//!
//! - `Keyword value` and `Keyword=value`, `#` comments, quoted values
//! - `Host` with several patterns, `*` and `?` wildcards, `!` negation
//! - `Include` with glob patterns, relative paths resolved against `~/.ssh`
//!   (or `/etc/ssh` for files that live there)
//! - `Match` blocks are skipped; their directives never apply
//!
//! Values are returned raw. Quoted values keep their quotes, callers unquote
//! with [`trim_quotes`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::config::expand_home;
use super::error::ErrorKind;

/// Includes nested deeper than this are reported as a syntax error.
const MAX_INCLUDE_DEPTH: usize = 16;

/// Identity files OpenSSH tries when none are configured.
pub const DEFAULT_IDENTITY_FILES: &[&str] = &["~/.ssh/id_rsa", "~/.ssh/id_ecdsa", "~/.ssh/id_ed25519"];

/// Failure to interpret an ssh_config file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SshConfigError {
    #[error("failed to read {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("{}:{line}: {message}", path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{}:{line}: invalid value {value:?} for {keyword}", path.display())]
    InvalidValue {
        path: PathBuf,
        line: usize,
        keyword: String,
        value: String,
    },
}

impl From<SshConfigError> for ErrorKind {
    fn from(err: SshConfigError) -> Self {
        ErrorKind::Config(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostPattern {
    negated: bool,
    glob: String,
}

impl HostPattern {
    fn parse(raw: &str) -> Self {
        let raw = trim_quotes(raw);
        match raw.strip_prefix('!') {
            Some(rest) => Self {
                negated: true,
                glob: rest.to_lowercase(),
            },
            None => Self {
                negated: false,
                glob: raw.to_lowercase(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Directive {
    keyword: String,
    value: String,
    path: PathBuf,
    line: usize,
}

#[derive(Debug, Clone)]
struct Block {
    /// `None` for `Match` blocks
    patterns: Option<Vec<HostPattern>>,
    directives: Vec<Directive>,
}

impl Block {
    fn global() -> Self {
        Self {
            patterns: Some(vec![HostPattern::parse("*")]),
            directives: Vec::new(),
        }
    }

    fn matches(&self, host: &str) -> bool {
        let Some(patterns) = &self.patterns else {
            return false;
        };
        let mut positive = false;
        for pattern in patterns {
            if wildcard_match(&pattern.glob, host) {
                if pattern.negated {
                    return false;
                }
                positive = true;
            }
        }
        positive
    }
}

#[derive(Debug, Default)]
struct ParsedConfig {
    blocks: Vec<Block>,
    error: Option<SshConfigError>,
}

/// Loaded ssh_config files, queried by host and keyword.
#[derive(Debug)]
pub struct SshConfigStore {
    paths: Vec<String>,
    parsed: RwLock<Arc<ParsedConfig>>,
}

impl SshConfigStore {
    /// Read the given files (unexpanded, `~` allowed) in order.
    ///
    /// Missing files are skipped. A malformed file does not fail the load;
    /// the error is returned by every later [`get_strict`](Self::get_strict).
    pub fn load(paths: Vec<String>) -> Self {
        let parsed = parse_paths(&paths);
        Self {
            paths,
            parsed: RwLock::new(Arc::new(parsed)),
        }
    }

    /// A store with no files, answering every lookup with defaults.
    pub fn empty() -> Self {
        Self::load(Vec::new())
    }

    /// Re-read the configured files, replacing the previous contents.
    pub fn reload(&self) {
        let parsed = Arc::new(parse_paths(&self.paths));
        match self.parsed.write() {
            Ok(mut guard) => *guard = parsed,
            Err(poisoned) => *poisoned.into_inner() = parsed,
        }
    }

    fn snapshot(&self) -> Arc<ParsedConfig> {
        match self.parsed.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// First value of `keyword` for `host`, or the OpenSSH default.
    ///
    /// # Arguments
    ///
    /// * `host` - Host name or alias as typed by the user
    /// * `keyword` - Directive name, case-insensitive
    ///
    /// # Returns
    ///
    /// The raw value (quotes kept), the keyword's default when no matching
    /// block sets it, or the empty string for keywords without a default.
    pub fn get_strict(&self, host: &str, keyword: &str) -> Result<String, SshConfigError> {
        let parsed = self.snapshot();
        if let Some(err) = &parsed.error {
            return Err(err.clone());
        }

        let host = host.to_lowercase();
        let keyword = keyword.to_lowercase();
        for block in parsed.blocks.iter().filter(|b| b.matches(&host)) {
            if let Some(directive) = block.directives.iter().find(|d| d.keyword == keyword) {
                validate(directive)?;
                return Ok(directive.value.clone());
            }
        }

        Ok(default_value(&keyword).to_string())
    }

    /// Every value of `keyword` for `host`, in file order.
    ///
    /// Falls back to the default identity list for `IdentityFile`, or the
    /// single default value for other keywords.
    pub fn get_all(&self, host: &str, keyword: &str) -> Result<Vec<String>, SshConfigError> {
        let parsed = self.snapshot();
        if let Some(err) = &parsed.error {
            return Err(err.clone());
        }

        let host = host.to_lowercase();
        let keyword = keyword.to_lowercase();
        let mut values = Vec::new();
        for block in parsed.blocks.iter().filter(|b| b.matches(&host)) {
            for directive in block.directives.iter().filter(|d| d.keyword == keyword) {
                validate(directive)?;
                values.push(directive.value.clone());
            }
        }

        if values.is_empty() {
            if keyword == "identityfile" {
                return Ok(DEFAULT_IDENTITY_FILES.iter().map(|f| f.to_string()).collect());
            }
            let default = default_value(&keyword);
            if !default.is_empty() {
                values.push(default.to_string());
            }
        }
        Ok(values)
    }
}

/// Strip one pair of surrounding double quotes.
pub fn trim_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// OpenSSH client defaults for the keywords the resolver reads.
fn default_value(keyword: &str) -> &'static str {
    match keyword {
        "port" => "22",
        "pubkeyauthentication" | "passwordauthentication" | "kbdinteractiveauthentication" => "yes",
        "batchmode" | "addkeystoagent" => "no",
        "preferredauthentications" => "gssapi-with-mic,hostbased,publickey,keyboard-interactive,password",
        "userknownhostsfile" => "~/.ssh/known_hosts ~/.ssh/known_hosts2",
        "globalknownhostsfile" => "/etc/ssh/ssh_known_hosts /etc/ssh/ssh_known_hosts2",
        _ => "",
    }
}

fn validate(directive: &Directive) -> Result<(), SshConfigError> {
    let value = trim_quotes(&directive.value);
    let valid = match directive.keyword.as_str() {
        "port" => value.parse::<u16>().map(|p| p != 0).unwrap_or(false),
        "batchmode" | "pubkeyauthentication" | "passwordauthentication" | "kbdinteractiveauthentication" => {
            value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("no")
        }
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(SshConfigError::InvalidValue {
            path: directive.path.clone(),
            line: directive.line,
            keyword: directive.keyword.clone(),
            value: directive.value.clone(),
        })
    }
}

fn parse_paths(paths: &[String]) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();
    for raw in paths {
        let Some(path) = expand_home(raw) else {
            warn!("Skipping ssh config path {}: cannot expand home directory", raw);
            continue;
        };
        parsed.blocks.push(Block::global());
        if let Err(err) = parse_file(&path, 0, &mut parsed.blocks) {
            warn!("Failed to parse ssh config: {}", err);
            parsed.error = Some(err);
            break;
        }
    }
    parsed
}

fn parse_file(path: &Path, depth: usize, blocks: &mut Vec<Block>) -> Result<(), SshConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("ssh config {} not found, skipping", path.display());
            return Ok(());
        }
        Err(err) => {
            return Err(SshConfigError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    for (index, raw_line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let syntax = |message: &str| SshConfigError::Syntax {
            path: path.to_path_buf(),
            line: line_no,
            message: message.to_string(),
        };

        let (keyword, value) = split_directive(line).ok_or_else(|| syntax("missing value"))?;
        if value.matches('"').count() % 2 != 0 {
            return Err(syntax("unterminated quote"));
        }

        match keyword.as_str() {
            "host" => blocks.push(Block {
                patterns: Some(value.split_whitespace().map(HostPattern::parse).collect()),
                directives: Vec::new(),
            }),
            "match" => blocks.push(Block {
                patterns: None,
                directives: Vec::new(),
            }),
            "include" => {
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(syntax("Include nested too deeply"));
                }
                let resumed = blocks.last().map(|b| b.patterns.clone());
                let before = blocks.len();
                for target in value.split_whitespace() {
                    for included in include_targets(path, trim_quotes(target)) {
                        parse_file(&included, depth + 1, blocks)?;
                    }
                }
                // the included file opened its own blocks; resume ours
                if blocks.len() != before
                    && let Some(patterns) = resumed
                {
                    blocks.push(Block {
                        patterns,
                        directives: Vec::new(),
                    });
                }
            }
            _ => {
                if blocks.is_empty() {
                    blocks.push(Block::global());
                }
                if let Some(block) = blocks.last_mut() {
                    block.directives.push(Directive {
                        keyword: keyword.clone(),
                        value: value.to_string(),
                        path: path.to_path_buf(),
                        line: line_no,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Split `Keyword value` or `Keyword=value`; the keyword is lowercased.
fn split_directive(line: &str) -> Option<(String, &str)> {
    let end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let keyword = line[..end].to_lowercase();
    let mut rest = line[end..].trim_start();
    if let Some(stripped) = rest.strip_prefix('=') {
        rest = stripped.trim_start();
    }
    let rest = rest.trim_end();
    if rest.is_empty() {
        None
    } else {
        Some((keyword, rest))
    }
}

fn include_targets(including: &Path, target: &str) -> Vec<PathBuf> {
    let Some(expanded) = expand_home(target) else {
        warn!("Cannot expand Include target {}", target);
        return Vec::new();
    };
    let resolved = if expanded.is_absolute() {
        expanded
    } else if including.starts_with("/etc/ssh") {
        Path::new("/etc/ssh").join(expanded)
    } else {
        match dirs::home_dir() {
            Some(home) => home.join(".ssh").join(expanded),
            None => return Vec::new(),
        }
    };

    let pattern = resolved.to_string_lossy().into_owned();
    match glob::glob(&pattern) {
        Ok(entries) => {
            let mut found: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
            found.sort();
            found
        }
        Err(err) => {
            warn!("Invalid Include pattern {}: {}", pattern, err);
            Vec::new()
        }
    }
}

/// Match `text` against a pattern with `*` and `?` wildcards.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
