//! Hop identities: `[user@]host[:port]`.
//!
//! A hop names one SSH server in a chain. The user is optional (resolved
//! later from config or the OS account) and port `0` means "not specified".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ErrorKind;

/// One SSH server as requested by the caller or a ProxyJump entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopIdentity {
    /// Login name, empty when unspecified
    pub user: String,
    /// Host name, alias, or address (IPv6 without brackets)
    pub host: String,
    /// Port, `0` when unspecified
    pub port: u16,
}

impl HopIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl FromStr for HopIdentity {
    type Err = ErrorKind;

    /// Parse `[user@]host[:port]`.
    ///
    /// Bracketed IPv6 (`[::1]:2222`) is accepted; a bare IPv6 address without
    /// brackets is taken as a host with no port.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (user, rest) = match input.rsplit_once('@') {
            Some((user, rest)) => (user, rest),
            None => ("", input),
        };

        let (host, port) = split_host_port(rest)?;
        if host.is_empty() {
            return Err(ErrorKind::Config(format!("missing host in {:?}", input)));
        }
        if host.chars().any(char::is_whitespace) || user.chars().any(char::is_whitespace) {
            return Err(ErrorKind::Config(format!(
                "whitespace is not allowed in {:?}",
                input
            )));
        }

        Ok(HopIdentity::new(user, host, port))
    }
}

fn split_host_port(rest: &str) -> Result<(&str, u16), ErrorKind> {
    if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| ErrorKind::Config(format!("unterminated '[' in {:?}", rest)))?;
        return match tail {
            "" => Ok((host, 0)),
            _ => match tail.strip_prefix(':') {
                Some(port) => Ok((host, parse_port(port)?)),
                None => Err(ErrorKind::Config(format!(
                    "unexpected text after ']' in {:?}",
                    rest
                ))),
            },
        };
    }

    match rest.rsplit_once(':') {
        // more than one colon: unbracketed IPv6
        Some((host, _)) if host.contains(':') => Ok((rest, 0)),
        Some((host, port)) => Ok((host, parse_port(port)?)),
        None => Ok((rest, 0)),
    }
}

fn parse_port(port: &str) -> Result<u16, ErrorKind> {
    port.parse::<u16>()
        .map_err(|e| ErrorKind::Config(format!("invalid port number {:?}: {}", port, e)))
}

impl fmt::Display for HopIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        if self.host.contains(':') && self.port != 0 {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse {
        use super::*;

        #[test]
        fn test_user_host_port() {
            let hop: HopIdentity = "admin@bastion:2222".parse().unwrap();
            assert_eq!(hop, HopIdentity::new("admin", "bastion", 2222));
        }

        #[test]
        fn test_host_only_leaves_port_unset() {
            let hop: HopIdentity = "db.internal".parse().unwrap();
            assert_eq!(hop, HopIdentity::new("", "db.internal", 0));
        }

        #[test]
        fn test_user_with_at_sign() {
            let hop: HopIdentity = "me@corp@jump:22".parse().unwrap();
            assert_eq!(hop.user, "me@corp");
            assert_eq!(hop.host, "jump");
            assert_eq!(hop.port, 22);
        }

        #[test]
        fn test_bracketed_ipv6_with_port() {
            let hop: HopIdentity = "[::1]:2200".parse().unwrap();
            assert_eq!(hop.host, "::1");
            assert_eq!(hop.port, 2200);
        }

        #[test]
        fn test_bare_ipv6_has_no_port() {
            let hop: HopIdentity = "fe80::1".parse().unwrap();
            assert_eq!(hop.host, "fe80::1");
            assert_eq!(hop.port, 0);
        }

        #[test]
        fn test_invalid_port_returns_error() {
            assert!("host:ssh".parse::<HopIdentity>().is_err());
            assert!("host:70000".parse::<HopIdentity>().is_err());
            assert!("host:-1".parse::<HopIdentity>().is_err());
        }

        #[test]
        fn test_empty_host_rejected() {
            assert!("user@".parse::<HopIdentity>().is_err());
            assert!(":22".parse::<HopIdentity>().is_err());
        }

        #[test]
        fn test_whitespace_rejected() {
            assert!("bad host".parse::<HopIdentity>().is_err());
        }
    }

    mod display {
        use super::*;

        #[test]
        fn test_full_form() {
            assert_eq!(HopIdentity::new("u", "h", 2222).to_string(), "u@h:2222");
        }

        #[test]
        fn test_omits_missing_parts() {
            assert_eq!(HopIdentity::new("", "h", 0).to_string(), "h");
        }

        #[test]
        fn test_ipv6_bracketed_when_port_present() {
            assert_eq!(HopIdentity::new("", "::1", 22).to_string(), "[::1]:22");
        }

        #[test]
        fn test_display_parses_back() {
            let hop = HopIdentity::new("root", "10.0.0.5", 2022);
            assert_eq!(hop.to_string().parse::<HopIdentity>().unwrap(), hop);
        }
    }
}
