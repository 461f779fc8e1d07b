use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One `local_port -> remote_host:remote_port` relay rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardRule {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardRule {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// `host:port` of the upstream side.
    pub fn upstream(&self) -> String {
        if self.remote_host.contains(':') {
            format!("[{}]:{}", self.remote_host, self.remote_port)
        } else {
            format!("{}:{}", self.remote_host, self.remote_port)
        }
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_port, self.upstream())
    }
}

/// Parses `LOCAL_PORT:REMOTE_HOST:REMOTE_PORT`. IPv6 hosts may be bracketed.
impl FromStr for ForwardRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::config(
                format!("invalid forward rule '{s}'"),
                serde_json::json!({ "hint": "expected LOCAL_PORT:REMOTE_HOST:REMOTE_PORT" }),
            )
        };
        let (local, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (host, remote) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let local_port = local.parse::<u16>().map_err(|_| invalid())?;
        let remote_port = remote.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(local_port, host, remote_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_triples() {
        let rule: ForwardRule = "9000:127.0.0.1:22".parse().unwrap();
        assert_eq!(rule, ForwardRule::new(9000, "127.0.0.1", 22));
        assert_eq!(rule.upstream(), "127.0.0.1:22");

        let rule: ForwardRule = "5900:[::1]:5901".parse().unwrap();
        assert_eq!(rule.remote_host, "::1");
        assert_eq!(rule.upstream(), "[::1]:5901");
    }

    #[test]
    fn rejects_malformed_rules() {
        for raw in ["9000", "9000:host", "x:host:22", "9000::22", "9000:host:99999"] {
            assert!(raw.parse::<ForwardRule>().is_err(), "{raw}");
        }
    }
}
