use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;
use crate::types::HostPort;

/// Location of an actor: `<scheme>://<system>@<host>:<port>/<path...>`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActorAddress {
    pub scheme: String,
    pub system: String,
    pub host_port: HostPort,
    /// Path below the system root, without a leading slash (e.g. `users/mike`).
    pub path: String,
}

impl ActorAddress {
    pub fn new(
        scheme: impl Into<String>,
        system: impl Into<String>,
        host_port: HostPort,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            system: system.into(),
            host_port,
            path: path.into().trim_start_matches('/').to_string(),
        }
    }
}

impl fmt::Display for ActorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}/{}",
            self.scheme, self.system, self.host_port, self.path
        )
    }
}

impl FromStr for ActorAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ClusterError::InvalidAddress {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let (system, rest) = rest
            .split_once('@')
            .ok_or_else(|| invalid("missing system name"))?;
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;

        if scheme.is_empty() || system.is_empty() || host.is_empty() {
            return Err(invalid("empty component"));
        }

        Ok(ActorAddress::new(
            scheme,
            system,
            HostPort::new(host, port),
            path,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let addr = ActorAddress::new(
            "ensemble",
            "EffectTsActorsDemo",
            HostPort::new("10.0.0.5", 34322),
            "users/mike",
        );
        let text = addr.to_string();
        assert_eq!(text, "ensemble://EffectTsActorsDemo@10.0.0.5:34322/users/mike");
        assert_eq!(text.parse::<ActorAddress>().unwrap(), addr);
    }

    #[test]
    fn parse_without_path() {
        let addr: ActorAddress = "ensemble://sys@localhost:9000".parse().unwrap();
        assert_eq!(addr.path, "");
        assert_eq!(addr.host_port.port, 9000);
    }

    #[test]
    fn parse_rejects_missing_port() {
        let err = "ensemble://sys@localhost/users".parse::<ActorAddress>().unwrap_err();
        assert!(matches!(err, ClusterError::InvalidAddress { .. }));
    }

    #[test]
    fn parse_rejects_missing_system() {
        assert!("ensemble://localhost:9000/users"
            .parse::<ActorAddress>()
            .is_err());
    }
}
