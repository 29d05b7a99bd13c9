use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const DEFAULT_PORT: u16 = 27017;

/// The `host:port` identity of a deployment member.
///
/// Hosts are stored lower-cased so that addresses reported by different members
/// (`Node1:27017` vs `node1:27017`) compare equal.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid server address `{address}`: {reason}")]
pub struct InvalidAddressError {
    pub address: String,
    pub reason: &'static str,
}

impl FromStr for ServerAddress {
    type Err = InvalidAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidAddressError {
            address: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        // Bracketed IPv6 literal, optionally followed by `:port`
        if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing closing bracket"))?;
            if host.is_empty() {
                return Err(invalid("host is empty"));
            }
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid("port is not a number"))?,
                None if after.is_empty() => DEFAULT_PORT,
                None => return Err(invalid("unexpected characters after host")),
            };
            return Ok(ServerAddress::new(host, port));
        }

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| invalid("port is not a number"))?,
            ),
            None => (trimmed, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if host.contains(':') {
            return Err(invalid("IPv6 hosts must be enclosed in brackets"));
        }
        if port == 0 {
            return Err(invalid("port must be greater than zero"));
        }

        Ok(ServerAddress::new(host, port))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Serialize for ServerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
