//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::SpecError;

/// Bind host used when a tunnel description omits one
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Which side of the secure session accepts connections for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelDirection {
    /// Bind locally, dial through the secure session
    Local,
    /// Bind through the secure session, dial locally
    Remote,
}

impl TunnelDirection {
    /// The other direction
    pub fn opposite(self) -> Self {
        match self {
            TunnelDirection::Local => TunnelDirection::Remote,
            TunnelDirection::Remote => TunnelDirection::Local,
        }
    }
}

impl fmt::Display for TunnelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelDirection::Local => write!(f, "local"),
            TunnelDirection::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for TunnelDirection {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L" | "-L" => Ok(TunnelDirection::Local),
            "R" | "-R" => Ok(TunnelDirection::Remote),
            other => Err(SpecError::UnknownDirection(other.to_string())),
        }
    }
}

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One requested tunnel
///
/// `bind` is where connections are accepted (locally for [`TunnelDirection::Local`],
/// through the secure session for [`TunnelDirection::Remote`]); `target` is
/// where the opposite side dials out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelSpec {
    pub direction: TunnelDirection,
    pub bind: Endpoint,
    pub target: Endpoint,
}

/// Parses `<direction> [bindHost:]bindPort:targetHost:targetPort`
impl FromStr for TunnelSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (marker, addresses) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| SpecError::MissingDirection(s.to_string()))?;
        let direction: TunnelDirection = marker.parse()?;
        let addresses = addresses.trim();

        let fields: Vec<&str> = addresses.split(':').collect();
        let (bind_host, bind_port, target_host, target_port) = match fields.as_slice() {
            [port, host, target_port] => (DEFAULT_BIND_HOST, *port, *host, *target_port),
            [bind_host, port, host, target_port] => (*bind_host, *port, *host, *target_port),
            _ => return Err(SpecError::BadAddresses(addresses.to_string())),
        };

        Ok(Self {
            direction,
            bind: Endpoint::new(parse_host(bind_host, addresses)?, parse_port(bind_port)?),
            target: Endpoint::new(parse_host(target_host, addresses)?, parse_port(target_port)?),
        })
    }
}

fn parse_host(host: &str, context: &str) -> Result<String, SpecError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(SpecError::EmptyHost(context.to_string()));
    }
    Ok(host.to_string())
}

fn parse_port(port: &str) -> Result<u16, SpecError> {
    port.trim()
        .parse()
        .map_err(|_| SpecError::BadPort(port.to_string()))
}

impl TryFrom<String> for TunnelSpec {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TunnelSpec> for String {
    fn from(spec: TunnelSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.direction {
            TunnelDirection::Local => "L",
            TunnelDirection::Remote => "R",
        };
        write!(f, "{} {}:{}", marker, self.bind, self.target)
    }
}

/// The ordered, fixed set of tunnels for the process lifetime
#[derive(Debug, Clone, Default)]
pub struct TunnelRegistry {
    specs: Arc<[TunnelSpec]>,
}

impl TunnelRegistry {
    /// Build a registry from parsed specs
    pub fn new(specs: Vec<TunnelSpec>) -> Self {
        Self {
            specs: specs.into(),
        }
    }

    /// Iterate over the tunnels in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &TunnelSpec> {
        self.specs.iter()
    }

    /// Number of tunnels
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no tunnel is configured
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl FromIterator<TunnelSpec> for TunnelRegistry {
    fn from_iter<I: IntoIterator<Item = TunnelSpec>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
