//! Value Types & Validation (spec §3, §4.1, component A).
//!
//! Every type here is obtainable only through a validating smart
//! constructor; once built, values are immutable and structurally equal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A TCP/UDP port number in `[1, 65535]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port(u16);

impl Port {
    /// Ports below this are conventionally privileged on Unix hosts.
    const PRIVILEGED_CEILING: u16 = 1024;

    pub fn of(value: u32) -> Result<Self> {
        if value < 1 || value > u16::MAX as u32 {
            return Err(Error::validation(format!(
                "port {value} is out of range [1, 65535]"
            )));
        }
        Ok(Port(value as u16))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_privileged(self) -> bool {
        self.0 < Self::PRIVILEGED_CEILING
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A URL path segment usable as an agent `location` entry.
///
/// Invariants: non-empty, length <= 100, does not start with `/`, composed
/// of `[A-Za-z0-9_\-/]`. The leading slash is added only at emission time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathSegment(String);

impl PathSegment {
    const MAX_LEN: usize = 100;

    pub fn of(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::validation("path must not be empty"));
        }
        if value.len() > Self::MAX_LEN {
            return Err(Error::validation(format!(
                "path exceeds {} characters",
                Self::MAX_LEN
            )));
        }
        if value.starts_with('/') {
            return Err(Error::validation("path must not start with '/'"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/')
        {
            return Err(Error::validation(
                "path must be composed of [A-Za-z0-9_-/]",
            ));
        }
        Ok(PathSegment(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path as it appears in an emitted `locations` entry: `/` + segment.
    pub fn as_location(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hostname: non-empty, at least one dot, each label alphanumeric plus `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Domain(String);

impl Domain {
    pub fn of(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::validation("domain must not be empty"));
        }
        if !value.contains('.') {
            return Err(Error::validation("domain must contain at least one dot"));
        }
        for label in value.split('.') {
            if label.is_empty() {
                return Err(Error::validation("domain labels must not be empty"));
            }
            if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(Error::validation(
                    "domain labels must be alphanumeric plus '-'",
                ));
            }
        }
        Ok(Domain(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque authentication secret. Never logged in full.
#[derive(Clone, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    pub fn of(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() < 8 {
            return Err(Error::validation("token must be at least 8 characters"));
        }
        Ok(Token(value))
    }

    /// The raw secret, for handing to the emitter. Never log this value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn masked(&self) -> String {
        let s = &self.0;
        if s.len() <= 8 {
            "****".to_string()
        } else {
            format!("{}…{}", &s[..4], &s[s.len() - 4..])
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.masked()).finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.masked())
    }
}

/// A non-empty identifier, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn of(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::validation("tunnel id must not be empty"));
        }
        Ok(TunnelId(value))
    }

    /// A random unique identifier (UUID v4), one of the two strategies
    /// named in spec §3.
    pub fn random() -> Self {
        TunnelId(uuid::Uuid::new_v4().to_string())
    }

    /// A descriptive id derived from kind/port/path, the other named
    /// strategy. Uniqueness is still enforced by the registry, not by this
    /// constructor.
    pub fn descriptive(kind: TunnelKind, local_port: Port, discriminant: &str) -> Self {
        TunnelId(format!(
            "{}-{}-{}",
            kind.as_str(),
            local_port.get(),
            discriminant
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a [`TunnelId`] is produced when the caller does not supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelIdStrategy {
    Random,
    Descriptive,
}

impl Default for TunnelIdStrategy {
    fn default() -> Self {
        TunnelIdStrategy::Random
    }
}

/// TCP or HTTP, the two kinds of tunnel the agent can proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelKind {
    Tcp,
    Http,
}

impl TunnelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelKind::Tcp => "tcp",
            TunnelKind::Http => "http",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tunnel lifecycle state (spec §3, §4.6 component G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    Pending,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Closed,
}

impl TunnelStatus {
    /// Allowed transitions per spec §4.6. `Closed` is terminal.
    pub fn can_transition_to(self, next: TunnelStatus) -> bool {
        use TunnelStatus::*;
        matches!(
            (self, next),
            (Pending, Connecting)
                | (Pending, Error)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Disconnected, Connecting)
                | (Disconnected, Closed)
                | (Error, Connecting)
                | (Error, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelStatus::Closed)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Pending => "pending",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Error => "error",
            TunnelStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}
