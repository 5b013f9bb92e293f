//! Common types used throughout Embody.

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Identifier of a federated agent (host, guest or broker).
///
/// Agent identifiers are chosen by the agent at registration time and are
/// opaque strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create an agent ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a body offered by a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyId(pub String);

impl BodyId {
    /// Create a body ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BodyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier correlating an embodiment request with its decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Create a new random request ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a request ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

/// Number of random bytes in a session token (256 bits).
const SESSION_TOKEN_BYTES: usize = 32;

/// Number of hex characters kept in a truncated token reference.
const TOKEN_REFERENCE_CHARS: usize = 8;

/// Bearer credential for an active embodiment session.
///
/// Tokens carry 256 bits of OS entropy and are not derivable from any agent
/// identity. `Display` and `Debug` only ever show a truncated reference;
/// the full value is reachable through [`SessionToken::expose`] and through
/// serialization (the grant message must carry it to the guest).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh token from the OS random number generator.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse a token received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedToken`] unless the input is exactly
    /// 64 lowercase hex characters.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let well_formed = raw.len() == SESSION_TOKEN_BYTES.saturating_mul(2)
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(raw.to_string()))
        } else {
            Err(CoreError::MalformedToken)
        }
    }

    /// The full token value. Only use this when handing the token to its owner.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Truncated reference safe to write into logs and audit entries.
    #[must_use]
    pub fn reference(&self) -> String {
        let prefix = self.0.get(..TOKEN_REFERENCE_CHARS).unwrap_or(&self.0);
        format!("sess_{prefix}")
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.reference())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

/// Timestamp wrapper for consistent handling throughout Embody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Get the current timestamp.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create a timestamp from a `DateTime<Utc>`.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create a timestamp from Unix milliseconds.
    ///
    /// Out-of-range values clamp to the Unix epoch.
    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(ms)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        )
    }

    /// Unix milliseconds (the wire encoding of `ts`).
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp `secs` seconds after this one, saturating on overflow.
    #[must_use]
    pub fn plus_secs(&self, secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs)
            .and_then(|d| self.0.checked_add_signed(d))
            .map_or(Self(DateTime::<Utc>::MAX_UTC), Self)
    }

    /// Signed distance in milliseconds from `other` to `self`.
    #[must_use]
    pub fn millis_since(&self, other: &Self) -> i64 {
        self.as_millis().saturating_sub(other.as_millis())
    }

    /// Check if this timestamp is in the past.
    #[must_use]
    pub fn is_past(&self) -> bool {
        self.0 < Utc::now()
    }

    /// Get the inner `DateTime<Utc>`.
    #[must_use]
    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

/// How much the federation trusts an agent.
///
/// Ordered from least to most trusted. Trust is advisory input to session
/// policy and discovery ranking; it is never a credential on its own.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Unknown or unverified agent.
    Untrusted,
    /// Registered agent with no track record.
    #[default]
    Basic,
    /// Agent whose operator has been verified out of band.
    Verified,
    /// Fully trusted agent (typically operated by the broker's owner).
    Trusted,
}

impl TrustLevel {
    /// Reputation score in `[0, 1]` used by discovery ranking.
    #[must_use]
    pub fn reputation(self) -> f64 {
        match self {
            Self::Untrusted => 0.0,
            Self::Basic => 0.4,
            Self::Verified => 0.7,
            Self::Trusted => 1.0,
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untrusted => write!(f, "untrusted"),
            Self::Basic => write!(f, "basic"),
            Self::Verified => write!(f, "verified"),
            Self::Trusted => write!(f, "trusted"),
        }
    }
}

impl FromStr for TrustLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "untrusted" => Ok(Self::Untrusted),
            "basic" => Ok(Self::Basic),
            "verified" => Ok(Self::Verified),
            "trusted" => Ok(Self::Trusted),
            other => Err(CoreError::UnknownTrustLevel(other.to_string())),
        }
    }
}

/// Role an agent plays in the federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Offers bodies to guests.
    Host,
    /// Requests control of bodies.
    Guest,
    /// Mediates discovery and session grants.
    Broker,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Guest => write!(f, "guest"),
            Self::Broker => write!(f, "broker"),
        }
    }
}

impl FromStr for AgentRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "guest" => Ok(Self::Guest),
            "broker" => Ok(Self::Broker),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

/// Lifecycle state of an embodiment session.
///
/// `Requested -> {Granted, Denied}`, `Granted -> Active`,
/// `Active -> {Expired, Terminated, Revoked}`. Terminal states absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Request received, not yet decided.
    Requested,
    /// Request accepted; becomes `Active` immediately.
    Granted,
    /// Request refused.
    Denied,
    /// Guest may issue tool calls.
    Active,
    /// Expiry time passed.
    Expired,
    /// Closed gracefully by guest, host or broker.
    Terminated,
    /// Closed as a security action.
    Revoked,
}

impl SessionState {
    /// Whether no further transition can leave this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Denied | Self::Expired | Self::Terminated | Self::Revoked
        )
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Granted | Self::Denied)
                | (Self::Granted, Self::Active)
                | (Self::Active, Self::Expired | Self::Terminated | Self::Revoked)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
            Self::Revoked => "revoked",
        };
        f.write_str(s)
    }
}
