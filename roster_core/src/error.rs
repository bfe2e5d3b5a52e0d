//! Error types for roster operations.

use crate::gateway::GatewayError;
use crate::keys::{KeyError, PublicKey};
use ipnet::Ipv4Net;
use thiserror::Error;

/// Result type for roster operations.
pub type RosterResult<T> = Result<T, RosterError>;

/// Everything a roster operation can report to its caller.
#[derive(Debug, Error)]
pub enum RosterError {
    /// A key string did not decode to 32 bytes. Nothing was changed.
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(#[from] KeyError),

    /// An allowed-IP entry was not a CIDR range, or is a host route held by
    /// another peer. Nothing was changed.
    #[error("invalid allowed IP `{input}`: {reason}")]
    InvalidAllowedIp { input: String, reason: String },

    /// The public key is already provisioned; remove it first.
    #[error("peer {0} is already provisioned")]
    DuplicateKey(PublicKey),

    /// Explicit lookup of a key that is not provisioned.
    #[error("peer {0} is not provisioned")]
    UnknownKey(PublicKey),

    /// The device rejected or did not confirm a configuration delta.
    ///
    /// For additions the roster is unchanged and a retry is safe. For
    /// removals the device may or may not have dropped the peer: a retry is
    /// safe but not guaranteed to be idempotent at the device layer.
    #[error("device configuration failed: {0}")]
    DeviceConfig(#[from] GatewayError),

    #[error("node index {0} is outside the valid range [0, 255)")]
    InvalidNodeIndex(u16),

    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("address pool {0} is exhausted")]
    AddressPoolExhausted(Ipv4Net),

    /// Internal bookkeeping disagreed with itself. Not a user error.
    #[error("roster invariant violated: {0}")]
    Invariant(String),
}

/// Coarse classification of [`RosterError`] for callers that branch on the
/// kind without caring about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidKeyFormat,
    InvalidAllowedIp,
    DuplicateKey,
    UnknownKey,
    DeviceConfig,
    InvalidAddressing,
    Invariant,
}

impl RosterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RosterError::InvalidKeyFormat(_) => ErrorKind::InvalidKeyFormat,
            RosterError::InvalidAllowedIp { .. } => ErrorKind::InvalidAllowedIp,
            RosterError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            RosterError::UnknownKey(_) => ErrorKind::UnknownKey,
            RosterError::DeviceConfig(_) => ErrorKind::DeviceConfig,
            RosterError::InvalidNodeIndex(_)
            | RosterError::InvalidSubnet { .. }
            | RosterError::AddressPoolExhausted(_) => ErrorKind::InvalidAddressing,
            RosterError::Invariant(_) => ErrorKind::Invariant,
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InvalidKeyFormat => "invalid_key",
            ErrorKind::InvalidAllowedIp => "invalid_allowed_ip",
            ErrorKind::DuplicateKey => "duplicate_key",
            ErrorKind::UnknownKey => "unknown_key",
            ErrorKind::DeviceConfig => "device_config",
            ErrorKind::InvalidAddressing => "addressing",
            ErrorKind::Invariant => "invariant",
        }
    }
}
