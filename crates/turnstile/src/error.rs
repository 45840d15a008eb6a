//! Error types.
//!
//! Only [`DedupeError`] ever leaves the gate. A [`StoreError::UniqueViolation`]
//! is consumed inside the gate as the "lost the race" signal and never
//! reaches a caller of [`AdmissionGate::admit`](crate::AdmissionGate::admit).

use crate::core::{Fingerprint, FingerprintError};
use thiserror::Error;

/// Failure reported by a [`FingerprintStore`](crate::FingerprintStore) or one
/// of its sessions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A reservation for this fingerprint already exists.
    #[error("fingerprint {fingerprint} is already reserved")]
    UniqueViolation { fingerprint: Fingerprint },

    /// The session can no longer be used until it is recovered.
    #[error("store session is closed")]
    SessionClosed,

    /// Backend failure (connection loss, IO, ...).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Wiring-time misconfiguration. Fatal at startup, never raised per message.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no fingerprint store configured")]
    MissingStore,

    #[error("deferred release requires a cleanup queue")]
    MissingCleanupQueue,

    #[error("reservation table `{table}` does not exist")]
    MissingTable { table: String },

    #[error("reservation table `{table}` has no unique index on `fingerprint`")]
    MissingUniqueIndex { table: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the gate, the release coordinator and the release
/// request handler.
#[derive(Debug, Error)]
pub enum DedupeError {
    /// The store failed for a reason other than a uniqueness violation.
    #[error("fingerprint store failed: {0}")]
    Store(#[from] StoreError),

    #[error("invalid fingerprint: {0}")]
    Fingerprint(#[from] FingerprintError),

    /// A cleanup job payload could not be decoded.
    #[error("malformed release request payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The cleanup queue refused a release request.
    #[error("failed to enqueue release request: {0}")]
    Enqueue(#[source] anyhow::Error),
}

pub type Result<T, E = DedupeError> = std::result::Result<T, E>;
