//! Fingerprint store interfaces.
//!
//! The store is the only source of atomicity in the whole protocol: its
//! uniqueness constraint on `fingerprint` decides which of several concurrent
//! admissions wins. Everything else (the soft check, the release paths) is
//! advisory or idempotent.
//!
//! Work happens through a [`StoreSession`] acquired per call. A session may
//! wrap a transaction; after a failed unique write some backends leave it
//! unusable, which callers detect with [`StoreSession::is_usable`] and repair
//! with [`StoreSession::recover`].

use crate::core::Fingerprint;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A live reservation. Its existence means the fingerprint is in flight or
/// awaiting cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
}

/// Shared persistent store of reservations, keyed uniquely by fingerprint.
#[async_trait]
pub trait FingerprintStore: Send + Sync + 'static {
    type Session: StoreSession;

    /// Acquire a fresh session. Callers release it on every exit path.
    async fn acquire(&self) -> Result<Self::Session, StoreError>;

    /// Delete every reservation created before `cutoff`.
    ///
    /// Administrative: nothing in the admission path calls this.
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// One unit of work against the store.
///
/// Dropping a session without calling [`release`](StoreSession::release)
/// discards any uncommitted work.
#[async_trait]
pub trait StoreSession: Send {
    async fn find_by_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Insert a reservation if none exists for `fingerprint`.
    ///
    /// Returns [`StoreError::UniqueViolation`] when another reservation holds
    /// the fingerprint, including one committed concurrently.
    async fn insert(&mut self, fingerprint: &Fingerprint) -> Result<Reservation, StoreError>;

    /// Delete `reservation`. `Ok(false)` if it was already gone.
    async fn delete(&mut self, reservation: &Reservation) -> Result<bool, StoreError>;

    fn is_usable(&self) -> bool;

    /// Roll back any active transaction and reset to a usable session.
    async fn recover(&mut self) -> Result<(), StoreError>;

    /// Commit outstanding work and give the session back.
    async fn release(self) -> Result<(), StoreError>;
}
