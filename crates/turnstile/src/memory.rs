//! In-memory fingerprint store.
//!
//! Backed by a [`DashMap`] whose entry API gives the same atomic
//! insert-if-absent a unique index gives a database. Shared by cloning, so
//! every worker task in a process sees the same reservations.

use crate::core::Fingerprint;
use crate::error::StoreError;
use crate::store::{FingerprintStore, Reservation, StoreSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct MemoryFingerprintStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rows: DashMap<Fingerprint, Reservation>,
    next_id: AtomicI64,
    poison_on_violation: bool,
    recoveries: AtomicU64,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close a session whenever one of its inserts hits a uniqueness
    /// violation, the way a transactional backend aborts the transaction.
    pub fn with_poison_on_violation() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                poison_on_violation: true,
                ..MemoryInner::default()
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.rows.contains_key(fingerprint)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Reservation> {
        self.inner.rows.get(fingerprint).map(|row| row.clone())
    }

    /// Number of times a session was recovered.
    pub fn recoveries(&self) -> u64 {
        self.inner.recoveries.load(Ordering::SeqCst)
    }

    /// Insert a reservation with an explicit creation time, bypassing
    /// sessions. Returns `None` if the fingerprint is already reserved.
    pub fn reserve_at(
        &self,
        fingerprint: Fingerprint,
        created_at: DateTime<Utc>,
    ) -> Option<Reservation> {
        self.inner.try_insert(&fingerprint, created_at)
    }
}

impl MemoryInner {
    fn try_insert(&self, fingerprint: &Fingerprint, created_at: DateTime<Utc>) -> Option<Reservation> {
        match self.rows.entry(fingerprint.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let reservation = Reservation {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                    fingerprint: fingerprint.clone(),
                    created_at,
                };
                slot.insert(reservation.clone());
                Some(reservation)
            }
        }
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    type Session = MemorySession;

    async fn acquire(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            inner: self.inner.clone(),
            open: true,
        })
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.inner.rows.retain(|_, reservation| {
            let keep = reservation.created_at >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

/// Session over a [`MemoryFingerprintStore`]. Writes apply immediately.
pub struct MemorySession {
    inner: Arc<MemoryInner>,
    open: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::SessionClosed)
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_by_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Reservation>, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.rows.get(fingerprint).map(|row| row.clone()))
    }

    async fn insert(&mut self, fingerprint: &Fingerprint) -> Result<Reservation, StoreError> {
        self.ensure_open()?;
        match self.inner.try_insert(fingerprint, Utc::now()) {
            Some(reservation) => Ok(reservation),
            None => {
                if self.inner.poison_on_violation {
                    self.open = false;
                }
                Err(StoreError::UniqueViolation {
                    fingerprint: fingerprint.clone(),
                })
            }
        }
    }

    async fn delete(&mut self, reservation: &Reservation) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self
            .inner
            .rows
            .remove_if(&reservation.fingerprint, |_, row| row.id == reservation.id)
            .is_some())
    }

    fn is_usable(&self) -> bool {
        self.open
    }

    async fn recover(&mut self) -> Result<(), StoreError> {
        self.open = true;
        self.inner.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(value: &str) -> Fingerprint {
        Fingerprint::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_second_insert_is_unique_violation() {
        let store = MemoryFingerprintStore::new();
        let mut session = store.acquire().await.unwrap();

        let first = session.insert(&fp("abc123")).await.unwrap();
        assert_eq!(first.fingerprint, fp("abc123"));

        let err = session.insert(&fp("abc123")).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert!(session.is_usable());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_session_rejects_work_until_recovered() {
        let store = MemoryFingerprintStore::with_poison_on_violation();
        let mut session = store.acquire().await.unwrap();
        session.insert(&fp("abc123")).await.unwrap();

        assert!(session.insert(&fp("abc123")).await.is_err());
        assert!(!session.is_usable());
        assert!(matches!(
            session.find_by_fingerprint(&fp("other")).await,
            Err(StoreError::SessionClosed)
        ));

        session.recover().await.unwrap();
        assert!(session.is_usable());
        assert!(session.find_by_fingerprint(&fp("other")).await.unwrap().is_none());
        assert_eq!(store.recoveries(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_matches_row_identity() {
        let store = MemoryFingerprintStore::new();
        let mut session = store.acquire().await.unwrap();
        let reservation = session.insert(&fp("abc123")).await.unwrap();

        assert!(session.delete(&reservation).await.unwrap());
        assert!(!session.delete(&reservation).await.unwrap());

        // A newer reservation for the same fingerprint is not removed by a
        // stale handle.
        session.insert(&fp("abc123")).await.unwrap();
        assert!(!session.delete(&reservation).await.unwrap());
        assert!(store.contains(&fp("abc123")));
    }

    #[tokio::test]
    async fn test_delete_created_before_keeps_recent_rows() {
        let store = MemoryFingerprintStore::new();
        let now = Utc::now();
        store.reserve_at(fp("old"), now - chrono::Duration::hours(2));
        store.reserve_at(fp("new"), now);

        let removed = store
            .delete_created_before(now - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!store.contains(&fp("old")));
        assert!(store.contains(&fp("new")));
    }
}
