//! Testing utilities for turnstile.
//!
//! - [`ScriptedStore`] wraps any store and injects the conditions that are
//!   hard to provoke on demand: a soft check that misses a concurrent
//!   reservation, sessions poisoned by a unique violation, failed recoveries,
//!   commits that fail or surface a late unique violation, backend outages.
//! - [`RecordingHandler`] counts handler invocations.
//! - [`RecordingQueue`] captures enqueued cleanup jobs so a test can drain
//!   them into a [`ReleaseRequestHandler`](turnstile_core::ReleaseRequestHandler).

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use turnstile_core::{
    CleanupQueue, Envelope, Fingerprint, FingerprintStore, JobSpec, Reservation, StoreError,
    StoreSession,
};
use uuid::Uuid;

#[derive(Default)]
struct Script {
    blind_soft_check: AtomicBool,
    poison_on_violation: AtomicBool,
    fail_recover: AtomicBool,
    violate_on_commit: AtomicBool,
    fail_commit: AtomicBool,
    backend_down: AtomicBool,
    acquired: AtomicU64,
    released: AtomicU64,
    released_unusable: AtomicU64,
    recovered: AtomicU64,
    violations: AtomicU64,
}

/// Fault-injecting wrapper around a [`FingerprintStore`].
pub struct ScriptedStore<S> {
    inner: Arc<S>,
    script: Arc<Script>,
}

impl<S> Clone for ScriptedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            script: self.script.clone(),
        }
    }
}

impl<S: FingerprintStore> ScriptedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            script: Arc::new(Script::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Make every soft check report "not reserved", forcing admissions onto
    /// the insert path as if they raced a concurrent reservation.
    pub fn blind_soft_check(self) -> Self {
        self.script.blind_soft_check.store(true, Ordering::SeqCst);
        self
    }

    /// Close a session whenever its insert hits a unique violation.
    pub fn poison_on_violation(self) -> Self {
        self.script.poison_on_violation.store(true, Ordering::SeqCst);
        self
    }

    /// Make every `recover` call fail, leaving the session unusable.
    pub fn fail_recover(self) -> Self {
        self.script.fail_recover.store(true, Ordering::SeqCst);
        self
    }

    /// Reject the commit of any session that inserted a reservation with a
    /// unique violation and roll the insert back, as a deferred unique
    /// constraint does.
    pub fn violate_on_commit(self) -> Self {
        self.script.violate_on_commit.store(true, Ordering::SeqCst);
        self
    }

    /// Report a backend error from every commit, after the inner session has
    /// been released.
    pub fn fail_commit(self) -> Self {
        self.script.fail_commit.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every store operation with a backend error while set.
    pub fn set_backend_down(&self, down: bool) {
        self.script.backend_down.store(down, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> u64 {
        self.script.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.script.released.load(Ordering::SeqCst)
    }

    /// Sessions handed back while still unusable.
    pub fn released_unusable(&self) -> u64 {
        self.script.released_unusable.load(Ordering::SeqCst)
    }

    pub fn recovered(&self) -> u64 {
        self.script.recovered.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> u64 {
        self.script.violations.load(Ordering::SeqCst)
    }
}

impl Script {
    fn check_backend(&self) -> Result<(), StoreError> {
        if self.backend_down.load(Ordering::SeqCst) {
            return Err(StoreError::Other(anyhow!("connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: FingerprintStore> FingerprintStore for ScriptedStore<S> {
    type Session = ScriptedSession<S::Session>;

    async fn acquire(&self) -> Result<Self::Session, StoreError> {
        self.script.check_backend()?;
        let inner = self.inner.acquire().await?;
        self.script.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSession {
            inner,
            script: self.script.clone(),
            open: true,
            inserted: None,
        })
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.script.check_backend()?;
        self.inner.delete_created_before(cutoff).await
    }
}

pub struct ScriptedSession<T> {
    inner: T,
    script: Arc<Script>,
    open: bool,
    inserted: Option<Reservation>,
}

impl<T> ScriptedSession<T> {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::SessionClosed);
        }
        self.script.check_backend()
    }
}

#[async_trait]
impl<T: StoreSession> StoreSession for ScriptedSession<T> {
    async fn find_by_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Reservation>, StoreError> {
        self.ensure_open()?;
        if self.script.blind_soft_check.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_fingerprint(fingerprint).await
    }

    async fn insert(&mut self, fingerprint: &Fingerprint) -> Result<Reservation, StoreError> {
        self.ensure_open()?;
        let result = self.inner.insert(fingerprint).await;
        match &result {
            Ok(reservation) => self.inserted = Some(reservation.clone()),
            Err(StoreError::UniqueViolation { .. }) => {
                self.script.violations.fetch_add(1, Ordering::SeqCst);
                if self.script.poison_on_violation.load(Ordering::SeqCst) {
                    self.open = false;
                }
            }
            Err(_) => {}
        }
        result
    }

    async fn delete(&mut self, reservation: &Reservation) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.inner.delete(reservation).await
    }

    fn is_usable(&self) -> bool {
        self.open && self.inner.is_usable()
    }

    async fn recover(&mut self) -> Result<(), StoreError> {
        self.script.check_backend()?;
        if self.script.fail_recover.load(Ordering::SeqCst) {
            return Err(StoreError::Other(anyhow!("rollback failed")));
        }
        if !self.inner.is_usable() {
            self.inner.recover().await?;
        }
        self.open = true;
        self.script.recovered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(mut self) -> Result<(), StoreError> {
        self.script.released.fetch_add(1, Ordering::SeqCst);
        if !self.is_usable() {
            self.script.released_unusable.fetch_add(1, Ordering::SeqCst);
        }

        if self.script.violate_on_commit.load(Ordering::SeqCst) {
            if let Some(reservation) = self.inserted.take() {
                self.inner.delete(&reservation).await?;
                self.inner.release().await?;
                self.script.violations.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::UniqueViolation {
                    fingerprint: reservation.fingerprint,
                });
            }
        }

        self.inner.release().await?;
        if self.script.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Other(anyhow!("commit failed")));
        }
        Ok(())
    }
}

/// Handler double that records every envelope it is given.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Option<Fingerprint>>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn handle<M>(&self, envelope: Envelope<M>) -> anyhow::Result<Envelope<M>> {
        self.seen
            .lock()
            .unwrap()
            .push(envelope.fingerprint().cloned());
        Ok(envelope)
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn calls_for(&self, fingerprint: &Fingerprint) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| seen.as_ref() == Some(fingerprint))
            .count()
    }
}

/// Cleanup queue double that keeps enqueued jobs in memory.
#[derive(Clone, Default)]
pub struct RecordingQueue {
    jobs: Arc<Mutex<Vec<(Uuid, JobSpec, serde_json::Value)>>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jobs(&self) -> Vec<(Uuid, JobSpec, serde_json::Value)> {
        self.jobs.lock().unwrap().clone()
    }

    /// Remove and return every queued payload, oldest first.
    pub fn drain(&self) -> Vec<serde_json::Value> {
        self.jobs
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, _, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl CleanupQueue for RecordingQueue {
    async fn enqueue(&self, payload: serde_json::Value, spec: JobSpec) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.jobs.lock().unwrap().push((id, spec, payload));
        Ok(id)
    }
}
