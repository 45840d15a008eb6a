//! Admission gate.
//!
//! Sits in front of the handler and lets each fingerprint through at most
//! once while it is reserved:
//!
//! ```text
//! envelope
//!    │
//!    ├─ ReceivedStamp? ───────────────► pass through (redelivery)
//!    ├─ no HashStamp?  ───────────────► pass through (dedup is opt-in)
//!    ├─ soft check: reserved? ────────► short-circuit
//!    └─ insert reservation
//!          ├─ ok ─────────────────────► pass through
//!          └─ unique violation ───────► recover session, short-circuit
//! ```
//!
//! The soft check and the insert are not atomic. Two first-seen admissions
//! can both pass the soft check; the store's unique index then lets exactly
//! one insert commit and the other observes a violation (the hard check).

use crate::core::{Envelope, Fingerprint};
use crate::error::{Result, StoreError};
use crate::store::{FingerprintStore, StoreSession};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`AdmissionGate::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission<M> {
    /// Continue down the pipeline; the handler runs.
    PassThrough(Envelope<M>),
    /// Return without invoking the handler.
    ShortCircuit(Envelope<M>),
}

impl<M> Admission<M> {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Admission::PassThrough(_))
    }

    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Admission::ShortCircuit(_))
    }

    pub fn envelope(&self) -> &Envelope<M> {
        match self {
            Admission::PassThrough(envelope) | Admission::ShortCircuit(envelope) => envelope,
        }
    }

    pub fn into_envelope(self) -> Envelope<M> {
        match self {
            Admission::PassThrough(envelope) | Admission::ShortCircuit(envelope) => envelope,
        }
    }
}

pub struct AdmissionGate<S> {
    store: Arc<S>,
}

impl<S> Clone for AdmissionGate<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: FingerprintStore> AdmissionGate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether `envelope` may reach its handler.
    ///
    /// A successful admission leaves one committed reservation behind. Losing
    /// a reservation race is not an error: it yields
    /// [`Admission::ShortCircuit`]. Only store failures unrelated to
    /// uniqueness are returned as errors.
    pub async fn admit<M>(&self, envelope: Envelope<M>) -> Result<Admission<M>> {
        if let Some(received) = envelope.last_received() {
            debug!(
                transport = %received.transport,
                "envelope received from transport, skipping deduplication"
            );
            return Ok(Admission::PassThrough(envelope));
        }

        let Some(fingerprint) = envelope.fingerprint().cloned() else {
            return Ok(Admission::PassThrough(envelope));
        };

        let mut session = self.store.acquire().await?;

        // Soft check
        if session.find_by_fingerprint(&fingerprint).await?.is_some() {
            info!(%fingerprint, "fingerprint already reserved, short-circuiting");
            // Nothing was written; a failed commit cannot change the outcome.
            if let Err(err) = session.release().await {
                warn!(%fingerprint, error = %err, "failed to release store session");
            }
            return Ok(Admission::ShortCircuit(envelope));
        }

        match session.insert(&fingerprint).await {
            Ok(reservation) => match session.release().await {
                Ok(()) => {
                    debug!(%fingerprint, reservation_id = reservation.id, "fingerprint reserved");
                    Ok(Admission::PassThrough(envelope))
                }
                // Deferred constraints surface the conflict at commit time.
                Err(err) if err.is_unique_violation() => {
                    info!(%fingerprint, "lost reservation race at commit, short-circuiting");
                    Ok(Admission::ShortCircuit(envelope))
                }
                Err(err) => Err(err.into()),
            },
            // Hard check
            Err(StoreError::UniqueViolation { .. }) => {
                info!(%fingerprint, "lost reservation race, short-circuiting");
                self.recover_session(session, &fingerprint).await;
                Ok(Admission::ShortCircuit(envelope))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Middleware form of [`admit`](Self::admit): runs `next` only when the
    /// envelope passes, otherwise hands the envelope straight back.
    pub async fn handle<M, F, Fut>(&self, envelope: Envelope<M>, next: F) -> anyhow::Result<Envelope<M>>
    where
        F: FnOnce(Envelope<M>) -> Fut,
        Fut: Future<Output = anyhow::Result<Envelope<M>>>,
    {
        match self.admit(envelope).await? {
            Admission::PassThrough(envelope) => next(envelope).await,
            Admission::ShortCircuit(envelope) => Ok(envelope),
        }
    }

    /// Repair a session a failed unique write may have left unusable, so the
    /// next store operation in this process starts clean. Failures here are
    /// logged only; they never change the short-circuit outcome.
    async fn recover_session(&self, mut session: S::Session, fingerprint: &Fingerprint) {
        if !session.is_usable() {
            if let Err(err) = session.recover().await {
                warn!(%fingerprint, error = %err, "failed to recover store session");
                return;
            }
            debug!(%fingerprint, "store session recovered after uniqueness violation");
        }

        if let Err(err) = session.release().await {
            warn!(%fingerprint, error = %err, "failed to release store session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFingerprintStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fp(value: &str) -> Fingerprint {
        Fingerprint::new(value).unwrap()
    }

    fn gate() -> (AdmissionGate<MemoryFingerprintStore>, MemoryFingerprintStore) {
        let store = MemoryFingerprintStore::new();
        (AdmissionGate::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_envelope_without_fingerprint_passes_through() {
        let (gate, store) = gate();

        for _ in 0..3 {
            let admission = gate.admit(Envelope::new("job")).await.unwrap();
            assert!(admission.is_pass_through());
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_first_admission_reserves_fingerprint() {
        let (gate, store) = gate();

        let admission = gate
            .admit(Envelope::new("job").with_fingerprint(fp("abc123")))
            .await
            .unwrap();

        assert!(admission.is_pass_through());
        assert!(store.contains(&fp("abc123")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_fingerprint_short_circuits() {
        let (gate, store) = gate();
        let envelope = Envelope::new("job").with_fingerprint(fp("abc123"));

        assert!(gate.admit(envelope.clone()).await.unwrap().is_pass_through());

        let second = gate.admit(envelope.clone()).await.unwrap();
        assert!(second.is_short_circuit());
        assert_eq!(second.envelope().message(), &"job");
        assert_eq!(second.into_envelope(), envelope);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_envelope_bypasses_live_reservation() {
        let (gate, store) = gate();
        let envelope = Envelope::new("job").with_fingerprint(fp("abc123"));
        gate.admit(envelope.clone()).await.unwrap();

        let redelivered = envelope.received_from("async");
        let admission = gate.admit(redelivered).await.unwrap();

        assert!(admission.is_pass_through());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_whitespace_variants_are_distinct_fingerprints() {
        let (gate, store) = gate();

        for value in ["abc123", "abc123 ", " abc123"] {
            let admission = gate
                .admit(Envelope::new(()).with_fingerprint(fp(value)))
                .await
                .unwrap();
            assert!(admission.is_pass_through(), "{value:?} should be admitted");
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_do_not_interfere() {
        let (gate, store) = gate();

        for value in ["a", "b", "c"] {
            let admission = gate
                .admit(Envelope::new(()).with_fingerprint(fp(value)))
                .await
                .unwrap();
            assert!(admission.is_pass_through());
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_handle_runs_next_only_when_admitted() {
        let (gate, _store) = gate();
        let calls = AtomicUsize::new(0);
        let envelope = Envelope::new("job").with_fingerprint(fp("abc123"));

        for _ in 0..2 {
            gate.handle(envelope.clone(), |envelope| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(envelope)
            })
            .await
            .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_errors_are_the_handlers_own() {
        let (gate, store) = gate();
        let envelope = Envelope::new("job").with_fingerprint(fp("abc123"));

        let result = gate
            .handle(envelope, |_| async { Err(anyhow::anyhow!("handler blew up")) })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "handler blew up");
        // The reservation stays until a lifecycle event releases it.
        assert!(store.contains(&fp("abc123")));
    }
}
