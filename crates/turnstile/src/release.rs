//! Release coordinator.
//!
//! Listens for lifecycle completion of admitted messages and removes their
//! reservation so a later message with the same fingerprint is admissible
//! again. Completion means handled, or failed with no retry coming; a failure
//! the transport will redeliver keeps the reservation, and the redelivery
//! re-enters through the gate's received-from-transport bypass.

use crate::core::{Envelope, Fingerprint};
use crate::error::Result;
use crate::release_request::{CleanupQueue, JobSpec, ReleaseRequest};
use crate::store::{FingerprintStore, StoreSession};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Worker lifecycle events the coordinator subscribes to.
#[derive(Debug, Clone)]
pub enum LifecycleEvent<M> {
    Handled { envelope: Envelope<M> },
    Failed { envelope: Envelope<M>, will_retry: bool },
}

impl<M> LifecycleEvent<M> {
    pub fn envelope(&self) -> &Envelope<M> {
        match self {
            LifecycleEvent::Handled { envelope } | LifecycleEvent::Failed { envelope, .. } => envelope,
        }
    }

    /// Whether the message is done with the pipeline for good.
    pub fn is_completion(&self) -> bool {
        match self {
            LifecycleEvent::Handled { .. } => true,
            LifecycleEvent::Failed { will_retry, .. } => !will_retry,
        }
    }
}

/// Result of a deletion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Deleted,
    /// No reservation existed; nothing to do.
    Absent,
}

/// How the coordinator removes reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    /// Delete in the completing worker.
    #[default]
    Inline,
    /// Enqueue a [`ReleaseRequest`] and let the release handler delete it.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Not a completion, or the envelope carries no fingerprint.
    Skipped,
    Released(Released),
    Deferred { job_id: Uuid },
}

/// Look up the reservation for `fingerprint` and delete it if present.
///
/// Idempotent; shared by the coordinator and the release request handler.
pub async fn release_fingerprint<S: FingerprintStore>(
    store: &S,
    fingerprint: &Fingerprint,
) -> Result<Released> {
    let mut session = store.acquire().await?;

    let mut released = Released::Absent;
    if let Some(reservation) = session.find_by_fingerprint(fingerprint).await? {
        if session.delete(&reservation).await? {
            released = Released::Deleted;
        }
    }

    session.release().await?;
    debug!(%fingerprint, ?released, "reservation released");
    Ok(released)
}

pub struct ReleaseCoordinator<S> {
    store: Arc<S>,
    deferred: Option<(Arc<dyn CleanupQueue>, JobSpec)>,
}

impl<S> Clone for ReleaseCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            deferred: self.deferred.clone(),
        }
    }
}

impl<S: FingerprintStore> ReleaseCoordinator<S> {
    /// Coordinator that deletes reservations inline.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            deferred: None,
        }
    }

    /// Coordinator that hands deletions to `queue` as release requests.
    pub fn deferred(store: Arc<S>, queue: Arc<dyn CleanupQueue>, spec: JobSpec) -> Self {
        Self {
            store,
            deferred: Some((queue, spec)),
        }
    }

    pub fn mode(&self) -> ReleaseMode {
        if self.deferred.is_some() {
            ReleaseMode::Deferred
        } else {
            ReleaseMode::Inline
        }
    }

    pub async fn on_lifecycle<M>(&self, event: &LifecycleEvent<M>) -> Result<ReleaseOutcome> {
        if !event.is_completion() {
            return Ok(ReleaseOutcome::Skipped);
        }

        match event.envelope().fingerprint() {
            Some(fingerprint) => self.release(fingerprint).await,
            None => Ok(ReleaseOutcome::Skipped),
        }
    }

    pub async fn on_handled<M>(&self, envelope: &Envelope<M>) -> Result<ReleaseOutcome> {
        match envelope.fingerprint() {
            Some(fingerprint) => self.release(fingerprint).await,
            None => Ok(ReleaseOutcome::Skipped),
        }
    }

    /// Release `fingerprint` according to the configured mode.
    pub async fn release(&self, fingerprint: &Fingerprint) -> Result<ReleaseOutcome> {
        match &self.deferred {
            None => release_fingerprint(self.store.as_ref(), fingerprint)
                .await
                .map(ReleaseOutcome::Released),
            Some((queue, spec)) => {
                let job_id = ReleaseRequest::new(fingerprint.clone())
                    .dispatch(queue.as_ref(), spec.clone())
                    .await?;
                Ok(ReleaseOutcome::Deferred { job_id })
            }
        }
    }
}
