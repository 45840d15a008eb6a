//! Asynchronous release requests.
//!
//! A [`ReleaseRequest`] carries only a fingerprint. It is enqueued on the
//! same transport the pipeline uses and consumed later by a
//! [`ReleaseRequestHandler`], so the deletion runs in its own transaction and
//! retry domain instead of the originating handler's.

use crate::core::Fingerprint;
use crate::error::{DedupeError, Result};
use crate::release::{release_fingerprint, Released};
use crate::store::FingerprintStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Job type used for release requests unless configured otherwise.
pub const RELEASE_JOB_TYPE: &str = "turnstile:release";

/// Queue-level description of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub max_retries: u32,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for JobSpec {
    fn default() -> Self {
        Self::new(RELEASE_JOB_TYPE)
    }
}

/// Transport seam for cleanup jobs.
#[async_trait]
pub trait CleanupQueue: Send + Sync + 'static {
    /// Enqueue a job for asynchronous execution and return its id.
    async fn enqueue(&self, payload: serde_json::Value, spec: JobSpec) -> anyhow::Result<Uuid>;
}

/// Fingerprint-only cleanup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub fingerprint: Fingerprint,
}

impl ReleaseRequest {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self { fingerprint }
    }

    /// Serialize and enqueue this request.
    pub async fn dispatch(&self, queue: &dyn CleanupQueue, spec: JobSpec) -> Result<Uuid> {
        let payload = serde_json::to_value(self)?;
        let job_id = queue
            .enqueue(payload, spec)
            .await
            .map_err(DedupeError::Enqueue)?;
        debug!(fingerprint = %self.fingerprint, %job_id, "release request enqueued");
        Ok(job_id)
    }
}

/// Consumes [`ReleaseRequest`]s. Idempotent: a request for a fingerprint
/// that is no longer reserved is a no-op.
pub struct ReleaseRequestHandler<S> {
    store: Arc<S>,
}

impl<S> Clone for ReleaseRequestHandler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: FingerprintStore> ReleaseRequestHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, request: ReleaseRequest) -> Result<Released> {
        release_fingerprint(self.store.as_ref(), &request.fingerprint).await
    }

    /// Decode a job payload produced by [`ReleaseRequest::dispatch`] and
    /// handle it.
    pub async fn handle_payload(&self, payload: serde_json::Value) -> Result<Released> {
        let request: ReleaseRequest = serde_json::from_value(payload)?;
        self.handle(request).await
    }
}
