//! # Turnstile
//!
//! A deduplication gate for asynchronous message pipelines: a message whose
//! fingerprint is already accepted for processing is not processed again,
//! even with concurrent workers and transport redelivery.
//!
//! ## Core Concepts
//!
//! - [`Fingerprint`] = identity of a logical message occurrence (computed by
//!   the producer, attached as a [`HashStamp`])
//! - [`Reservation`] = the only persisted fact: "this fingerprint is in flight"
//! - [`FingerprintStore`] = shared store with a unique index on fingerprint
//!
//! The key principle: **the store's unique constraint is the only lock.**
//! There is no in-process locking; of N concurrent reservation attempts for
//! one fingerprint, exactly one commits.
//!
//! ## Architecture
//!
//! ```text
//! Producer ── Envelope + HashStamp ──┐
//!                                    ▼
//!                            AdmissionGate.admit()
//!                              │             │
//!                   short-circuit      pass-through
//!                   (no handler)             │
//!                                            ▼
//!                                         handler
//!                                            │
//!                          LifecycleEvent (handled / failed for good)
//!                                            │
//!                                            ▼
//!                                  ReleaseCoordinator
//!                                     │            │
//!                               Inline delete   Deferred
//!                                                  │
//!                                       CleanupQueue.enqueue(ReleaseRequest)
//!                                                  │
//!                                                  ▼
//!                                       ReleaseRequestHandler
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one admission per fingerprint** while it is reserved
//! 2. **Redeliveries bypass the gate** - an envelope with a [`ReceivedStamp`]
//!    was already admitted once
//! 3. **Dedup is opt-in** - envelopes without a fingerprint always pass
//! 4. **Release is idempotent** - deleting an absent reservation is a no-op
//! 5. **Losing a race is not an error** - it is a short-circuit
//!
//! ## Known Gap
//!
//! A worker that crashes between reserving and completing leaves its
//! reservation behind. [`sweep_stale`] removes old reservations on demand and
//! [`spawn_sweeper`] runs it periodically; both take the age threshold from
//! the caller, no TTL is assumed.
//!
//! ## Example
//!
//! ```ignore
//! use turnstile_core::{DedupeBuilder, DedupeConfig, Envelope, Fingerprint, LifecycleEvent, MemoryFingerprintStore};
//!
//! let dedupe = DedupeBuilder::new(DedupeConfig::default())
//!     .with_store(MemoryFingerprintStore::new())
//!     .build()?;
//!
//! let envelope = Envelope::new(job).with_fingerprint(Fingerprint::new("abc123")?);
//!
//! let envelope = dedupe.gate.handle(envelope, |envelope| async move {
//!     run_job(envelope.message()).await?;
//!     Ok(envelope)
//! }).await?;
//!
//! dedupe.coordinator.on_lifecycle(&LifecycleEvent::Handled { envelope }).await?;
//! ```

mod builder;
mod core;
mod error;
mod gate;
mod memory;
mod release;
mod release_request;
mod store;
mod sweep;

// Re-export envelope types
pub use crate::core::{Envelope, Fingerprint, FingerprintError, HashStamp, ReceivedStamp, Stamp};

// Re-export error types
pub use crate::error::{ConfigError, DedupeError, Result, StoreError};

// Re-export store types
pub use memory::{MemoryFingerprintStore, MemorySession};
pub use store::{FingerprintStore, Reservation, StoreSession};

// Re-export gate types
pub use gate::{Admission, AdmissionGate};

// Re-export release types
pub use release::{
    release_fingerprint, LifecycleEvent, ReleaseCoordinator, ReleaseMode, ReleaseOutcome, Released,
};
pub use release_request::{
    CleanupQueue, JobSpec, ReleaseRequest, ReleaseRequestHandler, RELEASE_JOB_TYPE,
};

// Re-export maintenance helpers
pub use sweep::{spawn_sweeper, sweep_created_before, sweep_stale};

// Re-export wiring
pub use builder::{Dedupe, DedupeBuilder, DedupeConfig};

// Re-export commonly used external types
pub use async_trait::async_trait;
