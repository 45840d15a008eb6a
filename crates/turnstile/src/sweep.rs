//! Stale reservation sweep.
//!
//! A worker that crashes after reserving and before completing leaves its
//! reservation behind; nothing in the admission or release paths removes it.
//! This is the administrative escape hatch. No age threshold is assumed here:
//! the operator picks one that is longer than any legitimate processing time.

use crate::error::Result;
use crate::store::FingerprintStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Delete reservations older than `older_than`. Returns how many were removed.
pub async fn sweep_stale<S: FingerprintStore>(store: &S, older_than: Duration) -> Result<u64> {
    sweep_created_before(store, Utc::now() - older_than).await
}

/// Delete reservations created before `cutoff`.
pub async fn sweep_created_before<S: FingerprintStore>(
    store: &S,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let removed = store.delete_created_before(cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "swept stale fingerprint reservations");
    }
    Ok(removed)
}

/// Run [`sweep_stale`] every `every` until the returned handle is aborted.
///
/// Opt-in: both the period and the age threshold come from the caller.
pub fn spawn_sweeper<S: FingerprintStore>(
    store: Arc<S>,
    every: std::time::Duration,
    older_than: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_stale(store.as_ref(), older_than).await {
                warn!(error = %err, "stale reservation sweep failed");
            }
        }
    })
}
