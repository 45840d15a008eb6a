//! # Dedupe Worker Demo
//!
//! Two producers publish the same orders onto an in-memory "broker". The
//! admission gate sits on the dispatch side, so a duplicate never reaches the
//! broker while the original is in flight. Workers stamp what they receive as
//! redelivered (the gate lets those through) and, once an order is handled,
//! the release coordinator enqueues a cleanup job that a separate task runs.
//!
//! Run with `RUST_LOG=debug` to watch the gate decide.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;
use turnstile_core::{
    CleanupQueue, DedupeBuilder, DedupeConfig, Envelope, Fingerprint, JobSpec, LifecycleEvent,
    MemoryFingerprintStore, ReleaseMode,
};
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
struct PlaceOrder {
    order_id: u32,
    sku: String,
}

impl PlaceOrder {
    /// Producer-side fingerprint: one per logical order.
    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::new(format!("order:{}:{}", self.order_id, self.sku))?)
    }
}

// ============================================================================
// Cleanup queue (a second channel standing in for the broker)
// ============================================================================

struct ChannelQueue {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

#[async_trait]
impl CleanupQueue for ChannelQueue {
    async fn enqueue(&self, payload: serde_json::Value, _spec: JobSpec) -> Result<Uuid> {
        self.tx.send(payload)?;
        Ok(Uuid::new_v4())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = MemoryFingerprintStore::new();
    let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel();

    let config = DedupeConfig {
        release_mode: ReleaseMode::Deferred,
        ..DedupeConfig::default()
    };
    let dedupe = DedupeBuilder::new(config)
        .with_store(store.clone())
        .with_cleanup_queue(Arc::new(ChannelQueue { tx: cleanup_tx }))
        .build()?;

    let (broker_tx, broker_rx) = mpsc::channel::<Envelope<PlaceOrder>>(64);
    let broker_rx = Arc::new(Mutex::new(broker_rx));
    let handled = Arc::new(AtomicUsize::new(0));

    // Workers
    let mut workers = Vec::new();
    for worker_id in 0..4 {
        let broker_rx = broker_rx.clone();
        let gate = dedupe.gate.clone();
        let coordinator = dedupe.coordinator.clone();
        let handled = handled.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let Some(envelope) = broker_rx.lock().await.recv().await else {
                    break;
                };
                let envelope = envelope.received_from("memory");

                let handled = handled.clone();
                let envelope = gate
                    .handle(envelope, |envelope| async move {
                        let order = envelope.message();
                        info!(worker_id, order_id = order.order_id, sku = %order.sku, "placing order");
                        handled.fetch_add(1, Ordering::SeqCst);
                        Ok(envelope)
                    })
                    .await?;

                coordinator
                    .on_lifecycle(&LifecycleEvent::Handled { envelope })
                    .await?;
            }
            anyhow::Ok(())
        }));
    }

    // Cleanup consumer
    let release_handler = dedupe.release_handler.clone();
    let cleanup = tokio::spawn(async move {
        while let Some(payload) = cleanup_rx.recv().await {
            release_handler.handle_payload(payload).await?;
        }
        anyhow::Ok(())
    });

    // Producers publish every order; both run at once.
    let mut producers = Vec::new();
    for producer_id in 0..2 {
        let gate = dedupe.gate.clone();
        let broker_tx = broker_tx.clone();

        producers.push(tokio::spawn(async move {
            let mut published = 0usize;
            for order_id in 1..=5 {
                let order = PlaceOrder {
                    order_id,
                    sku: "SKU-42".to_string(),
                };
                let envelope = Envelope::new(order.clone()).with_fingerprint(order.fingerprint()?);

                let broker_tx = broker_tx.clone();
                let sent = Arc::new(AtomicUsize::new(0));
                let sent_in_next = sent.clone();
                gate.handle(envelope, |envelope| async move {
                    broker_tx.send(envelope.clone()).await?;
                    sent_in_next.fetch_add(1, Ordering::SeqCst);
                    Ok(envelope)
                })
                .await?;

                published += sent.load(Ordering::SeqCst);
            }
            info!(producer_id, published, "producer finished");
            anyhow::Ok(())
        }));
    }

    for producer in producers {
        producer.await??;
    }
    drop(broker_tx);

    for worker in workers {
        worker.await??;
    }
    drop(dedupe);
    cleanup.await??;

    info!(
        handled = handled.load(Ordering::SeqCst),
        remaining_reservations = store.len(),
        "demo complete"
    );

    Ok(())
}
