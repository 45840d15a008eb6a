//! Wiring.
//!
//! [`DedupeBuilder`] binds one store to the gate, the release coordinator and
//! the release request handler. Misconfiguration fails here, at startup,
//! instead of on the first message.

use crate::error::ConfigError;
use crate::gate::AdmissionGate;
use crate::release::{ReleaseCoordinator, ReleaseMode};
use crate::release_request::{CleanupQueue, JobSpec, ReleaseRequestHandler, RELEASE_JOB_TYPE};
use crate::store::FingerprintStore;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Deduplication settings, usually loaded from the host's config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub release_mode: ReleaseMode,
    pub release_job_type: String,
    pub release_max_retries: u32,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            release_mode: ReleaseMode::Inline,
            release_job_type: RELEASE_JOB_TYPE.to_string(),
            release_max_retries: 3,
        }
    }
}

impl DedupeConfig {
    pub fn release_job_spec(&self) -> JobSpec {
        JobSpec::new(self.release_job_type.clone()).with_max_retries(self.release_max_retries)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.release_job_type.trim().is_empty() {
            return Err(ConfigError::Invalid("release_job_type cannot be empty".into()));
        }
        Ok(())
    }
}

/// The three deduplication components, sharing one store.
pub struct Dedupe<S> {
    pub gate: AdmissionGate<S>,
    pub coordinator: ReleaseCoordinator<S>,
    pub release_handler: ReleaseRequestHandler<S>,
}

pub struct DedupeBuilder<S> {
    config: DedupeConfig,
    store: Option<Arc<S>>,
    cleanup_queue: Option<Arc<dyn CleanupQueue>>,
}

impl<S: FingerprintStore> DedupeBuilder<S> {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            store: None,
            cleanup_queue: None,
        }
    }

    pub fn with_store(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn with_shared_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Queue used for release requests in [`ReleaseMode::Deferred`].
    pub fn with_cleanup_queue(mut self, queue: Arc<dyn CleanupQueue>) -> Self {
        self.cleanup_queue = Some(queue);
        self
    }

    pub fn build(self) -> Result<Dedupe<S>, ConfigError> {
        self.config.validate()?;
        let store = self.store.ok_or(ConfigError::MissingStore)?;

        let coordinator = match self.config.release_mode {
            ReleaseMode::Inline => ReleaseCoordinator::new(store.clone()),
            ReleaseMode::Deferred => {
                let queue = self.cleanup_queue.ok_or(ConfigError::MissingCleanupQueue)?;
                ReleaseCoordinator::deferred(store.clone(), queue, self.config.release_job_spec())
            }
        };

        info!(release_mode = ?self.config.release_mode, "deduplication configured");

        Ok(Dedupe {
            gate: AdmissionGate::new(store.clone()),
            coordinator,
            release_handler: ReleaseRequestHandler::new(store),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFingerprintStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NullQueue;

    #[async_trait]
    impl CleanupQueue for NullQueue {
        async fn enqueue(&self, _: serde_json::Value, _: JobSpec) -> anyhow::Result<Uuid> {
            Ok(Uuid::nil())
        }
    }

    #[test]
    fn test_missing_store_is_config_error() {
        let result = DedupeBuilder::<MemoryFingerprintStore>::new(DedupeConfig::default()).build();
        assert!(matches!(result, Err(ConfigError::MissingStore)));
    }

    #[test]
    fn test_deferred_mode_requires_queue() {
        let config = DedupeConfig {
            release_mode: ReleaseMode::Deferred,
            ..DedupeConfig::default()
        };

        let result = DedupeBuilder::new(config.clone())
            .with_store(MemoryFingerprintStore::new())
            .build();
        assert!(matches!(result, Err(ConfigError::MissingCleanupQueue)));

        let dedupe = DedupeBuilder::new(config)
            .with_store(MemoryFingerprintStore::new())
            .with_cleanup_queue(Arc::new(NullQueue))
            .build()
            .unwrap();
        assert_eq!(dedupe.coordinator.mode(), ReleaseMode::Deferred);
    }

    #[test]
    fn test_blank_job_type_is_rejected() {
        let config = DedupeConfig {
            release_job_type: " ".into(),
            ..DedupeConfig::default()
        };
        let result = DedupeBuilder::new(config)
            .with_store(MemoryFingerprintStore::new())
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: DedupeConfig =
            serde_json::from_value(serde_json::json!({ "release_mode": "deferred" })).unwrap();

        assert_eq!(config.release_mode, ReleaseMode::Deferred);
        assert_eq!(config.release_job_type, RELEASE_JOB_TYPE);
        assert_eq!(config.release_job_spec().max_retries, 3);
    }

    #[tokio::test]
    async fn test_components_share_one_store() {
        let store = MemoryFingerprintStore::new();
        let dedupe = DedupeBuilder::new(DedupeConfig::default())
            .with_store(store.clone())
            .build()
            .unwrap();

        let envelope = crate::Envelope::new(())
            .with_fingerprint(crate::Fingerprint::new("abc123").unwrap());
        assert!(dedupe.gate.admit(envelope.clone()).await.unwrap().is_pass_through());
        assert_eq!(store.len(), 1);

        dedupe.coordinator.on_handled(&envelope).await.unwrap();
        assert!(store.is_empty());
    }
}
