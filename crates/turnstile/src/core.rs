//! Envelopes, stamps and fingerprints.
//!
//! An [`Envelope`] wraps a message together with the stamps the pipeline
//! attached to it. Two stamps matter to the gate:
//!
//! - [`HashStamp`] carries the producer-computed [`Fingerprint`]
//! - [`ReceivedStamp`] marks an envelope that re-entered the pipeline from
//!   the transport (a redelivery) rather than a fresh dispatch

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// Opaque identity of one logical message occurrence.
///
/// Computed by the producer; the gate only compares it for equality, so the
/// value is kept byte for byte. Only the empty string is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Result<Self, FingerprintError> {
        let value = value.into();
        if value.is_empty() {
            return Err(FingerprintError::Empty);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Rejected fingerprint value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("fingerprint cannot be empty")]
    Empty,
}

/// Fingerprint annotation attached by the producer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashStamp {
    pub fingerprint: Fingerprint,
}

impl HashStamp {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self { fingerprint }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// Marks an envelope received from a transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedStamp {
    pub transport: String,
}

impl ReceivedStamp {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stamp", rename_all = "snake_case")]
pub enum Stamp {
    Hash(HashStamp),
    Received(ReceivedStamp),
}

/// A message in flight, with its stamps in the order they were added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    message: M,
    stamps: SmallVec<[Stamp; 2]>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            stamps: SmallVec::new(),
        }
    }

    /// Attach a fingerprint annotation.
    pub fn with_fingerprint(self, fingerprint: Fingerprint) -> Self {
        self.with_stamp(Stamp::Hash(HashStamp::new(fingerprint)))
    }

    /// Mark the envelope as received from `transport`.
    pub fn received_from(self, transport: impl Into<String>) -> Self {
        self.with_stamp(Stamp::Received(ReceivedStamp::new(transport)))
    }

    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.stamps.push(stamp);
        self
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }

    /// The most recently attached hash stamp, if any.
    pub fn last_hash(&self) -> Option<&HashStamp> {
        self.stamps.iter().rev().find_map(|stamp| match stamp {
            Stamp::Hash(hash) => Some(hash),
            _ => None,
        })
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.last_hash().map(HashStamp::fingerprint)
    }

    pub fn last_received(&self) -> Option<&ReceivedStamp> {
        self.stamps.iter().rev().find_map(|stamp| match stamp {
            Stamp::Received(received) => Some(received),
            _ => None,
        })
    }

    pub fn is_received(&self) -> bool {
        self.last_received().is_some()
    }
}
