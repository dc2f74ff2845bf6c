//! Envelope: the unit of data carried over a topic.
//!
//! Wire form is a JSON object:
//!
//! ```json
//! {
//!   "kind": "deployment",
//!   "when": 1700000000,
//!   "metadata": {
//!     "tenantId": "t-1",
//!     "applicationId": "app-1",
//!     "environment": "prod",
//!     "labels": { "team": "core" }
//!   },
//!   "data": { ... }
//! }
//! ```
//!
//! `data` is opaque to this crate; it is carried as a raw JSON value.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bus::Result;

/// Routing and ownership metadata attached to every envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub tenant_id: String,
    pub application_id: String,
    pub environment: String,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(
        tenant_id: impl Into<String>,
        application_id: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            application_id: application_id.into(),
            environment: environment.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A message moved through the log.
///
/// Immutable once handed to the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Discriminator for the shape of `data`.
    pub kind: String,
    /// Unix timestamp (seconds) set by the producer at publish time.
    pub when: i64,
    pub metadata: Metadata,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, metadata: Metadata, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            when: chrono::Utc::now().timestamp(),
            metadata,
            data,
        }
    }

    /// Encode to the JSON wire form.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from the JSON wire form.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
