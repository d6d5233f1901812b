//! Core types shared by the session and lease subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a partition key range (e.g. `"0"`, `"12"`).
pub type PartitionRangeId = String;

/// Identity of a processor host competing for leases.
pub type HostName = String;

/// Well-known header names consumed by the session subsystem.
pub mod headers {
    /// Request/response session token, `"<rangeId>:<token>[,<rangeId>:<token>...]"`.
    pub const SESSION_TOKEN: &str = "x-ms-session-token";

    /// Response header carrying the owning collection's resource id.
    pub const OWNER_ID: &str = "x-ms-content-path";

    /// Response header carrying the owning collection's full name.
    pub const OWNER_FULL_NAME: &str = "x-ms-alt-content-path";
}

/// Opaque version marker used for optimistic-concurrency writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyTag(String);

impl ConcurrencyTag {
    /// Wrap an existing tag value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh, unique tag.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The raw tag value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
