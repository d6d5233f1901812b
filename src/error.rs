//! Error types for the change-feed coordination core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the coordination core.
#[derive(Error, Debug)]
pub enum Error {
    /// Session token parsing errors.
    #[error("session token error: {0}")]
    SessionToken(#[from] SessionTokenError),

    /// Collection resource id decoding errors.
    #[error("resource id error: {0}")]
    ResourceId(#[from] ResourceIdError),

    /// Durable item store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Lease protocol errors.
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// User observer code failed.
    #[error("observer fault: {0}")]
    Observer(#[from] ObserverFault),

    /// Change feed source errors.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Malformed session token text.
///
/// Always recovered locally: the offending header is logged and ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionTokenError {
    /// The token text was empty.
    #[error("empty session token")]
    Empty,

    /// The token text does not follow `version#globalLsn[#region=lsn...]`.
    #[error("malformed session token '{token}': {reason}")]
    Malformed { token: String, reason: String },

    /// A numeric segment could not be parsed.
    #[error("invalid number '{segment}' in session token '{token}'")]
    InvalidNumber { token: String, segment: String },

    /// A header entry is missing the `<partitionRangeId>:` prefix.
    #[error("session token entry '{value}' has no partition range id")]
    MissingPartition { value: String },
}

/// Undecodable collection resource id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceIdError {
    /// The text is not valid base64.
    #[error("resource id '{0}' is not valid base64")]
    InvalidEncoding(String),

    /// The decoded bytes do not describe a database or collection.
    #[error("resource id '{id}' has unexpected length {len}")]
    InvalidLength { id: String, len: usize },
}

/// Tagged outcome of a durable item store operation.
///
/// `NotFound` and `Conflict` are expected outcomes of the coordination
/// protocols and are matched explicitly by callers; everything else is
/// propagated unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The item does not exist.
    #[error("item not found: {id}")]
    NotFound { id: String },

    /// The item already exists, or the concurrency tag did not match.
    #[error("conflict on item: {id}")]
    Conflict { id: String },

    /// The store could not be reached or failed the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The item body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this is the `NotFound` outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Whether this is the `Conflict` outcome.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Lease protocol errors that are not ordinary contention.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Release was requested without holding the initialization lock.
    #[error("initialization lock is not held")]
    LockNotHeld,

    /// The lease is now owned by another host.
    #[error("lease for partition {partition_id} was lost")]
    Lost { partition_id: String },

    /// The lease document no longer exists.
    #[error("lease for partition {partition_id} is gone")]
    Gone { partition_id: String },

    /// A lease document could not be interpreted.
    #[error("corrupted lease '{id}': {reason}")]
    Corrupted { id: String, reason: String },
}

/// A user observer callback failed or panicked.
///
/// Distinguishes "user code broke" from infrastructure failures so the
/// scheduler can apply one teardown policy to every partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObserverFault {
    /// `open` failed.
    #[error("observer open failed for partition {partition_id}: {message}")]
    Open { partition_id: String, message: String },

    /// `close` failed.
    #[error("observer close failed for partition {partition_id}: {message}")]
    Close { partition_id: String, message: String },

    /// `process_changes` failed.
    #[error("observer failed processing changes for partition {partition_id}: {message}")]
    ProcessChanges { partition_id: String, message: String },
}

impl ObserverFault {
    /// The partition whose observer failed.
    pub fn partition_id(&self) -> &str {
        match self {
            ObserverFault::Open { partition_id, .. }
            | ObserverFault::Close { partition_id, .. }
            | ObserverFault::ProcessChanges { partition_id, .. } => partition_id,
        }
    }
}

/// Errors reported by the change feed source collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The partition no longer exists (split or merged away).
    #[error("partition gone: {0}")]
    PartitionGone(String),

    /// The source asked the caller to back off.
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// Any other read failure.
    #[error("feed read failed: {0}")]
    Other(String),
}

/// Boxed error returned by user-supplied observer code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
