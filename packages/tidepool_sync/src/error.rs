//! Replication error taxonomy.
//!
//! Nothing here is thrown into unrelated callers: failures inside the engine
//! surface through the [`crate::ReplicationEvent::Error`] stream, and the
//! loops recover with backoff up to the point of quarantine.

use tidepool_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transport-level failure reaching the remote; always retried.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote answered and said no. Repeated rejections of the same
    /// document lead to quarantine.
    #[error("remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// A document permanently failing push, now excluded from retry until the
    /// next local write touches it.
    #[error("document {id:?} in {collection} quarantined after {attempts} failed pushes")]
    PoisonedDocument {
        collection: String,
        id: String,
        attempts: u32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether a push failure counts toward quarantine. Transport failures
    /// are transient and never poison a document.
    pub(crate) fn is_rejection(&self) -> bool {
        matches!(self, SyncError::RemoteRejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
