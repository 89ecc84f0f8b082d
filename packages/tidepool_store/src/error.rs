//! Store error taxonomy.
//!
//! All variants here are surfaced synchronously to the caller of the mutating
//! operation. Replication-side failures live in `tidepool_sync` and are only
//! ever reported through that crate's event stream.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("schema validation failed for {collection}: {reason}")]
    SchemaValidation { collection: String, reason: String },

    #[error("duplicate key {id:?} in collection {collection}")]
    DuplicateKey { collection: String, id: String },

    #[error("document {id:?} not found in collection {collection}")]
    NotFound { collection: String, id: String },

    #[error(
        "database schema version {found} is newer than supported version {supported}; \
         upgrade the application or migrate the database"
    )]
    SchemaVersionMismatch { found: i64, supported: i64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
