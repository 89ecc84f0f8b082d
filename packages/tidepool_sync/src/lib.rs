//! Bidirectional replication between a local [`tidepool_store::Store`] and a
//! remote document backend.
//!
//! A [`Replication`] instance owns a pull loop and a push loop over one
//! collection pair. Pull asks the remote "what changed since checkpoint C"
//! and applies each batch atomically with the checkpoint advance, resolving
//! conflicts last-write-wins on `updatedAt`. Push scans locally-originated
//! writes past the acknowledged watermark and upserts them remote-side,
//! quarantining documents the remote keeps rejecting so one bad write cannot
//! wedge the pipeline.
//!
//! The remote side is anything implementing [`RemoteCollection`]: bundled are
//! an HTTP adapter ([`HttpRemote`]) and an in-memory double for tests
//! ([`MemoryRemote`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidepool_store::{Store, StoreConfig, SchemaSet};
//! use tidepool_sync::{HttpRemote, Replication, ReplicationConfig};
//!
//! # async fn demo(schemas: SchemaSet) -> anyhow::Result<()> {
//! let store = Store::open(StoreConfig::at_path("chat.db"), schemas).await?;
//! let remote = Arc::new(HttpRemote::new("https://api.example.com", "messages", "key"));
//! let replication = Replication::start(
//!     store,
//!     remote,
//!     ReplicationConfig::for_collection("acct-1", "messages"),
//! )
//! .await?;
//!
//! let mut events = replication.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod http;
mod memory_remote;
mod remote;
mod replication;

pub use config::ReplicationConfig;
pub use error::{Result, SyncError};
pub use http::HttpRemote;
pub use memory_remote::MemoryRemote;
pub use remote::{
    ChangeBatch, Checkpoint, DocumentPage, ListFilters, Order, RemoteCollection, cursor,
    cursor_parts,
};
pub use replication::{Replication, ReplicationEvent, ReplicationStatus};
