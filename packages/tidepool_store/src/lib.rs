//! # Tidepool Store
//!
//! Schema-validated local document store with live queries, backed by SQLite.
//!
//! This is the local half of an offline-first sync stack: collections of JSON
//! documents are validated against an immutable [`SchemaSet`] on every write,
//! persisted in one SQLite table per collection (with extracted columns for
//! declared indexes), and observable through live queries whose result sets
//! re-deliver as the underlying data changes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tidepool_store::{
//!     CollectionSchema, FieldDef, Query, SchemaSet, Selector, SortDirection, Store, StoreConfig,
//! };
//!
//! # async fn demo() -> tidepool_store::Result<()> {
//! let schemas = SchemaSet::new(1).collection(
//!     CollectionSchema::new("messages", "id")
//!         .field(FieldDef::string("id").required().max_length(36))
//!         .field(FieldDef::string("threadId").required().indexed())
//!         .field(FieldDef::integer("createdAt").required().indexed()),
//! );
//! let store = Store::open(StoreConfig::at_path("app.db"), schemas).await?;
//!
//! let query = Query::new("messages")
//!     .filter(Selector::eq("threadId", "t1"))
//!     .sort_by("createdAt", SortDirection::Asc);
//! let mut sub = store.subscribe(query).await?;
//! println!("{} messages", sub.initial().len());
//! while let Some(snapshot) = sub.next().await {
//!     println!("now {} messages", snapshot.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The store handle is an explicit context object: open it once at startup
//! and clone it into every consumer. There is no global state.

pub mod config;
pub mod document;
pub mod error;
pub mod live;
pub mod query;
pub mod schema;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::StoreConfig;
pub use document::{StoredDocument, now_ms};
pub use error::{Result, StoreError};
pub use live::Subscription;
pub use query::{Query, Selector, SortDirection, SortSpec};
pub use schema::{CollectionSchema, FieldDef, FieldType, SchemaSet};
pub use store::{PullOutcome, ReplicationKey, ReplicationState, Store};
