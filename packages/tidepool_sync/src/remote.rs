//! The consumed boundary: a remote document backend with CRUD and a
//! change-feed primitive. The engine is written against this trait; the HTTP
//! adapter and the in-memory test double both implement it.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Opaque change-feed cursor. The engine persists and returns it verbatim;
/// only the remote implementation interprets it.
pub type Checkpoint = Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Filters for `list_documents`: equality, range, ordering, pagination.
#[derive(Clone, Debug, Default)]
pub struct ListFilters {
    pub equal: Vec<(String, Value)>,
    pub greater_than: Vec<(String, Value)>,
    pub greater_equal: Vec<(String, Value)>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListFilters {
    pub fn equal(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equal.push((field.into(), value.into()));
        self
    }

    pub fn greater_than(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.greater_than.push((field.into(), value.into()));
        self
    }

    pub fn greater_equal(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.greater_equal.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DocumentPage {
    pub documents: Vec<Value>,
    pub total: u64,
}

/// One pull's worth of remote changes. `checkpoint` is the cursor to resume
/// after this batch; `None` when the batch is empty.
#[derive(Clone, Debug, Default)]
pub struct ChangeBatch {
    pub documents: Vec<Value>,
    pub checkpoint: Option<Checkpoint>,
}

/// One remote collection of documents.
///
/// `changes_since` is the change-feed primitive: "what changed after
/// checkpoint `C`, at most `N` items". The HTTP adapter answers it with a
/// polling list query ordered by `(updatedAt, id)`; a push-based
/// implementation is equally valid; the engine does not care.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    async fn create_document(&self, id: &str, fields: Value) -> Result<Value>;

    async fn get_document(&self, id: &str) -> Result<Value>;

    async fn list_documents(&self, filters: ListFilters) -> Result<DocumentPage>;

    async fn update_document(&self, id: &str, partial: Value) -> Result<Value>;

    async fn changes_since(&self, checkpoint: Option<&Checkpoint>, limit: u32)
    -> Result<ChangeBatch>;
}

/// A `(updatedAt, id)` cursor, the shape both bundled remotes use. Helper for
/// implementations; the engine itself never looks inside a checkpoint.
pub fn cursor(updated_at: i64, id: &str) -> Checkpoint {
    serde_json::json!({"updatedAt": updated_at, "id": id})
}

pub fn cursor_parts(checkpoint: &Checkpoint) -> (i64, String) {
    (
        checkpoint.get("updatedAt").and_then(Value::as_i64).unwrap_or(0),
        checkpoint
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}
