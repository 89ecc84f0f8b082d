//! In-memory [`RemoteCollection`] with injectable failures. Used by the test
//! suites and handy for demos; not compiled out because downstream crates
//! need it in their own tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::remote::{
    ChangeBatch, Checkpoint, DocumentPage, ListFilters, Order, RemoteCollection, cursor,
    cursor_parts,
};

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Value>,
    /// Next N requests fail with `RemoteUnavailable`.
    fail_requests: u32,
    /// Writes to these ids fail with `RemoteRejected` (permanent rejection).
    reject_ids: HashSet<String>,
}

/// A remote collection living in process memory, change feed ordered by
/// `(updatedAt, id)`.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a document in place without going through the write path, as if
    /// another client had created it.
    pub fn seed(&self, doc: Value) {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .expect("seeded document needs a string id")
            .to_string();
        self.lock().docs.insert(id, doc);
    }

    /// Make the next `n` requests fail with `RemoteUnavailable`.
    pub fn fail_next_requests(&self, n: u32) {
        self.lock().fail_requests = n;
    }

    /// Permanently reject writes to `id` (simulates remote-side validation).
    pub fn reject_writes_for(&self, id: &str) {
        self.lock().reject_ids.insert(id.to_string());
    }

    pub fn allow_writes_for(&self, id: &str) {
        self.lock().reject_ids.remove(id);
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.lock().docs.get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.lock().docs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory remote poisoned")
    }

    fn check_available(inner: &mut Inner) -> Result<()> {
        if inner.fail_requests > 0 {
            inner.fail_requests -= 1;
            return Err(SyncError::RemoteUnavailable(
                "injected transport failure".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(inner: &Inner, id: &str) -> Result<()> {
        if inner.reject_ids.contains(id) {
            return Err(SyncError::RemoteRejected {
                status: 400,
                message: format!("document {id:?} rejected by remote validation"),
            });
        }
        Ok(())
    }
}

fn updated_at(doc: &Value) -> i64 {
    doc.get("updatedAt").and_then(Value::as_i64).unwrap_or(0)
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn loose_gt(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64() > b.as_f64(),
        (Value::String(x), Value::String(y)) => x > y,
        _ => false,
    }
}

#[async_trait]
impl RemoteCollection for MemoryRemote {
    async fn create_document(&self, id: &str, fields: Value) -> Result<Value> {
        let mut inner = self.lock();
        Self::check_available(&mut inner)?;
        Self::check_writable(&inner, id)?;
        if inner.docs.contains_key(id) {
            return Err(SyncError::RemoteRejected {
                status: 409,
                message: format!("document {id:?} already exists"),
            });
        }
        inner.docs.insert(id.to_string(), fields.clone());
        Ok(fields)
    }

    async fn get_document(&self, id: &str) -> Result<Value> {
        let mut inner = self.lock();
        Self::check_available(&mut inner)?;
        inner.docs.get(id).cloned().ok_or(SyncError::RemoteRejected {
            status: 404,
            message: format!("document {id:?} not found"),
        })
    }

    async fn list_documents(&self, filters: ListFilters) -> Result<DocumentPage> {
        let mut inner = self.lock();
        Self::check_available(&mut inner)?;

        let mut documents: Vec<Value> = inner
            .docs
            .values()
            .filter(|doc| {
                let null = Value::Null;
                filters.equal.iter().all(|(f, v)| {
                    loose_eq(doc.get(f).unwrap_or(&null), v)
                }) && filters.greater_than.iter().all(|(f, v)| {
                    loose_gt(doc.get(f).unwrap_or(&null), v)
                }) && filters.greater_equal.iter().all(|(f, v)| {
                    let actual = doc.get(f).unwrap_or(&null);
                    loose_eq(actual, v) || loose_gt(actual, v)
                })
            })
            .cloned()
            .collect();

        documents.sort_by(|a, b| {
            for (field, order) in &filters.order_by {
                let null = Value::Null;
                let av = a.get(field).unwrap_or(&null);
                let bv = b.get(field).unwrap_or(&null);
                let ord = av
                    .as_f64()
                    .partial_cmp(&bv.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| av.as_str().unwrap_or("").cmp(bv.as_str().unwrap_or("")));
                let ord = match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });

        let total = documents.len() as u64;
        let offset = filters.offset.unwrap_or(0) as usize;
        let documents: Vec<Value> = documents
            .into_iter()
            .skip(offset)
            .take(filters.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .collect();
        Ok(DocumentPage { documents, total })
    }

    async fn update_document(&self, id: &str, partial: Value) -> Result<Value> {
        let mut inner = self.lock();
        Self::check_available(&mut inner)?;
        Self::check_writable(&inner, id)?;
        let Some(doc) = inner.docs.get_mut(id) else {
            return Err(SyncError::RemoteRejected {
                status: 404,
                message: format!("document {id:?} not found"),
            });
        };
        if let (Some(doc), Some(partial)) = (doc.as_object_mut(), partial.as_object()) {
            for (k, v) in partial {
                doc.insert(k.clone(), v.clone());
            }
        }
        Ok(inner.docs[id].clone())
    }

    async fn changes_since(
        &self,
        checkpoint: Option<&Checkpoint>,
        limit: u32,
    ) -> Result<ChangeBatch> {
        let mut inner = self.lock();
        Self::check_available(&mut inner)?;

        let after = checkpoint.map(cursor_parts);
        let mut changed: Vec<Value> = inner.docs.values().cloned().collect();
        changed.sort_by(|a, b| {
            (updated_at(a), a["id"].as_str().unwrap_or(""))
                .cmp(&(updated_at(b), b["id"].as_str().unwrap_or("")))
        });

        let documents: Vec<Value> = changed
            .into_iter()
            .filter(|doc| match &after {
                Some((at, id)) => {
                    let key = (updated_at(doc), doc["id"].as_str().unwrap_or("").to_string());
                    key > (*at, id.clone())
                }
                None => true,
            })
            .take(limit as usize)
            .collect();

        let checkpoint = documents.last().map(|doc| {
            cursor(updated_at(doc), doc["id"].as_str().unwrap_or(""))
        });
        Ok(ChangeBatch { documents, checkpoint })
    }
}
