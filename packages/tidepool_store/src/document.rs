//! Helpers over the raw JSON document representation.

use serde_json::Value;

/// A document row read back from the store, together with the monotonic write
/// watermark assigned when it was last written. The watermark is what the
/// push side of replication scans by, and what live queries fingerprint on.
#[derive(Clone, Debug)]
pub struct StoredDocument {
    pub doc: Value,
    pub local_seq: i64,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn doc_id<'a>(doc: &'a Value, primary_key: &str) -> Option<&'a str> {
    doc.get(primary_key).and_then(Value::as_str)
}

pub(crate) fn doc_updated_at(doc: &Value) -> i64 {
    doc.get("updatedAt").and_then(Value::as_i64).unwrap_or(0)
}

pub(crate) fn doc_deleted(doc: &Value) -> bool {
    doc.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

/// Shallow merge: only fields present in `partial` are written into `base`.
/// A `null` in the patch clears the field.
pub(crate) fn merge_patch(base: &mut Value, partial: &Value) {
    if let (Some(base), Some(partial)) = (base.as_object_mut(), partial.as_object()) {
        for (k, v) in partial {
            if v.is_null() {
                base.remove(k);
            } else {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Extracted-column representation of a field value for SQL binding.
#[derive(Clone, Debug)]
pub(crate) enum ColumnValue {
    Text(String),
    Int(i64),
    Null,
}

pub(crate) fn column_value(value: Option<&Value>) -> ColumnValue {
    match value {
        None | Some(Value::Null) => ColumnValue::Null,
        Some(Value::String(s)) => ColumnValue::Text(s.clone()),
        Some(Value::Bool(b)) => ColumnValue::Int(*b as i64),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => ColumnValue::Int(i),
            None => ColumnValue::Text(n.to_string()),
        },
        // Arrays and objects are never sensible index keys; store their JSON
        // so the column is at least stable.
        Some(other) => ColumnValue::Text(other.to_string()),
    }
}
