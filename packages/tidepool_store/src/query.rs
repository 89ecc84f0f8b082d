//! Declarative queries: selector predicate tree, sort spec, limit.
//!
//! Evaluation strategy: conditions on extracted (indexed) columns are pushed
//! down to SQL as a coarse pre-filter, then the *full* predicate tree is
//! re-checked in Rust against the decoded document, and sorting always
//! happens in Rust with a primary-key tiebreak. Correctness never depends on
//! pushdown; a selector over an unindexed field degrades to a collection
//! scan filtered in Rust (cost documented in DESIGN.md).

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{ColumnValue, StoredDocument, column_value, doc_deleted, doc_id};
use crate::schema::CollectionSchema;

#[derive(Clone, Debug)]
pub enum Selector {
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Eq(String, Value),
    In(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Substring match on string fields.
    Contains(String, String),
}

impl Selector {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Eq(field.into(), value.into())
    }

    pub fn any_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Selector::In(field.into(), values)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Lte(field.into(), value.into())
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Selector::Contains(field.into(), needle.into())
    }

    pub fn and(selectors: Vec<Selector>) -> Self {
        Selector::And(selectors)
    }

    pub fn or(selectors: Vec<Selector>) -> Self {
        Selector::Or(selectors)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Selector::And(subs) => subs.iter().all(|s| s.matches(doc)),
            Selector::Or(subs) => subs.iter().any(|s| s.matches(doc)),
            Selector::Eq(field, expected) => {
                let actual = doc.get(field).unwrap_or(&Value::Null);
                values_equal(actual, expected)
            }
            Selector::In(field, set) => {
                let actual = doc.get(field).unwrap_or(&Value::Null);
                set.iter().any(|v| values_equal(actual, v))
            }
            Selector::Gt(field, bound) => compare_field(doc, field, bound)
                .map(|o| o == Ordering::Greater)
                .unwrap_or(false),
            Selector::Gte(field, bound) => compare_field(doc, field, bound)
                .map(|o| o != Ordering::Less)
                .unwrap_or(false),
            Selector::Lt(field, bound) => compare_field(doc, field, bound)
                .map(|o| o == Ordering::Less)
                .unwrap_or(false),
            Selector::Lte(field, bound) => compare_field(doc, field, bound)
                .map(|o| o != Ordering::Greater)
                .unwrap_or(false),
            Selector::Contains(field, needle) => doc
                .get(field)
                .and_then(Value::as_str)
                .map(|s| s.contains(needle.as_str()))
                .unwrap_or(false),
        }
    }

    fn references(&self, field: &str) -> bool {
        match self {
            Selector::And(subs) | Selector::Or(subs) => subs.iter().any(|s| s.references(field)),
            Selector::Eq(f, _)
            | Selector::In(f, _)
            | Selector::Gt(f, _)
            | Selector::Gte(f, _)
            | Selector::Lt(f, _)
            | Selector::Lte(f, _)
            | Selector::Contains(f, _) => f == field,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Clone, Debug)]
pub struct Query {
    pub collection: String,
    pub selector: Option<Selector>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<usize>,
    pub include_deleted: bool,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            selector: None,
            sort: Vec::new(),
            limit: None,
            include_deleted: false,
        }
    }

    pub fn filter(mut self, selector: Selector) -> Self {
        self.selector = Some(match self.selector.take() {
            Some(existing) => Selector::And(vec![existing, selector]),
            None => selector,
        });
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Soft-deleted documents are visible only when asked for, either via the
    /// flag or by a selector that mentions `deleted` explicitly.
    pub(crate) fn wants_deleted(&self) -> bool {
        self.include_deleted
            || self
                .selector
                .as_ref()
                .map(|s| s.references("deleted"))
                .unwrap_or(false)
    }

    pub(crate) fn matches_doc(&self, doc: &Value) -> bool {
        if !self.wants_deleted() && doc_deleted(doc) {
            return false;
        }
        self.selector.as_ref().map(|s| s.matches(doc)).unwrap_or(true)
    }

    /// Sort + tiebreak + limit, applied in Rust over matching rows.
    pub(crate) fn finish(&self, mut docs: Vec<StoredDocument>, primary_key: &str) -> Vec<StoredDocument> {
        docs.sort_by(|a, b| self.doc_order(&a.doc, &b.doc, primary_key));
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }

    fn doc_order(&self, a: &Value, b: &Value, primary_key: &str) -> Ordering {
        for spec in &self.sort {
            let av = a.get(&spec.field).unwrap_or(&Value::Null);
            let bv = b.get(&spec.field).unwrap_or(&Value::Null);
            let mut ord = order_values(av, bv);
            if spec.direction == SortDirection::Desc {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        // Tie broken by primary key ascending: ordering is a total order.
        doc_id(a, primary_key).cmp(&doc_id(b, primary_key))
    }

    /// Best-effort SQL pre-filter from the top-level conjunction. Leaves that
    /// are not simple conditions on extracted columns are skipped here and
    /// caught by the Rust-side re-check.
    pub(crate) fn pushdown(&self, schema: &CollectionSchema) -> (Vec<String>, Vec<ColumnValue>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if !self.wants_deleted() {
            clauses.push("deleted = 0".to_string());
        }

        let mut leaves = Vec::new();
        if let Some(selector) = &self.selector {
            flatten_conjunction(selector, &mut leaves);
        }
        for leaf in leaves {
            let (field, op, value) = match leaf {
                Selector::Eq(f, v) => (f, "=", v),
                Selector::Gt(f, v) => (f, ">", v),
                Selector::Gte(f, v) => (f, ">=", v),
                Selector::Lt(f, v) => (f, "<", v),
                Selector::Lte(f, v) => (f, "<=", v),
                Selector::In(f, set) => {
                    if schema.is_extracted(f) && !set.is_empty() {
                        let marks = vec!["?"; set.len()].join(", ");
                        clauses.push(format!("{} IN ({})", schema.column_for(f), marks));
                        binds.extend(set.iter().map(|v| column_value(Some(v))));
                    }
                    continue;
                }
                _ => continue,
            };
            if schema.is_extracted(field) {
                clauses.push(format!("{} {} ?", schema.column_for(field), op));
                binds.push(column_value(Some(value)));
            }
        }

        (clauses, binds)
    }
}

fn flatten_conjunction<'a>(selector: &'a Selector, out: &mut Vec<&'a Selector>) {
    match selector {
        Selector::And(subs) => {
            for s in subs {
                flatten_conjunction(s, out);
            }
        }
        leaf => out.push(leaf),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_field(doc: &Value, field: &str, bound: &Value) -> Option<Ordering> {
    let actual = doc.get(field)?;
    match (actual, bound) {
        (Value::Number(_), Value::Number(_)) => actual.as_f64()?.partial_cmp(&bound.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// Total order over JSON values for sorting: null < bool < number < string
/// < array < object, with structural values falling back to their JSON text.
pub(crate) fn order_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionSchema, FieldDef};
    use serde_json::json;

    fn message_schema() -> CollectionSchema {
        CollectionSchema::new("messages", "id")
            .field(FieldDef::string("id").required())
            .field(FieldDef::string("threadId").indexed())
            .field(FieldDef::integer("createdAt").indexed())
            .field(FieldDef::string("content"))
    }

    #[test]
    fn selector_matching() {
        let doc = json!({"id": "m1", "threadId": "t1", "createdAt": 10, "content": "hello world"});
        assert!(Selector::eq("threadId", "t1").matches(&doc));
        assert!(!Selector::eq("threadId", "t2").matches(&doc));
        assert!(Selector::gt("createdAt", 5).matches(&doc));
        assert!(!Selector::gt("createdAt", 10).matches(&doc));
        assert!(Selector::gte("createdAt", 10).matches(&doc));
        assert!(Selector::contains("content", "world").matches(&doc));
        assert!(Selector::any_of("threadId", vec![json!("t1"), json!("t9")]).matches(&doc));
        assert!(
            Selector::or(vec![
                Selector::eq("threadId", "nope"),
                Selector::lt("createdAt", 99),
            ])
            .matches(&doc)
        );
    }

    #[test]
    fn comparison_on_missing_or_mismatched_field_is_false() {
        let doc = json!({"id": "m1", "createdAt": "not a number"});
        assert!(!Selector::gt("createdAt", 5).matches(&doc));
        assert!(!Selector::lt("missing", 5).matches(&doc));
    }

    #[test]
    fn deleted_hidden_unless_requested() {
        let live = json!({"id": "a"});
        let gone = json!({"id": "b", "deleted": true});
        let q = Query::new("messages");
        assert!(q.matches_doc(&live));
        assert!(!q.matches_doc(&gone));

        let q = Query::new("messages").include_deleted();
        assert!(q.matches_doc(&gone));

        // Mentioning `deleted` in the selector opts in too.
        let q = Query::new("messages").filter(Selector::eq("deleted", true));
        assert!(q.matches_doc(&gone));
        assert!(!q.matches_doc(&live));
    }

    #[test]
    fn sort_with_primary_key_tiebreak() {
        let docs = vec![
            StoredDocument { doc: json!({"id": "b", "createdAt": 5}), local_seq: 2 },
            StoredDocument { doc: json!({"id": "a", "createdAt": 5}), local_seq: 1 },
            StoredDocument { doc: json!({"id": "c", "createdAt": 1}), local_seq: 3 },
        ];
        let q = Query::new("messages").sort_by("createdAt", SortDirection::Asc);
        let sorted = q.finish(docs, "id");
        let ids: Vec<_> = sorted
            .iter()
            .map(|d| d.doc["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn limit_applies_after_sort() {
        let docs = vec![
            StoredDocument { doc: json!({"id": "a", "createdAt": 3}), local_seq: 1 },
            StoredDocument { doc: json!({"id": "b", "createdAt": 1}), local_seq: 2 },
            StoredDocument { doc: json!({"id": "c", "createdAt": 2}), local_seq: 3 },
        ];
        let q = Query::new("messages")
            .sort_by("createdAt", SortDirection::Desc)
            .limit(2);
        let sorted = q.finish(docs, "id");
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].doc["id"], "a");
        assert_eq!(sorted[1].doc["id"], "c");
    }

    #[test]
    fn pushdown_covers_extracted_fields_only() {
        let schema = message_schema();
        let q = Query::new("messages")
            .filter(Selector::eq("threadId", "t1"))
            .filter(Selector::gte("createdAt", 10))
            .filter(Selector::contains("content", "x"));
        let (clauses, binds) = q.pushdown(&schema);
        assert_eq!(
            clauses,
            vec!["deleted = 0", "thread_id = ?", "created_at >= ?"]
        );
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn pushdown_in_list() {
        let schema = message_schema();
        let q = Query::new("messages")
            .include_deleted()
            .filter(Selector::any_of("threadId", vec![json!("a"), json!("b")]));
        let (clauses, binds) = q.pushdown(&schema);
        assert_eq!(clauses, vec!["thread_id IN (?, ?)"]);
        assert_eq!(binds.len(), 2);
    }
}
