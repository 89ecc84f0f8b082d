//! Schema registry: per-collection definitions used to validate documents on
//! write and to derive the extracted SQL columns and indexes.
//!
//! Schemas are immutable once a [`crate::Store`] is opened: the whole
//! [`SchemaSet`] is moved into the store handle and no mutation API exists.
//! Changing a schema requires bumping [`SchemaSet::version`] and migrating;
//! opening a database persisted by a newer version fails with
//! `SchemaVersionMismatch`.

use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }
}

/// One declared field of a collection schema.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub indexed: bool,
    pub max_length: Option<usize>,
    /// Enum constraint: the string value must be one of these.
    pub allowed: Option<Vec<String>>,
}

impl FieldDef {
    fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            indexed: false,
            max_length: None,
            allowed: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Array)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Object)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            // Null is treated as absent; required-ness is checked separately.
            return Ok(());
        }
        if !self.field_type.matches(value) {
            return Err(format!(
                "field {:?} must be of type {}",
                self.name,
                self.field_type.name()
            ));
        }
        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            if s.chars().count() > max {
                return Err(format!("field {:?} exceeds max length {}", self.name, max));
            }
        }
        if let (Some(allowed), Some(s)) = (&self.allowed, value.as_str()) {
            if !allowed.iter().any(|a| a == s) {
                return Err(format!(
                    "field {:?} must be one of {:?}, got {:?}",
                    self.name, allowed, s
                ));
            }
        }
        Ok(())
    }
}

/// Schema for one collection: primary key, field constraints, and the
/// single-field / compound indexes the store builds over extracted columns.
#[derive(Clone, Debug)]
pub struct CollectionSchema {
    pub name: String,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
    pub compound_indexes: Vec<Vec<String>>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            fields: Vec::new(),
            compound_indexes: Vec::new(),
        }
    }

    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    pub fn compound_index(mut self, fields: &[&str]) -> Self {
        self.compound_indexes
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a full document against this schema. Used for inserts, for
    /// the merged result of a patch, and for documents applied from remote;
    /// every mutation path funnels through here.
    pub fn validate(&self, doc: &Value) -> Result<(), String> {
        let obj = doc
            .as_object()
            .ok_or_else(|| "document must be a JSON object".to_string())?;

        let pk = obj.get(&self.primary_key).unwrap_or(&Value::Null);
        let pk_str = pk
            .as_str()
            .ok_or_else(|| format!("primary key {:?} must be a string", self.primary_key))?;
        if pk_str.is_empty() {
            return Err(format!("primary key {:?} must not be empty", self.primary_key));
        }
        if let Some(def) = self.field_def(&self.primary_key) {
            def.check(pk)?;
        }

        for def in &self.fields {
            match obj.get(&def.name) {
                Some(value) if !value.is_null() => def.check(value)?,
                _ if def.required => {
                    return Err(format!("missing required field {:?}", def.name));
                }
                _ => {}
            }
        }
        // Undeclared fields pass through untouched; the remote side may carry
        // metadata this client does not know about.
        Ok(())
    }

    /// Fields persisted to their own SQL column, beyond the fixed meta
    /// columns (`id`, `updated_at`, `deleted`).
    pub(crate) fn extracted_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| {
            f.indexed && f.name != self.primary_key && f.name != "updatedAt" && f.name != "deleted"
        })
    }

    /// Whether a selector or sort on this field can be answered from a SQL
    /// column. Anything else falls back to a scan filtered in Rust.
    pub(crate) fn is_extracted(&self, field: &str) -> bool {
        field == self.primary_key
            || field == "updatedAt"
            || field == "deleted"
            || self
                .fields
                .iter()
                .any(|f| f.indexed && f.name == field)
    }

    /// SQL column name for a document field.
    pub(crate) fn column_for(&self, field: &str) -> String {
        if field == self.primary_key {
            "id".to_string()
        } else {
            camel_to_snake(field)
        }
    }
}

/// The immutable set of schemas a store is opened with.
#[derive(Clone, Debug)]
pub struct SchemaSet {
    pub version: i64,
    collections: Vec<CollectionSchema>,
}

impl SchemaSet {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            collections: Vec::new(),
        }
    }

    pub fn collection(mut self, schema: CollectionSchema) -> Self {
        self.collections.push(schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.iter()
    }
}

/// `threadId` -> `thread_id`. Deterministic, used for both DDL and query
/// pushdown so the two can never disagree.
pub(crate) fn camel_to_snake(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 4);
    for c in field.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::new("threads", "id")
            .field(FieldDef::string("id").required().max_length(36))
            .field(FieldDef::string("title").required())
            .field(FieldDef::string("visibility").one_of(&["private", "public"]))
            .field(FieldDef::integer("createdAt").required().indexed())
            .field(FieldDef::boolean("deleted"))
    }

    #[test]
    fn accepts_valid_document() {
        let doc = json!({"id": "t1", "title": "New Chat", "createdAt": 1, "visibility": "private"});
        assert!(schema().validate(&doc).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let doc = json!({"id": "t1", "createdAt": 1});
        let err = schema().validate(&doc).unwrap_err();
        assert!(err.contains("title"), "{err}");
    }

    #[test]
    fn rejects_enum_violation() {
        let doc = json!({"id": "t1", "title": "x", "createdAt": 1, "visibility": "shared"});
        let err = schema().validate(&doc).unwrap_err();
        assert!(err.contains("visibility"), "{err}");
    }

    #[test]
    fn rejects_wrong_type_and_long_key() {
        let doc = json!({"id": "t1", "title": "x", "createdAt": "yesterday"});
        assert!(schema().validate(&doc).is_err());

        let doc = json!({"id": "x".repeat(37), "title": "x", "createdAt": 1});
        assert!(schema().validate(&doc).is_err());
    }

    #[test]
    fn null_counts_as_absent() {
        let doc = json!({"id": "t1", "title": null, "createdAt": 1});
        assert!(schema().validate(&doc).is_err());

        let doc = json!({"id": "t1", "title": "x", "createdAt": 1, "deleted": null});
        assert!(schema().validate(&doc).is_ok());
    }

    #[test]
    fn column_names() {
        let s = schema();
        assert_eq!(s.column_for("id"), "id");
        assert_eq!(s.column_for("createdAt"), "created_at");
        assert_eq!(camel_to_snake("threadId"), "thread_id");
        assert_eq!(camel_to_snake("deleted"), "deleted");
    }

    #[test]
    fn extracted_fields_skip_meta_columns() {
        let s = CollectionSchema::new("messages", "id")
            .field(FieldDef::string("id").required())
            .field(FieldDef::string("threadId").indexed())
            .field(FieldDef::integer("createdAt").indexed())
            .field(FieldDef::boolean("deleted").indexed());
        let cols: Vec<_> = s.extracted_fields().map(|f| f.name.clone()).collect();
        assert_eq!(cols, vec!["threadId", "createdAt"]);
        assert!(s.is_extracted("deleted"));
        assert!(!s.is_extracted("content"));
    }
}
