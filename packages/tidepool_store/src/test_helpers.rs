use serde_json::{Value, json};

use crate::config::StoreConfig;
use crate::schema::{CollectionSchema, FieldDef, SchemaSet};
use crate::store::Store;

/// Chat-shaped schema set used across the crate's tests.
pub(crate) fn test_schemas() -> SchemaSet {
    SchemaSet::new(1)
        .collection(
            CollectionSchema::new("threads", "id")
                .field(FieldDef::string("id").required().max_length(36))
                .field(FieldDef::string("title").required())
                .field(FieldDef::string("visibility").one_of(&["private", "public"]))
                .field(FieldDef::integer("createdAt").required())
                .field(FieldDef::integer("updatedAt"))
                .field(FieldDef::integer("lastMessageAt").indexed())
                .field(FieldDef::boolean("deleted")),
        )
        .collection(
            CollectionSchema::new("messages", "id")
                .field(FieldDef::string("id").required().max_length(36))
                .field(FieldDef::string("threadId").required().max_length(36).indexed())
                .field(FieldDef::string("role").one_of(&["user", "assistant", "system", "data"]))
                .field(FieldDef::string("content"))
                .field(FieldDef::integer("createdAt").required().indexed())
                .field(FieldDef::integer("updatedAt"))
                .field(FieldDef::boolean("deleted"))
                .compound_index(&["threadId", "createdAt"]),
        )
}

/// Fresh store backed by an in-memory SQLite database. A single connection
/// keeps the database alive for the lifetime of the pool.
pub(crate) async fn memory_store() -> Store {
    Store::open(StoreConfig::in_memory(), test_schemas())
        .await
        .expect("failed to open in-memory store")
}

pub(crate) fn thread_doc(id: &str, updated_at: i64) -> Value {
    json!({
        "id": id,
        "title": "New Chat",
        "visibility": "private",
        "createdAt": updated_at,
        "updatedAt": updated_at,
        "lastMessageAt": updated_at,
        "deleted": false,
    })
}

pub(crate) fn message_doc(id: &str, thread_id: &str, created_at: i64) -> Value {
    json!({
        "id": id,
        "threadId": thread_id,
        "role": "user",
        "content": format!("message {id}"),
        "createdAt": created_at,
        "updatedAt": created_at,
        "deleted": false,
    })
}
