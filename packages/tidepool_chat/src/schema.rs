//! The chat collections, expressed as store schemas.

use tidepool_store::{CollectionSchema, FieldDef, SchemaSet};

/// Bump when any collection definition below changes; the store refuses to
/// open databases written by a newer version.
pub const CHAT_SCHEMA_VERSION: i64 = 1;

pub const THREADS: &str = "threads";
pub const MESSAGES: &str = "messages";
pub const MESSAGE_SUMMARIES: &str = "messageSummaries";

pub fn chat_schemas() -> SchemaSet {
    SchemaSet::new(CHAT_SCHEMA_VERSION)
        .collection(
            CollectionSchema::new(THREADS, "id")
                .field(FieldDef::string("id").required().max_length(36))
                .field(FieldDef::string("title").required())
                .field(FieldDef::integer("createdAt").required())
                .field(FieldDef::integer("updatedAt").required())
                .field(FieldDef::integer("lastMessageAt").required().indexed())
                .field(FieldDef::string("visibility").one_of(&["private", "public"]))
                .field(FieldDef::string("lastModifiedBy"))
                .field(FieldDef::boolean("deleted")),
        )
        .collection(
            CollectionSchema::new(MESSAGES, "id")
                .field(FieldDef::string("id").required().max_length(36))
                .field(FieldDef::string("threadId").required().max_length(36).indexed())
                .field(
                    FieldDef::string("role")
                        .required()
                        .one_of(&["user", "assistant", "system", "data"]),
                )
                .field(FieldDef::string("content"))
                .field(FieldDef::array("parts"))
                .field(FieldDef::integer("createdAt").required().indexed())
                .field(FieldDef::integer("updatedAt").required())
                .field(FieldDef::boolean("deleted"))
                .compound_index(&["threadId", "createdAt"]),
        )
        .collection(
            CollectionSchema::new(MESSAGE_SUMMARIES, "id")
                .field(FieldDef::string("id").required().max_length(36))
                .field(FieldDef::string("threadId").required().max_length(36).indexed())
                .field(FieldDef::string("messageId").required().max_length(36).indexed())
                .field(FieldDef::string("content").required())
                .field(FieldDef::integer("createdAt").required().indexed())
                .field(FieldDef::integer("updatedAt").required())
                .field(FieldDef::boolean("deleted"))
                .compound_index(&["threadId", "createdAt"]),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::to_value;

    use crate::types::{ChatMessage, MessageSummary, Role, Thread};

    #[test]
    fn typed_documents_satisfy_their_schemas() {
        let schemas = chat_schemas();

        let thread = to_value(Thread::new("t1")).unwrap();
        schemas.get(THREADS).unwrap().validate(&thread).unwrap();

        let msg = to_value(ChatMessage::new("t1", Role::User, "hi")).unwrap();
        schemas.get(MESSAGES).unwrap().validate(&msg).unwrap();

        let summary = to_value(MessageSummary::new("t1", "m1", "sum")).unwrap();
        schemas
            .get(MESSAGE_SUMMARIES)
            .unwrap()
            .validate(&summary)
            .unwrap();
    }

    #[test]
    fn bad_role_is_rejected() {
        let schemas = chat_schemas();
        let mut msg = to_value(ChatMessage::new("t1", Role::User, "hi")).unwrap();
        msg["role"] = "robot".into();
        assert!(schemas.get(MESSAGES).unwrap().validate(&msg).is_err());
    }
}
