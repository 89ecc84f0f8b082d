//! # Tidepool Chat
//!
//! The chat domain over [`tidepool_store`]: typed documents for threads,
//! messages, and message summaries, the schemas that validate them, and the
//! query facade the UI consumes.
//!
//! ```rust,no_run
//! use tidepool_chat::{ChatDb, ChatMessage, Role};
//! use tidepool_store::StoreConfig;
//!
//! # async fn demo() -> tidepool_store::Result<()> {
//! let db = ChatDb::open(StoreConfig::at_path("chat.db")).await?;
//! let thread = db.create_thread("T1").await?;
//! db.create_message(ChatMessage::new(&thread.id, Role::User, "hello")).await?;
//! for msg in db.messages_by_thread(&thread.id).await? {
//!     println!("{}: {}", msg.id, msg.content);
//! }
//! # Ok(())
//! # }
//! ```

pub mod queries;
pub mod schema;
pub mod types;

pub use queries::{ChatDb, MessageFeed};
pub use schema::{CHAT_SCHEMA_VERSION, MESSAGE_SUMMARIES, MESSAGES, THREADS, chat_schemas};
pub use types::{ChatMessage, MessagePart, MessageSummary, Role, Thread, Visibility};
