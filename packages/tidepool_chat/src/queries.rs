//! The query facade the UI consumes: typed operations over the generic
//! store, one method per screen-level need.

use serde_json::json;
use tidepool_store::{Query, Result, Selector, SortDirection, Store, StoreConfig, Subscription};
use tracing::info;

use crate::schema::{MESSAGE_SUMMARIES, MESSAGES, THREADS, chat_schemas};
use crate::types::{ChatMessage, MessageSummary, Thread, from_doc, to_doc};

/// Chat database handle. Cheap to clone; wraps a [`Store`] opened with the
/// chat schema set.
#[derive(Clone)]
pub struct ChatDb {
    store: Store,
}

impl ChatDb {
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let store = Store::open(config, chat_schemas()).await?;
        Ok(Self { store })
    }

    /// Wrap an already-open store. The store must have been opened with
    /// [`chat_schemas`].
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// All active threads, most recently active first.
    pub async fn get_threads(&self) -> Result<Vec<Thread>> {
        let query = Query::new(THREADS).sort_by("lastMessageAt", SortDirection::Desc);
        self.store
            .find(&query)
            .await?
            .into_iter()
            .map(from_doc)
            .collect()
    }

    pub async fn create_thread(&self, id: &str) -> Result<Thread> {
        let thread = Thread::new(id);
        self.store.insert(THREADS, to_doc(&thread)?).await?;
        info!(thread_id = id, "created thread");
        Ok(thread)
    }

    pub async fn rename_thread(&self, id: &str, title: &str) -> Result<Thread> {
        let doc = self
            .store
            .patch(THREADS, id, json!({"title": title}))
            .await?;
        from_doc(doc)
    }

    /// Mark a thread deleted without removing it; the tombstone propagates
    /// through replication.
    pub async fn tombstone_thread(&self, id: &str) -> Result<Thread> {
        let doc = self
            .store
            .patch(THREADS, id, json!({"deleted": true}))
            .await?;
        from_doc(doc)
    }

    /// Physically purge a thread and everything hanging off it: messages,
    /// summaries, then the thread row itself.
    pub async fn delete_thread(&self, id: &str) -> Result<()> {
        self.store
            .remove_where(MESSAGES, Selector::eq("threadId", id))
            .await?;
        self.store
            .remove_where(MESSAGE_SUMMARIES, Selector::eq("threadId", id))
            .await?;
        self.store.remove(THREADS, id).await?;
        info!(thread_id = id, "purged thread");
        Ok(())
    }

    pub async fn delete_all_threads(&self) -> Result<()> {
        for collection in [MESSAGES, MESSAGE_SUMMARIES, THREADS] {
            // An empty conjunction matches every document.
            self.store
                .remove_where(collection, Selector::and(Vec::new()))
                .await?;
        }
        info!("purged all threads");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    fn messages_query(thread_id: &str) -> Query {
        Query::new(MESSAGES)
            .filter(Selector::eq("threadId", thread_id))
            .sort_by("createdAt", SortDirection::Asc)
    }

    pub async fn messages_by_thread(&self, thread_id: &str) -> Result<Vec<ChatMessage>> {
        self.store
            .find(&Self::messages_query(thread_id))
            .await?
            .into_iter()
            .map(from_doc)
            .collect()
    }

    /// Insert a message and bump its thread's `lastMessageAt` to the
    /// message's timestamp.
    pub async fn create_message(&self, message: ChatMessage) -> Result<ChatMessage> {
        self.store.insert(MESSAGES, to_doc(&message)?).await?;
        self.store
            .patch(
                THREADS,
                &message.thread_id,
                json!({"lastMessageAt": message.created_at}),
            )
            .await?;
        Ok(message)
    }

    /// Remove messages at or after the cut point (used when regenerating a
    /// response), along with their summaries. Returns how many messages went.
    pub async fn delete_trailing_messages(
        &self,
        thread_id: &str,
        created_at: i64,
        inclusive: bool,
    ) -> Result<u64> {
        let cut = if inclusive {
            Selector::gte("createdAt", created_at)
        } else {
            Selector::gt("createdAt", created_at)
        };
        let selector = Selector::and(vec![Selector::eq("threadId", thread_id), cut]);

        let query = Query::new(MESSAGES).include_deleted().filter(selector.clone());
        let ids: Vec<serde_json::Value> = self
            .store
            .find(&query)
            .await?
            .into_iter()
            .filter_map(|d| d.get("id").cloned())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self.store.remove_where(MESSAGES, selector).await?;
        self.store
            .remove_where(MESSAGE_SUMMARIES, Selector::any_of("messageId", ids))
            .await?;
        Ok(removed)
    }

    /// Live view over a thread's messages, oldest first.
    pub async fn watch_messages(&self, thread_id: &str) -> Result<MessageFeed> {
        let sub = self.store.subscribe(Self::messages_query(thread_id)).await?;
        Ok(MessageFeed { sub })
    }

    // ------------------------------------------------------------------
    // Summaries
    // ------------------------------------------------------------------

    pub async fn create_summary(
        &self,
        thread_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<MessageSummary> {
        let summary = MessageSummary::new(thread_id, message_id, content);
        self.store
            .insert(MESSAGE_SUMMARIES, to_doc(&summary)?)
            .await?;
        Ok(summary)
    }

    pub async fn summaries_by_thread(&self, thread_id: &str) -> Result<Vec<MessageSummary>> {
        let query = Query::new(MESSAGE_SUMMARIES)
            .filter(Selector::eq("threadId", thread_id))
            .sort_by("createdAt", SortDirection::Asc);
        self.store
            .find(&query)
            .await?
            .into_iter()
            .map(from_doc)
            .collect()
    }
}

/// Typed wrapper around a live messages subscription.
pub struct MessageFeed {
    sub: Subscription,
}

impl MessageFeed {
    pub fn initial(&self) -> Result<Vec<ChatMessage>> {
        self.sub.initial().iter().cloned().map(from_doc).collect()
    }

    pub async fn next(&mut self) -> Option<Result<Vec<ChatMessage>>> {
        let snapshot = self.sub.next().await?;
        Some(snapshot.into_iter().map(from_doc).collect())
    }

    pub fn cancel(&self) {
        self.sub.cancel();
    }
}
