//! The store handle: open/close lifecycle, validated CRUD, query evaluation,
//! and the replication support surface (pull-batch apply, push scan,
//! persisted checkpoints, quarantine).
//!
//! All mutation paths, direct consumer writes and replication pulls alike,
//! funnel
//! through the same validation and post-commit notification path, so no
//! caller can bypass schema checks or desynchronize live queries.

use std::sync::Arc;

use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::document::{
    ColumnValue, StoredDocument, column_value, doc_deleted, doc_id, doc_updated_at, merge_patch,
    now_ms,
};
use crate::error::{Result, StoreError};
use crate::live::{LiveRegistry, Subscription};
use crate::query::Query;
use crate::schema::{CollectionSchema, FieldType, SchemaSet};

const ORIGIN_LOCAL: i64 = 0;
const ORIGIN_REMOTE: i64 = 1;

/// Identity of one replication instance, keying its persisted checkpoint and
/// push cursor. Survives process restart.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReplicationKey {
    pub local_collection: String,
    pub remote_collection: String,
    pub identifier: String,
}

/// Persisted replication metadata for one [`ReplicationKey`].
#[derive(Clone, Debug, Default)]
pub struct ReplicationState {
    /// Opaque cursor marking the last remote change applied.
    pub checkpoint: Option<Value>,
    /// Highest `local_seq` acknowledged by the remote.
    pub push_seq: i64,
}

/// Result of applying one pull batch.
#[derive(Debug, Default)]
pub struct PullOutcome {
    /// Ids upserted from the remote version.
    pub applied: Vec<String>,
    /// Ids where the local document won the last-writer-wins comparison.
    pub kept_local: Vec<String>,
}

/// Process-wide handle to the local document store. Cheap to clone (all
/// clones share one connection pool); constructed once at startup and passed
/// to every consumer.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    schemas: Arc<SchemaSet>,
    live: Arc<LiveRegistry>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store and run migrations. Idempotent: re-opening
    /// the same path yields an equivalent handle, all DDL is `IF NOT EXISTS`.
    pub async fn open(config: StoreConfig, schemas: SchemaSet) -> Result<Self> {
        info!(path = %config.path, "opening document store");
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .connect(&config.db_url())
            .await
            .map_err(StoreError::StorageUnavailable)?;

        for pragma in [
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
            "PRAGMA foreign_keys = ON",
        ] {
            sqlx::query(pragma).execute(&pool).await?;
        }

        run_migrations(&pool, &schemas).await?;

        let schemas = Arc::new(schemas);
        let (live, notice_rx) = LiveRegistry::new();
        tokio::spawn(run_dispatcher(
            pool.clone(),
            schemas.clone(),
            Arc::downgrade(&live),
            notice_rx,
        ));

        Ok(Self { pool, schemas, live })
    }

    /// Close the underlying pool. Idempotent; in-flight operations fail with
    /// `StorageUnavailable` afterwards.
    pub async fn close(&self) {
        info!("closing document store");
        self.pool.close().await;
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    fn schema(&self, collection: &str) -> Result<&CollectionSchema> {
        self.schemas
            .get(collection)
            .ok_or_else(|| StoreError::SchemaValidation {
                collection: collection.to_string(),
                reason: "unknown collection".to_string(),
            })
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Insert a new document. Fails on schema violations and duplicate keys;
    /// on success the document is visible to all live queries in the same
    /// tick.
    pub async fn insert(&self, collection: &str, doc: Value) -> Result<Value> {
        let schema = self.schema(collection)?;
        schema
            .validate(&doc)
            .map_err(|reason| StoreError::SchemaValidation {
                collection: collection.to_string(),
                reason,
            })?;
        let id = require_id(&doc, schema, collection)?;

        let mut tx = self.pool.begin().await?;
        let exists: Option<i64> =
            sqlx::query_scalar(&format!("SELECT 1 FROM \"{}\" WHERE id = ?", schema.name))
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_some() {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                id,
            });
        }
        let seq = next_seq(&mut tx).await?;
        write_row(&mut tx, schema, &doc, seq, ORIGIN_LOCAL, false).await?;
        tx.commit().await?;

        debug!(collection, id = %id, seq, "inserted document");
        self.live.notify(collection);
        Ok(doc)
    }

    /// Point lookup by primary key. Returns soft-deleted documents too.
    pub async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let schema = self.schema(collection)?;
        let row: Option<String> =
            sqlx::query_scalar(&format!("SELECT doc FROM \"{}\" WHERE id = ?", schema.name))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(Into::into)
    }

    /// Merge only the supplied fields into an existing document, re-validate,
    /// and stamp `updatedAt` (never moving it backward). The primary key
    /// cannot be changed. Any push quarantine on the document is cleared.
    pub async fn patch(&self, collection: &str, id: &str, partial: Value) -> Result<Value> {
        let schema = self.schema(collection)?;
        if let Some(new_id) = partial.get(&schema.primary_key) {
            if new_id.as_str() != Some(id) {
                return Err(StoreError::SchemaValidation {
                    collection: collection.to_string(),
                    reason: format!("primary key {:?} is immutable", schema.primary_key),
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        let existing: Option<String> =
            sqlx::query_scalar(&format!("SELECT doc FROM \"{}\" WHERE id = ?", schema.name))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(existing) = existing else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        let mut doc: Value = serde_json::from_str(&existing)?;
        let prev_updated = doc_updated_at(&doc);
        merge_patch(&mut doc, &partial);

        let stamp = match partial.get("updatedAt").and_then(Value::as_i64) {
            Some(supplied) => supplied.max(prev_updated),
            None => now_ms().max(prev_updated),
        };
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("updatedAt".to_string(), Value::from(stamp));
        }

        schema
            .validate(&doc)
            .map_err(|reason| StoreError::SchemaValidation {
                collection: collection.to_string(),
                reason,
            })?;

        let seq = next_seq(&mut tx).await?;
        write_row(&mut tx, schema, &doc, seq, ORIGIN_LOCAL, true).await?;
        sqlx::query("DELETE FROM push_quarantine WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(collection, id, seq, "patched document");
        self.live.notify(collection);
        Ok(doc)
    }

    /// Physical removal by primary key; used for cascading cleanup. Does not
    /// propagate a tombstone; soft-delete is a field-level `patch`.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let schema = self.schema(collection)?;
        let result = sqlx::query(&format!("DELETE FROM \"{}\" WHERE id = ?", schema.name))
            .bind(id)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            debug!(collection, id, "removed document");
            self.live.notify(collection);
        }
        Ok(removed)
    }

    /// Physical removal of every document matching the selector (soft-deleted
    /// rows included). Returns the number removed.
    pub async fn remove_where(
        &self,
        collection: &str,
        selector: crate::query::Selector,
    ) -> Result<u64> {
        let schema = self.schema(collection)?;
        let query = Query::new(collection).include_deleted().filter(selector);
        let docs = eval_query(&self.pool, &self.schemas, &query).await?;
        if docs.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = docs
            .iter()
            .filter_map(|d| doc_id(&d.doc, &schema.primary_key).map(str::to_string))
            .collect();
        // SQLite caps bind parameters per statement (999 on older builds).
        let mut removed = 0u64;
        for chunk in ids.chunks(500) {
            let marks = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM \"{}\" WHERE id IN ({})", schema.name, marks);
            let mut q = sqlx::query(&sql);
            for id in chunk {
                q = q.bind(id);
            }
            removed += q.execute(&self.pool).await?.rows_affected();
        }
        if removed > 0 {
            debug!(collection, removed, "removed documents by selector");
            self.live.notify(collection);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// One-shot snapshot evaluation.
    pub async fn find(&self, query: &Query) -> Result<Vec<Value>> {
        let docs = eval_query(&self.pool, &self.schemas, query).await?;
        Ok(docs.into_iter().map(|d| d.doc).collect())
    }

    /// Live result set: initial snapshot plus a stream of updated snapshots.
    pub async fn subscribe(&self, query: Query) -> Result<Subscription> {
        let schema = self.schema(&query.collection)?;
        let primary_key = schema.primary_key.clone();
        let initial = eval_query(&self.pool, &self.schemas, &query).await?;
        Ok(self.live.register(query, initial, &primary_key))
    }

    // ------------------------------------------------------------------
    // Replication support
    // ------------------------------------------------------------------

    /// Apply a batch of pulled remote documents and the new checkpoint in one
    /// transaction. Per document: validate, then last-writer-wins by
    /// `updatedAt` against any existing row (ties keep local). The checkpoint
    /// never advances unless the whole batch commits.
    pub async fn apply_pull_batch(
        &self,
        key: &ReplicationKey,
        docs: &[Value],
        checkpoint: &Value,
    ) -> Result<PullOutcome> {
        let schema = self.schema(&key.local_collection)?;
        let mut outcome = PullOutcome::default();
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            schema
                .validate(doc)
                .map_err(|reason| StoreError::SchemaValidation {
                    collection: key.local_collection.clone(),
                    reason,
                })?;
            let id = require_id(doc, schema, &key.local_collection)?;
            let local_updated: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT updated_at FROM \"{}\" WHERE id = ?",
                schema.name
            ))
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

            match local_updated {
                Some(local) if local >= doc_updated_at(doc) => outcome.kept_local.push(id),
                _ => {
                    let seq = next_seq(&mut tx).await?;
                    write_row(&mut tx, schema, doc, seq, ORIGIN_REMOTE, true).await?;
                    outcome.applied.push(id);
                }
            }
        }

        save_checkpoint_tx(&mut tx, key, checkpoint).await?;
        tx.commit().await?;

        debug!(
            collection = %key.local_collection,
            applied = outcome.applied.len(),
            kept_local = outcome.kept_local.len(),
            "applied pull batch"
        );
        if !outcome.applied.is_empty() {
            self.live.notify(&key.local_collection);
        }
        Ok(outcome)
    }

    /// Local writes not yet acknowledged remote-side: ascending `local_seq`
    /// scan of locally-originated rows past the cursor, quarantined documents
    /// excluded.
    pub async fn pending_push(
        &self,
        collection: &str,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<StoredDocument>> {
        let schema = self.schema(collection)?;
        let sql = format!(
            "SELECT doc, local_seq FROM \"{}\" \
             WHERE origin = {ORIGIN_LOCAL} AND local_seq > ? \
               AND id NOT IN (SELECT doc_id FROM push_quarantine WHERE collection = ?) \
             ORDER BY local_seq ASC LIMIT ?",
            schema.name
        );
        let rows = sqlx::query(&sql)
            .bind(after_seq)
            .bind(collection)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let text: String = row.get("doc");
                Ok(StoredDocument {
                    doc: serde_json::from_str(&text)?,
                    local_seq: row.get("local_seq"),
                })
            })
            .collect()
    }

    pub async fn replication_state(&self, key: &ReplicationKey) -> Result<ReplicationState> {
        let row = sqlx::query(
            "SELECT checkpoint, push_seq FROM replication_state \
             WHERE local_collection = ? AND remote_collection = ? AND identifier = ?",
        )
        .bind(&key.local_collection)
        .bind(&key.remote_collection)
        .bind(&key.identifier)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let checkpoint: Option<String> = row.get("checkpoint");
                Ok(ReplicationState {
                    checkpoint: checkpoint.map(|c| serde_json::from_str(&c)).transpose()?,
                    push_seq: row.get("push_seq"),
                })
            }
            None => Ok(ReplicationState::default()),
        }
    }

    pub async fn save_checkpoint(&self, key: &ReplicationKey, checkpoint: &Value) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        save_checkpoint_tx(&mut tx, key, checkpoint).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record that the remote acknowledged everything up to `seq`. Monotonic:
    /// an older value never overwrites a newer one.
    pub async fn advance_push_seq(&self, key: &ReplicationKey, seq: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO replication_state \
                 (local_collection, remote_collection, identifier, checkpoint, push_seq) \
             VALUES (?, ?, ?, NULL, ?) \
             ON CONFLICT(local_collection, remote_collection, identifier) \
             DO UPDATE SET push_seq = MAX(push_seq, excluded.push_seq)",
        )
        .bind(&key.local_collection)
        .bind(&key.remote_collection)
        .bind(&key.identifier)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Exclude a document from further push attempts until the next local
    /// write touches it (any `patch` clears the quarantine row).
    pub async fn quarantine(
        &self,
        collection: &str,
        doc_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO push_quarantine (collection, doc_id, attempts, last_error, quarantined_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(collection, doc_id) DO UPDATE SET \
                 attempts = excluded.attempts, \
                 last_error = excluded.last_error, \
                 quarantined_at = excluded.quarantined_at",
        )
        .bind(collection)
        .bind(doc_id)
        .bind(attempts as i64)
        .bind(error)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn quarantined_ids(&self, collection: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT doc_id FROM push_quarantine WHERE collection = ? ORDER BY doc_id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

// ----------------------------------------------------------------------
// Migrations and row plumbing
// ----------------------------------------------------------------------

async fn run_migrations(pool: &SqlitePool, schemas: &SchemaSet) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    let persisted: Option<String> =
        sqlx::query_scalar("SELECT value FROM store_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;
    let persisted: i64 = persisted.and_then(|v| v.parse().ok()).unwrap_or(0);
    if persisted > schemas.version {
        return Err(StoreError::SchemaVersionMismatch {
            found: persisted,
            supported: schemas.version,
        });
    }
    if persisted < schemas.version {
        info!(from = persisted, to = schemas.version, "bumping schema version");
        sqlx::query(
            "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(schemas.version.to_string())
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS replication_state ( \
             local_collection TEXT NOT NULL, \
             remote_collection TEXT NOT NULL, \
             identifier TEXT NOT NULL, \
             checkpoint TEXT, \
             push_seq INTEGER NOT NULL DEFAULT 0, \
             PRIMARY KEY (local_collection, remote_collection, identifier) \
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS push_quarantine ( \
             collection TEXT NOT NULL, \
             doc_id TEXT NOT NULL, \
             attempts INTEGER NOT NULL, \
             last_error TEXT NOT NULL, \
             quarantined_at INTEGER NOT NULL, \
             PRIMARY KEY (collection, doc_id) \
         )",
    )
    .execute(pool)
    .await?;

    for schema in schemas.iter() {
        create_collection_table(pool, schema).await?;
    }
    Ok(())
}

async fn create_collection_table(pool: &SqlitePool, schema: &CollectionSchema) -> Result<()> {
    let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
    for field in schema.extracted_fields() {
        let sql_type = match field.field_type {
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            _ => "TEXT",
        };
        columns.push(format!("\"{}\" {}", schema.column_for(&field.name), sql_type));
    }
    columns.push("deleted INTEGER NOT NULL DEFAULT 0".to_string());
    columns.push("updated_at INTEGER NOT NULL DEFAULT 0".to_string());
    columns.push("local_seq INTEGER NOT NULL".to_string());
    columns.push("origin INTEGER NOT NULL DEFAULT 0".to_string());
    columns.push("doc TEXT NOT NULL".to_string());

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        schema.name,
        columns.join(", ")
    ))
    .execute(pool)
    .await?;

    for field in schema.extracted_fields() {
        let col = schema.column_for(&field.name);
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{table}_{col}\" ON \"{table}\" (\"{col}\")",
            table = schema.name,
        ))
        .execute(pool)
        .await?;
    }
    for compound in &schema.compound_indexes {
        let cols: Vec<String> = compound.iter().map(|f| schema.column_for(f)).collect();
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{table}_{name}\" ON \"{table}\" ({list})",
            table = schema.name,
            name = cols.join("_"),
            list = cols
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", "),
        ))
        .execute(pool)
        .await?;
    }
    // The push side scans by write watermark.
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS \"idx_{table}_local_seq\" ON \"{table}\" (local_seq)",
        table = schema.name,
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Allocate the next global write watermark. Lives in `store_meta` so it is
/// transactional with the row write that consumes it.
async fn next_seq(tx: &mut Transaction<'_, Sqlite>) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar(
        "INSERT INTO store_meta (key, value) VALUES ('write_seq', '1') \
         ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1 \
         RETURNING CAST(value AS INTEGER)",
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(seq)
}

fn require_id(doc: &Value, schema: &CollectionSchema, collection: &str) -> Result<String> {
    doc_id(doc, &schema.primary_key)
        .map(str::to_string)
        .ok_or_else(|| StoreError::SchemaValidation {
            collection: collection.to_string(),
            reason: format!("primary key {:?} must be a string", schema.primary_key),
        })
}

async fn write_row(
    tx: &mut Transaction<'_, Sqlite>,
    schema: &CollectionSchema,
    doc: &Value,
    seq: i64,
    origin: i64,
    replace: bool,
) -> Result<()> {
    let id = require_id(doc, schema, &schema.name)?;

    let mut columns = vec!["id".to_string()];
    let mut values = vec![ColumnValue::Text(id)];
    for field in schema.extracted_fields() {
        columns.push(format!("\"{}\"", schema.column_for(&field.name)));
        values.push(column_value(doc.get(&field.name)));
    }
    columns.extend(
        ["deleted", "updated_at", "local_seq", "origin", "doc"]
            .iter()
            .map(|c| c.to_string()),
    );
    values.push(ColumnValue::Int(doc_deleted(doc) as i64));
    values.push(ColumnValue::Int(doc_updated_at(doc)));
    values.push(ColumnValue::Int(seq));
    values.push(ColumnValue::Int(origin));
    values.push(ColumnValue::Text(doc.to_string()));

    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let marks = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "{verb} INTO \"{}\" ({}) VALUES ({marks})",
        schema.name,
        columns.join(", ")
    );
    let mut q = sqlx::query(&sql);
    for value in values {
        q = bind_value(q, value);
    }
    q.execute(&mut **tx).await?;
    Ok(())
}

async fn save_checkpoint_tx(
    tx: &mut Transaction<'_, Sqlite>,
    key: &ReplicationKey,
    checkpoint: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO replication_state \
             (local_collection, remote_collection, identifier, checkpoint, push_seq) \
         VALUES (?, ?, ?, ?, 0) \
         ON CONFLICT(local_collection, remote_collection, identifier) \
         DO UPDATE SET checkpoint = excluded.checkpoint",
    )
    .bind(&key.local_collection)
    .bind(&key.remote_collection)
    .bind(&key.identifier)
    .bind(checkpoint.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: ColumnValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        ColumnValue::Text(s) => q.bind(s),
        ColumnValue::Int(i) => q.bind(i),
        ColumnValue::Null => q.bind(None::<String>),
    }
}

/// Evaluate a query: SQL pre-filter over extracted columns, full predicate
/// re-check in Rust, then sort/tiebreak/limit. Shared by `find`, `subscribe`,
/// and the live-query dispatcher.
pub(crate) async fn eval_query(
    pool: &SqlitePool,
    schemas: &SchemaSet,
    query: &Query,
) -> Result<Vec<StoredDocument>> {
    let schema = schemas
        .get(&query.collection)
        .ok_or_else(|| StoreError::SchemaValidation {
            collection: query.collection.clone(),
            reason: "unknown collection".to_string(),
        })?;
    let (clauses, binds) = query.pushdown(schema);
    let mut sql = format!("SELECT doc, local_seq FROM \"{}\"", schema.name);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    let mut q = sqlx::query(&sql);
    for bind in binds {
        q = bind_value(q, bind);
    }
    let rows = q.fetch_all(pool).await?;

    let mut docs = Vec::with_capacity(rows.len());
    for row in rows {
        let text: String = row.get("doc");
        let doc: Value = serde_json::from_str(&text)?;
        if query.matches_doc(&doc) {
            docs.push(StoredDocument {
                doc,
                local_seq: row.get("local_seq"),
            });
        }
    }
    Ok(query.finish(docs, &schema.primary_key))
}

/// Single dispatcher task: drains committed-write notices in FIFO order and
/// re-evaluates affected live queries. Holds only a weak reference to the
/// registry so it exits once every store handle and subscription is gone.
async fn run_dispatcher(
    pool: SqlitePool,
    schemas: Arc<SchemaSet>,
    registry: std::sync::Weak<LiveRegistry>,
    mut notice_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    while let Some(collection) = notice_rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        for (id, query) in registry.affected(&collection) {
            // Registered queries always reference a known collection.
            let primary_key = schemas
                .get(&query.collection)
                .map(|s| s.primary_key.as_str())
                .unwrap_or("id");
            match eval_query(&pool, &schemas, &query).await {
                Ok(docs) => registry.deliver(id, docs, primary_key),
                Err(err) => debug!(%collection, subscription = id, %err, "live re-evaluation failed"),
            }
        }
    }
    debug!("live query dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Selector, SortDirection};
    use crate::test_helpers::{memory_store, message_doc, test_schemas, thread_doc};
    use serde_json::json;

    #[tokio::test]
    async fn insert_and_find_one() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();
        let found = store.find_one("threads", "t1").await.unwrap().unwrap();
        assert_eq!(found["title"], "New Chat");
        assert!(store.find_one("threads", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_key_leaves_first_intact() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();

        let mut second = thread_doc("t1", 200);
        second["title"] = json!("Impostor");
        let err = store.insert("threads", second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }), "{err}");

        let found = store.find_one("threads", "t1").await.unwrap().unwrap();
        assert_eq!(found["title"], "New Chat");
        assert_eq!(found["updatedAt"], 100);
    }

    #[tokio::test]
    async fn missing_required_field_never_persists() {
        let store = memory_store().await;
        let err = store
            .insert("threads", json!({"id": "t1", "createdAt": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaValidation { .. }), "{err}");
        assert!(store.find_one("threads", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_collection_rejected() {
        let store = memory_store().await;
        let err = store.insert("widgets", json!({"id": "w1"})).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaValidation { .. }), "{err}");
    }

    #[tokio::test]
    async fn patch_merges_supplied_fields_only() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();
        let patched = store
            .patch("threads", "t1", json!({"title": "Renamed"}))
            .await
            .unwrap();
        assert_eq!(patched["title"], "Renamed");
        assert_eq!(patched["visibility"], "private");
        assert!(patched["updatedAt"].as_i64().unwrap() >= 100);
    }

    #[tokio::test]
    async fn patch_missing_doc_is_not_found() {
        let store = memory_store().await;
        let err = store
            .patch("threads", "ghost", json!({"title": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }), "{err}");
    }

    #[tokio::test]
    async fn patch_cannot_change_primary_key() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();
        let err = store
            .patch("threads", "t1", json!({"id": "t2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaValidation { .. }), "{err}");
    }

    #[tokio::test]
    async fn updated_at_never_moves_backward() {
        let store = memory_store().await;
        let far_future = now_ms() + 1_000_000;
        let mut doc = thread_doc("t1", 100);
        doc["updatedAt"] = json!(far_future);
        store.insert("threads", doc).await.unwrap();

        let patched = store
            .patch("threads", "t1", json!({"title": "x", "updatedAt": 50}))
            .await
            .unwrap();
        assert_eq!(patched["updatedAt"], far_future);

        let patched = store
            .patch("threads", "t1", json!({"title": "y"}))
            .await
            .unwrap();
        assert_eq!(patched["updatedAt"], far_future);
    }

    #[tokio::test]
    async fn soft_delete_hidden_from_find_but_not_find_one() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();
        store
            .patch("threads", "t1", json!({"deleted": true}))
            .await
            .unwrap();

        let active = store.find(&Query::new("threads")).await.unwrap();
        assert!(active.is_empty());

        let all = store
            .find(&Query::new("threads").include_deleted())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let by_key = store.find_one("threads", "t1").await.unwrap().unwrap();
        assert_eq!(by_key["deleted"], true);
    }

    #[tokio::test]
    async fn remove_is_physical() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();
        assert!(store.remove("threads", "t1").await.unwrap());
        assert!(!store.remove("threads", "t1").await.unwrap());
        assert!(store.find_one("threads", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_where_selector() {
        let store = memory_store().await;
        for (id, at) in [("m1", 10), ("m2", 20), ("m3", 30)] {
            store.insert("messages", message_doc(id, "t1", at)).await.unwrap();
        }
        store.insert("messages", message_doc("m4", "t2", 40)).await.unwrap();

        let removed = store
            .remove_where(
                "messages",
                Selector::and(vec![
                    Selector::eq("threadId", "t1"),
                    Selector::gte("createdAt", 20),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let left = store.find(&Query::new("messages")).await.unwrap();
        let ids: Vec<_> = left.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["m1", "m4"]);
    }

    #[tokio::test]
    async fn remove_where_exceeding_bind_parameter_limit() {
        let store = memory_store().await;
        for n in 0..1200 {
            store
                .insert("messages", message_doc(&format!("m{n:04}"), "big", n))
                .await
                .unwrap();
        }
        store.insert("messages", message_doc("keep", "other", 1)).await.unwrap();

        let removed = store
            .remove_where("messages", Selector::eq("threadId", "big"))
            .await
            .unwrap();
        assert_eq!(removed, 1200);

        let left = store.find(&Query::new("messages")).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["id"], "keep");
    }

    #[tokio::test]
    async fn thread_scenario_orders_messages() {
        let store = memory_store().await;
        store.insert("threads", thread_doc("T1", 1)).await.unwrap();
        store.insert("messages", message_doc("M1", "T1", 10)).await.unwrap();
        let mut m2 = message_doc("M2", "T1", 20);
        m2["role"] = json!("assistant");
        store.insert("messages", m2).await.unwrap();

        let query = Query::new("messages")
            .filter(Selector::eq("threadId", "T1"))
            .sort_by("createdAt", SortDirection::Asc);
        let docs = store.find(&query).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["M1", "M2"]);
    }

    #[tokio::test]
    async fn reopen_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let config = StoreConfig::at_path(path.to_str().unwrap());

        let store = Store::open(config.clone(), test_schemas()).await.unwrap();
        store.insert("threads", thread_doc("t1", 100)).await.unwrap();
        store.close().await;

        let store = Store::open(config, test_schemas()).await.unwrap();
        let found = store.find_one("threads", "t1").await.unwrap().unwrap();
        assert_eq!(found["title"], "New Chat");
    }

    #[tokio::test]
    async fn newer_persisted_schema_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let config = StoreConfig::at_path(path.to_str().unwrap());

        let mut newer = test_schemas();
        newer.version = 9;
        let store = Store::open(config.clone(), newer).await.unwrap();
        store.close().await;

        let err = Store::open(config, test_schemas()).await.unwrap_err();
        assert!(
            matches!(err, StoreError::SchemaVersionMismatch { found: 9, supported: 1 }),
            "{err}"
        );
    }

    fn repl_key() -> ReplicationKey {
        ReplicationKey {
            local_collection: "messages".to_string(),
            remote_collection: "messages".to_string(),
            identifier: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn pull_batch_applies_newer_and_keeps_local_on_tie() {
        let store = memory_store().await;
        let mut local = message_doc("m1", "t1", 10);
        local["content"] = json!("local text");
        local["updatedAt"] = json!(100);
        store.insert("messages", local).await.unwrap();

        let mut older = message_doc("m1", "t1", 10);
        older["content"] = json!("older remote");
        older["updatedAt"] = json!(100);
        let mut newer = message_doc("m2", "t1", 20);
        newer["content"] = json!("brand new");
        newer["updatedAt"] = json!(200);

        let outcome = store
            .apply_pull_batch(&repl_key(), &[older, newer], &json!({"updatedAt": 200, "id": "m2"}))
            .await
            .unwrap();
        assert_eq!(outcome.kept_local, vec!["m1"]);
        assert_eq!(outcome.applied, vec!["m2"]);

        let m1 = store.find_one("messages", "m1").await.unwrap().unwrap();
        assert_eq!(m1["content"], "local text");

        let state = store.replication_state(&repl_key()).await.unwrap();
        assert_eq!(state.checkpoint.unwrap()["updatedAt"], 200);
    }

    #[tokio::test]
    async fn pull_batch_replaces_local_when_remote_newer() {
        let store = memory_store().await;
        let mut local = message_doc("m1", "t1", 10);
        local["updatedAt"] = json!(100);
        store.insert("messages", local).await.unwrap();

        let mut remote = message_doc("m1", "t1", 10);
        remote["content"] = json!("remote wins");
        remote["updatedAt"] = json!(101);
        let outcome = store
            .apply_pull_batch(&repl_key(), &[remote], &json!({"updatedAt": 101, "id": "m1"}))
            .await
            .unwrap();
        assert_eq!(outcome.applied, vec!["m1"]);

        let m1 = store.find_one("messages", "m1").await.unwrap().unwrap();
        assert_eq!(m1["content"], "remote wins");
    }

    #[tokio::test]
    async fn pull_batch_is_atomic_on_validation_failure() {
        let store = memory_store().await;
        let good = message_doc("m1", "t1", 10);
        let bad = json!({"id": "m2", "role": "user"});

        let err = store
            .apply_pull_batch(&repl_key(), &[good, bad], &json!({"updatedAt": 10, "id": "m2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaValidation { .. }), "{err}");

        // Nothing from the failed batch landed, checkpoint did not advance.
        assert!(store.find_one("messages", "m1").await.unwrap().is_none());
        let state = store.replication_state(&repl_key()).await.unwrap();
        assert!(state.checkpoint.is_none());
    }

    #[tokio::test]
    async fn pending_push_skips_remote_origin_and_quarantined() {
        let store = memory_store().await;
        store.insert("messages", message_doc("m1", "t1", 10)).await.unwrap();
        store.insert("messages", message_doc("m2", "t1", 20)).await.unwrap();
        store.insert("messages", message_doc("m3", "t1", 30)).await.unwrap();

        // Remote-applied rows are never echoed back.
        let mut remote = message_doc("m4", "t1", 40);
        remote["updatedAt"] = json!(40);
        store
            .apply_pull_batch(&repl_key(), &[remote], &json!({"updatedAt": 40, "id": "m4"}))
            .await
            .unwrap();

        store.quarantine("messages", "m2", 5, "schema rejected").await.unwrap();

        let pending = store.pending_push("messages", 0, 10).await.unwrap();
        let ids: Vec<_> = pending
            .iter()
            .map(|d| d.doc["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["m1", "m3"]);
        assert_eq!(store.quarantined_ids("messages").await.unwrap(), vec!["m2"]);

        // A later local write lifts the quarantine.
        store
            .patch("messages", "m2", json!({"content": "fixed"}))
            .await
            .unwrap();
        assert!(store.quarantined_ids("messages").await.unwrap().is_empty());
        let pending = store.pending_push("messages", 0, 10).await.unwrap();
        assert!(pending.iter().any(|d| d.doc["id"] == "m2"));
    }

    #[tokio::test]
    async fn advance_push_seq_is_monotonic() {
        let store = memory_store().await;
        let key = repl_key();
        store.advance_push_seq(&key, 7).await.unwrap();
        store.advance_push_seq(&key, 3).await.unwrap();
        let state = store.replication_state(&key).await.unwrap();
        assert_eq!(state.push_seq, 7);
    }

    #[tokio::test]
    async fn checkpoint_survives_alongside_push_seq() {
        let store = memory_store().await;
        let key = repl_key();
        store.advance_push_seq(&key, 5).await.unwrap();
        store.save_checkpoint(&key, &json!({"updatedAt": 42, "id": "x"})).await.unwrap();
        let state = store.replication_state(&key).await.unwrap();
        assert_eq!(state.push_seq, 5);
        assert_eq!(state.checkpoint.unwrap()["updatedAt"], 42);
    }
}
