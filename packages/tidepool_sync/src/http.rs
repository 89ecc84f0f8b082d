//! HTTP adapter for a REST document backend.
//!
//! Endpoint shape: `{base}/collections/{collection}/documents[/{id}]` with
//! JSON bodies and an API-key header. The change feed is synthesized from
//! `list_documents` ordered by `(updatedAt, id)` above the checkpoint, so the
//! backend only needs plain list queries.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::remote::{
    ChangeBatch, Checkpoint, DocumentPage, ListFilters, Order, RemoteCollection, cursor,
    cursor_parts,
};

#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    collection_id: String,
    api_key: String,
}

#[derive(Deserialize)]
struct PageBody {
    documents: Vec<Value>,
    #[serde(default)]
    total: u64,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        collection_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection_id: collection_id.into(),
            api_key: api_key.into(),
        }
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/collections/{}/documents",
            self.base_url, self.collection_id
        )
    }

    fn document_url(&self, id: &str) -> String {
        format!("{}/{}", self.documents_url(), id)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::RemoteRejected {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))
    }
}

/// Filter serialization: `eq.field=v`, `gt.field=v`, `gte.field=v`,
/// `order=field.asc|desc`, `limit`, `offset`.
fn list_params(filters: &ListFilters) -> Vec<(String, String)> {
    fn plain(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    let mut params = Vec::new();
    for (field, value) in &filters.equal {
        params.push((format!("eq.{field}"), plain(value)));
    }
    for (field, value) in &filters.greater_than {
        params.push((format!("gt.{field}"), plain(value)));
    }
    for (field, value) in &filters.greater_equal {
        params.push((format!("gte.{field}"), plain(value)));
    }
    for (field, order) in &filters.order_by {
        let dir = match order {
            Order::Asc => "asc",
            Order::Desc => "desc",
        };
        params.push(("order".to_string(), format!("{field}.{dir}")));
    }
    if let Some(limit) = filters.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = filters.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

#[async_trait]
impl RemoteCollection for HttpRemote {
    async fn create_document(&self, id: &str, fields: Value) -> Result<Value> {
        let body = json!({"documentId": id, "data": fields});
        self.send(self.client.post(self.documents_url()).json(&body))
            .await
    }

    async fn get_document(&self, id: &str) -> Result<Value> {
        self.send(self.client.get(self.document_url(id))).await
    }

    async fn list_documents(&self, filters: ListFilters) -> Result<DocumentPage> {
        let value = self
            .send(
                self.client
                    .get(self.documents_url())
                    .query(&list_params(&filters)),
            )
            .await?;
        let body: PageBody =
            serde_json::from_value(value).map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;
        Ok(DocumentPage {
            documents: body.documents,
            total: body.total,
        })
    }

    async fn update_document(&self, id: &str, partial: Value) -> Result<Value> {
        let body = json!({"data": partial});
        self.send(self.client.patch(self.document_url(id)).json(&body))
            .await
    }

    /// Two list queries make the feed exact across `updatedAt` ties: first
    /// the remainder of the checkpoint's own timestamp (same `updatedAt`,
    /// greater id), then everything strictly newer.
    async fn changes_since(
        &self,
        checkpoint: Option<&Checkpoint>,
        limit: u32,
    ) -> Result<ChangeBatch> {
        let mut documents = Vec::new();

        match checkpoint {
            None => {
                let page = self
                    .list_documents(
                        ListFilters::default()
                            .order_by("updatedAt", Order::Asc)
                            .order_by("id", Order::Asc)
                            .limit(limit),
                    )
                    .await?;
                documents = page.documents;
            }
            Some(checkpoint) => {
                let (at, id) = cursor_parts(checkpoint);
                let ties = self
                    .list_documents(ListFilters {
                        equal: vec![("updatedAt".to_string(), json!(at))],
                        greater_than: vec![("id".to_string(), json!(id))],
                        order_by: vec![("id".to_string(), Order::Asc)],
                        limit: Some(limit),
                        ..ListFilters::default()
                    })
                    .await?;
                documents.extend(ties.documents);

                if (documents.len() as u32) < limit {
                    let newer = self
                        .list_documents(
                            ListFilters::default()
                                .greater_than("updatedAt", json!(at))
                                .order_by("updatedAt", Order::Asc)
                                .order_by("id", Order::Asc)
                                .limit(limit - documents.len() as u32),
                        )
                        .await?;
                    documents.extend(newer.documents);
                }
            }
        }

        debug!(count = documents.len(), "fetched remote changes");
        let checkpoint = documents.last().map(|doc| {
            cursor(
                doc.get("updatedAt").and_then(Value::as_i64).unwrap_or(0),
                doc.get("id").and_then(Value::as_str).unwrap_or_default(),
            )
        });
        Ok(ChangeBatch { documents, checkpoint })
    }
}
