//! Vector index access: one collection per indexed channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::RemoteError;
use crate::retry::ensure_success;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub document: String,
    /// Unix seconds of the source message.
    pub at: i64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMatch {
    pub id: String,
    pub distance: f32,
    pub document: Option<String>,
    pub at: Option<i64>,
}

impl QueryMatch {
    pub fn score(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Optional metadata / document filters, passed through to the index verbatim.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryFilter {
    pub metadata: Option<Value>,
    pub document: Option<Value>,
}

/// Metadata for a new collection using the given distance metric.
pub fn collection_metadata(metric: &str) -> Value {
    json!({ "hnsw:space": metric })
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn get_or_create(&self, collection: &str, metadata: &Value) -> Result<(), RemoteError>;
    async fn delete(&self, collection: &str) -> Result<(), RemoteError>;
    /// Insert-or-replace keyed by entry id.
    async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<(), RemoteError>;
    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryMatch>, RemoteError>;
    async fn count(&self, collection: &str) -> Result<usize, RemoteError>;
}

#[derive(Deserialize)]
struct Collection {
    id: String,
}

#[derive(Serialize)]
struct CreateCollection<'a> {
    name: &'a str,
    metadata: &'a Value,
    get_or_create: bool,
}

#[derive(Serialize)]
struct UpsertRequest {
    ids: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    metadatas: Vec<Value>,
    documents: Vec<String>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query_embeddings: Vec<Vec<f32>>,
    n_results: usize,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    where_metadata: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    where_document: Option<&'a Value>,
    include: [&'static str; 3],
}

#[derive(Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Value>>>>,
}

/// Chroma answers one row per query embedding; only one is ever sent.
fn first_row<T>(rows: Option<Vec<Vec<T>>>) -> Vec<T> {
    rows.and_then(|r| r.into_iter().next()).unwrap_or_default()
}

impl QueryResponse {
    fn into_matches(self) -> Vec<QueryMatch> {
        let ids = self.ids.into_iter().next().unwrap_or_default();
        let distances: Vec<f32> = first_row(self.distances);
        let documents: Vec<Option<String>> = first_row(self.documents);
        let metadatas: Vec<Option<Value>> = first_row(self.metadatas);

        ids.into_iter()
            .enumerate()
            .map(|(i, id)| QueryMatch {
                id,
                distance: distances.get(i).copied().unwrap_or(f32::NAN),
                document: documents.get(i).cloned().flatten(),
                at: metadatas
                    .get(i)
                    .and_then(|m| m.as_ref())
                    .and_then(|m| m.get("at"))
                    .and_then(Value::as_i64),
            })
            .collect()
    }
}

/// REST client for a Chroma server (`/api/v1`).
pub struct ChromaClient {
    http: reqwest::Client,
    base: String,
}

impl ChromaClient {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base, path)
    }

    async fn collection_id(&self, name: &str) -> Result<String, RemoteError> {
        let url = self.url(&format!("collections/{name}"));
        let response = ensure_success(&url, self.http.get(&url).send().await?).await?;
        let collection: Collection = response.json().await?;
        Ok(collection.id)
    }
}

#[async_trait]
impl VectorIndex for ChromaClient {
    async fn get_or_create(&self, collection: &str, metadata: &Value) -> Result<(), RemoteError> {
        let url = self.url("collections");
        let body = CreateCollection {
            name: collection,
            metadata,
            get_or_create: true,
        };
        ensure_success(&url, self.http.post(&url).json(&body).send().await?).await?;
        debug!("Vector index: collection {} ready", collection);
        Ok(())
    }

    async fn delete(&self, collection: &str) -> Result<(), RemoteError> {
        let url = self.url(&format!("collections/{collection}"));
        ensure_success(&url, self.http.delete(&url).send().await?).await?;
        debug!("Vector index: collection {} deleted", collection);
        Ok(())
    }

    async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<(), RemoteError> {
        if entries.is_empty() {
            return Ok(());
        }
        let id = self.collection_id(collection).await?;
        let count = entries.len();
        let mut body = UpsertRequest {
            ids: Vec::with_capacity(count),
            embeddings: Vec::with_capacity(count),
            metadatas: Vec::with_capacity(count),
            documents: Vec::with_capacity(count),
        };
        for entry in entries {
            body.ids.push(entry.id);
            body.embeddings.push(entry.embedding);
            body.metadatas.push(json!({ "at": entry.at }));
            body.documents.push(entry.document);
        }
        let url = self.url(&format!("collections/{id}/upsert"));
        ensure_success(&url, self.http.post(&url).json(&body).send().await?).await?;
        debug!("Vector index: upserted {} entries into {}", count, collection);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryMatch>, RemoteError> {
        let id = self.collection_id(collection).await?;
        let url = self.url(&format!("collections/{id}/query"));
        let body = QueryRequest {
            query_embeddings: vec![embedding],
            n_results: k,
            where_metadata: filter.metadata.as_ref(),
            where_document: filter.document.as_ref(),
            include: ["metadatas", "documents", "distances"],
        };
        let response = ensure_success(&url, self.http.post(&url).json(&body).send().await?).await?;
        let parsed: QueryResponse = response.json().await?;
        Ok(parsed.into_matches())
    }

    async fn count(&self, collection: &str) -> Result<usize, RemoteError> {
        let id = self.collection_id(collection).await?;
        let url = self.url(&format!("collections/{id}/count"));
        let response = ensure_success(&url, self.http.get(&url).send().await?).await?;
        Ok(response.json().await?)
    }
}
