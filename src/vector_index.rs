//! Vector index records and the Pinecone upsert client.
//!
//! Each chunk becomes one [`VectorRecord`] whose id is the chunk id, so
//! re-ingesting a post overwrites its previous vectors; ids beyond the new
//! chunk count are removed with [`VectorIndex::delete`]. Metadata carries
//! enough of the post (title, author, URL, a content preview, links) for
//! search results to be shown without a second lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::IndexConfig;
use crate::models::{Chunk, ExtractedLink};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index is disabled")]
    Disabled,
    #[error("index request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("index API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("{chunks} chunks but {vectors} vectors")]
    Mismatch { chunks: usize, vectors: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Map<String, Value>,
}

/// Write side of a namespaced vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;
    /// Insert or overwrite `records` in `namespace`; returns the count written.
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<usize, IndexError>;
    /// Remove `ids` from `namespace`. Unknown ids are not an error.
    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), IndexError>;
}

/// Pair chunks with their vectors and attach display metadata.
pub fn build_records(
    chunks: &[Chunk],
    vectors: Vec<Vec<f32>>,
    namespace: &str,
    config: &IndexConfig,
) -> Result<Vec<VectorRecord>, IndexError> {
    if chunks.len() != vectors.len() {
        return Err(IndexError::Mismatch {
            chunks: chunks.len(),
            vectors: vectors.len(),
        });
    }

    Ok(chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, values)| VectorRecord {
            id: chunk.id.clone(),
            values,
            metadata: chunk_metadata(chunk, namespace, config),
        })
        .collect())
}

fn chunk_metadata(chunk: &Chunk, namespace: &str, config: &IndexConfig) -> Map<String, Value> {
    let preview: String = chunk.text.chars().take(config.content_preview_chars).collect();
    let mut metadata = Map::new();
    metadata.insert("title".into(), json!(chunk.title));
    metadata.insert("author".into(), json!(chunk.author));
    metadata.insert("url".into(), json!(chunk.canonical_url));
    metadata.insert("published".into(), json!(chunk.published_at.to_rfc3339()));
    metadata.insert("source".into(), json!(chunk.source));
    metadata.insert("namespace".into(), json!(namespace));
    metadata.insert("chunk_index".into(), json!(chunk.chunk_index));
    metadata.insert("chunk_count".into(), json!(chunk.chunk_count));
    metadata.insert("content".into(), json!(preview));
    metadata.insert("text_hash".into(), json!(chunk.hash));
    if !chunk.links.is_empty() {
        metadata.insert(
            "links".into(),
            json!(bounded_links_json(&chunk.links, config.max_links_bytes)),
        );
    }
    metadata
}

/// JSON array of links no longer than `max_bytes`, dropping whole links
/// from the end until it fits. Never cuts a link in half.
pub fn bounded_links_json(links: &[ExtractedLink], max_bytes: usize) -> String {
    let mut kept = links.len();
    loop {
        let encoded = serde_json::to_string(&links[..kept]).unwrap_or_else(|_| "[]".into());
        if encoded.len() <= max_bytes || kept == 0 {
            if kept < links.len() {
                tracing::debug!(kept, dropped = links.len() - kept, "Truncated link metadata");
            }
            return encoded;
        }
        kept -= 1;
    }
}

// ============ Pinecone ============

/// Writes vectors through the Pinecone data-plane REST API.
pub struct PineconeIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    batch_size: usize,
}

impl PineconeIndex {
    pub fn new(host: &str, api_key: String, config: &IndexConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let host = host.trim_end_matches('/');
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        Ok(Self {
            client,
            base_url: base,
            api_key,
            batch_size: config.batch_size.max(1),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, IndexError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn name(&self) -> &str {
        "pinecone"
    }

    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<usize, IndexError> {
        let mut written = 0;
        for batch in records.chunks(self.batch_size) {
            let reply = self
                .post("/vectors/upsert", &json!({ "vectors": batch, "namespace": namespace }))
                .await?;
            written += reply["upsertedCount"]
                .as_u64()
                .map(|n| n as usize)
                .unwrap_or(batch.len());
        }
        tracing::debug!(namespace, written, "Upserted vectors");
        Ok(written)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), IndexError> {
        for batch in ids.chunks(self.batch_size) {
            self.post("/vectors/delete", &json!({ "ids": batch, "namespace": namespace }))
                .await?;
        }
        tracing::debug!(namespace, deleted = ids.len(), "Deleted vectors");
        Ok(())
    }
}

pub struct DisabledIndex;

#[async_trait]
impl VectorIndex for DisabledIndex {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn upsert(
        &self,
        _namespace: &str,
        _records: &[VectorRecord],
    ) -> Result<usize, IndexError> {
        Err(IndexError::Disabled)
    }

    async fn delete(&self, _namespace: &str, _ids: &[String]) -> Result<(), IndexError> {
        Err(IndexError::Disabled)
    }
}

/// Process-local index keyed by namespace then vector id.
///
/// Upserts overwrite by id, matching the remote index semantics.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    namespaces: Mutex<HashMap<String, BTreeMap<String, VectorRecord>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector ids stored in `namespace`, in sorted order.
    pub fn ids(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, namespace: &str, id: &str) -> Option<VectorRecord> {
        self.namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(namespace)
            .and_then(|ns| ns.get(id).cloned())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<usize, IndexError> {
        let mut namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), IndexError> {
        let mut namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(ns) = namespaces.get_mut(namespace) {
            for id in ids {
                ns.remove(id);
            }
        }
        Ok(())
    }
}

/// Create the configured index client. Missing credentials are an error.
pub fn create_index(config: &IndexConfig) -> anyhow::Result<Box<dyn VectorIndex>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledIndex)),
        "pinecone" => {
            let host = config
                .host
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("index.host required for pinecone"))?;
            let api_key = std::env::var(&config.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    anyhow::anyhow!("{} environment variable not set", config.api_key_env)
                })?;
            Ok(Box::new(PineconeIndex::new(host, api_key, config)?))
        }
        other => anyhow::bail!("Unknown index provider: {}", other),
    }
}
