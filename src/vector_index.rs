//! Vector Index Adapter (spec §4.4).
//!
//! `VectorIndex` abstracts the external vector store: `EnsureCollection`,
//! `Upsert`, and filtered `Query`. Two implementations: [`InMemoryVectorIndex`]
//! (default/test backend — a brute-force cosine scan, grounded on the
//! teacher's in-memory `Store` pattern) and [`QdrantVectorIndex`] (a REST
//! client over `reqwest`).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::summarizer::cosine_similarity;

/// One point upserted into a named vector collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A conjunctive predicate over payload fields: every `(key, value)` pair
/// must match exactly for a point to be included in query results.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub equals: Vec<(String, String)>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    fn matches(&self, payload: &Value) -> bool {
        self.equals.iter().all(|(field, expected)| {
            payload
                .get(field)
                .and_then(|v| v.as_str())
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryResult>>;
}

// ============ In-memory backend ============

struct MemCollection {
    dim: usize,
    points: HashMap<String, VectorPoint>,
}

/// Default/test backend: a brute-force cosine scan over an in-process
/// `HashMap`. Idempotent on point id per spec §4.4: re-upserting an id
/// replaces the prior point.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: RwLock<HashMap<String, MemCollection>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut guard = self.collections.write().unwrap();
        guard.entry(name.to_string()).or_insert_with(|| MemCollection {
            dim,
            points: HashMap::new(),
        });
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut guard = self.collections.write().unwrap();
        let coll = guard
            .get_mut(collection)
            .ok_or_else(|| anyhow::anyhow!("vector collection '{}' does not exist", collection))?;
        for point in points {
            if point.vector.len() != coll.dim {
                anyhow::bail!(
                    "vector dimension mismatch for point {}: expected {}, got {}",
                    point.id,
                    coll.dim,
                    point.vector.len()
                );
            }
            coll.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryResult>> {
        let guard = self.collections.read().unwrap();
        let coll = match guard.get(collection) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let mut scored: Vec<QueryResult> = coll
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| QueryResult {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

// ============ Qdrant REST backend ============

/// REST client over a Qdrant-compatible vector store: named collections,
/// cosine distance, `(id, vector, payload)` points.
pub struct QdrantVectorIndex {
    client: reqwest::Client,
    endpoint: String,
}

impl QdrantVectorIndex {
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building Qdrant HTTP client")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let url = format!("{}/collections/{}", self.endpoint, name);
        let body = serde_json::json!({
            "vectors": { "size": dim, "distance": "Cosine" }
        });
        let resp = self.client.put(&url).json(&body).send().await?;
        if !resp.status().is_success() && resp.status().as_u16() != 409 {
            anyhow::bail!("Qdrant ensure_collection failed: {}", resp.status());
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let url = format!("{}/collections/{}/points", self.endpoint, collection);
        let body = serde_json::json!({
            "points": points.iter().map(|p| serde_json::json!({
                "id": p.id,
                "vector": p.vector,
                "payload": p.payload,
            })).collect::<Vec<_>>()
        });
        let resp = self.client.put(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("Qdrant upsert failed: {}", resp.status());
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryResult>> {
        let url = format!("{}/collections/{}/points/search", self.endpoint, collection);
        let must: Vec<Value> = filter
            .equals
            .iter()
            .map(|(field, value)| {
                serde_json::json!({ "key": field, "match": { "value": value } })
            })
            .collect();
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if !must.is_empty() {
            body["filter"] = serde_json::json!({ "must": must });
        }
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("Qdrant query failed: {}", resp.status());
        }
        let json: Value = resp.json().await?;
        let results = json["result"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|item| QueryResult {
                id: item["id"].as_str().unwrap_or_default().to_string(),
                score: item["score"].as_f64().unwrap_or(0.0) as f32,
                payload: item["payload"].clone(),
            })
            .collect();
        Ok(results)
    }
}

pub fn create_vector_index(provider: &str, endpoint: Option<&str>) -> Result<Box<dyn VectorIndex>> {
    match provider {
        "memory" => Ok(Box::new(InMemoryVectorIndex::new())),
        "qdrant" => {
            let endpoint = endpoint
                .ok_or_else(|| anyhow::anyhow!("vector_index.endpoint required for provider 'qdrant'"))?;
            Ok(Box::new(QdrantVectorIndex::new(endpoint.to_string())?))
        }
        other => anyhow::bail!("Unknown vector_index provider: {}", other),
    }
}
