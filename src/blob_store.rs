//! Blob Store Adapter (spec §4.1).
//!
//! Resolves a `source_uri` to raw document bytes. Local paths (`local://`
//! prefix, relative `uploads/...`, or absolute) are read directly; remote
//! URIs go through an HTTP GET with retry/backoff and a local disk cache
//! keyed by a hash of the URI, so a re-fetch of the same document never
//! hits the network twice.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::BlobStoreConfig;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

fn is_local_uri(uri: &str) -> bool {
    uri.starts_with("local://") || uri.starts_with("uploads/") || Path::new(uri).is_absolute()
}

fn local_path(uri: &str) -> PathBuf {
    if let Some(rest) = uri.strip_prefix("local://") {
        PathBuf::from(rest)
    } else {
        PathBuf::from(uri)
    }
}

fn cache_key(uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Classifies an HTTP status per spec §4.1's retry table: 429 gets the long
/// schedule, 5xx the short one, everything else is a permanent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOutcome {
    RateLimited,
    ServerError,
    Permanent,
}

/// Combines local-path resolution with an HTTP client + disk cache for
/// remote URIs, as SPEC_FULL §4.1 names the single concrete `BlobStore`.
pub struct FileBlobStore {
    client: reqwest::Client,
    config: BlobStoreConfig,
}

impl FileBlobStore {
    pub fn new(config: BlobStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .context("building blob store HTTP client")?;
        Ok(Self { client, config })
    }

    fn cache_path(&self, uri: &str) -> PathBuf {
        self.config.cache_dir.join(cache_key(uri))
    }

    async fn fetch_remote(&self, uri: &str) -> Result<Vec<u8>> {
        let cache_path = self.cache_path(uri);
        if let Ok(bytes) = tokio::fs::read(&cache_path).await {
            return Ok(bytes);
        }

        let bytes = fetch_with_schedule(&self.client, uri).await?;

        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&cache_path, &bytes).await.ok();

        Ok(bytes)
    }
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchOutcome> {
    let resp = client.get(url).send().await.map_err(|_| FetchOutcome::ServerError)?;
    let status = resp.status();
    if status.is_success() {
        return resp
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|_| FetchOutcome::ServerError);
    }
    if status.as_u16() == 429 {
        return Err(FetchOutcome::RateLimited);
    }
    if status.is_server_error() {
        return Err(FetchOutcome::ServerError);
    }
    Err(FetchOutcome::Permanent)
}

/// 429 and 5xx get distinct schedules (spec §4.1), so this runs its own
/// three-attempt loop rather than calling [`retry_with_backoff`] with one
/// fixed schedule (kept here instead of in `retry.rs` — it's the only
/// caller whose delay depends on *which kind* of transient error it saw).
async fn fetch_with_schedule(client: &reqwest::Client, uri: &str) -> Result<Vec<u8>> {
    const RATE_LIMIT_DELAYS: [Duration; 3] =
        [Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20)];
    const SERVER_ERROR_DELAYS: [Duration; 3] =
        [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

    let mut last = FetchOutcome::Permanent;
    for attempt in 0..3usize {
        match fetch_once(client, uri).await {
            Ok(bytes) => return Ok(bytes),
            Err(FetchOutcome::Permanent) => bail!("blob fetch failed permanently for {}", uri),
            Err(outcome) => {
                last = outcome;
                let delay = match outcome {
                    FetchOutcome::RateLimited => RATE_LIMIT_DELAYS[attempt],
                    FetchOutcome::ServerError => SERVER_ERROR_DELAYS[attempt],
                    FetchOutcome::Permanent => unreachable!(),
                };
                if attempt < 2 {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    bail!("blob fetch exhausted retries for {} (last: {:?})", uri, last)
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        if is_local_uri(uri) {
            let path = local_path(uri);
            return tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading local document at {}", path.display()));
        }
        self.fetch_remote(uri).await
    }
}

pub fn create_blob_store(config: &BlobStoreConfig) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(FileBlobStore::new(config.clone())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_uri_detection() {
        assert!(is_local_uri("local:///tmp/doc.pdf"));
        assert!(is_local_uri("uploads/doc.pdf"));
        assert!(is_local_uri("/abs/path/doc.pdf"));
        assert!(!is_local_uri("https://example.com/doc.pdf"));
    }

    #[test]
    fn local_path_strips_scheme() {
        assert_eq!(local_path("local:///tmp/x.pdf"), PathBuf::from("/tmp/x.pdf"));
        assert_eq!(local_path("uploads/x.pdf"), PathBuf::from("uploads/x.pdf"));
    }

    #[tokio::test]
    async fn fetches_local_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let store = FileBlobStore::new(BlobStoreConfig {
            cache_dir: tmp.path().join("cache"),
            user_agent: "test".to_string(),
            fetch_timeout_secs: 5,
        })
        .unwrap();

        let bytes = store.fetch(path.to_str().unwrap()).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn missing_local_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(BlobStoreConfig {
            cache_dir: tmp.path().join("cache"),
            user_agent: "test".to_string(),
            fetch_timeout_secs: 5,
        })
        .unwrap();
        let missing = tmp.path().join("nope.txt");
        assert!(store.fetch(missing.to_str().unwrap()).await.is_err());
    }
}
