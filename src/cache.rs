//! Extraction cache: a read-through, content-addressed store of
//! LLM extraction/summarization/keyword-extraction results, keyed by
//! `(project_id, cache_type, content_hash)`. Durable entries are the sole
//! basis for the deletion-rebuild fast path — no new LLM calls
//! are issued there.

use std::collections::HashMap;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::{CacheType, ExtractionCacheEntry};

/// A stable, versioned hash of normalized input text, used as the cache
/// key's third component.
pub fn content_hash(normalized_text: &str, version_tag: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version_tag.as_bytes());
    hasher.update(b"\0");
    hasher.update(normalized_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait ExtractionCache: Send + Sync {
    async fn get(
        &self,
        project_id: &str,
        cache_type: CacheType,
        content_hash: &str,
    ) -> CoreResult<Option<ExtractionCacheEntry>>;

    async fn store(&self, entry: ExtractionCacheEntry) -> CoreResult<()>;

    async fn get_by_chunk_id(&self, project_id: &str, chunk_id: &str) -> CoreResult<Vec<ExtractionCacheEntry>>;

    async fn delete_by_project(&self, project_id: &str) -> CoreResult<()>;
}

/// In-process adapter. Production deployments would back this with a
/// durable k/v store; a dedicated embedded store such as `redb` — used
/// for exactly this kind of content-addressed log elsewhere — is the
/// natural fit, left as a pluggable adapter behind this trait.
#[derive(Default)]
pub struct InMemoryExtractionCache {
    entries: RwLock<HashMap<(String, &'static str, String), ExtractionCacheEntry>>,
}

impl InMemoryExtractionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(project_id: &str, cache_type: CacheType, content_hash: &str) -> (String, &'static str, String) {
        (project_id.to_string(), cache_type.as_str(), content_hash.to_string())
    }
}

#[async_trait]
impl ExtractionCache for InMemoryExtractionCache {
    async fn get(
        &self,
        project_id: &str,
        cache_type: CacheType,
        content_hash: &str,
    ) -> CoreResult<Option<ExtractionCacheEntry>> {
        let key = Self::key(project_id, cache_type, content_hash);
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn store(&self, mut entry: ExtractionCacheEntry) -> CoreResult<()> {
        if entry.id.is_empty() {
            entry.id = Uuid::new_v4().to_string();
        }
        if entry.created_at.timestamp() == 0 {
            entry.created_at = Utc::now();
        }
        let key = Self::key(&entry.project_id, entry.cache_type, &entry.content_hash);
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    async fn get_by_chunk_id(&self, project_id: &str, chunk_id: &str) -> CoreResult<Vec<ExtractionCacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.project_id == project_id && e.chunk_id.as_deref() == Some(chunk_id))
            .cloned()
            .collect())
    }

    async fn delete_by_project(&self, project_id: &str) -> CoreResult<()> {
        self.entries.write().await.retain(|_, v| v.project_id != project_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(project: &str, hash: &str, chunk_id: &str) -> ExtractionCacheEntry {
        ExtractionCacheEntry {
            id: String::new(),
            project_id: project.to_string(),
            cache_type: CacheType::EntityExtraction,
            chunk_id: Some(chunk_id.to_string()),
            content_hash: hash.to_string(),
            result: "entity<FS>Alice<FS>PERSON<FS>desc<RS>".to_string(),
            tokens_used: 10,
            created_at: chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn round_trip_hit() {
        let cache = InMemoryExtractionCache::new();
        cache.store(entry("p1", "h1", "c1")).await.unwrap();
        let hit = cache.get("p1", CacheType::EntityExtraction, "h1").await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn miss_on_different_project() {
        let cache = InMemoryExtractionCache::new();
        cache.store(entry("p1", "h1", "c1")).await.unwrap();
        let hit = cache.get("p2", CacheType::EntityExtraction, "h1").await.unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn get_by_chunk_id_finds_entries() {
        let cache = InMemoryExtractionCache::new();
        cache.store(entry("p1", "h1", "c1")).await.unwrap();
        cache.store(entry("p1", "h2", "c1")).await.unwrap();
        let entries = cache.get_by_chunk_id("p1", "c1").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_project_clears_all_its_entries() {
        let cache = InMemoryExtractionCache::new();
        cache.store(entry("p1", "h1", "c1")).await.unwrap();
        cache.delete_by_project("p1").await.unwrap();
        assert!(cache.get("p1", CacheType::EntityExtraction, "h1").await.unwrap().is_none());
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("hello", "v1"), content_hash("hello", "v1"));
        assert_ne!(content_hash("hello", "v1"), content_hash("hello", "v2"));
    }
}
