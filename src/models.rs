//! Domain model: the typed property graph, chunks, and the transient
//! records that flow through deduplication and caching.

use std::collections::{HashSet, VecDeque};
use serde::{Deserialize, Serialize};

/// FIFO bound on `Entity::source_chunk_ids` / `Relation::source_chunk_ids`.
pub const DEFAULT_SOURCE_CHUNK_CAP: usize = 50;

/// A node in the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub project_id: String,
    /// Canonical identifier, already normalized.
    pub name: String,
    pub entity_type: String,
    pub description: String,
    /// FIFO-bounded, de-duplicated chunk provenance.
    pub source_chunk_ids: VecDeque<String>,
    pub document_id: Option<String>,
    pub file_path: Option<String>,
    pub global_keys: Option<HashSet<String>>,
}

impl Entity {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            description: String::new(),
            source_chunk_ids: VecDeque::new(),
            document_id: None,
            file_path: None,
            global_keys: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}::{}", self.project_id, self.name.to_lowercase())
    }

    /// Push a source chunk id, de-duplicating and enforcing the FIFO cap.
    pub fn push_source_chunk(&mut self, chunk_id: impl Into<String>, cap: usize) {
        let chunk_id = chunk_id.into();
        if self.source_chunk_ids.contains(&chunk_id) {
            return;
        }
        self.source_chunk_ids.push_back(chunk_id);
        while self.source_chunk_ids.len() > cap {
            self.source_chunk_ids.pop_front();
        }
    }

    pub fn merge_source_chunks(&mut self, other: &VecDeque<String>, cap: usize) {
        for id in other {
            self.push_source_chunk(id.clone(), cap);
        }
    }
}

/// An edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub project_id: String,
    pub src_name: String,
    pub tgt_name: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    pub source_chunk_ids: VecDeque<String>,
    pub document_id: Option<String>,
    pub file_path: Option<String>,
}

impl Relation {
    pub fn new(project_id: impl Into<String>, src_name: impl Into<String>, tgt_name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            src_name: src_name.into(),
            tgt_name: tgt_name.into(),
            description: String::new(),
            keywords: String::new(),
            weight: 1.0,
            source_chunk_ids: VecDeque::new(),
            document_id: None,
            file_path: None,
        }
    }

    /// `{lowercase(src), lowercase(tgt)}` — the unordered identity of a
    /// relation within a project.
    pub fn unordered_key(&self) -> (String, String) {
        let a = self.src_name.to_lowercase();
        let b = self.tgt_name.to_lowercase();
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Self-loops are forbidden; filtered at extraction, dedup, and merge
    /// time.
    pub fn is_self_loop(&self) -> bool {
        self.src_name.to_lowercase() == self.tgt_name.to_lowercase()
    }

    pub fn push_source_chunk(&mut self, chunk_id: impl Into<String>, cap: usize) {
        let chunk_id = chunk_id.into();
        if self.source_chunk_ids.contains(&chunk_id) {
            return;
        }
        self.source_chunk_ids.push_back(chunk_id);
        while self.source_chunk_ids.len() > cap {
            self.source_chunk_ids.pop_front();
        }
    }
}

/// A content-addressed slice of a source document — the unit of
/// extraction and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project_id: String,
    pub document_id: String,
    pub content: String,
    pub tokens: usize,
    pub chunk_order_index: usize,
}

/// Pairwise similarity result produced by the similarity calculator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub jaccard: f64,
    pub containment: f64,
    pub levenshtein: f64,
    pub abbreviation: f64,
    pub token_overlap: f64,
    pub length_penalty: f64,
    pub final_score: f64,
}

/// A connected component produced by the clusterer, prior to
/// being turned into a canonical [`Entity`].
#[derive(Debug, Clone)]
pub struct Cluster {
    pub member_indices: Vec<usize>,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub entity_type: String,
    pub merged_descriptions: Vec<String>,
    pub merged_source_chunk_ids: VecDeque<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    EntityExtraction,
    Gleaning,
    Summarization,
    KeywordExtraction,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::EntityExtraction => "ENTITY_EXTRACTION",
            CacheType::Gleaning => "GLEANING",
            CacheType::Summarization => "SUMMARIZATION",
            CacheType::KeywordExtraction => "KEYWORD_EXTRACTION",
        }
    }
}

/// A durable, content-addressed LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionCacheEntry {
    pub id: String,
    pub project_id: String,
    pub cache_type: CacheType,
    pub chunk_id: Option<String>,
    pub content_hash: String,
    /// Raw LLM output text; preserves the tuple-delimited format so it can
    /// be re-parsed during deletion-rebuild.
    pub result: String,
    pub tokens_used: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One LLM/embedding call's token cost, immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub operation_type: String,
    pub model_name: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Aggregated per-request token accounting, returned to callers of
/// [`crate::orchestrator::Orchestrator`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSummary {
    pub total_input: u64,
    pub total_output: u64,
    pub breakdown_by_operation: std::collections::HashMap<String, (u64, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_chunk_fifo_cap_and_dedup() {
        let mut e = Entity::new("p1", "Alice", "PERSON");
        for i in 0..60 {
            e.push_source_chunk(format!("chunk-{i}"), DEFAULT_SOURCE_CHUNK_CAP);
        }
        assert_eq!(e.source_chunk_ids.len(), DEFAULT_SOURCE_CHUNK_CAP);
        assert_eq!(e.source_chunk_ids.front().unwrap(), "chunk-10");
        e.push_source_chunk("chunk-59", DEFAULT_SOURCE_CHUNK_CAP);
        assert_eq!(e.source_chunk_ids.len(), DEFAULT_SOURCE_CHUNK_CAP);
    }

    #[test]
    fn relation_unordered_key_is_symmetric() {
        let r1 = Relation::new("p1", "Alice", "Bob");
        let r2 = Relation::new("p1", "bob", "alice");
        assert_eq!(r1.unordered_key(), r2.unordered_key());
    }

    #[test]
    fn self_loop_detection_is_case_insensitive() {
        let r = Relation::new("p1", "Alice", "ALICE");
        assert!(r.is_self_loop());
    }
}
