//! Deletion service: removes a document's contribution to the
//! graph, rebuilding entities/relations that still have surviving
//! provenance from cached extractions rather than re-calling the LLM.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::cache::ExtractionCache;
use crate::description::DescriptionSummarizer;
use crate::error::CoreResult;
use crate::extractor::parse_cached_extraction;
use crate::graph_store::GraphStore;
use crate::models::{CacheType, Entity, Relation};
use crate::token_tracker::TokenTracker;
use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    pub entities_deleted: Vec<String>,
    pub entities_rebuilt: Vec<String>,
    pub relations_deleted: usize,
    pub relations_rebuilt: usize,
    pub errors: Vec<String>,
}

enum Classification {
    FullDelete,
    Rebuild(VecDeque<String>),
    NoChange,
}

fn classify(source_chunk_ids: &VecDeque<String>, deleted_chunks: &std::collections::HashSet<&String>) -> Classification {
    if source_chunk_ids.is_empty() {
        return Classification::NoChange;
    }
    let remaining: VecDeque<String> = source_chunk_ids.iter().filter(|id| !deleted_chunks.contains(id)).cloned().collect();
    if remaining.is_empty() {
        Classification::FullDelete
    } else if remaining.len() == source_chunk_ids.len() {
        Classification::NoChange
    } else {
        Classification::Rebuild(remaining)
    }
}

pub struct DeletionService {
    graph_store: Arc<dyn GraphStore>,
    vector_store: Arc<dyn VectorStore>,
    cache: Arc<dyn ExtractionCache>,
    summarizer: DescriptionSummarizer,
    entity_name_max_length: usize,
}

impl DeletionService {
    pub fn new(
        graph_store: Arc<dyn GraphStore>,
        vector_store: Arc<dyn VectorStore>,
        cache: Arc<dyn ExtractionCache>,
        summarizer: DescriptionSummarizer,
        entity_name_max_length: usize,
    ) -> Self {
        Self { graph_store, vector_store, cache, summarizer, entity_name_max_length }
    }

    pub async fn delete_document(
        &self,
        project_id: &str,
        document_id: &str,
        skip_rebuild: bool,
        tracker: &TokenTracker,
    ) -> CoreResult<DeletionReport> {
        let mut report = DeletionReport::default();

        let chunk_ids = self.vector_store.get_chunk_ids_by_document_id(project_id, document_id).await?;
        if chunk_ids.is_empty() {
            return Ok(report);
        }
        let deleted_chunks: std::collections::HashSet<&String> = chunk_ids.iter().collect();

        let entities = self.graph_store.get_entities_by_source_chunks(project_id, &chunk_ids).await?;
        let relations = self.graph_store.get_relations_by_source_chunks(project_id, &chunk_ids).await?;

        let mut full_delete_entities = Vec::new();
        let mut rebuild_entities: Vec<(Entity, VecDeque<String>)> = Vec::new();
        for entity in entities {
            match classify(&entity.source_chunk_ids, &deleted_chunks) {
                Classification::FullDelete => full_delete_entities.push(entity.name),
                Classification::Rebuild(remaining) => rebuild_entities.push((entity, remaining)),
                Classification::NoChange => {}
            }
        }

        let mut full_delete_relations = Vec::new();
        let mut rebuild_relations: Vec<(Relation, VecDeque<String>)> = Vec::new();
        for relation in relations {
            match classify(&relation.source_chunk_ids, &deleted_chunks) {
                Classification::FullDelete => full_delete_relations.push(relation.unordered_key()),
                Classification::Rebuild(remaining) => rebuild_relations.push((relation, remaining)),
                Classification::NoChange => {}
            }
        }

        if !full_delete_entities.is_empty() {
            if let Err(e) = self.graph_store.delete_entities(project_id, &full_delete_entities).await {
                report.errors.push(format!("failed to delete entities: {e}"));
            } else if let Err(e) = self.vector_store.delete_entity_embeddings(project_id, &full_delete_entities).await {
                report.errors.push(format!("failed to delete entity embeddings: {e}"));
            }
            report.entities_deleted = full_delete_entities;
        }
        if !full_delete_relations.is_empty() {
            report.relations_deleted = full_delete_relations.len();
            if let Err(e) = self.graph_store.delete_relations(project_id, &full_delete_relations).await {
                report.errors.push(format!("failed to delete relations: {e}"));
            }
        }

        if !skip_rebuild {
            for (entity, remaining) in rebuild_entities {
                match self.rebuild_entity(project_id, &entity, &remaining, tracker).await {
                    Ok(()) => report.entities_rebuilt.push(entity.name),
                    Err(e) => report.errors.push(format!("failed to rebuild entity {}: {e}", entity.name)),
                }
            }
            for (relation, remaining) in rebuild_relations {
                match self.rebuild_relation(project_id, &relation, &remaining).await {
                    Ok(()) => report.relations_rebuilt += 1,
                    Err(e) => report.errors.push(format!(
                        "failed to rebuild relation {} -> {}: {e}",
                        relation.src_name, relation.tgt_name
                    )),
                }
            }
        }

        if let Err(e) = self.vector_store.delete_chunk_embeddings(project_id, &chunk_ids).await {
            report.errors.push(format!("failed to delete chunk embeddings: {e}"));
        }

        Ok(report)
    }

    /// Recovers per-chunk descriptions from the cached raw extraction text
    /// for each surviving chunk — never calls the LLM for extraction on
    /// this path, only (optionally) for the final summarization.
    async fn rebuild_entity(&self, project_id: &str, entity: &Entity, remaining: &VecDeque<String>, tracker: &TokenTracker) -> CoreResult<()> {
        let mut descriptions = Vec::new();
        for chunk_id in remaining {
            let cached = self.cache.get_by_chunk_id(project_id, chunk_id).await?;
            for entry in cached.into_iter().filter(|e| e.cache_type == CacheType::EntityExtraction) {
                let parsed = parse_cached_extraction(project_id, chunk_id, &entry.result, self.entity_name_max_length);
                for candidate in parsed.entities {
                    if candidate.name.eq_ignore_ascii_case(&entity.name) && !candidate.description.is_empty() {
                        descriptions.push(candidate.description);
                    }
                }
            }
        }
        if descriptions.is_empty() {
            warn!(entity = %entity.name, "no surviving cached description found during rebuild; clearing description");
        }
        let description = self.summarizer.summarize(&entity.name, &descriptions, tracker).await;
        self.graph_store.update_entity_description(project_id, &entity.name, &description, remaining.clone()).await
    }

    /// Relations have no dedicated "update description" port method;
    /// rebuilding means replacing the stored edge with one whose
    /// `sourceChunkIds` no longer reference the deleted document, without
    /// re-running extraction or re-summing weight.
    async fn rebuild_relation(&self, project_id: &str, relation: &Relation, remaining: &VecDeque<String>) -> CoreResult<()> {
        self.graph_store.delete_relations(project_id, std::slice::from_ref(&relation.unordered_key())).await?;
        let mut rebuilt = Relation::new(project_id, relation.src_name.clone(), relation.tgt_name.clone());
        rebuilt.description = relation.description.clone();
        rebuilt.keywords = relation.keywords.clone();
        rebuilt.weight = relation.weight;
        rebuilt.source_chunk_ids = remaining.clone();
        self.graph_store.upsert_relation(rebuilt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{content_hash, InMemoryExtractionCache};
    use crate::config::DescriptionConfig;
    use crate::extractor::{FIELD_SEP, RECORD_SEP};
    use crate::graph_store::InMemoryGraphStore;
    use crate::llm::fakes::ScriptedLlm;
    use crate::models::ExtractionCacheEntry;
    use crate::vector_store::{EmbeddingKind, InMemoryVectorStore, VectorEntry, VectorMetadata};

    fn desc_config() -> DescriptionConfig {
        DescriptionConfig {
            force_summary_count: 6,
            summary_context_size: 10_000,
            summary_max_tokens: 500,
            max_map_iterations: 3,
            max_chars: 4000,
        }
    }

    fn service(cache: Arc<dyn ExtractionCache>) -> (DeletionService, Arc<InMemoryGraphStore>, Arc<InMemoryVectorStore>) {
        let graph = Arc::new(InMemoryGraphStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let summarizer = DescriptionSummarizer::new(llm, desc_config());
        let service = DeletionService::new(graph.clone(), vectors.clone(), cache, summarizer, 500);
        (service, graph, vectors)
    }

    fn chunk_embedding(id: &str, project: &str, document: &str) -> VectorEntry {
        VectorEntry {
            id: id.to_string(),
            vector: vec![1.0, 0.0],
            metadata: VectorMetadata {
                kind: EmbeddingKind::Chunk,
                content: "chunk text".to_string(),
                source_chunk_id: None,
                document_id: Some(document.to_string()),
                project_id: project.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn full_delete_removes_entity_with_no_surviving_chunks() {
        let cache = Arc::new(InMemoryExtractionCache::new());
        let (service, graph, vectors) = service(cache);
        vectors.upsert_batch(vec![chunk_embedding("c1", "p1", "d1")]).await.unwrap();
        let mut entity = Entity::new("p1", "Alice", "PERSON");
        entity.push_source_chunk("c1", 50);
        graph.upsert_entity(entity).await.unwrap();

        let tracker = TokenTracker::new();
        let report = service.delete_document("p1", "d1", false, &tracker).await.unwrap();
        assert_eq!(report.entities_deleted, vec!["Alice".to_string()]);
        assert!(graph.get_entity("p1", "Alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_recovers_description_from_cache_without_calling_llm() {
        let cache = Arc::new(InMemoryExtractionCache::new());
        let raw = format!("entity{FIELD_SEP}Alice{FIELD_SEP}PERSON{FIELD_SEP}still here{RECORD_SEP}");
        cache
            .store(ExtractionCacheEntry {
                id: String::new(),
                project_id: "p1".to_string(),
                cache_type: CacheType::EntityExtraction,
                chunk_id: Some("c2".to_string()),
                content_hash: content_hash("whatever", "v1"),
                result: raw,
                tokens_used: 0,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let (service, graph, vectors) = service(cache);
        vectors.upsert_batch(vec![chunk_embedding("c1", "p1", "d1")]).await.unwrap();
        let mut entity = Entity::new("p1", "Alice", "PERSON");
        entity.push_source_chunk("c1", 50);
        entity.push_source_chunk("c2", 50);
        graph.upsert_entity(entity).await.unwrap();

        let tracker = TokenTracker::new();
        let report = service.delete_document("p1", "d1", false, &tracker).await.unwrap();
        assert_eq!(report.entities_rebuilt, vec!["Alice".to_string()]);
        let rebuilt = graph.get_entity("p1", "Alice").await.unwrap().unwrap();
        assert_eq!(rebuilt.description, "still here");
        assert_eq!(rebuilt.source_chunk_ids, VecDeque::from(["c2".to_string()]));
    }

    #[tokio::test]
    async fn legacy_entities_with_no_source_chunks_are_untouched() {
        let cache = Arc::new(InMemoryExtractionCache::new());
        let (service, graph, vectors) = service(cache);
        vectors.upsert_batch(vec![chunk_embedding("c1", "p1", "d1")]).await.unwrap();
        graph.upsert_entity(Entity::new("p1", "Legacy", "PERSON")).await.unwrap();

        let tracker = TokenTracker::new();
        service.delete_document("p1", "d1", false, &tracker).await.unwrap();
        assert!(graph.get_entity("p1", "Legacy").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn skip_rebuild_leaves_partially_sourced_entities_unchanged() {
        let cache = Arc::new(InMemoryExtractionCache::new());
        let (service, graph, vectors) = service(cache);
        vectors.upsert_batch(vec![chunk_embedding("c1", "p1", "d1")]).await.unwrap();
        let mut entity = Entity::new("p1", "Alice", "PERSON");
        entity.description = "original".to_string();
        entity.push_source_chunk("c1", 50);
        entity.push_source_chunk("c2", 50);
        graph.upsert_entity(entity).await.unwrap();

        let tracker = TokenTracker::new();
        let report = service.delete_document("p1", "d1", true, &tracker).await.unwrap();
        assert!(report.entities_rebuilt.is_empty());
        let unchanged = graph.get_entity("p1", "Alice").await.unwrap().unwrap();
        assert_eq!(unchanged.description, "original");
    }
}
