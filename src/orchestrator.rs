//! Orchestrator: the RAG façade. Two entry points —
//! `ingest_document` (chunk → embed → extract → resolve → store) and
//! `query` (delegates to [`QueryEngine`]) — with every sub-component
//! bound from a single [`EngineConfig`].

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cache::ExtractionCache;
use crate::chunking::Chunker;
use crate::config::EngineConfig;
use crate::context_merger::ContextMerger;
use crate::deletion_service::{DeletionReport, DeletionService};
use crate::error::CoreResult;
use crate::extractor::Extractor;
use crate::graph_store::GraphStore;
use crate::keyword_extractor::KeywordExtractor;
use crate::llm::{Embedder, Llm};
use crate::merge_service::{MergeService, MergeStrategy};
use crate::models::{Entity, TokenSummary};
use crate::query::{QueryEngine, QueryMode, QueryResult};
use crate::reranker::{Reranker, RerankingService};
use crate::resolver::Resolver;
use crate::similarity::SimilarityCalculator;
use crate::token_tracker::TokenTracker;
use crate::tokens::TokenAccountant;
use crate::vector_store::{EmbeddingKind, VectorEntry, VectorMetadata, VectorStore};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestionSummary {
    pub document_id: String,
    pub chunks_ingested: usize,
    pub entities_upserted: usize,
    pub relations_upserted: usize,
    pub malformed_records: u32,
}

/// Binds every sub-component from one [`EngineConfig`], passed as a
/// single immutable configuration structure. Cheap to construct once
/// per process and shared behind an `Arc` by callers.
pub struct Orchestrator {
    config: EngineConfig,
    graph_store: Arc<dyn GraphStore>,
    vector_store: Arc<dyn VectorStore>,
    cache: Arc<dyn ExtractionCache>,
    llm: Arc<dyn Llm>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<Extractor>,
    resolver: Arc<Resolver>,
    query_engine: Arc<QueryEngine>,
    merge_service: Arc<MergeService>,
    deletion_service: Arc<DeletionService>,
    chunker: Chunker,
    ingestion_semaphore: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        graph_store: Arc<dyn GraphStore>,
        vector_store: Arc<dyn VectorStore>,
        cache: Arc<dyn ExtractionCache>,
        llm: Arc<dyn Llm>,
        embedder: Arc<dyn Embedder>,
        reranker_provider: Option<Box<dyn Reranker>>,
    ) -> Self {
        let extractor = Arc::new(Extractor::new(llm.clone(), cache.clone(), &config));

        let similarity = SimilarityCalculator::new(
            config.similarity.weights,
            config.entity_name_max_length,
            config.similarity.early_termination_ratio,
        );
        let description_summarizer =
            crate::description::DescriptionSummarizer::new(llm.clone(), config.description.clone());
        let resolver = Arc::new(Resolver::new(similarity, config.similarity.threshold, config.source_chunk_ids_max, description_summarizer));

        let keyword_extractor = KeywordExtractor::new(llm.clone(), cache.clone());
        let reranker = RerankingService::new(reranker_provider, config.rerank.clone());
        let query_engine = Arc::new(QueryEngine {
            vector_store: vector_store.clone(),
            graph_store: graph_store.clone(),
            embedder: embedder.clone(),
            keyword_extractor,
            reranker,
            merger: ContextMerger::new(),
            accountant: TokenAccountant,
            neighbor_expansion: config.neighbor_expansion.clone(),
            query_budget: config.query_budget.clone(),
            query_context_max_tokens: config.query_context_max_tokens,
            query_top_k: config.query_top_k,
        });

        let merge_summarizer = crate::description::DescriptionSummarizer::new(llm.clone(), config.description.clone());
        let merge_service = Arc::new(MergeService::new(graph_store.clone(), vector_store.clone(), merge_summarizer, config.source_chunk_ids_max));

        let deletion_summarizer = crate::description::DescriptionSummarizer::new(llm.clone(), config.description.clone());
        let deletion_service = Arc::new(DeletionService::new(
            graph_store.clone(),
            vector_store.clone(),
            cache.clone(),
            deletion_summarizer,
            config.entity_name_max_length,
        ));

        let chunker = Chunker::new(config.chunk_size_tokens, config.chunk_overlap_tokens);
        let parallelism = config.parallelism.max(1);

        Self {
            config,
            graph_store,
            vector_store,
            cache,
            llm,
            embedder,
            extractor,
            resolver,
            query_engine,
            merge_service,
            deletion_service,
            chunker,
            ingestion_semaphore: Arc::new(Semaphore::new(parallelism)),
        }
    }

    /// Chunks `text`, embeds and extracts each chunk with bounded
    /// parallelism (roughly a quarter of the embedding batch size in
    /// spirit, simplified here to the configured `parallelism` cap),
    /// resolves the combined entity/relation batch once extraction of
    /// all chunks has completed — so resolver merges are applied before
    /// any write to the graph store — then upserts.
    pub async fn ingest_document(&self, project_id: &str, document_id: &str, text: &str) -> CoreResult<(IngestionSummary, TokenSummary)> {
        let tracker = TokenTracker::new();
        self.graph_store.create_project_graph(project_id).await?;

        let chunks = self.chunker.chunk(project_id, document_id, text);
        if chunks.is_empty() {
            return Ok((IngestionSummary { document_id: document_id.to_string(), ..Default::default() }, tracker.summary().await));
        }

        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed_texts(&chunk_texts).await.unwrap_or_default();

        let mut chunk_entries = Vec::new();
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            chunk_entries.push(VectorEntry {
                id: chunk.id.clone(),
                vector: embedding.iter().map(|v| *v as f32).collect(),
                metadata: VectorMetadata {
                    kind: EmbeddingKind::Chunk,
                    content: chunk.content.clone(),
                    source_chunk_id: None,
                    document_id: Some(document_id.to_string()),
                    project_id: project_id.to_string(),
                },
            });
        }
        if !chunk_entries.is_empty() {
            self.vector_store.upsert_batch(chunk_entries).await?;
        }

        let extraction_tasks = chunks.iter().map(|chunk| {
            let extractor = self.extractor.clone();
            let semaphore = self.ingestion_semaphore.clone();
            let project_id = project_id.to_string();
            let chunk = chunk.clone();
            let tracker = tracker.clone();
            async move {
                let _permit = semaphore.acquire_owned().await;
                extractor.extract(&project_id, &chunk, &tracker).await
            }
        });
        let extraction_results = join_all(extraction_tasks).await;

        let mut all_entities = Vec::new();
        let mut all_relations = Vec::new();
        let mut malformed_total = 0u32;
        for result in extraction_results {
            all_entities.extend(result.entities);
            all_relations.extend(result.relations);
            malformed_total += result.malformed_record_count;
        }
        if malformed_total > 0 {
            warn!(malformed_total, document_id, "some extraction records were malformed and skipped");
        }

        let (resolved_entities, resolved_relations) = self.resolver.resolve(all_entities, all_relations, &tracker).await;

        let mut entities_with_doc = resolved_entities;
        for entity in &mut entities_with_doc {
            entity.document_id = Some(document_id.to_string());
        }
        let mut relations_with_doc = resolved_relations;
        for relation in &mut relations_with_doc {
            relation.document_id = Some(document_id.to_string());
        }

        self.graph_store.upsert_entities(entities_with_doc.clone()).await?;
        self.graph_store.upsert_relations(relations_with_doc.clone()).await?;

        self.embed_and_store_entities(project_id, &entities_with_doc).await?;

        info!(
            document_id,
            chunks = chunks.len(),
            entities = entities_with_doc.len(),
            relations = relations_with_doc.len(),
            "document ingested"
        );

        let summary = IngestionSummary {
            document_id: document_id.to_string(),
            chunks_ingested: chunks.len(),
            entities_upserted: entities_with_doc.len(),
            relations_upserted: relations_with_doc.len(),
            malformed_records: malformed_total,
        };
        Ok((summary, tracker.summary().await))
    }

    async fn embed_and_store_entities(&self, project_id: &str, entities: &[Entity]) -> CoreResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = entities.iter().map(|e| format!("{}: {}", e.name, e.description)).collect();
        let embeddings = self.embedder.embed_texts(&texts).await.unwrap_or_default();

        let entries: Vec<VectorEntry> = entities
            .iter()
            .zip(embeddings.iter())
            .map(|(entity, embedding)| VectorEntry {
                id: entity.name.clone(),
                vector: embedding.iter().map(|v| *v as f32).collect(),
                metadata: VectorMetadata {
                    kind: EmbeddingKind::Entity,
                    content: entity.name.clone(),
                    source_chunk_id: None,
                    document_id: entity.document_id.clone(),
                    project_id: project_id.to_string(),
                },
            })
            .collect();
        if !entries.is_empty() {
            self.vector_store.upsert_batch(entries).await?;
        }
        Ok(())
    }

    pub async fn query(&self, project_id: &str, query_text: &str, mode: QueryMode) -> (QueryResult, TokenSummary) {
        let tracker = TokenTracker::new();
        let result = self.query_engine.query(project_id, query_text, mode, &tracker).await;
        (result, tracker.summary().await)
    }

    pub async fn merge(&self, project_id: &str, source_names: &[String], target_name: &str, strategy: MergeStrategy) -> CoreResult<(Entity, TokenSummary)> {
        let tracker = TokenTracker::new();
        let entity = self.merge_service.merge(project_id, source_names, target_name, strategy, &tracker).await?;
        Ok((entity, tracker.summary().await))
    }

    pub async fn delete_document(&self, project_id: &str, document_id: &str, skip_rebuild: bool) -> CoreResult<(DeletionReport, TokenSummary)> {
        let tracker = TokenTracker::new();
        let report = self.deletion_service.delete_document(project_id, document_id, skip_rebuild, &tracker).await?;
        Ok((report, tracker.summary().await))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryExtractionCache;
    use crate::graph_store::InMemoryGraphStore;
    use crate::llm::fakes::{HashEmbedder, ScriptedLlm};
    use crate::vector_store::InMemoryVectorStore;

    fn orchestrator(llm_responses: Vec<String>) -> Orchestrator {
        let cfg = EngineConfig::for_tests();
        let graph_store = Arc::new(InMemoryGraphStore::new());
        let vector_store = Arc::new(InMemoryVectorStore::new());
        let cache = Arc::new(InMemoryExtractionCache::new());
        let llm = Arc::new(ScriptedLlm::new(llm_responses));
        let embedder = Arc::new(HashEmbedder::default());
        Orchestrator::new(cfg, graph_store, vector_store, cache, llm, embedder, None)
    }

    #[tokio::test]
    async fn ingest_then_query_naive_finds_the_chunk() {
        let orchestrator = orchestrator(vec![]);
        let (summary, _) = orchestrator
            .ingest_document("p1", "d1", "Alice met Bob at the conference.")
            .await
            .unwrap();
        assert_eq!(summary.chunks_ingested, 1);

        let (result, _) = orchestrator.query("p1", "conference", QueryMode::Naive).await;
        assert!(result.context.contains("conference"));
    }

    #[tokio::test]
    async fn ingest_document_with_extraction_populates_the_graph() {
        use crate::extractor::{FIELD_SEP, RECORD_SEP};
        let raw = format!(
            "entity{FIELD_SEP}Alice{FIELD_SEP}PERSON{FIELD_SEP}a person{RECORD_SEP}entity{FIELD_SEP}Bob{FIELD_SEP}PERSON{FIELD_SEP}a person{RECORD_SEP}relation{FIELD_SEP}Alice{FIELD_SEP}Bob{FIELD_SEP}knows{FIELD_SEP}friends{RECORD_SEP}"
        );
        let mut cfg_responses = vec![raw];
        cfg_responses.extend(std::iter::repeat(String::new()).take(4));
        let orchestrator = orchestrator(cfg_responses);

        let (summary, _) = orchestrator.ingest_document("p1", "d1", "Alice knows Bob.").await.unwrap();
        assert_eq!(summary.entities_upserted, 2);
        assert_eq!(summary.relations_upserted, 1);

        let entity = orchestrator.graph_store.get_entity("p1", "Alice").await.unwrap();
        assert!(entity.is_some());
    }

    #[tokio::test]
    async fn empty_document_produces_an_empty_summary() {
        let orchestrator = orchestrator(vec![]);
        let (summary, _) = orchestrator.ingest_document("p1", "d1", "   ").await.unwrap();
        assert_eq!(summary.chunks_ingested, 0);
    }
}
