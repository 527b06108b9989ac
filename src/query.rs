//! Query executors: dispatches on [`QueryMode`], runs
//! independent retrievals concurrently, and truncates the assembled
//! context to the per-request token budget.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{NeighborExpansionConfig, QueryBudgetRatios};
use crate::context_merger::{ContextMerger, MergeItem};
use crate::graph_store::GraphStore;
use crate::keyword_extractor::KeywordExtractor;
use crate::llm::Embedder;
use crate::models::Entity;
use crate::reranker::RerankingService;
use crate::token_tracker::TokenTracker;
use crate::tokens::TokenAccountant;
use crate::vector_store::{EmbeddingKind, VectorQueryFilter, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Naive,
    Bypass,
    Local,
    Global,
    Hybrid,
    Mix,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub items_included: usize,
    pub items_truncated: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub context: String,
    pub stats: QueryStats,
}

pub struct QueryEngine {
    pub vector_store: Arc<dyn VectorStore>,
    pub graph_store: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn Embedder>,
    pub keyword_extractor: KeywordExtractor,
    pub reranker: RerankingService,
    pub merger: ContextMerger,
    pub accountant: TokenAccountant,
    pub neighbor_expansion: NeighborExpansionConfig,
    pub query_budget: QueryBudgetRatios,
    pub query_context_max_tokens: usize,
    pub query_top_k: usize,
}

impl QueryEngine {
    pub async fn query(&self, project_id: &str, query_text: &str, mode: QueryMode, tracker: &TokenTracker) -> QueryResult {
        match mode {
            QueryMode::Bypass => QueryResult::default(),
            QueryMode::Naive => self.naive(project_id, query_text, tracker).await,
            QueryMode::Local => {
                let items = self.local_items(project_id, query_text, tracker).await;
                self.finalize(items)
            }
            QueryMode::Global => {
                let items = self.global_items(project_id, query_text, tracker).await;
                self.finalize(items)
            }
            QueryMode::Hybrid => {
                let (local, global) = tokio::join!(
                    self.local_items(project_id, query_text, tracker),
                    self.global_items(project_id, query_text, tracker),
                );
                self.merge_budgeted(vec![local, global])
            }
            QueryMode::Mix => {
                let (local, global, chunks) = tokio::join!(
                    self.local_items(project_id, query_text, tracker),
                    self.global_items(project_id, query_text, tracker),
                    self.chunk_items(project_id, query_text),
                );
                let chunks = self.apply_rerank(query_text, chunks).await;
                self.merge_budgeted(vec![local, global, chunks])
            }
        }
    }

    async fn naive(&self, project_id: &str, query_text: &str, _tracker: &TokenTracker) -> QueryResult {
        let items = self.chunk_items(project_id, query_text).await;
        self.finalize(items)
    }

    async fn chunk_items(&self, project_id: &str, query_text: &str) -> Vec<MergeItem> {
        let Ok(vector) = self.embedder.embed_single(query_text).await else {
            return Vec::new();
        };
        let vector: Vec<f32> = vector.iter().map(|v| *v as f32).collect();
        let hits = self
            .vector_store
            .query(&vector, self.query_top_k, VectorQueryFilter { kind: Some(EmbeddingKind::Chunk), project_id: project_id.to_string() })
            .await
            .unwrap_or_default();
        hits.into_iter()
            .map(|hit| {
                let tokens = self.accountant.count(&hit.metadata.content);
                MergeItem { content: hit.metadata.content, item_type: "chunk".to_string(), tokens }
            })
            .collect()
    }

    async fn local_items(&self, project_id: &str, query_text: &str, tracker: &TokenTracker) -> Vec<MergeItem> {
        let keywords = self.keyword_extractor.extract(project_id, query_text, tracker).await;
        let embed_text = if keywords.low_level.is_empty() { query_text.to_string() } else { keywords.low_level.join(", ") };
        let Ok(vector) = self.embedder.embed_single(&embed_text).await else {
            return Vec::new();
        };
        let vector: Vec<f32> = vector.iter().map(|v| *v as f32).collect();
        let hits = self
            .vector_store
            .query(&vector, self.query_top_k, VectorQueryFilter { kind: Some(EmbeddingKind::Entity), project_id: project_id.to_string() })
            .await
            .unwrap_or_default();

        let names: Vec<String> = hits.into_iter().map(|h| h.id).collect();
        let mut entities = self.graph_store.get_entities(project_id, &names).await.unwrap_or_default();
        if self.neighbor_expansion.enabled {
            entities = self.expand_neighbors(project_id, entities).await;
        }
        entities_to_items(&self.accountant, &entities)
    }

    async fn global_items(&self, project_id: &str, query_text: &str, tracker: &TokenTracker) -> Vec<MergeItem> {
        let keywords = self.keyword_extractor.extract(project_id, query_text, tracker).await;
        let embed_text = if keywords.high_level.is_empty() { query_text.to_string() } else { keywords.high_level.join(", ") };
        let Ok(vector) = self.embedder.embed_single(&embed_text).await else {
            return Vec::new();
        };
        let vector: Vec<f32> = vector.iter().map(|v| *v as f32).collect();
        let hits = self
            .vector_store
            .query(&vector, self.query_top_k, VectorQueryFilter { kind: Some(EmbeddingKind::Entity), project_id: project_id.to_string() })
            .await
            .unwrap_or_default();

        let seed_names: Vec<String> = hits.into_iter().map(|h| h.id).collect();
        let mut relations = Vec::new();
        for name in &seed_names {
            relations.extend(self.graph_store.get_relations_for_entity(project_id, name).await.unwrap_or_default());
        }
        relations
            .into_iter()
            .map(|r| {
                let content = format!("{} -> {} : {}", r.src_name, r.tgt_name, r.description);
                let tokens = self.accountant.count(&content);
                MergeItem { content, item_type: "relation".to_string(), tokens }
            })
            .collect()
    }

    /// Divides the configured node budget evenly across seed entities and
    /// merges BFS results into a deduplicated set, preserving seed order.
    async fn expand_neighbors(&self, project_id: &str, seeds: Vec<Entity>) -> Vec<Entity> {
        if seeds.is_empty() {
            return seeds;
        }
        let per_seed_budget = (self.neighbor_expansion.max_nodes / seeds.len()).max(1);
        let mut seen: HashSet<String> = HashSet::new();
        let mut expanded = Vec::new();

        for seed in &seeds {
            if seen.insert(seed.name.to_lowercase()) {
                expanded.push(seed.clone());
            }
        }
        for seed in &seeds {
            let subgraph = self
                .graph_store
                .traverse_bfs(project_id, &seed.name, self.neighbor_expansion.max_depth, per_seed_budget)
                .await
                .unwrap_or_default();
            for entity in subgraph.entities {
                if seen.insert(entity.name.to_lowercase()) {
                    expanded.push(entity);
                }
            }
        }
        expanded
    }

    async fn apply_rerank(&self, query_text: &str, items: Vec<MergeItem>) -> Vec<MergeItem> {
        let top_k = items.len();
        let contents: Vec<String> = items.iter().map(|i| i.content.clone()).collect();
        let reranked = self.reranker.rerank(query_text, contents, top_k).await;
        reranked
            .into_iter()
            .map(|content| {
                let tokens = self.accountant.count(&content);
                MergeItem { content, item_type: "chunk".to_string(), tokens }
            })
            .collect()
    }

    fn merge_budgeted(&self, sources: Vec<Vec<MergeItem>>) -> QueryResult {
        let ratios = match sources.len() {
            2 => vec![
                self.query_budget.entity / (self.query_budget.entity + self.query_budget.relation),
                self.query_budget.relation / (self.query_budget.entity + self.query_budget.relation),
            ],
            3 => vec![self.query_budget.entity, self.query_budget.relation, self.query_budget.chunk],
            _ => return self.finalize(sources.into_iter().flatten().collect()),
        };

        let mut merged_all = Vec::new();
        let mut truncated_total = 0usize;
        let mut tokens_total = 0usize;
        for (source, ratio) in sources.into_iter().zip(ratios) {
            let budget = (self.query_context_max_tokens as f64 * ratio) as usize;
            let (items, stats) = self.merger.merge(vec![source], budget);
            merged_all.extend(items);
            truncated_total += stats.items_truncated;
            tokens_total += stats.total_tokens;
        }

        let context = merged_all.iter().map(|i| i.content.as_str()).collect::<Vec<_>>().join("\n");
        QueryResult {
            context,
            stats: QueryStats { items_included: merged_all.len(), items_truncated: truncated_total, total_tokens: tokens_total },
        }
    }

    fn finalize(&self, items: Vec<MergeItem>) -> QueryResult {
        let (merged, stats) = self.merger.merge(vec![items], self.query_context_max_tokens);
        let context = merged.iter().map(|i| i.content.as_str()).collect::<Vec<_>>().join("\n");
        QueryResult {
            context,
            stats: QueryStats { items_included: stats.items_included, items_truncated: stats.items_truncated, total_tokens: stats.total_tokens },
        }
    }
}

fn entities_to_items(accountant: &TokenAccountant, entities: &[Entity]) -> Vec<MergeItem> {
    entities
        .iter()
        .map(|e| {
            let content = format!("({}, {}, {})", e.name, e.entity_type, e.description);
            let tokens = accountant.count(&content);
            MergeItem { content, item_type: "entity".to_string(), tokens }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryExtractionCache;
    use crate::config::{EngineConfig, RerankConfig};
    use crate::graph_store::InMemoryGraphStore;
    use crate::llm::fakes::{HashEmbedder, ScriptedLlm};
    use crate::vector_store::{InMemoryVectorStore, VectorEntry, VectorMetadata};

    fn engine() -> QueryEngine {
        let cfg = EngineConfig::for_tests();
        QueryEngine {
            vector_store: Arc::new(InMemoryVectorStore::new()),
            graph_store: Arc::new(InMemoryGraphStore::new()),
            embedder: Arc::new(HashEmbedder::default()),
            keyword_extractor: KeywordExtractor::new(Arc::new(ScriptedLlm::new(vec![])), Arc::new(InMemoryExtractionCache::new())),
            reranker: RerankingService::new(None, RerankConfig { enabled: false, ..cfg.rerank.clone() }),
            merger: ContextMerger::new(),
            accountant: TokenAccountant,
            neighbor_expansion: cfg.neighbor_expansion.clone(),
            query_budget: cfg.query_budget.clone(),
            query_context_max_tokens: cfg.query_context_max_tokens,
            query_top_k: cfg.query_top_k,
        }
    }

    #[tokio::test]
    async fn bypass_mode_returns_empty_context() {
        let engine = engine();
        let tracker = TokenTracker::new();
        let result = engine.query("p1", "anything", QueryMode::Bypass, &tracker).await;
        assert!(result.context.is_empty());
    }

    #[tokio::test]
    async fn naive_mode_retrieves_chunks_from_vector_store() {
        let engine = engine();
        engine
            .vector_store
            .upsert_batch(vec![VectorEntry {
                id: "c1".to_string(),
                vector: vec![1.0, 0.0],
                metadata: VectorMetadata {
                    kind: EmbeddingKind::Chunk,
                    content: "chunk about inflation".to_string(),
                    source_chunk_id: None,
                    document_id: None,
                    project_id: "p1".to_string(),
                },
            }])
            .await
            .unwrap();

        let tracker = TokenTracker::new();
        let result = engine.query("p1", "inflation", QueryMode::Naive, &tracker).await;
        assert!(result.context.contains("inflation"));
    }

    #[tokio::test]
    async fn local_mode_hydrates_entities_from_graph_store() {
        let engine = engine();
        engine.graph_store.upsert_entity(Entity::new("p1", "Federal Reserve", "ORGANIZATION")).await.unwrap();
        engine
            .vector_store
            .upsert_batch(vec![VectorEntry {
                id: "Federal Reserve".to_string(),
                vector: vec![1.0, 0.0],
                metadata: VectorMetadata {
                    kind: EmbeddingKind::Entity,
                    content: "Federal Reserve".to_string(),
                    source_chunk_id: None,
                    document_id: None,
                    project_id: "p1".to_string(),
                },
            }])
            .await
            .unwrap();

        let tracker = TokenTracker::new();
        let result = engine.query("p1", "who sets interest rates", QueryMode::Local, &tracker).await;
        assert!(result.context.contains("Federal Reserve"));
    }
}
