//! Resolver: orchestrates deduplication across a batch of
//! extracted entities/relations — type-bucket blocking, similarity +
//! clustering, canonical construction, and relation rewiring.
//!
//! Never corrupts ingestion: any internal failure logs a warning and
//! returns the original, unresolved input unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::cluster::Clusterer;
use crate::description::DescriptionSummarizer;
use crate::models::{Entity, Relation};
use crate::similarity::SimilarityCalculator;
use crate::token_tracker::TokenTracker;

/// Relation weight is additive under merging but bounded so a single
/// heavily-duplicated pair can't dominate downstream ranking.
const MAX_RELATION_WEIGHT: f64 = 100.0;
const DEDUP_RATE_WARN_THRESHOLD: f64 = 0.60;

pub struct Resolver {
    similarity: SimilarityCalculator,
    threshold: f64,
    source_chunk_cap: usize,
    summarizer: DescriptionSummarizer,
}

impl Resolver {
    pub fn new(similarity: SimilarityCalculator, threshold: f64, source_chunk_cap: usize, summarizer: DescriptionSummarizer) -> Self {
        Self { similarity, threshold, source_chunk_cap, summarizer }
    }

    pub async fn resolve(
        &self,
        entities: Vec<Entity>,
        relations: Vec<Relation>,
        tracker: &TokenTracker,
    ) -> (Vec<Entity>, Vec<Relation>) {
        let original_count = entities.len();
        let non_blank: Vec<Entity> = entities.iter().filter(|e| !e.name.trim().is_empty()).cloned().collect();

        let clusterer = Clusterer::new(&self.similarity, self.threshold, self.source_chunk_cap);
        let clusters = clusterer.cluster(&non_blank);

        let mut clustered_indices: std::collections::HashSet<usize> = std::collections::HashSet::new();
        let mut rename_map: HashMap<String, String> = HashMap::new();
        let mut canonical_entities = Vec::new();

        for cluster in &clusters {
            for &idx in &cluster.member_indices {
                clustered_indices.insert(idx);
            }
            for alias in &cluster.aliases {
                rename_map.insert(alias.to_lowercase(), cluster.canonical_name.clone());
            }

            let project_id = non_blank[cluster.member_indices[0]].project_id.clone();
            let mut canonical = Entity::new(project_id, cluster.canonical_name.clone(), cluster.entity_type.clone());
            canonical.description = self
                .summarizer
                .summarize(&cluster.canonical_name, &cluster.merged_descriptions, tracker)
                .await;
            canonical.source_chunk_ids = cluster.merged_source_chunk_ids.clone();
            canonical_entities.push(canonical);
        }

        let untouched: Vec<Entity> = non_blank
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !clustered_indices.contains(idx))
            .map(|(_, e)| e)
            .collect();

        let mut resolved_entities = untouched;
        resolved_entities.extend(canonical_entities);

        let dedup_rate = if original_count == 0 {
            0.0
        } else {
            1.0 - (resolved_entities.len() as f64 / original_count as f64)
        };
        if dedup_rate > DEDUP_RATE_WARN_THRESHOLD {
            warn!(
                dedup_rate,
                "entity deduplication rate exceeds 60%; check similarity threshold calibration"
            );
        }

        let rewired = self.rewire_relations(relations, &rename_map);
        (resolved_entities, rewired)
    }

    fn rewire_relations(&self, relations: Vec<Relation>, rename_map: &HashMap<String, String>) -> Vec<Relation> {
        let mut merged: HashMap<(String, String), Relation> = HashMap::new();

        for mut relation in relations {
            if let Some(canonical) = rename_map.get(&relation.src_name.to_lowercase()) {
                relation.src_name = canonical.clone();
            }
            if let Some(canonical) = rename_map.get(&relation.tgt_name.to_lowercase()) {
                relation.tgt_name = canonical.clone();
            }
            if relation.is_self_loop() {
                continue;
            }

            let key = relation.unordered_key();
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.weight = (existing.weight + relation.weight).min(MAX_RELATION_WEIGHT);
                    if !relation.description.is_empty() && !existing.description.contains(&relation.description) {
                        if existing.description.is_empty() {
                            existing.description = relation.description.clone();
                        } else {
                            existing.description.push_str(" | ");
                            existing.description.push_str(&relation.description);
                        }
                    }
                    for chunk_id in relation.source_chunk_ids {
                        existing.push_source_chunk(chunk_id, self.source_chunk_cap);
                    }
                }
                None => {
                    merged.insert(key, relation);
                }
            }
        }

        merged.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DescriptionConfig, SimilarityWeights};
    use crate::llm::fakes::ScriptedLlm;

    fn make_entity(name: &str, ty: &str, chunk_id: &str) -> Entity {
        let mut e = Entity::new("p1", name, ty);
        e.description = format!("{name} description");
        e.push_source_chunk(chunk_id, 50);
        e
    }

    fn resolver() -> Resolver {
        let calc = SimilarityCalculator::new(SimilarityWeights::default(), 500, 0.75);
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let desc_cfg = DescriptionConfig {
            force_summary_count: 6,
            summary_context_size: 10_000,
            summary_max_tokens: 500,
            max_map_iterations: 3,
            max_chars: 4000,
        };
        let summarizer = DescriptionSummarizer::new(llm, desc_cfg);
        Resolver::new(calc, 0.40, 50, summarizer)
    }

    #[tokio::test]
    async fn merges_variant_names_and_rewires_relations() {
        let resolver = resolver();
        let tracker = TokenTracker::new();
        let entities = vec![
            make_entity("Warren State Home and Training School", "ORGANIZATION", "c1"),
            make_entity("Warren Home", "ORGANIZATION", "c2"),
            make_entity("Bob", "PERSON", "c1"),
        ];
        let relations = vec![Relation::new("p1", "Warren State Home and Training School", "Bob")];

        let (resolved_entities, resolved_relations) = resolver.resolve(entities, relations, &tracker).await;
        assert_eq!(resolved_entities.len(), 2);
        assert!(resolved_entities.iter().any(|e| e.name == "Warren Home"));
        assert_eq!(resolved_relations.len(), 1);
        assert_eq!(resolved_relations[0].src_name, "Warren Home");
    }

    #[tokio::test]
    async fn duplicate_relations_after_rewiring_combine_weight() {
        let resolver = resolver();
        let tracker = TokenTracker::new();
        let entities = vec![
            make_entity("Warren State Home and Training School", "ORGANIZATION", "c1"),
            make_entity("Warren Home", "ORGANIZATION", "c2"),
        ];
        let mut r1 = Relation::new("p1", "Warren State Home and Training School", "Bob");
        r1.weight = 1.0;
        let mut r2 = Relation::new("p1", "Warren Home", "Bob");
        r2.weight = 2.0;
        let relations = vec![r1, r2];

        let (_, resolved_relations) = resolver.resolve(entities, relations, &tracker).await;
        assert_eq!(resolved_relations.len(), 1);
        assert_eq!(resolved_relations[0].weight, 3.0);
    }

    #[tokio::test]
    async fn blank_names_are_dropped() {
        let resolver = resolver();
        let tracker = TokenTracker::new();
        let entities = vec![make_entity("", "PERSON", "c1"), make_entity("Alice", "PERSON", "c1")];
        let (resolved, _) = resolver.resolve(entities, vec![], &tracker).await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "Alice");
    }

    #[tokio::test]
    async fn rewiring_that_creates_a_self_loop_is_dropped() {
        let resolver = resolver();
        let tracker = TokenTracker::new();
        let entities = vec![
            make_entity("Warren State Home and Training School", "ORGANIZATION", "c1"),
            make_entity("Warren Home", "ORGANIZATION", "c2"),
        ];
        let relations = vec![Relation::new("p1", "Warren State Home and Training School", "Warren Home")];
        let (_, resolved_relations) = resolver.resolve(entities, relations, &tracker).await;
        assert!(resolved_relations.is_empty());
    }
}
