//! Merge service: manually redirect one or more entities into a
//! single target, rewiring incident relations and combining descriptions
//! per a caller-chosen strategy.

use std::collections::HashMap;
use std::sync::Arc;

use crate::description::DescriptionSummarizer;
use crate::error::{CoreError, CoreResult};
use crate::graph_store::GraphStore;
use crate::models::{Entity, Relation};
use crate::token_tracker::TokenTracker;
use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Concatenate,
    KeepFirst,
    KeepLongest,
    LlmSummarize,
}

pub struct MergeService {
    graph_store: Arc<dyn GraphStore>,
    vector_store: Arc<dyn VectorStore>,
    summarizer: DescriptionSummarizer,
    source_chunk_cap: usize,
}

impl MergeService {
    pub fn new(
        graph_store: Arc<dyn GraphStore>,
        vector_store: Arc<dyn VectorStore>,
        summarizer: DescriptionSummarizer,
        source_chunk_cap: usize,
    ) -> Self {
        Self { graph_store, vector_store, summarizer, source_chunk_cap }
    }

    /// Redirects `source_names` into `target_name`. Atomic from the
    /// caller's view: a rejected validation leaves the graph completely
    /// untouched; once validation passes, the remaining steps are plain
    /// upserts/deletes against stores whose own concurrency control
    /// applies — either the target ends up with all redirected relations
    /// and the sources are gone, or the graph is unchanged.
    pub async fn merge(
        &self,
        project_id: &str,
        source_names: &[String],
        target_name: &str,
        strategy: MergeStrategy,
        tracker: &TokenTracker,
    ) -> CoreResult<Entity> {
        if source_names.is_empty() {
            return Err(CoreError::validation("merge requires at least one source entity"));
        }
        if source_names.iter().any(|s| s.eq_ignore_ascii_case(target_name)) {
            return Err(CoreError::validation("cannot merge an entity into itself"));
        }

        let mut sources = Vec::with_capacity(source_names.len());
        for name in source_names {
            match self.graph_store.get_entity(project_id, name).await? {
                Some(entity) => sources.push(entity),
                None => {
                    return Err(CoreError::EntityNotFound { project: project_id.to_string(), name: name.clone() });
                }
            }
        }
        let existing_target = self.graph_store.get_entity(project_id, target_name).await?;

        let source_lower: std::collections::HashSet<String> = source_names.iter().map(|s| s.to_lowercase()).collect();
        let mut incident = Vec::new();
        for source in &sources {
            incident.extend(self.graph_store.get_relations_for_entity(project_id, &source.name).await?);
        }

        let rewired = self.rewire(incident, &source_lower, target_name);

        let entity_type = existing_target
            .as_ref()
            .map(|e| e.entity_type.clone())
            .unwrap_or_else(|| sources[0].entity_type.clone());
        let mut target = Entity::new(project_id, target_name, entity_type);
        target.description = self.combine_descriptions(&sources, existing_target.as_ref(), strategy, tracker).await;
        for source in &sources {
            target.merge_source_chunks(&source.source_chunk_ids, self.source_chunk_cap);
        }
        if let Some(existing) = &existing_target {
            target.merge_source_chunks(&existing.source_chunk_ids, self.source_chunk_cap);
        }

        self.graph_store.upsert_entity(target.clone()).await?;
        if !rewired.is_empty() {
            self.graph_store.upsert_relations(rewired).await?;
        }
        self.graph_store.delete_entities(project_id, source_names).await?;
        self.vector_store.delete_entity_embeddings(project_id, source_names).await?;

        Ok(target)
    }

    fn rewire(&self, relations: Vec<Relation>, source_lower: &std::collections::HashSet<String>, target_name: &str) -> Vec<Relation> {
        let mut merged: HashMap<(String, String), Relation> = HashMap::new();

        for mut relation in relations {
            if source_lower.contains(&relation.src_name.to_lowercase()) {
                relation.src_name = target_name.to_string();
            }
            if source_lower.contains(&relation.tgt_name.to_lowercase()) {
                relation.tgt_name = target_name.to_string();
            }
            if relation.is_self_loop() {
                continue;
            }

            let key = relation.unordered_key();
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.weight += relation.weight;
                    if !relation.description.is_empty() && existing.description != relation.description {
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

    async fn combine_descriptions(
        &self,
        sources: &[Entity],
        existing_target: Option<&Entity>,
        strategy: MergeStrategy,
        tracker: &TokenTracker,
    ) -> String {
        let mut descriptions: Vec<String> = Vec::new();
        if let Some(existing) = existing_target {
            if !existing.description.is_empty() {
                descriptions.push(existing.description.clone());
            }
        }
        descriptions.extend(sources.iter().map(|e| e.description.clone()).filter(|d| !d.is_empty()));

        match strategy {
            MergeStrategy::Concatenate => descriptions.join(" | "),
            MergeStrategy::KeepFirst => descriptions.into_iter().next().unwrap_or_default(),
            MergeStrategy::KeepLongest => descriptions.into_iter().max_by_key(|d| d.chars().count()).unwrap_or_default(),
            MergeStrategy::LlmSummarize => {
                let name = existing_target.map(|e| e.name.as_str()).unwrap_or_else(|| sources[0].name.as_str());
                self.summarizer.summarize(name, &descriptions, tracker).await
            }
        }
    }
}
