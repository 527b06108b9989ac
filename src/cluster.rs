//! Clusterer: type-bucketed connected-components clustering over
//! a pairwise similarity matrix built with [`crate::similarity`].

use std::collections::{HashMap, VecDeque};
use crate::models::{Cluster, Entity};
use crate::similarity::SimilarityCalculator;

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), rank: vec![0; n] }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

pub struct Clusterer<'a> {
    pub calculator: &'a SimilarityCalculator,
    pub threshold: f64,
    pub source_chunk_cap: usize,
}

impl<'a> Clusterer<'a> {
    pub fn new(calculator: &'a SimilarityCalculator, threshold: f64, source_chunk_cap: usize) -> Self {
        Self { calculator, threshold, source_chunk_cap }
    }

    /// Bucket `entities` by type (case-insensitive), cluster within each
    /// bucket, and return one [`Cluster`] per connected component whose
    /// size is greater than 1, plus the untouched singleton indices.
    ///
    /// Deterministic given identical input ordering, so repeated runs are
    /// idempotent for testing: bucketing preserves insertion order, and
    /// ties in canonical-name selection break on first insertion order.
    pub fn cluster(&self, entities: &[Entity]) -> Vec<Cluster> {
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, entity) in entities.iter().enumerate() {
            buckets
                .entry(entity.entity_type.to_lowercase())
                .or_default()
                .push(idx);
        }

        let mut type_keys: Vec<&String> = buckets.keys().collect();
        type_keys.sort();

        let mut clusters = Vec::new();
        for type_key in type_keys {
            let indices = &buckets[type_key];
            if indices.len() < 2 {
                continue;
            }
            clusters.extend(self.cluster_bucket(entities, indices));
        }
        clusters
    }

    fn cluster_bucket(&self, entities: &[Entity], indices: &[usize]) -> Vec<Cluster> {
        let n = indices.len();
        let mut uf = UnionFind::new(n);

        for i in 0..n {
            for j in (i + 1)..n {
                let e1 = &entities[indices[i]];
                let e2 = &entities[indices[j]];
                let score = self
                    .calculator
                    .score(&e1.name, &e1.entity_type, &e2.name, &e2.entity_type);
                if score.final_score >= self.threshold {
                    uf.union(i, j);
                }
            }
        }

        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = uf.find(i);
            components.entry(root).or_default().push(i);
        }

        let mut clusters = Vec::new();
        let mut roots: Vec<usize> = components.keys().copied().collect();
        roots.sort();
        for root in roots {
            let members = &components[&root];
            if members.len() < 2 {
                continue;
            }
            clusters.push(self.build_cluster(entities, indices, members));
        }
        clusters
    }

    fn build_cluster(&self, entities: &[Entity], bucket_indices: &[usize], local_members: &[usize]) -> Cluster {
        let global_indices: Vec<usize> = local_members.iter().map(|&li| bucket_indices[li]).collect();

        // Canonical = shortest non-empty name, ties broken by first
        // insertion order (lower original index wins).
        let mut ordered = global_indices.clone();
        ordered.sort_by_key(|&idx| (entities[idx].name.chars().count(), idx));
        let canonical_idx = ordered[0];
        let canonical_name = entities[canonical_idx].name.clone();
        let entity_type = entities[canonical_idx].entity_type.clone();

        let aliases: Vec<String> = global_indices
            .iter()
            .filter(|&&idx| idx != canonical_idx)
            .map(|&idx| entities[idx].name.clone())
            .collect();

        let mut descriptions = Vec::new();
        let mut seen_descriptions = std::collections::HashSet::new();
        let mut merged_chunks: VecDeque<String> = VecDeque::new();
        for &idx in &global_indices {
            let entity = &entities[idx];
            if !entity.description.is_empty() && seen_descriptions.insert(entity.description.clone()) {
                descriptions.push(entity.description.clone());
            }
            for chunk_id in &entity.source_chunk_ids {
                if !merged_chunks.contains(chunk_id) {
                    merged_chunks.push_back(chunk_id.clone());
                }
            }
        }
        while merged_chunks.len() > self.source_chunk_cap {
            merged_chunks.pop_front();
        }

        Cluster {
            member_indices: global_indices,
            canonical_name,
            aliases,
            entity_type,
            merged_descriptions: descriptions,
            merged_source_chunk_ids: merged_chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityWeights;

    fn make_entity(name: &str, ty: &str) -> Entity {
        let mut e = Entity::new("p1", name, ty);
        e.description = format!("{name} description");
        e
    }

    #[test]
    fn clusters_variants_and_picks_shortest_canonical() {
        let calculator = SimilarityCalculator::new(SimilarityWeights::default(), 500, 0.75);
        let clusterer = Clusterer::new(&calculator, 0.40, 50);
        let entities = vec![
            make_entity("Warren State Home and Training School", "ORGANIZATION"),
            make_entity("Warren Home", "ORGANIZATION"),
            make_entity("Warren Home", "ORGANIZATION"),
        ];
        let clusters = clusterer.cluster(&entities);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].canonical_name, "Warren Home");
        assert_eq!(clusters[0].member_indices.len(), 3);
    }

    #[test]
    fn type_gate_keeps_apple_food_separate_from_apple_org() {
        let calculator = SimilarityCalculator::new(SimilarityWeights::default(), 500, 0.75);
        let clusterer = Clusterer::new(&calculator, 0.40, 50);
        let entities = vec![
            make_entity("Apple Inc.", "ORGANIZATION"),
            make_entity("apple", "FOOD"),
        ];
        let clusters = clusterer.cluster(&entities);
        assert!(clusters.is_empty());
    }

    #[test]
    fn clustering_is_deterministic() {
        let calculator = SimilarityCalculator::new(SimilarityWeights::default(), 500, 0.75);
        let clusterer = Clusterer::new(&calculator, 0.40, 50);
        let entities = vec![
            make_entity("Massachusetts Institute of Technology", "ORGANIZATION"),
            make_entity("MIT", "ORGANIZATION"),
            make_entity("Stanford University", "ORGANIZATION"),
        ];
        let first = clusterer.cluster(&entities);
        let second = clusterer.cluster(&entities);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].canonical_name, second[0].canonical_name);
    }
}
