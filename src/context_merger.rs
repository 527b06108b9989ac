//! Context merger: round-robin interleaves `k` ranked source
//! lists under a shared token budget, deterministically.

use crate::tokens::TokenAccountant;

#[derive(Debug, Clone)]
pub struct MergeItem {
    pub content: String,
    pub item_type: String,
    pub tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    pub items_included: usize,
    pub items_truncated: usize,
    pub total_tokens: usize,
}

/// Epsilon below the hard budget at which merging stops early, giving
/// headroom for a trailing separator or synthesis instruction the
/// caller appends afterward.
const EPSILON_TOKENS: usize = 8;

pub struct ContextMerger {
    accountant: TokenAccountant,
}

impl Default for ContextMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextMerger {
    pub fn new() -> Self {
        Self { accountant: TokenAccountant }
    }

    /// Round-robin merge of `sources` under budget `b`. Deterministic for
    /// identical source ordering and content.
    pub fn merge(&self, sources: Vec<Vec<MergeItem>>, budget: usize) -> (Vec<MergeItem>, MergeStats) {
        let mut cursors = vec![0usize; sources.len()];
        let mut exhausted = vec![false; sources.len()];
        let mut merged = Vec::new();
        let mut used = 0usize;
        let mut truncated = 0usize;

        loop {
            if exhausted.iter().all(|&e| e) || used + EPSILON_TOKENS >= budget {
                break;
            }

            let mut made_progress = false;
            for (source_idx, source) in sources.iter().enumerate() {
                if exhausted[source_idx] {
                    continue;
                }
                let cursor = cursors[source_idx];
                let Some(item) = source.get(cursor) else {
                    exhausted[source_idx] = true;
                    continue;
                };

                if used + item.tokens <= budget {
                    merged.push(item.clone());
                    used += item.tokens;
                    cursors[source_idx] += 1;
                    made_progress = true;
                } else {
                    exhausted[source_idx] = true;
                    truncated += source.len() - cursor;
                }

                if used + EPSILON_TOKENS >= budget {
                    break;
                }
            }

            if !made_progress {
                break;
            }
        }

        // Anything never visited in a source that ran out of budget mid-way
        // was already counted above; anything in a source we broke out of
        // early due to the budget epsilon still needs counting.
        for (source_idx, source) in sources.iter().enumerate() {
            if !exhausted[source_idx] {
                let remaining = source.len().saturating_sub(cursors[source_idx]);
                truncated += remaining;
            }
        }

        let stats = MergeStats { items_included: merged.len(), items_truncated: truncated, total_tokens: used };
        (merged, stats)
    }

    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(content: &str, tokens: usize) -> MergeItem {
        MergeItem { content: content.to_string(), item_type: "entity".to_string(), tokens }
    }

    #[test]
    fn interleaves_sources_round_robin() {
        let merger = ContextMerger::new();
        let a = vec![item("a1", 10), item("a2", 10)];
        let b = vec![item("b1", 10), item("b2", 10)];
        let (merged, _) = merger.merge(vec![a, b], 1000);
        let order: Vec<&str> = merged.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(order, vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn stops_at_budget() {
        let merger = ContextMerger::new();
        let a = vec![item("a1", 50), item("a2", 50)];
        let b = vec![item("b1", 50), item("b2", 50)];
        let (merged, stats) = merger.merge(vec![a, b], 110);
        assert!(stats.total_tokens <= 110);
        assert!(merged.len() < 4);
        assert!(stats.items_truncated > 0);
    }

    #[test]
    fn is_deterministic_for_identical_input() {
        let merger = ContextMerger::new();
        let a = vec![item("a1", 10), item("a2", 10)];
        let b = vec![item("b1", 10)];
        let (m1, _) = merger.merge(vec![a.clone(), b.clone()], 100);
        let (m2, _) = merger.merge(vec![a, b], 100);
        let order1: Vec<&str> = m1.iter().map(|i| i.content.as_str()).collect();
        let order2: Vec<&str> = m2.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(order1, order2);
    }

    #[test]
    fn exhausted_shorter_source_does_not_block_longer_one() {
        let merger = ContextMerger::new();
        let a = vec![item("a1", 10)];
        let b = vec![item("b1", 10), item("b2", 10), item("b3", 10)];
        let (merged, _) = merger.merge(vec![a, b], 1000);
        assert_eq!(merged.len(), 4);
    }
}
