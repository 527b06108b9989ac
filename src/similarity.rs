//! Similarity calculator: name normalization, six string-similarity
//! metrics, weighted combination, and the type gate that keeps
//! differently-typed entities ("Apple"/ORGANIZATION vs "apple"/FOOD) from
//! ever merging regardless of name similarity.

use std::collections::HashSet;
use crate::config::SimilarityWeights;
use crate::models::SimilarityScore;

/// Normalize an entity name for comparison: strip outer quotes, trim,
/// collapse internal whitespace, drop ASCII punctuation (keeping internal
/// hyphens), lowercase, and truncate to `max_length`.
pub fn normalize_name(raw: &str, max_length: usize) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed);

    let mut cleaned = String::with_capacity(unquoted.len());
    let mut last_was_space = false;
    for ch in unquoted.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space && !cleaned.is_empty() {
                cleaned.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        if ch == '-' || ch.is_alphanumeric() {
            cleaned.push(ch);
        }
        // other ASCII punctuation is dropped silently; non-ASCII letters
        // pass through `is_alphanumeric`.
    }
    let cleaned = cleaned.trim_end().to_lowercase();
    cleaned.chars().take(max_length).collect()
}

fn tokenize(normalized: &str) -> HashSet<&str> {
    normalized.split_whitespace().collect()
}

fn jaccard(a_tokens: &HashSet<&str>, b_tokens: &HashSet<&str>) -> f64 {
    if a_tokens.is_empty() && b_tokens.is_empty() {
        return 1.0;
    }
    let intersection = a_tokens.intersection(b_tokens).count();
    let union = a_tokens.union(b_tokens).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn containment(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(b) || b.contains(a) {
        1.0
    } else {
        0.0
    }
}

fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = strsim::levenshtein(a, b);
    1.0 - (distance as f64 / max_len as f64)
}

const ACRONYM_STOPWORDS: [&str; 5] = ["of", "the", "and", "for", "de"];

/// Initials of `full`'s words, in order, skipping stopwords that acronyms
/// conventionally drop (e.g. "of" in "Massachusetts Institute of Technology").
fn acronym_initials(full: &str) -> String {
    full.split_whitespace()
        .filter(|word| !ACRONYM_STOPWORDS.contains(word))
        .filter_map(|word| word.chars().next())
        .collect()
}

/// True when one side is a short, space-free token matching the other
/// side's word initials (e.g. "mit" vs "massachusetts institute of
/// technology"). Order-sensitive, unlike a token-set comparison, so it
/// only fires on a genuine acronym, not any two names that happen to
/// share initial letters.
fn is_abbreviation_pair(a: &str, b: &str) -> bool {
    let is_acronym_of = |short: &str, full: &str| -> bool {
        if short.is_empty() || short.contains(' ') {
            return false;
        }
        if full.split_whitespace().count() < 2 {
            return false;
        }
        acronym_initials(full) == short
    };

    is_acronym_of(a, b) || is_acronym_of(b, a)
}

fn token_overlap_bonus(a_tokens: &HashSet<&str>, b_tokens: &HashSet<&str>) -> f64 {
    let min_len = a_tokens.len().min(b_tokens.len());
    if min_len == 0 {
        return 0.0;
    }
    a_tokens.intersection(b_tokens).count() as f64 / min_len as f64
}

fn length_penalty(a: &str, b: &str) -> f64 {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    let max_len = a_len.max(b_len);
    if max_len == 0 {
        return 1.0;
    }
    a_len.min(b_len) as f64 / max_len as f64
}

pub struct SimilarityCalculator {
    pub weights: SimilarityWeights,
    pub max_name_length: usize,
    pub early_termination_ratio: f64,
}

impl SimilarityCalculator {
    pub fn new(weights: SimilarityWeights, max_name_length: usize, early_termination_ratio: f64) -> Self {
        Self { weights, max_name_length, early_termination_ratio }
    }

    /// Score two candidate entity names. Applies the type gate first:
    /// entities of different types never merge regardless of name
    /// similarity.
    pub fn score(&self, name1: &str, type1: &str, name2: &str, type2: &str) -> SimilarityScore {
        if !type1.eq_ignore_ascii_case(type2) {
            return SimilarityScore {
                jaccard: 0.0,
                containment: 0.0,
                levenshtein: 0.0,
                abbreviation: 0.0,
                token_overlap: 0.0,
                length_penalty: 0.0,
                final_score: 0.0,
            };
        }

        let a = normalize_name(name1, self.max_name_length);
        let b = normalize_name(name2, self.max_name_length);

        if a == b {
            return SimilarityScore {
                jaccard: 1.0,
                containment: 1.0,
                levenshtein: 1.0,
                abbreviation: 1.0,
                token_overlap: 1.0,
                length_penalty: 1.0,
                final_score: 1.0,
            };
        }

        // Checked before the length-ratio early termination below: an
        // acronym's length is expected to differ wildly from its source
        // name, so the short-circuit must never shadow this gate.
        if is_abbreviation_pair(&a, &b) {
            return SimilarityScore {
                jaccard: 1.0,
                containment: 1.0,
                levenshtein: 1.0,
                abbreviation: 1.0,
                token_overlap: 1.0,
                length_penalty: 1.0,
                final_score: 1.0,
            };
        }

        let a_len = a.chars().count();
        let b_len = b.chars().count();
        let max_len = a_len.max(b_len);
        if max_len > 0 {
            let len_diff = (a_len as isize - b_len as isize).unsigned_abs();
            if len_diff as f64 > self.early_termination_ratio * max_len as f64 {
                return SimilarityScore {
                    jaccard: 0.0,
                    containment: 0.0,
                    levenshtein: 0.0,
                    abbreviation: 0.0,
                    token_overlap: 0.0,
                    length_penalty: 0.0,
                    final_score: 0.0,
                };
            }
        }

        let a_tokens = tokenize(&a);
        let b_tokens = tokenize(&b);
        let j = jaccard(&a_tokens, &b_tokens);
        let c = containment(&a, &b);
        let l = levenshtein_similarity(&a, &b);
        let o = token_overlap_bonus(&a_tokens, &b_tokens);
        let p = length_penalty(&a, &b);

        let w = &self.weights;
        let final_score = w.jaccard * j
            + w.containment * c
            + w.levenshtein * l
            + w.token_overlap * o
            + w.length_penalty * p;

        SimilarityScore {
            jaccard: j,
            containment: c,
            levenshtein: l,
            abbreviation: 0.0,
            token_overlap: o,
            length_penalty: p,
            final_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> SimilarityCalculator {
        SimilarityCalculator::new(SimilarityWeights::default(), 500, 0.75)
    }

    #[test]
    fn normalization_strips_quotes_and_collapses_whitespace() {
        assert_eq!(normalize_name("  \"Warren   Home\"  ", 500), "warren home");
    }

    #[test]
    fn normalization_keeps_internal_hyphens() {
        assert_eq!(normalize_name("Jean-Paul Sartre", 500), "jean-paul sartre");
    }

    #[test]
    fn exact_match_scores_one() {
        let s = calc().score("Warren Home", "ORGANIZATION", "warren home", "ORGANIZATION");
        assert_eq!(s.final_score, 1.0);
    }

    #[test]
    fn type_gate_zeroes_cross_type_candidates() {
        let s = calc().score("Apple Inc.", "ORGANIZATION", "apple", "FOOD");
        assert_eq!(s.final_score, 0.0);
    }

    #[test]
    fn acronym_merges_with_full_name() {
        let s = calc().score(
            "Massachusetts Institute of Technology",
            "ORGANIZATION",
            "MIT",
            "ORGANIZATION",
        );
        assert!(s.abbreviation > 0.0);
        assert!(s.final_score >= 0.40);
    }

    #[test]
    fn variant_consolidation_scores_above_threshold() {
        let calculator = calc();
        let s1 = calculator.score(
            "Warren State Home and Training School",
            "ORGANIZATION",
            "Warren Home",
            "ORGANIZATION",
        );
        assert!(s1.final_score >= 0.40, "expected >= 0.40, got {}", s1.final_score);
    }

    #[test]
    fn wildly_different_lengths_short_circuit() {
        let calculator = calc();
        let s = calculator.score(
            "a",
            "ORGANIZATION",
            "a very long organization name that goes on and on",
            "ORGANIZATION",
        );
        assert_eq!(s.final_score, 0.0);
    }
}
