//! Token accounting: approximate, deterministic token counting
//! and budget-aware truncation/splitting. The exact tokenizer is left
//! unspecified as long as it is stable for identical input and roughly
//! proportional to length; this uses a byte-pair-ish heuristic (word +
//! punctuation boundaries) rather than a model-specific BPE table.

use anyhow::{anyhow, Result};

/// Average characters per token assumed by the heuristic counter. Close
/// enough to common subword tokenizers (~4 chars/token for English prose)
/// to keep downstream budgets meaningful without depending on a specific
/// model's vocabulary.
const CHARS_PER_TOKEN: f64 = 4.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct TokenAccountant;

impl TokenAccountant {
    pub fn new() -> Self {
        Self
    }

    /// Count tokens in `text`. Monotonic in `text.len()` and stable for
    /// identical input.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let word_count = text.split_whitespace().count();
        let char_estimate = (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize;
        // Blend a whitespace-token count with a char-based estimate so
        // both very short dense tokens (URLs, code) and ordinary prose
        // get a sane count.
        word_count.max(char_estimate).max(1)
    }

    /// Truncate `text` to at most `n` tokens, cutting only at a
    /// whitespace/token boundary, never mid-codepoint.
    pub fn truncate_to_tokens(&self, text: &str, n: usize) -> String {
        if n == 0 {
            return String::new();
        }
        if self.count(text) <= n {
            return text.to_string();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() <= n {
            return text.to_string();
        }

        let mut out = String::new();
        let mut used = 0usize;
        for word in &words {
            let candidate = if out.is_empty() {
                word.to_string()
            } else {
                format!("{out} {word}")
            };
            let candidate_tokens = self.count(&candidate);
            if candidate_tokens > n && used > 0 {
                break;
            }
            out = candidate;
            used = candidate_tokens;
            if used >= n {
                break;
            }
        }
        out
    }

    /// Split `total` tokens across `ratios`, which must sum to 1.0 +/-
    /// 0.01. Fails loudly otherwise. Remainder tokens from integer
    /// rounding are assigned to the last bucket so the sum is exact.
    pub fn split_budget(&self, total: usize, ratios: &[f64]) -> Result<Vec<usize>> {
        let sum: f64 = ratios.iter().sum();
        if (sum - 1.0).abs() > 0.01 {
            return Err(anyhow!("split_budget ratios must sum to 1.0 +/- 0.01, got {sum}"));
        }
        if ratios.is_empty() {
            return Ok(Vec::new());
        }

        let mut shares: Vec<usize> = ratios
            .iter()
            .map(|r| ((*r) * total as f64).floor() as usize)
            .collect();
        let assigned: usize = shares.iter().sum();
        if let Some(last) = shares.last_mut() {
            *last += total.saturating_sub(assigned);
        }
        Ok(shares)
    }
}
