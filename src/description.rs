//! Description summarizer: decides whether a set of merged
//! entity descriptions needs LLM summarization, and if so, does it
//! directly or via bounded map-reduce.

use std::sync::Arc;

use crate::config::DescriptionConfig;
use crate::llm::Llm;
use crate::retry::retry_with_backoff;
use crate::token_tracker::TokenTracker;
use crate::tokens::TokenAccountant;

const SEPARATOR: &str = " | ";

pub struct DescriptionSummarizer {
    llm: Arc<dyn Llm>,
    accountant: TokenAccountant,
    config: DescriptionConfig,
}

impl DescriptionSummarizer {
    pub fn new(llm: Arc<dyn Llm>, config: DescriptionConfig) -> Self {
        Self { llm, accountant: TokenAccountant, config }
    }

    fn needs_summarization(&self, descriptions: &[String]) -> bool {
        let joined = descriptions.join(SEPARATOR);
        self.accountant.count(&joined) > self.config.summary_context_size
            || descriptions.len() > self.config.force_summary_count
    }

    /// Produces the entity's final description text. Never panics and
    /// never leaves the description empty when at least one input is
    /// non-empty; on unrecoverable LLM failure, falls back to truncated
    /// concatenation.
    pub async fn summarize(&self, entity_name: &str, descriptions: &[String], tracker: &TokenTracker) -> String {
        if descriptions.is_empty() {
            return String::new();
        }
        if !self.needs_summarization(descriptions) {
            return self.truncate(descriptions.join(SEPARATOR));
        }

        let joined = descriptions.join(SEPARATOR);
        if self.accountant.count(&joined) <= self.config.summary_max_tokens {
            return match self.single_call(entity_name, &joined, tracker).await {
                Some(summary) => self.truncate(summary),
                None => self.truncate(joined),
            };
        }

        match self.map_reduce(entity_name, descriptions.to_vec(), tracker, 0).await {
            Some(summary) => self.truncate(summary),
            None => self.truncate(joined),
        }
    }

    async fn single_call(&self, entity_name: &str, joined: &str, tracker: &TokenTracker) -> Option<String> {
        let prompt = format!(
            "Summarize the following descriptions of the entity \"{entity_name}\" into one concise paragraph:\n{joined}"
        );
        let llm = &self.llm;
        let result = retry_with_backoff(
            || async { llm.complete(None, &prompt, "summarization", tracker).await },
            |_| true,
        )
        .await;
        result.ok().map(|s| s.trim().to_string())
    }

    /// Map-reduce: partition into token-bounded batches,
    /// summarize each, then recurse on the batch summaries. Bounded by
    /// `maxMapIterations`; beyond that, callers fall back to hard
    /// truncation via [`Self::truncate`].
    fn map_reduce<'a>(
        &'a self,
        entity_name: &'a str,
        descriptions: Vec<String>,
        tracker: &'a TokenTracker,
        iteration: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(async move {
            if iteration >= self.config.max_map_iterations {
                return None;
            }

            let batches = self.partition_into_batches(&descriptions);
            let mut batch_summaries = Vec::with_capacity(batches.len());
            for batch in batches {
                let joined = batch.join(SEPARATOR);
                match self.single_call(entity_name, &joined, tracker).await {
                    Some(summary) => batch_summaries.push(summary),
                    None => batch_summaries.push(self.truncate(joined)),
                }
            }

            if batch_summaries.len() == 1 {
                return Some(batch_summaries.remove(0));
            }

            let joined = batch_summaries.join(SEPARATOR);
            if self.accountant.count(&joined) <= self.config.summary_max_tokens {
                return match self.single_call(entity_name, &joined, tracker).await {
                    Some(summary) => Some(summary),
                    None => Some(joined),
                };
            }

            self.map_reduce(entity_name, batch_summaries, tracker, iteration + 1).await
        })
    }

    fn partition_into_batches(&self, descriptions: &[String]) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_tokens = 0usize;

        for description in descriptions {
            let tokens = self.accountant.count(description);
            if !current.is_empty() && current_tokens + tokens > self.config.summary_max_tokens {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += tokens;
            current.push(description.clone());
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.config.max_chars {
            text
        } else {
            text.chars().take(self.config.max_chars).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fakes::ScriptedLlm;

    fn config() -> DescriptionConfig {
        DescriptionConfig {
            force_summary_count: 6,
            summary_context_size: 10_000,
            summary_max_tokens: 500,
            max_map_iterations: 3,
            max_chars: 4000,
        }
    }

    #[tokio::test]
    async fn below_threshold_just_concatenates() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let summarizer = DescriptionSummarizer::new(llm, config());
        let tracker = TokenTracker::new();
        let result = summarizer.summarize("Alice", &["a".to_string(), "b".to_string()], &tracker).await;
        assert_eq!(result, "a | b");
    }

    #[tokio::test]
    async fn above_force_count_triggers_summarization() {
        let llm = Arc::new(ScriptedLlm::new(vec!["a concise summary".to_string()]));
        let summarizer = DescriptionSummarizer::new(llm, config());
        let tracker = TokenTracker::new();
        let descriptions: Vec<String> = (0..8).map(|i| format!("desc {i}")).collect();
        let result = summarizer.summarize("Alice", &descriptions, &tracker).await;
        assert_eq!(result, "a concise summary");
    }

    #[tokio::test]
    async fn result_is_hard_truncated_to_max_chars() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let mut cfg = config();
        cfg.max_chars = 10;
        let summarizer = DescriptionSummarizer::new(llm, cfg);
        let tracker = TokenTracker::new();
        let result = summarizer.summarize("Alice", &["a long description here".to_string()], &tracker).await;
        assert_eq!(result.chars().count(), 10);
    }

    #[tokio::test]
    async fn empty_input_returns_empty_description() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let summarizer = DescriptionSummarizer::new(llm, config());
        let tracker = TokenTracker::new();
        let result = summarizer.summarize("Alice", &[], &tracker).await;
        assert_eq!(result, "");
    }
}
