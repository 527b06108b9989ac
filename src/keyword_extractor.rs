//! Keyword extractor: splits a natural-language query into
//! HIGH_LEVEL (thematic) and LOW_LEVEL (entity/concrete-noun) keyword
//! sets, cached by query hash.

use std::sync::Arc;

use crate::cache::{content_hash, ExtractionCache};
use crate::llm::Llm;
use crate::models::{CacheType, ExtractionCacheEntry};
use crate::retry::retry_with_backoff;
use crate::token_tracker::TokenTracker;

const KEYWORD_PROMPT_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keywords {
    pub high_level: Vec<String>,
    pub low_level: Vec<String>,
}

impl Keywords {
    pub fn is_empty(&self) -> bool {
        self.high_level.is_empty() && self.low_level.is_empty()
    }
}

pub struct KeywordExtractor {
    llm: Arc<dyn Llm>,
    cache: Arc<dyn ExtractionCache>,
}

impl KeywordExtractor {
    pub fn new(llm: Arc<dyn Llm>, cache: Arc<dyn ExtractionCache>) -> Self {
        Self { llm, cache }
    }

    pub async fn extract(&self, project_id: &str, query: &str, tracker: &TokenTracker) -> Keywords {
        let hash = content_hash(query, KEYWORD_PROMPT_VERSION);

        if let Ok(Some(hit)) = self.cache.get(project_id, CacheType::KeywordExtraction, &hash).await {
            return parse_keywords(&hit.result);
        }

        let prompt = keyword_prompt(query);
        let llm = &self.llm;
        let raw = retry_with_backoff(
            || async { llm.complete(None, &prompt, "keyword_extraction", tracker).await },
            |_| true,
        )
        .await
        .unwrap_or_default();

        let entry = ExtractionCacheEntry {
            id: String::new(),
            project_id: project_id.to_string(),
            cache_type: CacheType::KeywordExtraction,
            chunk_id: None,
            content_hash: hash,
            result: raw.clone(),
            tokens_used: 0,
            created_at: chrono::Utc::now(),
        };
        let _ = self.cache.store(entry).await;

        parse_keywords(&raw)
    }
}

fn keyword_prompt(query: &str) -> String {
    format!(
        "Split the query below into two labeled keyword lists.\n\
         HIGH_LEVEL: thematic concepts.\n\
         LOW_LEVEL: named entities and concrete nouns.\n\n\
         Query: {query}"
    )
}

/// Tolerant of comma-separated and line-separated lists under each label.
fn parse_keywords(raw: &str) -> Keywords {
    let mut high_level = Vec::new();
    let mut low_level = Vec::new();
    let mut current: Option<&mut Vec<String>> = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let upper = trimmed.to_uppercase();
        if let Some(rest) = upper.strip_prefix("HIGH_LEVEL") {
            let rest = trimmed[trimmed.len() - rest.len()..].trim_start_matches(':').trim();
            current = Some(&mut high_level);
            push_items(&mut current, rest);
            continue;
        }
        if let Some(rest) = upper.strip_prefix("LOW_LEVEL") {
            let rest = trimmed[trimmed.len() - rest.len()..].trim_start_matches(':').trim();
            current = Some(&mut low_level);
            push_items(&mut current, rest);
            continue;
        }
        push_items(&mut current, trimmed);
    }

    Keywords { high_level, low_level }
}

fn push_items(target: &mut Option<&mut Vec<String>>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(list) = target {
        for item in text.split(',') {
            let item = item.trim();
            if !item.is_empty() {
                list.push(item.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryExtractionCache;
    use crate::llm::fakes::ScriptedLlm;

    #[tokio::test]
    async fn parses_comma_separated_lists() {
        let raw = "HIGH_LEVEL: economics, policy\nLOW_LEVEL: Federal Reserve, interest rates";
        let llm = Arc::new(ScriptedLlm::new(vec![raw.to_string()]));
        let cache = Arc::new(InMemoryExtractionCache::new());
        let extractor = KeywordExtractor::new(llm, cache);
        let tracker = TokenTracker::new();

        let keywords = extractor.extract("p1", "query", &tracker).await;
        assert_eq!(keywords.high_level, vec!["economics", "policy"]);
        assert_eq!(keywords.low_level, vec!["Federal Reserve", "interest rates"]);
    }

    #[tokio::test]
    async fn parses_line_separated_lists() {
        let raw = "HIGH_LEVEL:\neconomics\npolicy\nLOW_LEVEL:\nFederal Reserve";
        let llm = Arc::new(ScriptedLlm::new(vec![raw.to_string()]));
        let cache = Arc::new(InMemoryExtractionCache::new());
        let extractor = KeywordExtractor::new(llm, cache);
        let tracker = TokenTracker::new();

        let keywords = extractor.extract("p1", "query", &tracker).await;
        assert_eq!(keywords.high_level, vec!["economics", "policy"]);
        assert_eq!(keywords.low_level, vec!["Federal Reserve"]);
    }

    #[tokio::test]
    async fn empty_result_is_reported_as_empty() {
        let llm = Arc::new(ScriptedLlm::new(vec![String::new()]));
        let cache = Arc::new(InMemoryExtractionCache::new());
        let extractor = KeywordExtractor::new(llm, cache);
        let tracker = TokenTracker::new();

        let keywords = extractor.extract("p1", "query", &tracker).await;
        assert!(keywords.is_empty());
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_llm_call() {
        let cache = Arc::new(InMemoryExtractionCache::new());
        let query = "what drives inflation?";
        let hash = content_hash(query, KEYWORD_PROMPT_VERSION);
        cache
            .store(ExtractionCacheEntry {
                id: String::new(),
                project_id: "p1".to_string(),
                cache_type: CacheType::KeywordExtraction,
                chunk_id: None,
                content_hash: hash,
                result: "HIGH_LEVEL: inflation\nLOW_LEVEL: prices".to_string(),
                tokens_used: 0,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let extractor = KeywordExtractor::new(llm, cache);
        let tracker = TokenTracker::new();
        let keywords = extractor.extract("p1", query, &tracker).await;
        assert_eq!(keywords.high_level, vec!["inflation"]);
    }
}
