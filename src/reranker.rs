//! Reranker port: optional query-chunk reranking with a
//! timeout, a consecutive-failure circuit breaker, and an identity
//! fallback so a flaky provider never breaks retrieval.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::warn;

use crate::config::RerankConfig;

#[derive(Debug, Clone)]
pub struct RankedItem {
    pub content: String,
    pub score: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank_raw(&self, query: &str, chunks: &[String], top_k: usize) -> anyhow::Result<Vec<RankedItem>>;
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Process-global-style circuit breaker state, owned by one [`RerankingService`]
/// instance (one per provider, not a true process singleton — avoids
/// hidden global mutable state even for this cross-cutting concern).
struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at_secs: AtomicU64,
    threshold: u32,
    cooldown_secs: u64,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_secs: AtomicU64::new(0),
            threshold,
            cooldown_secs,
        }
    }

    fn is_open(&self) -> bool {
        let opened_at = self.opened_at_secs.load(Ordering::SeqCst);
        if opened_at == 0 {
            return false;
        }
        if now_secs().saturating_sub(opened_at) >= self.cooldown_secs {
            // Cooldown elapsed: half-open, allow one probe through.
            self.opened_at_secs.store(0, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.opened_at_secs.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            self.opened_at_secs.store(now_secs(), Ordering::SeqCst);
        }
    }
}

pub struct RerankingService {
    provider: Option<Box<dyn Reranker>>,
    config: RerankConfig,
    breaker: CircuitBreaker,
}

impl RerankingService {
    pub fn new(provider: Option<Box<dyn Reranker>>, config: RerankConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_cooldown_secs);
        Self { provider, config, breaker }
    }

    /// Reranks `chunks`, falling back to the identity order (unchanged
    /// input, truncated to `top_k`) on any failure, open circuit, a
    /// disabled config, or a missing provider.
    pub async fn rerank(&self, query: &str, chunks: Vec<String>, top_k: usize) -> Vec<String> {
        if !self.config.enabled {
            return chunks.into_iter().take(top_k).collect();
        }
        let Some(provider) = &self.provider else {
            return chunks.into_iter().take(top_k).collect();
        };
        if self.breaker.is_open() {
            warn!("reranker circuit breaker open; falling back to identity order");
            return chunks.into_iter().take(top_k).collect();
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let result = tokio::time::timeout(timeout, provider.rerank_raw(query, &chunks, top_k)).await;

        match result {
            Ok(Ok(ranked)) => {
                self.breaker.record_success();
                ranked
                    .into_iter()
                    .filter(|item| item.score >= self.config.min_score)
                    .take(top_k)
                    .map(|item| item.content)
                    .collect()
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                warn!(error = %err, "reranker call failed; falling back to identity order");
                chunks.into_iter().take(top_k).collect()
            }
            Err(_) => {
                self.breaker.record_failure();
                warn!("reranker call timed out; falling back to identity order");
                chunks.into_iter().take(top_k).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct AlwaysFails;
    #[async_trait]
    impl Reranker for AlwaysFails {
        async fn rerank_raw(&self, _query: &str, _chunks: &[String], _top_k: usize) -> anyhow::Result<Vec<RankedItem>> {
            Err(anyhow::anyhow!("provider down"))
        }
    }

    struct CountingReranker {
        calls: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl Reranker for CountingReranker {
        async fn rerank_raw(&self, _query: &str, chunks: &[String], _top_k: usize) -> anyhow::Result<Vec<RankedItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(chunks.iter().map(|c| RankedItem { content: c.clone(), score: 0.9 }).collect())
        }
    }

    fn config() -> RerankConfig {
        RerankConfig {
            enabled: true,
            provider: Some("test".to_string()),
            min_score: 0.1,
            timeout_ms: 1000,
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown_secs: 60,
        }
    }

    #[tokio::test]
    async fn disabled_config_returns_identity_order() {
        let mut cfg = config();
        cfg.enabled = false;
        let service = RerankingService::new(Some(Box::new(AlwaysFails)), cfg);
        let result = service.rerank("q", vec!["a".to_string(), "b".to_string()], 5).await;
        assert_eq!(result, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failure_falls_back_to_identity() {
        let service = RerankingService::new(Some(Box::new(AlwaysFails)), config());
        let result = service.rerank("q", vec!["a".to_string(), "b".to_string()], 5).await;
        assert_eq!(result, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = RerankingService::new(Some(Box::new(AlwaysFails)), config());
        for _ in 0..2 {
            service.rerank("q", vec!["a".to_string()], 5).await;
        }
        assert!(service.breaker.is_open());
        let _ = calls;
    }

    #[tokio::test]
    async fn min_score_filters_low_scoring_items() {
        struct LowScore;
        #[async_trait]
        impl Reranker for LowScore {
            async fn rerank_raw(&self, _q: &str, chunks: &[String], _k: usize) -> anyhow::Result<Vec<RankedItem>> {
                Ok(chunks.iter().map(|c| RankedItem { content: c.clone(), score: 0.01 }).collect())
            }
        }
        let service = RerankingService::new(Some(Box::new(LowScore)), config());
        let result = service.rerank("q", vec!["a".to_string()], 5).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn successful_rerank_uses_provider_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = RerankingService::new(Some(Box::new(CountingReranker { calls: calls.clone() })), config());
        let result = service.rerank("q", vec!["a".to_string(), "b".to_string()], 5).await;
        assert_eq!(result.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
