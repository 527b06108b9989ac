//! Request-scoped token tracker — never a process-global singleton. One
//! instance per top-level `ingestDocument`/`query` call, shared across
//! concurrently running sub-tasks via `Arc`, mutated through thread-safe
//! accumulators.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{TokenSummary, TokenUsage};

/// Cheaply cloneable handle; the inner state lives behind an `Arc<Mutex<_>>`
/// so every clone observes the same accumulator, simplified to a mutex
/// since the list is short-lived and per-request.
#[derive(Clone, Default)]
pub struct TokenTracker {
    inner: Arc<Mutex<Vec<TokenUsage>>>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, operation_type: impl Into<String>, model_name: impl Into<String>, input_tokens: u32, output_tokens: u32) {
        let usage = TokenUsage {
            operation_type: operation_type.into(),
            model_name: model_name.into(),
            input_tokens,
            output_tokens,
            timestamp: chrono::Utc::now(),
        };
        self.inner.lock().await.push(usage);
    }

    pub async fn summary(&self) -> TokenSummary {
        let entries = self.inner.lock().await;
        let mut breakdown: HashMap<String, (u64, u64)> = HashMap::new();
        let mut total_input = 0u64;
        let mut total_output = 0u64;
        for usage in entries.iter() {
            total_input += usage.input_tokens as u64;
            total_output += usage.output_tokens as u64;
            let entry = breakdown.entry(usage.operation_type.clone()).or_default();
            entry.0 += usage.input_tokens as u64;
            entry.1 += usage.output_tokens as u64;
        }
        TokenSummary { total_input, total_output, breakdown_by_operation: breakdown }
    }
}
