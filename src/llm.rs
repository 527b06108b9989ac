//! LLM and embedding ports, plus a `rig-core` + OpenAI adapter behind
//! them. Every call surfaces its token cost to the request-scoped
//! [`TokenTracker`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::config::{EngineConfig, LlmProvider};
use crate::token_tracker::TokenTracker;

/// `complete(prompt, system?, kwargs) -> future<string>`.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, system: Option<&str>, prompt: &str, operation_type: &str, tracker: &TokenTracker) -> Result<String>;
}

/// `embed(texts[]) -> future<vector[]>`, `embedSingle(text) -> future<vector>`.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;

    async fn embed_single(&self, text: &str) -> Result<Vec<f64>> {
        let mut v = self.embed_texts(std::slice::from_ref(&text.to_string())).await?;
        v.pop().ok_or_else(|| anyhow!("embedding provider returned no vectors"))
    }
}

/// `rig-core` + OpenAI adapter. Only OpenAI is wired up for now; other
/// providers return a clear "not implemented" error from the `match`
/// arm that would otherwise handle them.
#[derive(Clone)]
pub struct RigLlmClient {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl RigLlmClient {
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    fn chat_model_name(&self) -> &str {
        if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        }
    }

    fn embedding_model_name(&self) -> &str {
        use rig::providers::openai::TEXT_EMBEDDING_3_SMALL;
        if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        }
    }
}

#[async_trait]
impl Llm for RigLlmClient {
    async fn complete(&self, system: Option<&str>, prompt: &str, operation_type: &str, tracker: &TokenTracker) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => {
                use rig::client::CompletionClient as _;
                use rig::completion::Prompt;

                let client = rig::providers::openai::Client::from_env();
                let model_name = self.chat_model_name();
                let mut builder = client.agent(model_name);
                if let Some(system) = system {
                    builder = builder.preamble(system);
                }
                let agent = builder.build();
                let answer = agent.prompt(prompt).await?;

                // rig does not currently surface per-call token usage
                // through `Prompt`; approximate from text length so the
                // tracker still reflects relative cost across operations.
                let input_tokens = (prompt.len() / 4).max(1) as u32;
                let output_tokens = (answer.len() / 4).max(1) as u32;
                tracker.record(operation_type, model_name, input_tokens, output_tokens).await;

                Ok(answer)
            }
            ref other => Err(anyhow!("LLM provider {:?} not yet implemented for completion", other)),
        }
    }
}

#[async_trait]
impl Embedder for RigLlmClient {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            LlmProvider::OpenAI => {
                use rig::client::EmbeddingsClient as _;
                use rig::embeddings::EmbeddingModel as _;

                let client = rig::providers::openai::Client::from_env();
                let model = client.embedding_model(self.embedding_model_name());
                let embeddings = model.embed_texts(texts.to_vec()).await?;
                if embeddings.len() != texts.len() {
                    return Err(anyhow!(
                        "embedding provider returned {} vectors for {} inputs",
                        embeddings.len(),
                        texts.len()
                    ));
                }
                Ok(embeddings.into_iter().map(|e| e.vec).collect())
            }
            ref other => Err(anyhow!("LLM provider {:?} not yet implemented for embeddings", other)),
        }
    }
}

/// Deterministic fake used across the core's own tests so orchestration
/// logic can be exercised without a live provider.
#[cfg(test)]
pub mod fakes {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedLlm {
        pub responses: Mutex<std::collections::VecDeque<String>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: Vec<String>) -> Self {
            Self { responses: Mutex::new(responses.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl Llm for ScriptedLlm {
        async fn complete(&self, _system: Option<&str>, _prompt: &str, operation_type: &str, tracker: &TokenTracker) -> Result<String> {
            let mut queue = self.responses.lock().await;
            let response = queue.pop_front().unwrap_or_default();
            tracker.record(operation_type, "scripted", 10, 10).await;
            Ok(response)
        }
    }

    /// Hash-based fake embedder: deterministic, low-dimensional, good
    /// enough to exercise nearest-neighbor ordering in tests.
    pub struct HashEmbedder {
        pub dims: usize,
    }

    impl Default for HashEmbedder {
        fn default() -> Self {
            Self { dims: 16 }
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            Ok(texts.iter().map(|t| hash_embed(t, self.dims)).collect())
        }
    }

    pub fn hash_embed(text: &str, dims: usize) -> Vec<f64> {
        use sha2::{Digest, Sha256};
        let mut vec = vec![0f64; dims];
        for (i, word) in text.split_whitespace().enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(word.as_bytes());
            let digest = hasher.finalize();
            let bucket = (digest[0] as usize + i) % dims;
            vec[bucket] += 1.0;
        }
        let norm: f64 = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in vec.iter_mut() {
                *v /= norm;
            }
        }
        vec
    }
}
