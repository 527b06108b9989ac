//! Engine configuration — a single immutable structure bound once at
//! startup, validated once rather than re-read on hot paths. Loaded with
//! an env-vars-with-defaults style: required keys via `env::var` +
//! `anyhow!`, optional keys with `unwrap_or_else` defaults.

use std::env;
use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("unsupported LLM provider: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GleaningConfig {
    pub enabled: bool,
    pub max_passes: u32,
}

#[derive(Clone, Debug)]
pub struct SimilarityConfig {
    pub threshold: f64,
    pub weights: SimilarityWeights,
    pub early_termination_ratio: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct SimilarityWeights {
    pub jaccard: f64,
    pub containment: f64,
    pub levenshtein: f64,
    pub abbreviation: f64,
    pub token_overlap: f64,
    pub length_penalty: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            jaccard: 0.25,
            containment: 0.20,
            levenshtein: 0.25,
            abbreviation: 0.15,
            token_overlap: 0.10,
            length_penalty: 0.05,
        }
    }
}

impl SimilarityWeights {
    pub fn sum(&self) -> f64 {
        self.jaccard
            + self.containment
            + self.levenshtein
            + self.abbreviation
            + self.token_overlap
            + self.length_penalty
    }

    pub fn validate(&self) -> Result<()> {
        if (self.sum() - 1.0).abs() > 0.01 {
            return Err(anyhow!(
                "similarity weights must sum to 1.0 +/- 0.01, got {}",
                self.sum()
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DescriptionConfig {
    pub force_summary_count: usize,
    pub summary_context_size: usize,
    pub summary_max_tokens: usize,
    pub max_map_iterations: u32,
    pub max_chars: usize,
}

#[derive(Clone, Debug)]
pub struct QueryBudgetRatios {
    pub entity: f64,
    pub relation: f64,
    pub chunk: f64,
}

impl QueryBudgetRatios {
    pub fn validate(&self) -> Result<()> {
        let sum = self.entity + self.relation + self.chunk;
        if (sum - 1.0).abs() > 0.01 {
            return Err(anyhow!("query budget ratios must sum to 1.0 +/- 0.01, got {sum}"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NeighborExpansionConfig {
    pub enabled: bool,
    pub max_depth: u32,
    pub max_nodes: usize,
    pub include_relations: bool,
}

#[derive(Clone, Debug)]
pub struct RerankConfig {
    pub enabled: bool,
    pub provider: Option<String>,
    pub min_score: f64,
    pub timeout_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
}

/// Full configuration surface. Cheap to `Clone`, read-only after
/// construction, safe to share across concurrently-running tasks.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,

    pub gleaning: GleaningConfig,
    pub similarity: SimilarityConfig,
    pub entity_name_max_length: usize,
    pub description: DescriptionConfig,
    pub source_chunk_ids_max: usize,

    pub query_context_max_tokens: usize,
    pub query_budget: QueryBudgetRatios,
    pub query_top_k: usize,
    pub keyword_extraction_enabled: bool,
    pub neighbor_expansion: NeighborExpansionConfig,
    pub rerank: RerankConfig,

    pub cache_enabled: bool,
    pub parallelism: usize,
}

impl EngineConfig {
    /// Load from environment variables, using `.env` if present, across
    /// the full configuration surface.
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI").map_err(|_| anyhow!("missing NEO4J_URI in the environment"))?;
        let neo4j_user = env::var("NEO4J_USER").map_err(|_| anyhow!("missing NEO4J_USER in the environment"))?;
        let neo4j_password =
            env::var("NEO4J_PASSWORD").map_err(|_| anyhow!("missing NEO4J_PASSWORD in the environment"))?;

        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str = env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model =
            env::var("LLM_EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model = env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let env_usize = |key: &str, default: usize| -> usize {
            env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let env_f64 = |key: &str, default: f64| -> f64 {
            env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let env_bool = |key: &str, default: bool| -> bool {
            env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let config = Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,

            chunk_size_tokens: env_usize("CHUNK_SIZE", 2000),
            chunk_overlap_tokens: env_usize("CHUNK_OVERLAP", 200),

            gleaning: GleaningConfig {
                enabled: env_bool("GLEANING_ENABLED", true),
                max_passes: env_usize("GLEANING_MAX_PASSES", 2) as u32,
            },
            similarity: SimilarityConfig {
                threshold: env_f64("SIMILARITY_THRESHOLD", 0.40),
                weights: SimilarityWeights::default(),
                early_termination_ratio: env_f64("SIMILARITY_EARLY_TERMINATION_K", 0.75),
            },
            entity_name_max_length: env_usize("ENTITY_NAME_MAX_LENGTH", 500),
            description: DescriptionConfig {
                force_summary_count: env_usize("DESCRIPTION_FORCE_SUMMARY_COUNT", 6),
                summary_context_size: env_usize("DESCRIPTION_SUMMARY_CONTEXT_SIZE", 10_000),
                summary_max_tokens: env_usize("DESCRIPTION_SUMMARY_MAX_TOKENS", 500),
                max_map_iterations: env_usize("DESCRIPTION_MAX_MAP_ITERATIONS", 3) as u32,
                max_chars: env_usize("DESCRIPTION_MAX_CHARS", 4000),
            },
            source_chunk_ids_max: env_usize("SOURCE_CHUNK_IDS_MAX", crate::models::DEFAULT_SOURCE_CHUNK_CAP),

            query_context_max_tokens: env_usize("QUERY_CONTEXT_MAX_TOKENS", 4000),
            query_budget: QueryBudgetRatios {
                entity: env_f64("QUERY_BUDGET_ENTITY", 0.40),
                relation: env_f64("QUERY_BUDGET_RELATION", 0.40),
                chunk: env_f64("QUERY_BUDGET_CHUNK", 0.20),
            },
            query_top_k: env_usize("QUERY_TOP_K", 20),
            keyword_extraction_enabled: env_bool("KEYWORD_EXTRACTION_ENABLED", true),
            neighbor_expansion: NeighborExpansionConfig {
                enabled: env_bool("NEIGHBOR_EXPANSION_ENABLED", true),
                max_depth: env_usize("NEIGHBOR_EXPANSION_MAX_DEPTH", 1) as u32,
                max_nodes: env_usize("NEIGHBOR_EXPANSION_MAX_NODES", 20),
                include_relations: env_bool("NEIGHBOR_EXPANSION_INCLUDE_RELATIONS", true),
            },
            rerank: RerankConfig {
                enabled: env_bool("RERANK_ENABLED", false),
                provider: env::var("RERANK_PROVIDER").ok(),
                min_score: env_f64("RERANK_MIN_SCORE", 0.1),
                timeout_ms: env_usize("RERANK_TIMEOUT_MS", 2000) as u64,
                circuit_breaker_threshold: env_usize("RERANK_CIRCUIT_BREAKER_THRESHOLD", 5) as u32,
                circuit_breaker_cooldown_secs: env_usize("RERANK_CIRCUIT_BREAKER_COOLDOWN_SECS", 60) as u64,
            },

            cache_enabled: env_bool("CACHE_ENABLED", true),
            parallelism: env_usize("PARALLELISM", 4),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate once at bind time — weight/ratio sums, thresholds in
    /// range — so hot paths never re-check configuration validity.
    pub fn validate(&self) -> Result<()> {
        self.similarity.weights.validate()?;
        self.query_budget.validate()?;
        if !(0.0..=1.0).contains(&self.similarity.threshold) {
            return Err(anyhow!("similarity.threshold must be in [0,1]"));
        }
        if self.rerank.min_score < 0.0 || self.rerank.min_score > 1.0 {
            return Err(anyhow!("rerank.min_score must be in [0,1]"));
        }
        if self.parallelism == 0 {
            return Err(anyhow!("parallelism must be >= 1"));
        }
        Ok(())
    }

    /// A configuration with sane defaults and no required env vars, for
    /// tests and the in-memory adapters.
    pub fn for_tests() -> Self {
        Self {
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "test".to_string(),
            server_addr: "127.0.0.1:0".to_string(),
            llm_provider: LlmProvider::OpenAI,
            llm_embedding_model: "text-embedding-3-small".to_string(),
            llm_chat_model: "gpt-4o-mini".to_string(),
            chunk_size_tokens: 2000,
            chunk_overlap_tokens: 200,
            gleaning: GleaningConfig { enabled: true, max_passes: 2 },
            similarity: SimilarityConfig {
                threshold: 0.40,
                weights: SimilarityWeights::default(),
                early_termination_ratio: 0.75,
            },
            entity_name_max_length: 500,
            description: DescriptionConfig {
                force_summary_count: 6,
                summary_context_size: 10_000,
                summary_max_tokens: 500,
                max_map_iterations: 3,
                max_chars: 4000,
            },
            source_chunk_ids_max: crate::models::DEFAULT_SOURCE_CHUNK_CAP,
            query_context_max_tokens: 4000,
            query_budget: QueryBudgetRatios { entity: 0.40, relation: 0.40, chunk: 0.20 },
            query_top_k: 20,
            keyword_extraction_enabled: true,
            neighbor_expansion: NeighborExpansionConfig {
                enabled: true,
                max_depth: 1,
                max_nodes: 20,
                include_relations: true,
            },
            rerank: RerankConfig {
                enabled: false,
                provider: None,
                min_score: 0.1,
                timeout_ms: 2000,
                circuit_breaker_threshold: 5,
                circuit_breaker_cooldown_secs: 60,
            },
            cache_enabled: true,
            parallelism: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::for_tests().validate().unwrap();
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let mut cfg = EngineConfig::for_tests();
        cfg.similarity.weights.jaccard = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mismatched_budget_ratios_are_rejected() {
        let mut cfg = EngineConfig::for_tests();
        cfg.query_budget.entity = 0.9;
        assert!(cfg.validate().is_err());
    }
}
