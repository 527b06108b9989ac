//! Error taxonomy for the knowledge-graph engine.
//!
//! Adapters (Neo4j, LLM, reranker HTTP clients) keep using `anyhow` for
//! their own internals; the core surfaces a structured [`CoreError`] at
//! component boundaries so callers can map kinds to user-visible outcomes
//! (validation -> 400, transient exhaustion -> 503, semantic issues ->
//! success-with-warning).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Null/blank names, out-of-range scores, weights not summing to 1.0,
    /// self-referential merges, and similar caller-supplied bad input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store connection drop, LLM timeout, reranker 5xx. Adapters retry
    /// with backoff before surfacing this; at that point it is terminal
    /// for the current request.
    #[error("transient I/O error after retries: {0}")]
    Transient(String),

    /// Store schema error, unauthorized, malformed persistent data. Never
    /// retried.
    #[error("permanent I/O error: {0}")]
    Permanent(String),

    /// LLM output unparseable across every gleaning pass. Not fatal to
    /// ingestion — the caller indexes the chunk with an empty KG
    /// contribution and logs this at WARN.
    #[error("semantic extraction issue: {0}")]
    Semantic(String),

    /// An entity referenced by name does not exist in the project.
    #[error("entity not found: project={project}, name={name}")]
    EntityNotFound { project: String, name: String },

    /// A relation would connect an entity to itself.
    #[error("self-loop rejected: {0}")]
    SelfLoop(String),

    /// Wraps adapter-level failures that don't fit the taxonomy above
    /// (e.g. a Cypher syntax error surfaced from `neo4rs`).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}
