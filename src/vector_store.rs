//! Vector store port and its Neo4j-backed adapter, using a native
//! vector index for nearest-neighbor search over chunk and entity
//! embeddings. An in-memory cosine-search adapter backs the core's own
//! test suite.

use std::collections::HashMap;
use async_trait::async_trait;
use neo4rs::query;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::graph_store::Neo4jGraphStore;

/// What kind of thing an embedding represents — the vector store is
/// shared across chunks, entities, and (optionally) relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Chunk,
    Entity,
    Relation,
}

impl EmbeddingKind {
    fn as_str(&self) -> &'static str {
        match self {
            EmbeddingKind::Chunk => "chunk",
            EmbeddingKind::Entity => "entity",
            EmbeddingKind::Relation => "relation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorMetadata {
    pub kind: EmbeddingKind,
    pub content: String,
    pub source_chunk_id: Option<String>,
    pub document_id: Option<String>,
    pub project_id: String,
}

#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct VectorQueryFilter {
    pub kind: Option<EmbeddingKind>,
    pub project_id: String,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub distance: f64,
    pub metadata: VectorMetadata,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> CoreResult<()>;

    async fn query(&self, query_vector: &[f32], top_k: usize, filter: VectorQueryFilter) -> CoreResult<Vec<VectorHit>>;

    async fn delete_entity_embeddings(&self, project_id: &str, names: &[String]) -> CoreResult<()>;
    async fn delete_chunk_embeddings(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<()>;

    async fn get_chunk_ids_by_document_id(&self, project_id: &str, document_id: &str) -> CoreResult<Vec<String>>;
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

// ---------------------------------------------------------------------
// Neo4j adapter
// ---------------------------------------------------------------------

const CHUNK_INDEX: &str = "chunkEmbeddingIndex";
const ENTITY_INDEX: &str = "entityEmbeddingIndex";
const VECTOR_DIMENSIONS: u32 = 1536;

pub struct Neo4jVectorStore {
    store: Neo4jGraphStore,
}

impl Neo4jVectorStore {
    pub fn new(store: Neo4jGraphStore) -> Self {
        Self { store }
    }

    fn graph(&self) -> &neo4rs::Graph {
        self.store.graph()
    }

    async fn ensure_index(&self, index_name: &str, label: &str) -> anyhow::Result<()> {
        let mut cursor = self
            .graph()
            .execute(query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name").param("name", index_name))
            .await?;
        if cursor.next().await?.is_some() {
            info!("vector index '{index_name}' already exists");
            return Ok(());
        }

        let cypher = format!(
            "CREATE VECTOR INDEX {index_name} FOR (n:{label}) ON (n.embedding)
             OPTIONS {{ indexConfig: {{ `vector.dimensions`: {VECTOR_DIMENSIONS}, `vector.similarity_function`: 'cosine' }} }}"
        );
        self.graph().run(query(&cypher)).await?;
        info!("vector index '{index_name}' created");
        Ok(())
    }

    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.ensure_index(CHUNK_INDEX, "Chunk").await?;
        self.ensure_index(ENTITY_INDEX, "Entity").await?;
        Ok(())
    }

    fn index_for(kind: EmbeddingKind) -> &'static str {
        match kind {
            EmbeddingKind::Chunk => CHUNK_INDEX,
            EmbeddingKind::Entity | EmbeddingKind::Relation => ENTITY_INDEX,
        }
    }

    fn label_for(kind: EmbeddingKind) -> &'static str {
        match kind {
            EmbeddingKind::Chunk => "Chunk",
            EmbeddingKind::Entity | EmbeddingKind::Relation => "Entity",
        }
    }
}

#[async_trait]
impl VectorStore for Neo4jVectorStore {
    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> CoreResult<()> {
        for entry in entries {
            let label = Self::label_for(entry.metadata.kind);
            let vector: Vec<f64> = entry.vector.iter().map(|v| *v as f64).collect();
            let cypher = format!(
                "MERGE (n:{label} {{id: $id, project_id: $pid}})
                 SET n.embedding = $embedding, n.text = $content, n.kind = $kind,
                     n.source_chunk_id = $source_chunk_id, n.document_id = $document_id"
            );
            self.graph()
                .run(
                    query(&cypher)
                        .param("id", entry.id)
                        .param("pid", entry.metadata.project_id.clone())
                        .param("embedding", vector)
                        .param("content", entry.metadata.content.clone())
                        .param("kind", entry.metadata.kind.as_str())
                        .param("source_chunk_id", entry.metadata.source_chunk_id.clone().unwrap_or_default())
                        .param("document_id", entry.metadata.document_id.clone().unwrap_or_default()),
                )
                .await
                .map_err(|e| CoreError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn query(&self, query_vector: &[f32], top_k: usize, filter: VectorQueryFilter) -> CoreResult<Vec<VectorHit>> {
        let index_name = filter.kind.map(Self::index_for).unwrap_or(ENTITY_INDEX);
        let vector: Vec<f64> = query_vector.iter().map(|v| *v as f64).collect();

        let mut cursor = self
            .graph()
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     WHERE node.project_id = $pid
                     RETURN node.id AS id, score, node.text AS content, node.kind AS kind,
                            node.source_chunk_id AS source_chunk_id, node.document_id AS document_id
                     ORDER BY score DESC",
                )
                .param("index_name", index_name)
                .param("k", top_k as i64)
                .param("embedding", vector)
                .param("pid", filter.project_id.clone()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            let id: String = row.get("id").unwrap_or_default();
            let score: f64 = row.get("score").unwrap_or(0.0);
            let content: String = row.get("content").unwrap_or_default();
            let kind_str: String = row.get("kind").unwrap_or_default();
            let kind = match kind_str.as_str() {
                "chunk" => EmbeddingKind::Chunk,
                "relation" => EmbeddingKind::Relation,
                _ => EmbeddingKind::Entity,
            };
            let source_chunk_id: Option<String> = row.get("source_chunk_id");
            let document_id: Option<String> = row.get("document_id");
            out.push(VectorHit {
                id,
                distance: 1.0 - score,
                metadata: VectorMetadata {
                    kind,
                    content,
                    source_chunk_id: source_chunk_id.filter(|s| !s.is_empty()),
                    document_id: document_id.filter(|s| !s.is_empty()),
                    project_id: filter.project_id.clone(),
                },
            });
        }
        Ok(out)
    }

    async fn delete_entity_embeddings(&self, project_id: &str, names: &[String]) -> CoreResult<()> {
        self.graph()
            .run(
                query("MATCH (n:Entity {project_id: $pid}) WHERE n.id IN $names REMOVE n.embedding")
                    .param("pid", project_id.to_string())
                    .param("names", names.to_vec()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn delete_chunk_embeddings(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<()> {
        self.graph()
            .run(
                query("MATCH (n:Chunk {project_id: $pid}) WHERE n.id IN $ids REMOVE n.embedding")
                    .param("pid", project_id.to_string())
                    .param("ids", chunk_ids.to_vec()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn get_chunk_ids_by_document_id(&self, project_id: &str, document_id: &str) -> CoreResult<Vec<String>> {
        let mut cursor = self
            .graph()
            .execute(
                query("MATCH (c:Chunk {project_id: $pid, document_id: $doc}) RETURN c.id AS id")
                    .param("pid", project_id.to_string())
                    .param("doc", document_id.to_string()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut ids = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            if let Some(id) = row.get::<String>("id") {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------
// In-memory adapter (tests, and a drop-in standalone deployment mode)
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<String, VectorEntry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> CoreResult<()> {
        let mut store = self.entries.write().await;
        for entry in entries {
            store.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn query(&self, query_vector: &[f32], top_k: usize, filter: VectorQueryFilter) -> CoreResult<Vec<VectorHit>> {
        let store = self.entries.read().await;
        let mut scored: Vec<(f64, &VectorEntry)> = store
            .values()
            .filter(|e| {
                e.metadata.project_id == filter.project_id
                    && filter.kind.map(|k| k == e.metadata.kind).unwrap_or(true)
            })
            .map(|e| (cosine_distance(query_vector, &e.vector), e))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.id.cmp(&b.1.id)));
        scored.truncate(top_k);
        Ok(scored
            .into_iter()
            .map(|(distance, entry)| VectorHit { id: entry.id.clone(), distance, metadata: entry.metadata.clone() })
            .collect())
    }

    async fn delete_entity_embeddings(&self, project_id: &str, names: &[String]) -> CoreResult<()> {
        let wanted: std::collections::HashSet<&String> = names.iter().collect();
        self.entries.write().await.retain(|_, e| {
            !(e.metadata.project_id == project_id
                && e.metadata.kind == EmbeddingKind::Entity
                && wanted.contains(&e.id))
        });
        Ok(())
    }

    async fn delete_chunk_embeddings(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<()> {
        let wanted: std::collections::HashSet<&String> = chunk_ids.iter().collect();
        self.entries.write().await.retain(|_, e| {
            !(e.metadata.project_id == project_id
                && e.metadata.kind == EmbeddingKind::Chunk
                && wanted.contains(&e.id))
        });
        Ok(())
    }

    async fn get_chunk_ids_by_document_id(&self, project_id: &str, document_id: &str) -> CoreResult<Vec<String>> {
        let store = self.entries.read().await;
        Ok(store
            .values()
            .filter(|e| {
                e.metadata.project_id == project_id
                    && e.metadata.kind == EmbeddingKind::Chunk
                    && e.metadata.document_id.as_deref() == Some(document_id)
            })
            .map(|e| e.id.clone())
            .collect())
    }
}
