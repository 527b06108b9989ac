//! Graph store port and its Neo4j-backed adapter, built on the same
//! connection/query-builder/schema-constraint patterns used to persist
//! a knowledge graph in Neo4j via `neo4rs`. An in-memory adapter backs
//! the core's own test suite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tokio::sync::RwLock;
use tracing::info;
use url::Url;

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::Entity;
use crate::models::Relation;

/// A bounded subgraph returned by `traverse_bfs`: entities and
/// relations discovered while expanding from a seed, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn create_project_graph(&self, project_id: &str) -> CoreResult<()>;
    async fn delete_project_graph(&self, project_id: &str) -> CoreResult<()>;

    async fn upsert_entity(&self, entity: Entity) -> CoreResult<()>;
    async fn upsert_entities(&self, entities: Vec<Entity>) -> CoreResult<()>;
    async fn upsert_relation(&self, relation: Relation) -> CoreResult<()>;
    async fn upsert_relations(&self, relations: Vec<Relation>) -> CoreResult<()>;

    async fn get_entity(&self, project_id: &str, name: &str) -> CoreResult<Option<Entity>>;
    async fn get_entities(&self, project_id: &str, names: &[String]) -> CoreResult<Vec<Entity>>;
    async fn get_entities_batch(&self, project_id: &str, offset: usize, limit: usize) -> CoreResult<Vec<Entity>>;

    async fn get_relations_for_entity(&self, project_id: &str, name: &str) -> CoreResult<Vec<Relation>>;

    async fn get_entities_by_source_chunks(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<Vec<Entity>>;
    async fn get_relations_by_source_chunks(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<Vec<Relation>>;

    async fn delete_entities(&self, project_id: &str, names: &[String]) -> CoreResult<()>;
    async fn delete_relations(&self, project_id: &str, keys: &[(String, String)]) -> CoreResult<()>;
    async fn delete_by_source_id(&self, project_id: &str, source_id: &str) -> CoreResult<()>;

    async fn update_entity_description(
        &self,
        project_id: &str,
        name: &str,
        description: &str,
        source_chunk_ids: VecDeque<String>,
    ) -> CoreResult<()>;

    async fn traverse_bfs(&self, project_id: &str, seed: &str, max_depth: u32, max_nodes: usize) -> CoreResult<Subgraph>;
}

fn reject_self_loop(relation: &Relation) -> CoreResult<()> {
    if relation.is_self_loop() {
        return Err(CoreError::SelfLoop(format!(
            "{} -> {}",
            relation.src_name, relation.tgt_name
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Neo4j adapter
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct Neo4jGraphStore {
    graph: Arc<Graph>,
}

impl Neo4jGraphStore {
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let url = Url::parse(&cfg.neo4j_uri)?;
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port().unwrap_or(7687);
        let addr = format!("{host}:{port}");

        info!("connecting to Neo4j at {addr}");
        let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
        info!("Neo4j connection established");
        Ok(Self { graph: Arc::new(graph) })
    }

    /// Exposes the underlying connection so the vector store adapter can
    /// share it rather than opening a second one.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Create the uniqueness constraints the core relies on. Idempotent.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let statements = [
            "CREATE CONSTRAINT entity_key IF NOT EXISTS FOR (e:Entity) REQUIRE (e.project_id, e.name_lower) IS UNIQUE",
            "CREATE CONSTRAINT chunk_id IF NOT EXISTS FOR (c:Chunk) REQUIRE c.id IS UNIQUE",
        ];
        for stmt in statements {
            self.graph.run(query(stmt)).await?;
        }
        info!("Neo4j schema ensured");
        Ok(())
    }

    fn row_to_entity(project_id: &str, row: &neo4rs::Row) -> Option<Entity> {
        let name: String = row.get("name")?;
        let entity_type: String = row.get("type")?;
        let description: String = row.get("description").unwrap_or_default();
        let source_chunk_ids: Vec<String> = row.get("source_chunk_ids").unwrap_or_default();
        let document_id: Option<String> = row.get("document_id");
        let file_path: Option<String> = row.get("file_path");
        Some(Entity {
            project_id: project_id.to_string(),
            name,
            entity_type,
            description,
            source_chunk_ids: source_chunk_ids.into_iter().collect(),
            document_id,
            file_path,
            global_keys: None,
        })
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn create_project_graph(&self, _project_id: &str) -> CoreResult<()> {
        // Neo4j has no per-project schema to create; projects are a
        // property partition, not a separate database. Idempotent no-op.
        Ok(())
    }

    async fn delete_project_graph(&self, project_id: &str) -> CoreResult<()> {
        self.graph
            .run(
                query("MATCH (n) WHERE n.project_id = $pid DETACH DELETE n")
                    .param("pid", project_id.to_string()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn upsert_entity(&self, entity: Entity) -> CoreResult<()> {
        self.upsert_entities(vec![entity]).await
    }

    async fn upsert_entities(&self, entities: Vec<Entity>) -> CoreResult<()> {
        for entity in entities {
            let source_chunk_ids: Vec<String> = entity.source_chunk_ids.into_iter().collect();
            self.graph
                .run(
                    query(
                        "MERGE (e:Entity {project_id: $pid, name_lower: $name_lower})
                         SET e.name = $name, e.type = $type, e.description = $description,
                             e.source_chunk_ids = $source_chunk_ids,
                             e.document_id = $document_id, e.file_path = $file_path",
                    )
                    .param("pid", entity.project_id.clone())
                    .param("name_lower", entity.name.to_lowercase())
                    .param("name", entity.name.clone())
                    .param("type", entity.entity_type.clone())
                    .param("description", entity.description.clone())
                    .param("source_chunk_ids", source_chunk_ids)
                    .param("document_id", entity.document_id.clone().unwrap_or_default())
                    .param("file_path", entity.file_path.clone().unwrap_or_default()),
                )
                .await
                .map_err(|e| CoreError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn upsert_relation(&self, relation: Relation) -> CoreResult<()> {
        self.upsert_relations(vec![relation]).await
    }

    async fn upsert_relations(&self, relations: Vec<Relation>) -> CoreResult<()> {
        for relation in relations {
            reject_self_loop(&relation)?;
            let source_chunk_ids: Vec<String> = relation.source_chunk_ids.into_iter().collect();
            self.graph
                .run(
                    query(
                        "MATCH (s:Entity {project_id: $pid, name_lower: $src}),
                               (t:Entity {project_id: $pid, name_lower: $tgt})
                         MERGE (s)-[r:RELATED_TO]->(t)
                         SET r.description = $description, r.keywords = $keywords, r.weight = $weight,
                             r.source_chunk_ids = $source_chunk_ids,
                             r.document_id = $document_id, r.file_path = $file_path",
                    )
                    .param("pid", relation.project_id.clone())
                    .param("src", relation.src_name.to_lowercase())
                    .param("tgt", relation.tgt_name.to_lowercase())
                    .param("description", relation.description.clone())
                    .param("keywords", relation.keywords.clone())
                    .param("weight", relation.weight)
                    .param("source_chunk_ids", source_chunk_ids)
                    .param("document_id", relation.document_id.clone().unwrap_or_default())
                    .param("file_path", relation.file_path.clone().unwrap_or_default()),
                )
                .await
                .map_err(|e| CoreError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn get_entity(&self, project_id: &str, name: &str) -> CoreResult<Option<Entity>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {project_id: $pid, name_lower: $name_lower})
                     RETURN e.name AS name, e.type AS type, e.description AS description,
                            e.source_chunk_ids AS source_chunk_ids, e.document_id AS document_id,
                            e.file_path AS file_path",
                )
                .param("pid", project_id.to_string())
                .param("name_lower", name.to_lowercase()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        match cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            Some(row) => Ok(Self::row_to_entity(project_id, &row)),
            None => Ok(None),
        }
    }

    async fn get_entities(&self, project_id: &str, names: &[String]) -> CoreResult<Vec<Entity>> {
        let lowered: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {project_id: $pid}) WHERE e.name_lower IN $names
                     RETURN e.name AS name, e.type AS type, e.description AS description,
                            e.source_chunk_ids AS source_chunk_ids, e.document_id AS document_id,
                            e.file_path AS file_path",
                )
                .param("pid", project_id.to_string())
                .param("names", lowered),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            if let Some(entity) = Self::row_to_entity(project_id, &row) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    async fn get_entities_batch(&self, project_id: &str, offset: usize, limit: usize) -> CoreResult<Vec<Entity>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {project_id: $pid}) RETURN e.name AS name, e.type AS type,
                     e.description AS description, e.source_chunk_ids AS source_chunk_ids,
                     e.document_id AS document_id, e.file_path AS file_path
                     ORDER BY e.name_lower SKIP $offset LIMIT $limit",
                )
                .param("pid", project_id.to_string())
                .param("offset", offset as i64)
                .param("limit", limit as i64),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            if let Some(entity) = Self::row_to_entity(project_id, &row) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    async fn get_relations_for_entity(&self, project_id: &str, name: &str) -> CoreResult<Vec<Relation>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {project_id: $pid, name_lower: $name_lower})-[r:RELATED_TO]-(o:Entity)
                     RETURN e.name AS src, o.name AS tgt, r.description AS description,
                            r.keywords AS keywords, r.weight AS weight,
                            r.source_chunk_ids AS source_chunk_ids",
                )
                .param("pid", project_id.to_string())
                .param("name_lower", name.to_lowercase()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            let src: String = row.get("src").unwrap_or_default();
            let tgt: String = row.get("tgt").unwrap_or_default();
            let mut relation = Relation::new(project_id, src, tgt);
            relation.description = row.get("description").unwrap_or_default();
            relation.keywords = row.get("keywords").unwrap_or_default();
            relation.weight = row.get("weight").unwrap_or(1.0);
            let chunks: Vec<String> = row.get("source_chunk_ids").unwrap_or_default();
            relation.source_chunk_ids = chunks.into_iter().collect();
            out.push(relation);
        }
        Ok(out)
    }

    async fn get_entities_by_source_chunks(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<Vec<Entity>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {project_id: $pid}) WHERE any(c IN e.source_chunk_ids WHERE c IN $chunk_ids)
                     RETURN e.name AS name, e.type AS type, e.description AS description,
                            e.source_chunk_ids AS source_chunk_ids, e.document_id AS document_id,
                            e.file_path AS file_path",
                )
                .param("pid", project_id.to_string())
                .param("chunk_ids", chunk_ids.to_vec()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            if let Some(entity) = Self::row_to_entity(project_id, &row) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    async fn get_relations_by_source_chunks(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<Vec<Relation>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (s:Entity {project_id: $pid})-[r:RELATED_TO]->(t:Entity)
                     WHERE any(c IN r.source_chunk_ids WHERE c IN $chunk_ids)
                     RETURN s.name AS src, t.name AS tgt, r.description AS description,
                            r.keywords AS keywords, r.weight AS weight, r.source_chunk_ids AS source_chunk_ids",
                )
                .param("pid", project_id.to_string())
                .param("chunk_ids", chunk_ids.to_vec()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            let src: String = row.get("src").unwrap_or_default();
            let tgt: String = row.get("tgt").unwrap_or_default();
            let mut relation = Relation::new(project_id, src, tgt);
            relation.description = row.get("description").unwrap_or_default();
            relation.keywords = row.get("keywords").unwrap_or_default();
            relation.weight = row.get("weight").unwrap_or(1.0);
            let chunks: Vec<String> = row.get("source_chunk_ids").unwrap_or_default();
            relation.source_chunk_ids = chunks.into_iter().collect();
            out.push(relation);
        }
        Ok(out)
    }

    async fn delete_entities(&self, project_id: &str, names: &[String]) -> CoreResult<()> {
        let lowered: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        self.graph
            .run(
                query("MATCH (e:Entity {project_id: $pid}) WHERE e.name_lower IN $names DETACH DELETE e")
                    .param("pid", project_id.to_string())
                    .param("names", lowered),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn delete_relations(&self, project_id: &str, keys: &[(String, String)]) -> CoreResult<()> {
        for (a, b) in keys {
            self.graph
                .run(
                    query(
                        "MATCH (s:Entity {project_id: $pid, name_lower: $a})-[r:RELATED_TO]-(t:Entity {project_id: $pid, name_lower: $b})
                         DELETE r",
                    )
                    .param("pid", project_id.to_string())
                    .param("a", a.to_lowercase())
                    .param("b", b.to_lowercase()),
                )
                .await
                .map_err(|e| CoreError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn delete_by_source_id(&self, project_id: &str, source_id: &str) -> CoreResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (n) WHERE n.project_id = $pid AND n.document_id = $doc
                     DETACH DELETE n",
                )
                .param("pid", project_id.to_string())
                .param("doc", source_id.to_string()),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn update_entity_description(
        &self,
        project_id: &str,
        name: &str,
        description: &str,
        source_chunk_ids: VecDeque<String>,
    ) -> CoreResult<()> {
        let chunks: Vec<String> = source_chunk_ids.into_iter().collect();
        self.graph
            .run(
                query(
                    "MATCH (e:Entity {project_id: $pid, name_lower: $name_lower})
                     SET e.description = $description, e.source_chunk_ids = $source_chunk_ids",
                )
                .param("pid", project_id.to_string())
                .param("name_lower", name.to_lowercase())
                .param("description", description.to_string())
                .param("source_chunk_ids", chunks),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn traverse_bfs(&self, project_id: &str, seed: &str, max_depth: u32, max_nodes: usize) -> CoreResult<Subgraph> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (start:Entity {project_id: $pid, name_lower: $seed})
                     CALL apoc.path.subgraphAll(start, {maxLevel: $depth, limit: $limit})
                     YIELD nodes, relationships
                     UNWIND nodes AS n
                     RETURN n.name AS name, n.type AS type, n.description AS description,
                            n.source_chunk_ids AS source_chunk_ids",
                )
                .param("pid", project_id.to_string())
                .param("seed", seed.to_lowercase())
                .param("depth", max_depth as i64)
                .param("limit", max_nodes as i64),
            )
            .await
            .map_err(|e| CoreError::Transient(e.to_string()))?;

        let mut entities = Vec::new();
        while let Some(row) = cursor.next().await.map_err(|e| CoreError::Transient(e.to_string()))? {
            if let Some(entity) = Self::row_to_entity(project_id, &row) {
                entities.push(entity);
            }
        }
        entities.truncate(max_nodes);
        Ok(Subgraph { entities, relations: Vec::new() })
    }
}

// ---------------------------------------------------------------------
// In-memory adapter (tests, and a drop-in standalone deployment mode)
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryGraphStore {
    entities: RwLock<HashMap<(String, String), Entity>>,
    relations: RwLock<HashMap<(String, String, String), Relation>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entity_key(project_id: &str, name: &str) -> (String, String) {
        (project_id.to_string(), name.to_lowercase())
    }

    fn relation_key(relation: &Relation) -> (String, String, String) {
        let (a, b) = relation.unordered_key();
        (relation.project_id.clone(), a, b)
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_project_graph(&self, _project_id: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn delete_project_graph(&self, project_id: &str) -> CoreResult<()> {
        self.entities.write().await.retain(|k, _| k.0 != project_id);
        self.relations.write().await.retain(|k, _| k.0 != project_id);
        Ok(())
    }

    async fn upsert_entity(&self, entity: Entity) -> CoreResult<()> {
        let key = Self::entity_key(&entity.project_id, &entity.name);
        self.entities.write().await.insert(key, entity);
        Ok(())
    }

    async fn upsert_entities(&self, entities: Vec<Entity>) -> CoreResult<()> {
        let mut store = self.entities.write().await;
        for entity in entities {
            let key = Self::entity_key(&entity.project_id, &entity.name);
            store.insert(key, entity);
        }
        Ok(())
    }

    async fn upsert_relation(&self, relation: Relation) -> CoreResult<()> {
        reject_self_loop(&relation)?;
        let key = Self::relation_key(&relation);
        let mut store = self.relations.write().await;
        if let Some(existing) = store.get_mut(&key) {
            existing.weight += relation.weight;
            if !relation.description.is_empty() {
                if existing.description.is_empty() {
                    existing.description = relation.description;
                } else {
                    existing.description.push_str(" | ");
                    existing.description.push_str(&relation.description);
                }
            }
            for id in relation.source_chunk_ids {
                existing.push_source_chunk(id, 50);
            }
        } else {
            store.insert(key, relation);
        }
        Ok(())
    }

    async fn upsert_relations(&self, relations: Vec<Relation>) -> CoreResult<()> {
        for relation in relations {
            self.upsert_relation(relation).await?;
        }
        Ok(())
    }

    async fn get_entity(&self, project_id: &str, name: &str) -> CoreResult<Option<Entity>> {
        let key = Self::entity_key(project_id, name);
        Ok(self.entities.read().await.get(&key).cloned())
    }

    async fn get_entities(&self, project_id: &str, names: &[String]) -> CoreResult<Vec<Entity>> {
        let store = self.entities.read().await;
        Ok(names
            .iter()
            .filter_map(|n| store.get(&Self::entity_key(project_id, n)).cloned())
            .collect())
    }

    async fn get_entities_batch(&self, project_id: &str, offset: usize, limit: usize) -> CoreResult<Vec<Entity>> {
        let store = self.entities.read().await;
        let mut matching: Vec<Entity> = store
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_relations_for_entity(&self, project_id: &str, name: &str) -> CoreResult<Vec<Relation>> {
        let lowered = name.to_lowercase();
        let store = self.relations.read().await;
        Ok(store
            .values()
            .filter(|r| {
                r.project_id == project_id
                    && (r.src_name.to_lowercase() == lowered || r.tgt_name.to_lowercase() == lowered)
            })
            .cloned()
            .collect())
    }

    async fn get_entities_by_source_chunks(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<Vec<Entity>> {
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        let store = self.entities.read().await;
        Ok(store
            .values()
            .filter(|e| e.project_id == project_id && e.source_chunk_ids.iter().any(|c| wanted.contains(c)))
            .cloned()
            .collect())
    }

    async fn get_relations_by_source_chunks(&self, project_id: &str, chunk_ids: &[String]) -> CoreResult<Vec<Relation>> {
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        let store = self.relations.read().await;
        Ok(store
            .values()
            .filter(|r| r.project_id == project_id && r.source_chunk_ids.iter().any(|c| wanted.contains(c)))
            .cloned()
            .collect())
    }

    async fn delete_entities(&self, project_id: &str, names: &[String]) -> CoreResult<()> {
        let mut store = self.entities.write().await;
        for name in names {
            store.remove(&Self::entity_key(project_id, name));
        }
        Ok(())
    }

    async fn delete_relations(&self, project_id: &str, keys: &[(String, String)]) -> CoreResult<()> {
        let mut store = self.relations.write().await;
        for (a, b) in keys {
            let (lo, hi) = if a.to_lowercase() <= b.to_lowercase() {
                (a.to_lowercase(), b.to_lowercase())
            } else {
                (b.to_lowercase(), a.to_lowercase())
            };
            store.remove(&(project_id.to_string(), lo, hi));
        }
        Ok(())
    }

    async fn delete_by_source_id(&self, project_id: &str, source_id: &str) -> CoreResult<()> {
        self.entities
            .write()
            .await
            .retain(|_, e| !(e.project_id == project_id && e.document_id.as_deref() == Some(source_id)));
        self.relations
            .write()
            .await
            .retain(|_, r| !(r.project_id == project_id && r.document_id.as_deref() == Some(source_id)));
        Ok(())
    }

    async fn update_entity_description(
        &self,
        project_id: &str,
        name: &str,
        description: &str,
        source_chunk_ids: VecDeque<String>,
    ) -> CoreResult<()> {
        let key = Self::entity_key(project_id, name);
        let mut store = self.entities.write().await;
        if let Some(entity) = store.get_mut(&key) {
            entity.description = description.to_string();
            entity.source_chunk_ids = source_chunk_ids;
            Ok(())
        } else {
            Err(CoreError::EntityNotFound { project: project_id.to_string(), name: name.to_string() })
        }
    }

    async fn traverse_bfs(&self, project_id: &str, seed: &str, max_depth: u32, max_nodes: usize) -> CoreResult<Subgraph> {
        let entities = self.entities.read().await;
        let relations = self.relations.read().await;

        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        let seed_lower = seed.to_lowercase();
        frontier.push_back((seed_lower.clone(), 0));
        visited.insert(seed_lower);

        let mut out_entities = Vec::new();
        let mut out_relations = Vec::new();

        while let Some((current, depth)) = frontier.pop_front() {
            if out_entities.len() >= max_nodes {
                break;
            }
            if let Some(entity) = entities.get(&(project_id.to_string(), current.clone())) {
                out_entities.push(entity.clone());
            }
            if depth >= max_depth {
                continue;
            }
            let mut neighbors: Vec<&Relation> = relations
                .values()
                .filter(|r| {
                    r.project_id == project_id
                        && (r.src_name.to_lowercase() == current || r.tgt_name.to_lowercase() == current)
                })
                .collect();
            neighbors.sort_by(|a, b| a.unordered_key().cmp(&b.unordered_key()));
            for relation in neighbors {
                out_relations.push(relation.clone());
                let other = if relation.src_name.to_lowercase() == current {
                    relation.tgt_name.to_lowercase()
                } else {
                    relation.src_name.to_lowercase()
                };
                if visited.insert(other.clone()) {
                    frontier.push_back((other, depth + 1));
                }
            }
        }

        out_entities.truncate(max_nodes);
        Ok(Subgraph { entities: out_entities, relations: out_relations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, ty: &str) -> Entity {
        Entity::new("p1", name, ty)
    }

    #[tokio::test]
    async fn upsert_and_get_entity_roundtrip() {
        let store = InMemoryGraphStore::new();
        store.upsert_entity(entity("Alice", "PERSON")).await.unwrap();
        let fetched = store.get_entity("p1", "alice").await.unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn self_loop_relation_is_rejected() {
        let store = InMemoryGraphStore::new();
        let relation = Relation::new("p1", "Alice", "alice");
        let result = store.upsert_relation(relation).await;
        assert!(matches!(result, Err(CoreError::SelfLoop(_))));
    }

    #[tokio::test]
    async fn duplicate_relation_pair_combines_weight() {
        let store = InMemoryGraphStore::new();
        store.upsert_entity(entity("Alice", "PERSON")).await.unwrap();
        store.upsert_entity(entity("Bob", "PERSON")).await.unwrap();
        let mut r1 = Relation::new("p1", "Alice", "Bob");
        r1.weight = 1.0;
        let mut r2 = Relation::new("p1", "Bob", "Alice");
        r2.weight = 2.0;
        store.upsert_relation(r1).await.unwrap();
        store.upsert_relation(r2).await.unwrap();

        let relations = store.get_relations_for_entity("p1", "alice").await.unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].weight, 3.0);
    }

    #[tokio::test]
    async fn bfs_expands_within_depth_and_node_cap() {
        let store = InMemoryGraphStore::new();
        for name in ["A", "B", "C", "D"] {
            store.upsert_entity(entity(name, "CONCEPT")).await.unwrap();
        }
        store.upsert_relation(Relation::new("p1", "A", "B")).await.unwrap();
        store.upsert_relation(Relation::new("p1", "B", "C")).await.unwrap();
        store.upsert_relation(Relation::new("p1", "C", "D")).await.unwrap();

        let subgraph = store.traverse_bfs("p1", "A", 1, 20).await.unwrap();
        let names: HashSet<String> = subgraph.entities.iter().map(|e| e.name.clone()).collect();
        assert!(names.contains("A"));
        assert!(names.contains("B"));
        assert!(!names.contains("C"));
    }

    #[tokio::test]
    async fn bfs_respects_max_nodes() {
        let store = InMemoryGraphStore::new();
        for name in ["A", "B", "C", "D", "E"] {
            store.upsert_entity(entity(name, "CONCEPT")).await.unwrap();
        }
        store.upsert_relation(Relation::new("p1", "A", "B")).await.unwrap();
        store.upsert_relation(Relation::new("p1", "A", "C")).await.unwrap();
        store.upsert_relation(Relation::new("p1", "A", "D")).await.unwrap();
        store.upsert_relation(Relation::new("p1", "A", "E")).await.unwrap();

        let subgraph = store.traverse_bfs("p1", "A", 2, 2).await.unwrap();
        assert!(subgraph.entities.len() <= 2);
    }

    #[tokio::test]
    async fn delete_by_source_id_removes_only_that_documents_nodes() {
        let store = InMemoryGraphStore::new();
        let mut e1 = entity("Alice", "PERSON");
        e1.document_id = Some("doc1".to_string());
        let mut e2 = entity("Bob", "PERSON");
        e2.document_id = Some("doc2".to_string());
        store.upsert_entity(e1).await.unwrap();
        store.upsert_entity(e2).await.unwrap();

        store.delete_by_source_id("p1", "doc1").await.unwrap();
        assert!(store.get_entity("p1", "alice").await.unwrap().is_none());
        assert!(store.get_entity("p1", "bob").await.unwrap().is_some());
    }
}
