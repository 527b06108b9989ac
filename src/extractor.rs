//! Extractor: drives the LLM over a chunk with a gleaning loop,
//! parses the tuple-delimited output format, normalizes entity names, and
//! filters self-loops. Cache-first: a hit short-circuits the LLM entirely.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{content_hash, ExtractionCache};
use crate::config::{EngineConfig, GleaningConfig};
use crate::llm::Llm;
use crate::models::{CacheType, Chunk, Entity, ExtractionCacheEntry, Relation};
use crate::retry::retry_with_backoff;
use crate::similarity::normalize_name;
use crate::token_tracker::TokenTracker;

pub(crate) const RECORD_SEP: &str = "\u{E000}";
pub(crate) const FIELD_SEP: &str = "\u{E001}";
const EXTRACTION_PROMPT_VERSION: &str = "v1";

pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub malformed_record_count: u32,
}

pub struct Extractor {
    llm: Arc<dyn Llm>,
    cache: Arc<dyn ExtractionCache>,
    gleaning: GleaningConfig,
    entity_name_max_length: usize,
}

impl Extractor {
    pub fn new(llm: Arc<dyn Llm>, cache: Arc<dyn ExtractionCache>, cfg: &EngineConfig) -> Self {
        Self {
            llm,
            cache,
            gleaning: cfg.gleaning.clone(),
            entity_name_max_length: cfg.entity_name_max_length,
        }
    }

    pub async fn extract(&self, project_id: &str, chunk: &Chunk, tracker: &TokenTracker) -> ExtractionResult {
        let hash = content_hash(&chunk.content, EXTRACTION_PROMPT_VERSION);

        if let Ok(Some(hit)) = self.cache.get(project_id, CacheType::EntityExtraction, &hash).await {
            return self.finalize(project_id, chunk, &hit.result);
        }

        let prompt = extraction_prompt(&chunk.content);
        let raw = self.call_llm(&prompt, "extraction", tracker).await;
        self.store_pass(project_id, chunk, &hash, CacheType::EntityExtraction, &raw).await;

        let mut combined = raw;
        if self.gleaning.enabled {
            combined = self.gleaning_loop(project_id, chunk, combined, tracker).await;
        }

        self.finalize(project_id, chunk, &combined)
    }

    async fn gleaning_loop(&self, project_id: &str, chunk: &Chunk, mut combined: String, tracker: &TokenTracker) -> String {
        let mut seen_entity_names: HashSet<String> = parse_tuple_records(&combined)
            .0
            .into_iter()
            .map(|e| e.name.to_lowercase())
            .collect();
        let mut seen_relation_pairs: HashSet<(String, String)> = parse_tuple_records(&combined)
            .1
            .into_iter()
            .map(|r| unordered_pair(&r.0, &r.1))
            .collect();

        for pass in 0..self.gleaning.max_passes {
            let prompt = gleaning_prompt(&combined);
            let raw = self.call_llm(&prompt, "gleaning", tracker).await;
            let pass_hash = content_hash(&format!("{}::{pass}", chunk.content), EXTRACTION_PROMPT_VERSION);
            self.store_pass(project_id, chunk, &pass_hash, CacheType::Gleaning, &raw).await;

            let (new_entities, new_relations, _) = parse_tuple_records_full(&raw);
            let mut novel_count = 0;
            for entity in &new_entities {
                if seen_entity_names.insert(entity.name.to_lowercase()) {
                    novel_count += 1;
                }
            }
            for relation in &new_relations {
                if seen_relation_pairs.insert(unordered_pair(&relation.0, &relation.1)) {
                    novel_count += 1;
                }
            }

            if novel_count == 0 {
                break;
            }
            combined.push_str(&raw);
        }

        combined
    }

    async fn call_llm(&self, prompt: &str, operation_type: &str, tracker: &TokenTracker) -> String {
        let llm = &self.llm;
        retry_with_backoff(
            || async { llm.complete(Some(EXTRACTION_SYSTEM_PROMPT), prompt, operation_type, tracker).await },
            |_| true,
        )
        .await
        .unwrap_or_default()
    }

    async fn store_pass(&self, project_id: &str, chunk: &Chunk, hash: &str, cache_type: CacheType, raw: &str) {
        let entry = ExtractionCacheEntry {
            id: String::new(),
            project_id: project_id.to_string(),
            cache_type,
            chunk_id: Some(chunk.id.clone()),
            content_hash: hash.to_string(),
            result: raw.to_string(),
            tokens_used: 0,
            created_at: chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap(),
        };
        let _ = self.cache.store(entry).await;
    }

    fn finalize(&self, project_id: &str, chunk: &Chunk, raw: &str) -> ExtractionResult {
        parse_cached_extraction(project_id, &chunk.id, raw, self.entity_name_max_length)
    }
}

/// Re-derives entities and relations from a previously cached raw
/// extraction result, without touching the LLM. Shared by [`Extractor`]
/// and by deletion-rebuild, which re-parses cached
/// `ENTITY_EXTRACTION` entries for chunks that survive a document delete.
pub fn parse_cached_extraction(project_id: &str, chunk_id: &str, raw: &str, entity_name_max_length: usize) -> ExtractionResult {
    let (raw_entities, raw_relations, malformed) = parse_tuple_records_full(raw);

    let mut entities = Vec::new();
    let mut seen_names = HashSet::new();
    for raw_entity in raw_entities {
        let name = normalize_name(&raw_entity.name, entity_name_max_length);
        if name.is_empty() || !seen_names.insert(name.to_lowercase()) {
            continue;
        }
        let mut entity = Entity::new(project_id, name, raw_entity.entity_type);
        entity.description = raw_entity.description;
        entity.push_source_chunk(chunk_id.to_string(), crate::models::DEFAULT_SOURCE_CHUNK_CAP);
        entities.push(entity);
    }

    let mut relations = Vec::new();
    let mut seen_pairs = HashSet::new();
    for raw_relation in raw_relations {
        let src = normalize_name(&raw_relation.0, entity_name_max_length);
        let tgt = normalize_name(&raw_relation.1, entity_name_max_length);
        if src.is_empty() || tgt.is_empty() {
            continue;
        }
        let mut relation = Relation::new(project_id, src, tgt);
        if relation.is_self_loop() {
            continue;
        }
        if !seen_pairs.insert(relation.unordered_key()) {
            continue;
        }
        relation.keywords = raw_relation.2;
        relation.description = raw_relation.3;
        relation.push_source_chunk(chunk_id.to_string(), crate::models::DEFAULT_SOURCE_CHUNK_CAP);
        relations.push(relation);
    }

    ExtractionResult { entities, relations, malformed_record_count: malformed }
}

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract entities and relations from text into a strict tuple-delimited format.";

fn extraction_prompt(content: &str) -> String {
    format!(
        "Extract all entities and relations from the text below.\n\
         Format each record as:\n\
         entity{FIELD_SEP}name{FIELD_SEP}type{FIELD_SEP}description{RECORD_SEP}\n\
         relation{FIELD_SEP}srcName{FIELD_SEP}tgtName{FIELD_SEP}keywords{FIELD_SEP}description{RECORD_SEP}\n\n\
         Text:\n{content}"
    )
}

fn gleaning_prompt(previous_output: &str) -> String {
    format!(
        "Many entities and relations were missed. Add them below, using the same tuple-delimited format.\n\
         Previous output:\n{previous_output}"
    )
}

struct RawEntity {
    name: String,
    entity_type: String,
    description: String,
}

/// `(srcName, tgtName, keywords, description)`.
type RawRelation = (String, String, String, String);

fn unordered_pair(a: &str, b: &str) -> (String, String) {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn parse_tuple_records(raw: &str) -> (Vec<RawEntity>, Vec<RawRelation>) {
    let (entities, relations, _) = parse_tuple_records_full(raw);
    (entities, relations)
}

/// Tolerant parser: skips malformed records and counts them
/// instead of failing the whole batch. Tolerates a missing trailing
/// record separator and stray whitespace around fields.
fn parse_tuple_records_full(raw: &str) -> (Vec<RawEntity>, Vec<RawRelation>, u32) {
    let mut entities = Vec::new();
    let mut relations = Vec::new();
    let mut malformed = 0u32;

    for record in raw.split(RECORD_SEP) {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.split(FIELD_SEP).map(|f| f.trim()).collect();
        match fields.first().copied() {
            Some("entity") if fields.len() >= 4 => {
                entities.push(RawEntity {
                    name: fields[1].to_string(),
                    entity_type: fields[2].to_string(),
                    description: fields[3].to_string(),
                });
            }
            Some("relation") if fields.len() >= 5 => {
                relations.push((fields[1].to_string(), fields[2].to_string(), fields[3].to_string(), fields[4].to_string()));
            }
            _ => malformed += 1,
        }
    }

    (entities, relations, malformed)
}
