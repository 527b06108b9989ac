//! Thin demonstration server. The HTTP surface itself is a replaceable
//! outer layer; this binary exists to exercise
//! [`kg_rag_engine::Orchestrator`] end to end behind a minimal API router.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kg_rag_engine::cache::InMemoryExtractionCache;
use kg_rag_engine::graph_store::Neo4jGraphStore;
use kg_rag_engine::llm::RigLlmClient;
use kg_rag_engine::vector_store::Neo4jVectorStore;
use kg_rag_engine::{EngineConfig, Orchestrator, QueryMode};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[derive(Deserialize)]
struct IngestRequest {
    project_id: String,
    document_id: String,
    text: String,
}

#[derive(Deserialize)]
struct QueryRequest {
    project_id: String,
    query: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn parse_mode(mode: Option<&str>) -> QueryMode {
    match mode.unwrap_or("hybrid").to_lowercase().as_str() {
        "naive" => QueryMode::Naive,
        "local" => QueryMode::Local,
        "global" => QueryMode::Global,
        "hybrid" => QueryMode::Hybrid,
        "mix" => QueryMode::Mix,
        "bypass" => QueryMode::Bypass,
        _ => QueryMode::Hybrid,
    }
}

async fn ingest(State(state): State<AppState>, Json(req): Json<IngestRequest>) -> Json<serde_json::Value> {
    match state.orchestrator.ingest_document(&req.project_id, &req.document_id, &req.text).await {
        Ok((summary, tokens)) => Json(serde_json::json!({ "summary": summary, "tokens": tokens })),
        Err(e) => Json(serde_json::json!(ErrorResponse { error: e.to_string() })),
    }
}

async fn query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Json<serde_json::Value> {
    let mode = parse_mode(req.mode.as_deref());
    let (result, tokens) = state.orchestrator.query(&req.project_id, &req.query, mode).await;
    Json(serde_json::json!({ "result": result, "tokens": tokens }))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = EngineConfig::from_env().expect("failed to load configuration");

    let graph_store = Neo4jGraphStore::connect(&cfg).await.expect("failed to connect to Neo4j");
    graph_store.ensure_schema().await.expect("failed to ensure Neo4j schema");
    let vector_store = Neo4jVectorStore::new(graph_store.clone());
    vector_store.ensure_indexes().await.expect("failed to ensure Neo4j vector indexes");

    let llm = RigLlmClient::from_config(&cfg).expect("failed to initialize LLM client");
    let llm = Arc::new(llm);

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        Arc::new(graph_store),
        Arc::new(vector_store),
        Arc::new(InMemoryExtractionCache::new()),
        llm.clone(),
        llm,
        None,
    );

    let state = AppState { orchestrator: Arc::new(orchestrator) };

    let app = Router::new()
        .route("/ingest", post(ingest))
        .route("/query", post(query))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = tokio::net::TcpListener::bind(&cfg.server_addr).await.unwrap();
    info!("listening on {}", &cfg.server_addr);
    axum::serve(listener, app).await.unwrap();
}
