mod cache;
mod config;
mod corpus;
mod eligibility;
mod error;
mod index;
mod model;
mod recommend;
mod search;
mod server;
mod stacking;

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cache::EngineCache;
use config::Config;
use corpus::CorpusStore;
use index::IndexService;
use search::HybridSearchEngine;
use server::IncentiveEngineServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing to stderr (stdout is reserved for MCP JSON-RPC)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting incentive-engine MCP server");

    // 1. Load config from environment
    let config = Config::from_env()?;
    info!(
        corpus_path = %config.corpus_path,
        lancedb_path = %config.lancedb_path,
        redis = config.redis_url.is_some(),
        "configuration loaded"
    );

    // 2. Connect to Redis (optional, graceful degradation if unavailable)
    let redis_cache = match_common::redis::RedisCache::new(config.redis_url.as_deref());
    if redis_cache.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, running without cache");
    }
    let cache = Arc::new(EngineCache::new(redis_cache, config.search_cache_ttl_secs));

    // 3. Configure the embedding provider client
    let embedding_config = match_common::embedding::EmbeddingClientConfig::from_env();
    let embedder = Arc::new(match_common::embedding::EmbeddingClient::new(
        embedding_config,
    )?);
    info!(dimensions = embedder.dimensions(), "embedding client ready");

    // 4. Connect to LanceDB
    let vectordb = Arc::new(match_common::vectordb::VectorDb::connect(&config.lancedb_path).await?);
    info!("lancedb connected");

    // 5. Load the corpus and re-index if its content changed
    let (snapshot, skipped) = corpus::load_corpus(&config.corpus_path)?;
    info!(
        programs = snapshot.len(),
        skipped,
        version = %snapshot.version,
        "corpus loaded"
    );

    let index_service = Arc::new(IndexService::new(
        Arc::clone(&embedder),
        Arc::clone(&vectordb),
        Arc::clone(&cache),
    ));
    if index_service.needs_update(&snapshot).await {
        info!("indexing programs (first run or corpus changed)");
        match index_service.reindex(&snapshot).await {
            Ok(report) => info!(
                indexed = report.indexed,
                dropped = report.dropped,
                reused = report.reused,
                "indexing complete"
            ),
            // A stale-but-present index still serves searches; only a missing
            // table is fatal at startup.
            Err(e) if index_service.table_exists().await => {
                warn!(error = %e, "re-index failed, serving from the existing stale index");
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        info!("index up to date");
    }
    let corpus_store = Arc::new(CorpusStore::new(snapshot));

    // 6. Build MCP server and serve on stdio
    let search_engine = Arc::new(HybridSearchEngine::new(
        Arc::clone(&embedder),
        Arc::clone(&vectordb),
        Arc::clone(&cache),
    ));
    let server = IncentiveEngineServer::new(corpus_store, search_engine, index_service, config);

    info!("MCP server ready, serving on stdio");
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!(error = %e, "MCP server error");
    })?;

    service.waiting().await?;
    info!("MCP server shut down");
    Ok(())
}
