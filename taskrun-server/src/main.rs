use std::sync::Arc;

use taskrun_core::config::EngineConfig;
use taskrun_core::engine::TaskEngine;
use taskrun_core::gateway::HttpModuleGateway;
use taskrun_core::store::{MemoryTaskRegistry, RunStore};
use taskrun_core::store_memory::MemoryRunStore;
use taskrun_server::routes::create_router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = EngineConfig::from_env();
    let database_url = parse_database_url();

    let store: Arc<dyn RunStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = taskrun_core::store_postgres::PostgresRunStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresRunStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryRunStore"
            );
            Arc::new(MemoryRunStore::new())
        }
        None => {
            tracing::info!("Using MemoryRunStore (no database URL configured)");
            Arc::new(MemoryRunStore::new())
        }
    };

    let registry = Arc::new(MemoryTaskRegistry::new());
    let gateway = Arc::new(HttpModuleGateway::new(config.module_endpoints.clone()));
    let engine = Arc::new(TaskEngine::new(store, registry, gateway, config));

    let workers = engine.spawn_workers();
    tracing::info!(workers = workers.len(), "dispatcher workers running");

    let app = create_router(engine)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    tracing::info!("taskrun server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL` env var.
fn parse_database_url() -> Option<String> {
    // CLI arg takes precedence
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    // Fall back to env var
    std::env::var("DATABASE_URL").ok()
}
