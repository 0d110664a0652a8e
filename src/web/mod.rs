//! Player-facing HTTP surface.
//!
//! Three routes: the eager catalog, the lazy per-link resolver, and health.
//! No response caching headers anywhere; every TTL lives in the cache
//! fabric. The router is built per worker by the supervisor.

pub mod handlers;
pub mod opaque;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::aggregator::Aggregator;
use crate::cache::{CacheFabric, KvStore};
use crate::config::Config;
use crate::cookies::CookieJarService;
use crate::errors::AppError;
use crate::fetch::probe::SeekProber;
use crate::fetch::FetchClient;
use crate::meta::MetaClient;
use crate::providers::hosts::HostRegistry;
use crate::providers::ProviderRegistry;
use crate::resolver::Resolver;
use crate::solver::CfSolver;

/// Everything a worker needs to serve requests. Cheap to clone; all inner
/// services are shared.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Aggregator,
    pub resolver: Arc<Resolver>,
    pub cache: CacheFabric,
    pub fetch: FetchClient,
    pub config: Arc<Config>,
    pub worker_id: usize,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Wire the full service graph over an already-connected store.
    pub fn build(config: Arc<Config>, store: KvStore, worker_id: usize) -> Result<Self, AppError> {
        let cache = CacheFabric::new(store, &config.cache);
        let jars = CookieJarService::new(
            cache.clone(),
            Duration::from_secs(config.cache.cookie_ttl_secs),
        );
        let fetch = FetchClient::new(&config.fetch, jars.clone())
            .map_err(|e| AppError::internal(format!("http client init failed: {e}")))?;
        let solver = CfSolver::new(&config.solver, jars)
            .map_err(|e| AppError::internal(format!("solver client init failed: {e}")))?;
        let prober = SeekProber::new(&config.resolver, &config.fetch.user_agent)
            .map_err(|e| AppError::internal(format!("prober init failed: {e}")))?;

        let hosts = Arc::new(HostRegistry::standard());
        let resolver = Arc::new(Resolver::new(
            fetch.clone(),
            solver.clone(),
            prober,
            hosts,
            &config.resolver,
        ));

        let meta = MetaClient::new(
            fetch.clone(),
            cache.clone(),
            &config.meta,
            Duration::from_secs(config.cache.meta_ttl_secs),
        );
        let aggregator = Aggregator::new(
            Arc::new(ProviderRegistry::standard()),
            cache.clone(),
            meta,
            fetch.clone(),
            solver,
            config.clone(),
        );

        Ok(Self {
            aggregator,
            resolver,
            cache,
            fetch,
            config,
            worker_id,
            started_at: std::time::Instant::now(),
        })
    }
}

/// The worker router. Route patterns use a trailing wildcard for the
/// opaque segment; handlers re-parse the raw URI to keep percent-encoding
/// intact.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/streams/:kind/:id", get(handlers::streams))
        .route("/resolve/:tag/*opaque", get(handlers::resolve))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
