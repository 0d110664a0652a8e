//! Aggregation scheduler.
//!
//! One request fans out to every enabled provider with an independent
//! budget. Provider results are cached single-flight per media key; any
//! provider's failure is invisible to the client, and the whole fan-out is
//! abandoned promptly when the requester disconnects.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheFabric, ComputeOptions, NS_STREAMS};
use crate::config::Config;
use crate::fetch::FetchClient;
use crate::meta::MetaClient;
use crate::models::{MediaKey, Metadata, PreviewStream, ProviderLink, ResolutionTag, ResolveHints};
use crate::providers::{Provider, ProviderContext, ProviderRegistry};
use crate::solver::CfSolver;
use crate::web::opaque;

#[derive(Clone)]
pub struct Aggregator {
    registry: Arc<ProviderRegistry>,
    cache: CacheFabric,
    meta: MetaClient,
    fetch: FetchClient,
    solver: CfSolver,
    config: Arc<Config>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: CacheFabric,
        meta: MetaClient,
        fetch: FetchClient,
        solver: CfSolver,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            cache,
            meta,
            fetch,
            solver,
            config,
        }
    }

    /// Fan out to every enabled provider and return the flattened preview
    /// catalog. Never fails: the worst outcome is an empty list.
    pub async fn aggregate(&self, key: &MediaKey, cancel: CancellationToken) -> Vec<PreviewStream> {
        let enabled: Vec<_> = self
            .config
            .providers
            .iter()
            .filter(|p| p.enabled)
            .filter_map(|p| self.registry.get(&p.id).map(|provider| (p.clone(), provider)))
            .collect();
        if enabled.is_empty() {
            debug!("no providers enabled, skipping aggregation");
            return Vec::new();
        }

        let deadline = Duration::from_secs(self.config.aggregator.deadline_secs);
        let started = tokio::time::Instant::now();

        // Metadata first, bounded by its own slice of the deadline so a slow
        // MetaService cannot starve the providers.
        let meta_budget = deadline.mul_f64(self.config.aggregator.meta_deadline_fraction);
        let metadata = match tokio::time::timeout(
            meta_budget,
            self.meta.get(key, cancel.child_token()),
        )
        .await
        {
            Ok(Ok(Some(metadata))) => metadata,
            Ok(Ok(None)) => {
                debug!(id = %key.external_id, "metadata unknown, nothing to search for");
                return Vec::new();
            }
            Ok(Err(e)) => {
                warn!(id = %key.external_id, error = %e, "metadata lookup failed");
                return Vec::new();
            }
            Err(_) => {
                warn!(id = %key.external_id, "metadata lookup exceeded its budget");
                return Vec::new();
            }
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        let ceiling = Duration::from_secs(self.config.aggregator.provider_ceiling_secs);

        let mut handles = Vec::with_capacity(enabled.len());
        for (provider_config, provider) in enabled {
            let budget = ceiling.min(remaining);
            let ttl = self.config.streams_ttl(&provider_config.id);
            let cache = self.cache.clone();
            let cache_key = key.cache_key(&provider_config.id);
            let ctx = ProviderContext {
                fetch: self.fetch.clone(),
                solver: self.solver.clone(),
                cancel: cancel.child_token(),
                solver_first: provider_config.solver_first,
                origin: provider_config.id.clone(),
            };
            let key = key.clone();
            let metadata = metadata.clone();
            let prefer_fresh = provider_config.prefer_fresh;
            let provider_id = provider_config.id.clone();

            handles.push(tokio::spawn(async move {
                let links: Result<Option<Vec<ProviderLink>>, _> = cache
                    .get_or_compute(
                        NS_STREAMS,
                        &cache_key,
                        ttl,
                        ComputeOptions {
                            prefer_fresh,
                            negative_ttl: None,
                        },
                        move || run_provider_task(provider, key, metadata, ctx, budget),
                    )
                    .await;
                (provider_id, links)
            }));
        }

        let mut streams: Vec<PreviewStream> = Vec::new();
        let mut seen_urls = std::collections::HashSet::new();

        // Results are collected in config order, not completion order.
        for handle in handles {
            let (provider_id, links) = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "provider task panicked");
                    continue;
                }
            };
            let links = match links {
                Ok(Some(links)) => links,
                Ok(None) => {
                    debug!(provider = %provider_id, "provider produced no links");
                    continue;
                }
                Err(e) => {
                    // Absorbed: one provider's failure never fails the whole.
                    warn!(provider = %provider_id, error = %e, "provider task failed");
                    continue;
                }
            };

            for link in links {
                if !seen_urls.insert(link.url.clone()) {
                    continue;
                }
                streams.push(self.preview_from(&provider_id, key, link));
            }
        }

        streams
    }

    fn preview_from(&self, provider_id: &str, key: &MediaKey, link: ProviderLink) -> PreviewStream {
        let resolution = link.resolution.unwrap_or(ResolutionTag::Unknown);
        let hints = ResolveHints {
            episode: key.episode_tag(),
            resolution: (resolution != ResolutionTag::Unknown).then_some(resolution),
            host: link.host_hint.clone(),
        };
        let opaque_url = opaque::wrap(
            &self.config.web.base_url,
            provider_id,
            &link.url,
            &hints,
        );

        PreviewStream {
            provider: provider_id.to_string(),
            opaque_url,
            display_label: link.label,
            resolution,
            size_bytes: link.size_bytes,
            languages: link.languages,
            // Wrapped links always re-enter the resolver on click.
            needs_resolution: true,
            hints: hints.to_fragment(),
        }
    }
}

/// Producer body for one provider task: the provider's whole discovery run
/// under its budget. Timeouts and errors become producer errors (not
/// cached); an empty catalog is a legitimate cached negative.
async fn run_provider_task(
    provider: Arc<dyn Provider>,
    key: MediaKey,
    metadata: Metadata,
    ctx: ProviderContext,
    budget: Duration,
) -> Result<Option<Vec<ProviderLink>>, String> {
    let provider_id = provider.id();
    let started = std::time::Instant::now();

    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            // Cancellation is quiet by design.
            return Err("canceled".to_string());
        }
        result = tokio::time::timeout(budget, provider.fetch_streams(&key, &metadata, &ctx)) => result,
    };

    match outcome {
        Err(_) => Err(format!(
            "timed out after {}ms",
            budget.as_millis()
        )),
        Ok(Err(e)) if e.is_cancellation() => Err("canceled".to_string()),
        Ok(Err(e)) => Err(e.to_string()),
        Ok(Ok(links)) => {
            debug!(
                provider = provider_id,
                count = links.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "provider discovery finished"
            );
            if links.is_empty() {
                Ok(None)
            } else {
                Ok(Some(links))
            }
        }
    }
}
