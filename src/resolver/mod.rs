//! Link-chain resolver.
//!
//! Walks a wrapped opaque URL through shortener → intermediary → host page
//! → CDN until one candidate passes the seekability gate. The walk is an
//! explicit state machine: every transition is a value, every failure is a
//! value, and partial failures inside a candidate list are swallowed; only
//! exhaustion is fatal.

pub mod intermediary;
pub mod payload;
pub mod shortlink;

use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::errors::ResolveError;
use crate::fetch::probe::{ProbeOptions, SeekProbe, SeekProber};
use crate::fetch::FetchClient;
use crate::models::{FinalStream, ResolutionTag, ResolveHints};
use crate::providers::hosts::HostRegistry;
use crate::providers::ProviderContext;
use crate::solver::CfSolver;
use crate::utils;

/// A candidate somewhere along the chain.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: String,
    pub label: String,
    pub priority: i32,
    pub resolution: Option<ResolutionTag>,
}

impl Candidate {
    pub fn new(url: String, label: String, priority: i32) -> Self {
        let resolution = match ResolutionTag::from_label(&label) {
            ResolutionTag::Unknown => None,
            tag => Some(tag),
        };
        Self {
            url,
            label,
            priority,
            resolution,
        }
    }
}

/// What the classifier decides about an input URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputClass {
    Shortener,
    Intermediary,
    HostPage,
    OpaqueCdn,
}

/// Machine states. Terminal outcomes leave the loop via return.
enum Step {
    Classify(String),
    Short(String),
    Intermediary(String),
    HostPage(String, i32),
    Select(Vec<Candidate>),
    ProbeBatch(Vec<Candidate>),
}

pub struct Resolver {
    pub(crate) fetch: FetchClient,
    pub(crate) solver: CfSolver,
    pub(crate) prober: SeekProber,
    pub(crate) hosts: Arc<HostRegistry>,
    pub(crate) config: ResolverConfig,
}

impl Resolver {
    pub fn new(
        fetch: FetchClient,
        solver: CfSolver,
        prober: SeekProber,
        hosts: Arc<HostRegistry>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            fetch,
            solver,
            prober,
            hosts,
            config: config.clone(),
        }
    }

    pub(crate) fn page_ctx(&self, cancel: CancellationToken) -> ProviderContext {
        ProviderContext {
            fetch: self.fetch.clone(),
            solver: self.solver.clone(),
            cancel,
            solver_first: false,
            origin: "resolver".to_string(),
        }
    }

    /// Resolve to a seekable direct URL; `None` is the only failure surface.
    pub async fn resolve(
        &self,
        url: &str,
        hints: &ResolveHints,
        cancel: CancellationToken,
    ) -> Option<FinalStream> {
        match self.run(url, hints, cancel).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                info!(url, error = %e, "resolution failed");
                None
            }
        }
    }

    async fn run(
        &self,
        input: &str,
        hints: &ResolveHints,
        cancel: CancellationToken,
    ) -> Result<FinalStream, ResolveError> {
        let mut step = Step::Classify(input.to_string());
        // Loop detector over (method, url, body) triples, shared with the
        // short-link form dance.
        let mut visited: HashSet<String> = HashSet::new();
        let mut hops = 0usize;
        // Candidates set aside while a better one is explored deeper.
        let mut fallback: Vec<Candidate> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ResolveError::HopsExhausted { hops });
            }
            if hops > self.config.max_hops {
                return Err(ResolveError::HopsExhausted { hops });
            }

            step = match step {
                Step::Classify(url) => {
                    if !visited.insert(format!("GET {url}")) {
                        return Err(ResolveError::LoopDetected { url });
                    }
                    match self.classify_input(&url) {
                        InputClass::Shortener => Step::Short(url),
                        InputClass::Intermediary => Step::Intermediary(url),
                        InputClass::HostPage => Step::HostPage(url, 0),
                        InputClass::OpaqueCdn => {
                            Step::ProbeBatch(vec![Candidate::new(url, String::new(), 0)])
                        }
                    }
                }

                Step::Short(url) => {
                    hops += 1;
                    let destination = shortlink::resolve_short(
                        self,
                        &url,
                        hints,
                        cancel.clone(),
                        &mut visited,
                    )
                    .await?;
                    debug!(from = %url, to = %destination, "short link resolved");
                    Step::Classify(destination)
                }

                Step::Intermediary(url) => {
                    hops += 1;
                    let candidates = intermediary::resolve_intermediary(
                        self,
                        &url,
                        hints,
                        cancel.clone(),
                    )
                    .await?;
                    Step::Select(candidates)
                }

                Step::HostPage(url, priority) => {
                    hops += 1;
                    match self.extract_host(&url, priority, cancel.clone()).await {
                        Ok(candidates) if !candidates.is_empty() => Step::Select(candidates),
                        Ok(_) | Err(_) if !fallback.is_empty() => {
                            debug!(url = %url, "host extraction empty, trying fallback candidates");
                            Step::Select(std::mem::take(&mut fallback))
                        }
                        Ok(_) => {
                            return Err(ResolveError::CandidatesExhausted { count: 0 });
                        }
                        Err(e) => {
                            warn!(url = %url, error = %e, "host extraction failed");
                            return Err(e);
                        }
                    }
                }

                Step::Select(mut candidates) => {
                    // googleusercontent never survives selection, probe or not.
                    candidates.retain(|c| !is_blocked_host(&c.url));
                    dedupe_by_url(&mut candidates);
                    if candidates.is_empty() {
                        if fallback.is_empty() {
                            return Err(ResolveError::CandidatesExhausted { count: 0 });
                        }
                        candidates = std::mem::take(&mut fallback);
                    }

                    rank_candidates(&mut candidates, hints);

                    // A candidate behind a known host extractor goes one
                    // level deeper; the rest wait as fallback.
                    if self.hosts.for_url(&candidates[0].url).is_some() {
                        let best = candidates.remove(0);
                        fallback.extend(candidates);
                        Step::HostPage(best.url, best.priority)
                    } else {
                        Step::ProbeBatch(candidates)
                    }
                }

                Step::ProbeBatch(candidates) => {
                    match self.probe_batch(&candidates, cancel.clone()).await {
                        Some(stream) => return Ok(stream),
                        None if !fallback.is_empty() => {
                            Step::Select(std::mem::take(&mut fallback))
                        }
                        None => {
                            return Err(ResolveError::CandidatesExhausted {
                                count: candidates.len(),
                            });
                        }
                    }
                }
            };
        }
    }

    fn classify_input(&self, url: &str) -> InputClass {
        let host = utils::domain_of(url).unwrap_or_default();

        if self
            .config
            .shortener_hosts
            .iter()
            .any(|s| utils::host_matches(&host, s))
        {
            return InputClass::Shortener;
        }

        // Host pages beat the intermediary patterns: a gdflix file page has
        // its own extractor even though "gdflix" is an intermediary pattern.
        if self.hosts.for_url(url).is_some() {
            return InputClass::HostPage;
        }

        if self
            .config
            .intermediary_hosts
            .iter()
            .any(|s| host.contains(s.as_str()))
        {
            return InputClass::Intermediary;
        }

        InputClass::OpaqueCdn
    }

    async fn extract_host(
        &self,
        url: &str,
        priority: i32,
        cancel: CancellationToken,
    ) -> Result<Vec<Candidate>, ResolveError> {
        let Some(extractor) = self.hosts.for_url(url) else {
            return Ok(vec![Candidate::new(url.to_string(), String::new(), priority)]);
        };

        let ctx = self.page_ctx(cancel);
        let links = extractor
            .extract(url, priority, &ctx)
            .await
            .map_err(|e| match e {
                crate::errors::ProviderError::Fetch(f) => ResolveError::Fetch(f),
                crate::errors::ProviderError::Solver(s) => ResolveError::Solver(s),
                other => {
                    debug!(url, error = %other, "extractor parse failure");
                    ResolveError::CandidatesExhausted { count: 0 }
                }
            })?;

        let mut candidates: Vec<Candidate> = links
            .into_iter()
            .map(|link| Candidate::new(link.url, link.label, link.priority))
            .collect();
        // ranked by priority, deduplicated by URL
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        dedupe_by_url(&mut candidates);
        Ok(candidates)
    }

    /// Probe candidates in small parallel batches; the first seekable in
    /// candidate order wins.
    async fn probe_batch(
        &self,
        candidates: &[Candidate],
        cancel: CancellationToken,
    ) -> Option<FinalStream> {
        let opts = ProbeOptions {
            require_partial_content: true,
            timeout: std::time::Duration::from_secs(self.config.probe_timeout_secs),
            cancel,
        };

        // The blocked-host rule applies here too: a candidate that arrived
        // via the direct-CDN path never reached selection.
        let candidates: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !is_blocked_host(&c.url))
            .collect();

        for chunk in candidates.chunks(self.config.probe_batch.max(1)) {
            let probes = futures::future::join_all(
                chunk.iter().map(|candidate| self.prober.probe(&candidate.url, &opts)),
            )
            .await;

            for (candidate, probe) in chunk.iter().zip(probes) {
                match probe {
                    SeekProbe::Seekable {
                        filename,
                        content_length,
                        trusted,
                    } => {
                        debug!(url = %candidate.url, trusted, "candidate passed seek gate");
                        return Some(FinalStream {
                            direct_url: candidate.url.clone(),
                            seekable: true,
                            filename,
                            content_length,
                        });
                    }
                    SeekProbe::NonVideo { filename } => {
                        debug!(url = %candidate.url, ?filename, "candidate rejected: non-video");
                    }
                    SeekProbe::Unseekable { .. } => {
                        debug!(url = %candidate.url, "candidate rejected: no range support");
                    }
                    SeekProbe::Invalid { status } => {
                        debug!(url = %candidate.url, ?status, "candidate rejected: invalid probe");
                    }
                }
            }
        }
        None
    }
}

pub(crate) fn is_blocked_host(url: &str) -> bool {
    utils::domain_of(url)
        .map(|host| utils::host_matches(&host, "googleusercontent.com"))
        .unwrap_or(false)
}

pub(crate) fn dedupe_by_url(candidates: &mut Vec<Candidate>) {
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.url.clone()));
}

/// Selection order: host-hint match, then advertised priority, then
/// resolution match, then the incoming stable order.
pub(crate) fn rank_candidates(candidates: &mut [Candidate], hints: &ResolveHints) {
    candidates.sort_by(|a, b| {
        let a_host = host_hint_match(a, hints);
        let b_host = host_hint_match(b, hints);
        b_host
            .cmp(&a_host)
            .then(b.priority.cmp(&a.priority))
            .then(resolution_match(b, hints).cmp(&resolution_match(a, hints)))
    });
}

fn host_hint_match(candidate: &Candidate, hints: &ResolveHints) -> bool {
    match &hints.host {
        Some(host) => utils::domain_of(&candidate.url)
            .map(|domain| domain.contains(host.as_str()))
            .unwrap_or(false),
        None => false,
    }
}

fn resolution_match(candidate: &Candidate, hints: &ResolveHints) -> bool {
    match (hints.resolution, candidate.resolution) {
        (Some(wanted), Some(got)) => wanted == got,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheFabric, KvStore};
    use crate::config::{CacheConfig, DatabaseConfig, FetchConfig, SolverConfig};
    use crate::cookies::CookieJarService;

    async fn resolver() -> Resolver {
        let store = KvStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .unwrap();
        let fabric = CacheFabric::new(store, &CacheConfig::default());
        let jars = CookieJarService::new(fabric, std::time::Duration::from_secs(1500));
        let fetch = FetchClient::new(&FetchConfig::default(), jars.clone()).unwrap();
        let solver = CfSolver::new(&SolverConfig::default(), jars).unwrap();
        let config = ResolverConfig::default();
        let prober = SeekProber::new(&config, "test-agent").unwrap();
        Resolver::new(fetch, solver, prober, Arc::new(HostRegistry::standard()), &config)
    }

    #[tokio::test]
    async fn input_classification() {
        let resolver = resolver().await;
        assert_eq!(
            resolver.classify_input("https://ouo.io/abc"),
            InputClass::Shortener
        );
        assert_eq!(
            resolver.classify_input("https://hubcloud.art/drive/x"),
            InputClass::Intermediary
        );
        // gdflix has an extractor, so the host page wins over the
        // intermediary pattern
        assert_eq!(
            resolver.classify_input("https://new.gdflix.dad/file/x"),
            InputClass::HostPage
        );
        assert_eq!(
            resolver.classify_input("https://cdn.example.workers.dev/f.mkv"),
            InputClass::OpaqueCdn
        );
    }

    #[test]
    fn blocked_hosts() {
        assert!(is_blocked_host(
            "https://lh3.googleusercontent.com/file"
        ));
        assert!(!is_blocked_host("https://example.com/googleusercontent"));
    }

    #[test]
    fn ranking_prefers_hint_then_priority_then_resolution() {
        let hints = ResolveHints {
            episode: None,
            resolution: Some(ResolutionTag::P1080),
            host: Some("pixeldrain".to_string()),
        };
        let mut candidates = vec![
            Candidate::new("https://gofile.io/d/a".into(), "2160p".into(), 50),
            Candidate::new("https://pixeldrain.com/u/b".into(), "720p".into(), 1),
            Candidate::new("https://dl.example/c".into(), "1080p".into(), 5),
            Candidate::new("https://dl.example/d".into(), "1080p x265".into(), 5),
        ];
        rank_candidates(&mut candidates, &hints);

        // host hint wins despite lowest priority
        assert_eq!(candidates[0].url, "https://pixeldrain.com/u/b");
        // then priority
        assert_eq!(candidates[1].url, "https://gofile.io/d/a");
        // stable order among equals
        assert_eq!(candidates[2].url, "https://dl.example/c");
        assert_eq!(candidates[3].url, "https://dl.example/d");
    }

    #[tokio::test]
    async fn trusted_cdn_resolves_without_io() {
        let resolver = resolver().await;
        let stream = resolver
            .resolve(
                "https://pub-abc.r2.dev/Movie.2024.mkv",
                &ResolveHints::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(stream.seekable);
        assert_eq!(stream.direct_url, "https://pub-abc.r2.dev/Movie.2024.mkv");
    }

    #[tokio::test]
    async fn googleusercontent_is_unconditionally_rejected() {
        let resolver = resolver().await;
        let result = resolver
            .resolve(
                "https://lh3.googleusercontent.com/big-video",
                &ResolveHints::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn archive_on_trusted_host_is_rejected() {
        let resolver = resolver().await;
        let result = resolver
            .resolve(
                "https://pub-abc.r2.dev/bundle.zip",
                &ResolveHints::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_none());
    }
}
