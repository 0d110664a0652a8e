//! Provider adapters and their registries.
//!
//! Every provider presents the same shape (`search` / `load` /
//! `fetch_streams`) so the scheduler and resolver can treat them uniformly;
//! host extractors do the same for terminal file hosts. Adapters are
//! stateless aside from module-level caches they may own, and all of their
//! failures are values absorbed by the caller.

pub mod hosts;

pub mod fourkhdhub;
pub mod moviesdrive;
pub mod uhdmovies;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{FetchError, ProviderError};
use crate::fetch::FetchClient;
use crate::models::{LoadedPage, MediaKey, Metadata, ProviderLink, ResolutionTag, SearchResult};
use crate::solver::{CfSolver, SolveOptions};
use crate::utils;

/// Capability bundle handed to a provider for one request.
///
/// Carries the request-scoped cancellation token; every HTTP call a
/// provider makes inherits it.
#[derive(Clone)]
pub struct ProviderContext {
    pub fetch: FetchClient,
    pub solver: CfSolver,
    pub cancel: CancellationToken,
    /// Route fetches through the solver unconditionally
    pub solver_first: bool,
    /// Provider (or "resolver") this context is acting for, for logs
    pub origin: String,
}

/// A fetched page body, whichever path produced it.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub body: String,
    pub final_url: String,
    pub status: u16,
    pub via_solver: bool,
}

impl ProviderContext {
    /// Fetch a page, escalating to the solver only after a challenge
    /// signature (or immediately for solver-first providers).
    pub async fn fetch_page(&self, url: &str) -> Result<PageContent, ProviderError> {
        if self.solver_first && self.solver.enabled() {
            return self.solve_page(url, None).await;
        }

        let response = self.fetch.get(url, self.cancel.clone()).await?;
        if response.is_challenge() {
            debug!(origin = %self.origin, url, status = response.status, "challenge observed");
            // Whatever clearance we sent no longer works.
            if let Some(host) = utils::domain_of(url) {
                self.fetch.jars().invalidate(&host).await;
            }
            if self.solver.enabled() {
                return self.solve_page(url, None).await;
            }
            return Err(ProviderError::Challenge {
                provider: self.origin.clone(),
            });
        }

        if !(200..400).contains(&response.status) {
            return Err(ProviderError::Fetch(FetchError::HttpStatus {
                code: response.status,
                url: url.to_string(),
            }));
        }

        Ok(PageContent {
            body: response.text(),
            final_url: response.final_url,
            status: response.status,
            via_solver: false,
        })
    }

    /// Fetch through the solver, optionally as a form POST.
    pub async fn solve_page(
        &self,
        url: &str,
        post_data: Option<String>,
    ) -> Result<PageContent, ProviderError> {
        let solution = self
            .solver
            .solve(
                url,
                &SolveOptions {
                    post_data,
                    timeout: None,
                },
            )
            .await?;
        Ok(PageContent {
            body: solution.body,
            final_url: solution.final_url,
            status: solution.status,
            via_solver: true,
        })
    }
}

/// The uniform provider interface.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &'static str;

    /// Title search on the provider's catalog.
    async fn search(
        &self,
        query: &str,
        ctx: &ProviderContext,
    ) -> Result<Vec<SearchResult>, ProviderError>;

    /// Load one detail page into its download links.
    async fn load(&self, url: &str, ctx: &ProviderContext) -> Result<LoadedPage, ProviderError>;

    /// Discovery: search, pick the right title, load, filter to the key.
    async fn fetch_streams(
        &self,
        key: &MediaKey,
        metadata: &Metadata,
        ctx: &ProviderContext,
    ) -> Result<Vec<ProviderLink>, ProviderError>;
}

/// Static provider registry, order defines the catalog order.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn standard() -> Self {
        Self::with_providers(vec![
            Arc::new(fourkhdhub::FourKHdHub::new()),
            Arc::new(moviesdrive::MoviesDrive::new()),
            Arc::new(uhdmovies::UhdMovies::new()),
        ])
    }

    pub fn with_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.id()).collect()
    }
}

/// Default search/load pipeline shared by the scrape providers: search with
/// the title (and year for movies), take the best-matching result, load it,
/// then keep links that belong to the requested episode.
pub(crate) async fn discover_via_search(
    provider: &dyn Provider,
    key: &MediaKey,
    metadata: &Metadata,
    ctx: &ProviderContext,
) -> Result<Vec<ProviderLink>, ProviderError> {
    let query = match (key.kind, metadata.year) {
        (crate::models::MediaKind::Movie, Some(year)) => format!("{} {year}", metadata.name),
        _ => metadata.name.clone(),
    };

    let results = provider.search(&query, ctx).await?;
    let Some(best) = pick_best_result(&results, metadata) else {
        debug!(provider = provider.id(), query = %query, "no matching search result");
        return Ok(Vec::new());
    };

    let page = provider.load(&best.url, ctx).await?;
    let episode_tag = key.episode_tag();

    let mut links: Vec<ProviderLink> = page
        .download_links
        .into_iter()
        .filter(|link| match (&episode_tag, &link.episode_hint) {
            // Movies keep everything; episode requests keep links that match
            // or carry no episode marker (season packs resolve later).
            (None, _) => true,
            (Some(wanted), Some(hint)) => hint.eq_ignore_ascii_case(wanted),
            (Some(_), None) => true,
        })
        .collect();

    // Quality-biased provider-internal order.
    links.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(links)
}

/// Choose the search hit whose title matches the metadata best; a year
/// mismatch of more than one disqualifies a hit when both sides know it.
pub(crate) fn pick_best_result<'a>(
    results: &'a [SearchResult],
    metadata: &Metadata,
) -> Option<&'a SearchResult> {
    let wanted = normalize_title(&metadata.name);
    let alternatives: Vec<String> = metadata
        .alternative_titles
        .iter()
        .chain(metadata.original_title.iter())
        .map(|t| normalize_title(t))
        .collect();

    results
        .iter()
        .filter(|result| match (result.year, metadata.year) {
            (Some(a), Some(b)) => a.abs_diff(b) <= 1,
            _ => true,
        })
        .find(|result| {
            let candidate = normalize_title(&result.title);
            candidate.contains(&wanted)
                || wanted.contains(&candidate)
                || alternatives
                    .iter()
                    .any(|alt| !alt.is_empty() && candidate.contains(alt))
        })
}

pub(crate) fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quality-biased priority used for provider-internal ordering.
pub(crate) fn resolution_priority(resolution: ResolutionTag) -> i32 {
    match resolution {
        ResolutionTag::P2160 => 40,
        ResolutionTag::P1080 => 30,
        ResolutionTag::P720 => 20,
        ResolutionTag::P480 => 10,
        ResolutionTag::Unknown => 0,
    }
}

/// Stable fingerprint for the cache merge rule.
pub(crate) fn link_fingerprint(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..12])
}

/// `SxxExx` marker in a label, normalized to uppercase.
pub(crate) fn episode_hint_from(label: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?i)S(\d{1,2})\s*E(\d{1,3})").ok()?;
    let caps = re.captures(label)?;
    let season: u32 = caps[1].parse().ok()?;
    let episode: u32 = caps[2].parse().ok()?;
    Some(format!("S{season:02}E{episode:02}"))
}

/// Audio language markers commonly embedded in release labels.
pub(crate) fn languages_from(label: &str) -> Vec<String> {
    const KNOWN: [&str; 7] = [
        "hindi", "english", "tamil", "telugu", "malayalam", "kannada", "japanese",
    ];
    let lower = label.to_lowercase();
    let mut languages: Vec<String> = KNOWN
        .iter()
        .filter(|lang| lower.contains(*lang))
        .map(|lang| {
            let mut name = lang.to_string();
            name[..1].make_ascii_uppercase();
            name
        })
        .collect();
    if lower.contains("dual audio") && languages.len() < 2 {
        languages.push("Dual Audio".to_string());
    }
    if lower.contains("multi audio") || lower.contains("multi-audio") {
        languages.push("Multi Audio".to_string());
    }
    languages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_matching() {
        let metadata = Metadata {
            name: "The Shawshank Redemption".to_string(),
            year: Some(1994),
            original_title: None,
            alternative_titles: vec![],
        };
        let results = vec![
            SearchResult {
                title: "Shawshank Redemption 2: Parody".to_string(),
                url: "https://p/1".to_string(),
                year: Some(2010),
            },
            SearchResult {
                title: "The Shawshank Redemption (1994) 1080p".to_string(),
                url: "https://p/2".to_string(),
                year: Some(1994),
            },
        ];
        let best = pick_best_result(&results, &metadata).unwrap();
        assert_eq!(best.url, "https://p/2");
    }

    #[test]
    fn year_gate_rejects_wrong_year() {
        let metadata = Metadata {
            name: "Dune".to_string(),
            year: Some(2021),
            original_title: None,
            alternative_titles: vec![],
        };
        let results = vec![SearchResult {
            title: "Dune".to_string(),
            url: "https://p/old".to_string(),
            year: Some(1984),
        }];
        assert!(pick_best_result(&results, &metadata).is_none());
    }

    #[test]
    fn episode_hints_and_languages() {
        assert_eq!(
            episode_hint_from("Breaking.Bad.s1e5.720p").as_deref(),
            Some("S01E05")
        );
        assert_eq!(episode_hint_from("Movie 1080p"), None);

        let langs = languages_from("Hindi-English Dual Audio 1080p");
        assert!(langs.contains(&"Hindi".to_string()));
        assert!(langs.contains(&"English".to_string()));
    }

    #[test]
    fn fingerprints_are_stable_and_short() {
        let a = link_fingerprint("https://host/file/1");
        let b = link_fingerprint("https://host/file/1");
        let c = link_fingerprint("https://host/file/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 24);
    }
}
