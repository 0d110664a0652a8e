//! Intermediary (wrapper page / cloud redirector) resolution.
//!
//! An intermediary lists mirrors of the same file across hosts of very
//! different quality. Candidates are scored on the host-preference ladder,
//! filtered by the resolution hint, and the best non-terminal one is
//! resolved one hop deeper until a terminal host or direct media URL shows
//! up. Encrypted candidate payloads re-enter selection after decryption.

use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::ResolveError;
use crate::models::{HostPreference, ResolveHints};
use crate::utils;

use super::{payload, Candidate, Resolver};

/// Deep-resolution budget inside one intermediary walk.
const MAX_INNER_HOPS: usize = 2;

pub(crate) async fn resolve_intermediary(
    resolver: &Resolver,
    url: &str,
    hints: &ResolveHints,
    cancel: CancellationToken,
) -> Result<Vec<Candidate>, ResolveError> {
    let ctx = resolver.page_ctx(cancel.clone());
    let mut current = url.to_string();

    for inner_hop in 0..=MAX_INNER_HOPS {
        let page = ctx.fetch_page(&current).await.map_err(|e| match e {
            crate::errors::ProviderError::Fetch(f) => ResolveError::Fetch(f),
            crate::errors::ProviderError::Solver(s) => ResolveError::Solver(s),
            _ => ResolveError::CandidatesExhausted { count: 0 },
        })?;

        // Encrypted payloads carry the candidate list directly.
        if let Some(encrypted) = payload::detect(&page.body) {
            debug!(url = %current, "decrypting embedded candidate payload");
            let candidates = payload::decrypt(&encrypted)?
                .into_iter()
                .map(|c| Candidate::new(c.url, c.label, c.priority))
                .collect();
            return Ok(filter_by_resolution(candidates, hints));
        }

        let mut candidates = collect_candidates(&page.body, &page.final_url);
        candidates = filter_by_resolution(candidates, hints);
        if candidates.is_empty() {
            return Err(ResolveError::CandidatesExhausted { count: 0 });
        }
        score_by_preference(&mut candidates);

        // Terminal or direct candidates are ready for selection.
        if candidates.iter().any(|c| is_terminal(&c.url)) || inner_hop == MAX_INNER_HOPS {
            return Ok(candidates);
        }

        // Everything is still wrapped; follow the best one a hop deeper.
        trace!(from = %current, to = %candidates[0].url, "intermediary hop deeper");
        current = candidates.remove(0).url;
    }

    Err(ResolveError::HopsExhausted {
        hops: MAX_INNER_HOPS,
    })
}

/// Anchors plus raw URLs in scripts, absolutized against the page.
fn collect_candidates(html: &str, page_url: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").unwrap();
    let base = url::Url::parse(page_url).ok();
    let page_host = utils::domain_of(page_url).unwrap_or_default();

    let mut candidates = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let absolute = match &base {
            Some(base) => match base.join(href) {
                Ok(joined) => joined.to_string(),
                Err(_) => continue,
            },
            None => href.to_string(),
        };
        if !absolute.starts_with("http") {
            continue;
        }
        let host = utils::domain_of(&absolute).unwrap_or_default();
        // Same-page navigation is noise; same-host download paths are not.
        if host == page_host && !absolute.contains("/cloud") && !absolute.contains("/watch") {
            continue;
        }
        if !is_mirrorish(&absolute) {
            continue;
        }

        let label = anchor.text().collect::<String>().trim().to_string();
        candidates.push(Candidate::new(absolute, label, 0));
    }

    super::dedupe_by_url(&mut candidates);
    candidates
}

fn is_mirrorish(url: &str) -> bool {
    let host = utils::domain_of(url).unwrap_or_default();
    let lower = url.to_lowercase();
    host.contains("gdflix")
        || host.contains("filesdl")
        || host.contains("pixeldrain")
        || host.contains("gofile")
        || host.contains("hubcloud")
        || utils::host_matches(&host, "workers.dev")
        || utils::host_matches(&host, "r2.dev")
        || lower.ends_with(".mkv")
        || lower.ends_with(".mp4")
        || lower.ends_with(".m3u8")
}

fn is_terminal(url: &str) -> bool {
    matches!(
        HostPreference::of(url),
        HostPreference::CdnDirect | HostPreference::WrapperWithDirect
    ) || crate::utils::domain_of(url)
        .map(|h| h.contains("pixeldrain") || h.contains("gofile") || h.contains("filesdl"))
        .unwrap_or(false)
}

/// Keep candidates whose label agrees with the hinted resolution; unknown
/// labels survive because wrapper pages often omit the quality.
fn filter_by_resolution(candidates: Vec<Candidate>, hints: &ResolveHints) -> Vec<Candidate> {
    let Some(wanted) = hints.resolution else {
        return candidates;
    };
    let filtered: Vec<Candidate> = candidates
        .iter()
        .filter(|c| match c.resolution {
            Some(res) => res == wanted,
            None => true,
        })
        .cloned()
        .collect();
    // Never filter down to nothing over a cosmetic label.
    if filtered.is_empty() {
        candidates
    } else {
        filtered
    }
}

/// Ladder scoring; the preference converts into the priority the generic
/// ranker already understands (better rung, bigger number).
fn score_by_preference(candidates: &mut [Candidate]) {
    for candidate in candidates.iter_mut() {
        let rung = match HostPreference::of(&candidate.url) {
            HostPreference::CdnDirect => 3,
            HostPreference::WrapperWithDirect => 2,
            HostPreference::WrapperRequiringSolve => 1,
            HostPreference::ShareableCloud => 0,
        };
        candidate.priority += rung * 100;
    }
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolutionTag;

    const WRAPPER_PAGE: &str = r#"
        <html><body>
          <a href="https://new.gdflix.dad/file/AAA">GDFlix [1080p]</a>
          <a href="https://filesdl.site/cloud/BBB">FilesDL Cloud [1080p]</a>
          <a href="https://gofile.io/d/CCC">GoFile [1080p]</a>
          <a href="/watch/DDD">Watch Online [720p]</a>
          <a href="https://hubcloud.art/about">About us</a>
        </body></html>
    "#;

    #[test]
    fn candidates_scored_on_the_ladder() {
        let mut candidates = collect_candidates(WRAPPER_PAGE, "https://hubcloud.art/drive/x");
        score_by_preference(&mut candidates);

        // gdflix (wrapper-with-direct) outranks filesdl (solve tier)
        // which outranks gofile (shareable cloud)
        assert_eq!(
            utils::domain_of(&candidates[0].url).unwrap(),
            "new.gdflix.dad"
        );
        assert!(candidates
            .iter()
            .position(|c| c.url.contains("filesdl"))
            .unwrap()
            < candidates
                .iter()
                .position(|c| c.url.contains("gofile"))
                .unwrap());
        // /about on the page's own host was dropped
        assert!(!candidates.iter().any(|c| c.url.contains("about")));
    }

    #[test]
    fn resolution_hint_filters_but_never_empties() {
        let candidates = vec![
            Candidate::new("https://a/1".into(), "2160p HDR".into(), 0),
            Candidate::new("https://a/2".into(), "1080p".into(), 0),
            Candidate::new("https://a/3".into(), "no label".into(), 0),
        ];
        let hints = ResolveHints {
            resolution: Some(ResolutionTag::P1080),
            ..ResolveHints::default()
        };
        let filtered = filter_by_resolution(candidates.clone(), &hints);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|c| !c.label.contains("2160")));

        // a hint nothing matches keeps the full list
        let hints = ResolveHints {
            resolution: Some(ResolutionTag::P480),
            ..ResolveHints::default()
        };
        let kept = filter_by_resolution(
            vec![Candidate::new("https://a/1".into(), "2160p".into(), 0)],
            &hints,
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn terminal_detection() {
        assert!(is_terminal("https://pub.r2.dev/f.mkv"));
        assert!(is_terminal("https://new.gdflix.dad/file/1"));
        assert!(is_terminal("https://pixeldrain.com/u/1"));
        assert!(!is_terminal("https://hubcloud.art/drive/1"));
    }
}
