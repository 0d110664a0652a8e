//! Short-link (ouo-style) form dance.
//!
//! These pages hide the destination behind one or two self-submitting
//! forms. The dance: fetch the page (through the solver when challenged),
//! find the primary form, collect its hidden inputs, submit, follow up to
//! four hops merging cookies along the way. If the page already exposes an
//! external candidate matching the host hint, that wins immediately.

use scraper::{Html, Selector};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::ResolveError;
use crate::fetch::FetchOptions;
use crate::models::ResolveHints;
use crate::utils;

use super::Resolver;

const MAX_FORM_HOPS: usize = 4;

const TERMINAL_HOST_PATTERNS: [&str; 6] = [
    "gdflix",
    "filesdl",
    "pixeldrain",
    "gofile",
    "workers.dev",
    "r2.dev",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FormSubmission {
    pub action: String,
    pub method: String,
    pub fields: Vec<(String, String)>,
}

impl FormSubmission {
    pub fn encoded_body(&self) -> String {
        self.fields
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Walk a short link to its destination URL.
pub(crate) async fn resolve_short(
    resolver: &Resolver,
    url: &str,
    hints: &ResolveHints,
    cancel: CancellationToken,
    visited: &mut HashSet<String>,
) -> Result<String, ResolveError> {
    let ctx = resolver.page_ctx(cancel.clone());
    let mut current = url.to_string();

    for hop in 0..MAX_FORM_HOPS {
        let page = ctx
            .fetch_page(&current)
            .await
            .map_err(provider_to_resolve)?;

        // Destination already visible on the page?
        if let Some(external) = find_external_candidate(&page.body, &page.final_url, hints) {
            trace!(hop, external = %external, "short page exposed its destination");
            return Ok(external);
        }

        let Some(form) = find_primary_form(&page.body, &page.final_url) else {
            // No form and no candidate: the fetch itself may have landed on
            // the destination after a redirect chain.
            if page.final_url != current && !same_host(&page.final_url, &current) {
                return Ok(page.final_url);
            }
            return Err(ResolveError::CandidatesExhausted { count: 0 });
        };

        let triple = format!("{} {} {}", form.method, form.action, form.encoded_body());
        if !visited.insert(triple) {
            return Err(ResolveError::LoopDetected { url: form.action });
        }

        debug!(hop, action = %form.action, method = %form.method, "submitting short-link form");
        let (submit_url, submit_opts) = if form.method == "GET" {
            let url = if form.fields.is_empty() {
                form.action.clone()
            } else {
                format!("{}?{}", form.action, form.encoded_body())
            };
            (url, FetchOptions::with_cancel(cancel.clone()))
        } else {
            (
                form.action.clone(),
                FetchOptions::post_form(cancel.clone(), form.encoded_body()),
            )
        };
        let response = resolver.fetch.fetch(&submit_url, submit_opts).await?;

        let landed = response.final_url.clone();
        if !same_host(&landed, &current) && looks_terminal(&landed) {
            return Ok(landed);
        }
        if let Some(external) = find_external_candidate(&response.text(), &landed, hints) {
            return Ok(external);
        }

        // Another interstitial of the same shortener; go around again.
        current = landed;
    }

    Err(ResolveError::HopsExhausted {
        hops: MAX_FORM_HOPS,
    })
}

fn provider_to_resolve(e: crate::errors::ProviderError) -> ResolveError {
    match e {
        crate::errors::ProviderError::Fetch(f) => ResolveError::Fetch(f),
        crate::errors::ProviderError::Solver(s) => ResolveError::Solver(s),
        _ => ResolveError::CandidatesExhausted { count: 0 },
    }
}

fn same_host(a: &str, b: &str) -> bool {
    match (utils::domain_of(a), utils::domain_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn looks_terminal(url: &str) -> bool {
    let lower = url.to_lowercase();
    let host = utils::domain_of(url).unwrap_or_default();
    TERMINAL_HOST_PATTERNS
        .iter()
        .any(|pattern| host.contains(pattern))
        || lower.ends_with(".mkv")
        || lower.ends_with(".mp4")
        || lower.ends_with(".m3u8")
}

/// An anchor or script URL pointing off-site at a known terminal host.
/// A host hint narrows the match; without one any terminal host counts.
pub(crate) fn find_external_candidate(
    html: &str,
    page_url: &str,
    hints: &ResolveHints,
) -> Option<String> {
    let page_host = utils::domain_of(page_url).unwrap_or_default();
    let re = regex::Regex::new(r#"https?://[^\s"'<>\\]+"#).unwrap();

    let mut fallback: Option<String> = None;
    for found in re.find_iter(html) {
        let candidate = found.as_str().trim_end_matches(['.', ',', ')']);
        let Some(host) = utils::domain_of(candidate) else {
            continue;
        };
        if host == page_host || !looks_terminal(candidate) {
            continue;
        }
        match &hints.host {
            Some(wanted) if host.contains(wanted.as_str()) => {
                return Some(candidate.to_string());
            }
            Some(_) => {
                fallback.get_or_insert_with(|| candidate.to_string());
            }
            None => return Some(candidate.to_string()),
        }
    }
    fallback
}

/// The primary button form: prefer a form owning a submit control, fall
/// back to the first form. A missing action is derived from the page body;
/// a missing method means POST.
pub(crate) fn find_primary_form(html: &str, page_url: &str) -> Option<FormSubmission> {
    let document = Html::parse_document(html);
    let forms = Selector::parse("form").unwrap();
    let inputs = Selector::parse("input").unwrap();
    let submits = Selector::parse("button[type=submit], input[type=submit]").unwrap();

    let all_forms: Vec<_> = document.select(&forms).collect();
    let form = all_forms
        .iter()
        .find(|form| form.select(&submits).next().is_some())
        .or_else(|| all_forms.first())?;

    let fields: Vec<(String, String)> = form
        .select(&inputs)
        .filter_map(|input| {
            let value = input.value();
            let name = value.attr("name")?;
            if matches!(value.attr("type"), Some("submit") | Some("button")) {
                return None;
            }
            Some((name.to_string(), value.attr("value").unwrap_or("").to_string()))
        })
        .collect();

    let base = url::Url::parse(page_url).ok()?;
    let action = match form.value().attr("action").filter(|a| !a.is_empty()) {
        Some(action) => base.join(action).ok()?.to_string(),
        // Tie-break: derive the action from a body regex matching the
        // host's path scheme.
        None => derive_action(html, &base)?,
    };

    let method = form
        .value()
        .attr("method")
        .map(|m| m.to_uppercase())
        .unwrap_or_else(|| "POST".to_string());

    Some(FormSubmission {
        action,
        method,
        fields,
    })
}

/// Same-host URLs with go/out/redirect-ish paths mentioned in the body.
fn derive_action(html: &str, base: &url::Url) -> Option<String> {
    let host = base.host_str()?;
    let re = regex::Regex::new(&format!(
        r#"["'](https?://{}/[^"']*(?:go|out|redirect|submit)[^"']*)["']"#,
        regex::escape(host)
    ))
    .ok()?;
    if let Some(caps) = re.captures(html) {
        return Some(caps[1].to_string());
    }
    // Last resort: re-submit to the page itself.
    Some(base.to_string())
}
