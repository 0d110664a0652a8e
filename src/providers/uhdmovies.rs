//! uhdmovies provider.
//!
//! Article-grid search. Download paragraphs alternate a quality line with
//! shortener-wrapped mirror buttons, so the links this provider emits
//! usually enter the resolver's short-link path first.

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::errors::ProviderError;
use crate::models::{LoadedPage, MediaKey, Metadata, ProviderLink, ResolutionTag, SearchResult};

use super::{
    discover_via_search, episode_hint_from, languages_from, link_fingerprint,
    resolution_priority, Provider, ProviderContext,
};

const BASE_URL: &str = "https://uhdmovies.email";

pub struct UhdMovies {
    base_url: String,
}

impl UhdMovies {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
        }
    }
}

impl Default for UhdMovies {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for UhdMovies {
    fn id(&self) -> &'static str {
        "uhdmovies"
    }

    async fn search(
        &self,
        query: &str,
        ctx: &ProviderContext,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let url = format!("{}/?s={}", self.base_url, urlencoding::encode(query));
        let page = ctx.fetch_page(&url).await?;
        Ok(parse_search(&page.body))
    }

    async fn load(&self, url: &str, ctx: &ProviderContext) -> Result<LoadedPage, ProviderError> {
        let page = ctx.fetch_page(url).await?;
        parse_detail(&page.body)
            .ok_or_else(|| ProviderError::parse("uhdmovies", "detail page had no title"))
    }

    async fn fetch_streams(
        &self,
        key: &MediaKey,
        metadata: &Metadata,
        ctx: &ProviderContext,
    ) -> Result<Vec<ProviderLink>, ProviderError> {
        discover_via_search(self, key, metadata, ctx).await
    }
}

fn parse_search(html: &str) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    let articles = Selector::parse("article.gridlove-post").unwrap();
    let link = Selector::parse("h2.entry-title a[href], h1.entry-title a[href]").unwrap();

    document
        .select(&articles)
        .filter_map(|article| {
            let anchor = article.select(&link).next()?;
            let href = anchor.value().attr("href")?;
            let title = anchor.text().collect::<String>().trim().to_string();
            let year = year_in(&title);
            Some(SearchResult {
                title,
                url: href.to_string(),
                year,
            })
        })
        .collect()
}

fn parse_detail(html: &str) -> Option<LoadedPage> {
    let document = Html::parse_document(html);
    let title_selector = Selector::parse("h1.entry-title, title").unwrap();
    // Quality lines live in bold paragraph text; the mirror buttons follow
    // in the next paragraphs until another quality line shows up.
    let stream = Selector::parse("p strong, pre, a.maxbutton, a[href]").unwrap();

    let title = document
        .select(&title_selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())?;
    let year = year_in(&title);

    let mut current_label = title.clone();
    let mut download_links = Vec::new();

    for node in document.select(&stream) {
        if matches!(node.value().name(), "strong" | "pre") {
            let text = node.text().collect::<String>().trim().to_string();
            if ResolutionTag::from_label(&text) != ResolutionTag::Unknown {
                current_label = text;
            }
            continue;
        }

        let Some(href) = node.value().attr("href") else {
            continue;
        };
        if !is_mirror(href) {
            continue;
        }

        let resolution = ResolutionTag::from_label(&current_label);
        download_links.push(ProviderLink {
            fingerprint: Some(link_fingerprint(href)),
            // shortener links hide the real host; the button text often
            // names it ("Download From GDFlix")
            host_hint: host_hint_from(&node.text().collect::<String>()),
            episode_hint: episode_hint_from(&current_label),
            languages: languages_from(&current_label),
            size_bytes: crate::utils::parse_size(&current_label),
            priority: resolution_priority(resolution),
            resolution: Some(resolution),
            label: current_label.clone(),
            url: href.to_string(),
        });
    }

    Some(LoadedPage {
        title,
        year,
        download_links,
    })
}

fn is_mirror(href: &str) -> bool {
    let Some(host) = crate::utils::domain_of(href) else {
        return false;
    };
    host.contains("ouo.")
        || host.contains("shrinkme")
        || host.contains("gdflix")
        || host.contains("filesdl")
        || host.contains("pixeldrain")
        || host.contains("gofile")
}

fn host_hint_from(button_text: &str) -> Option<String> {
    let lower = button_text.to_lowercase();
    for host in ["gdflix", "filesdl", "pixeldrain", "gofile"] {
        if lower.contains(host) {
            return Some(host.to_string());
        }
    }
    None
}

fn year_in(text: &str) -> Option<u16> {
    let re = regex::Regex::new(r"\b(19|20)\d{2}\b").ok()?;
    re.find(text)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"
        <article class="gridlove-post">
          <h2 class="entry-title"><a href="https://uhdmovies.email/dune-part-two">
            Download Dune: Part Two (2024) 2160p
          </a></h2>
        </article>
    "#;

    const DETAIL_PAGE: &str = r#"
        <h1 class="entry-title">Dune: Part Two (2024)</h1>
        <p><strong>Dune.Part.Two.2024.2160p.DV.HDR [21.4GB]</strong></p>
        <p><a class="maxbutton" href="https://ouo.io/aAbBcC">Download From GDFlix</a></p>
        <p><strong>Dune.Part.Two.2024.1080p.x264 [8.2GB]</strong></p>
        <p><a class="maxbutton" href="https://ouo.press/dDeEfF">Download From FilesDL</a></p>
        <p><a href="https://uhdmovies.email/how-to-download">How to download</a></p>
    "#;

    #[test]
    fn search_articles_parsed() {
        let results = parse_search(SEARCH_PAGE);
        assert_eq!(results.len(), 1);
        assert!(results[0].title.contains("Dune: Part Two"));
        assert_eq!(results[0].year, Some(2024));
    }

    #[test]
    fn shortener_mirrors_with_host_hints() {
        let page = parse_detail(DETAIL_PAGE).unwrap();
        assert_eq!(page.download_links.len(), 2);

        let uhd = &page.download_links[0];
        assert_eq!(uhd.url, "https://ouo.io/aAbBcC");
        assert_eq!(uhd.resolution, Some(ResolutionTag::P2160));
        assert_eq!(uhd.host_hint.as_deref(), Some("gdflix"));

        let fhd = &page.download_links[1];
        assert_eq!(fhd.host_hint.as_deref(), Some("filesdl"));
        assert_eq!(fhd.size_bytes, crate::utils::parse_size("8.2GB"));
    }
}
