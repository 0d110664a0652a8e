//! moviesdrive provider.
//!
//! Thumbnail-list search; detail pages group mirrors under h5 quality
//! headers, mostly pointing at gdflix file pages.

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::errors::ProviderError;
use crate::models::{LoadedPage, MediaKey, Metadata, ProviderLink, ResolutionTag, SearchResult};

use super::{
    discover_via_search, episode_hint_from, languages_from, link_fingerprint,
    resolution_priority, Provider, ProviderContext,
};

const BASE_URL: &str = "https://moviesdrive.world";

pub struct MoviesDrive {
    base_url: String,
}

impl MoviesDrive {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
        }
    }
}

impl Default for MoviesDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MoviesDrive {
    fn id(&self) -> &'static str {
        "moviesdrive"
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
        parse_detail(&page.body).ok_or_else(|| {
            ProviderError::parse("moviesdrive", "detail page had no title")
        })
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
    let entries = Selector::parse("ul.recent-movies li.thumb a[href]").unwrap();
    let images = Selector::parse("img[title]").unwrap();

    document
        .select(&entries)
        .filter_map(|entry| {
            let href = entry.value().attr("href")?;
            let title = entry
                .select(&images)
                .next()
                .and_then(|img| img.value().attr("title"))
                .map(|t| t.trim().to_string())?;
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
    // Quality blocks: an h5 header labels every mirror anchor until the
    // next header. A compound selector iterates in document order.
    let blocks = Selector::parse("h5, a[href]").unwrap();

    let title = document
        .select(&title_selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())?;
    let year = year_in(&title);

    let mut current_label = title.clone();
    let mut download_links = Vec::new();
    for node in document.select(&blocks) {
        if node.value().name() == "h5" {
            let text = node.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
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
        let label = current_label.clone();
        let resolution = ResolutionTag::from_label(&label);

        download_links.push(ProviderLink {
            fingerprint: Some(link_fingerprint(href)),
            host_hint: crate::utils::domain_of(href)
                .and_then(|h| h.split('.').rev().nth(1).map(|s| s.to_string())),
            episode_hint: episode_hint_from(&label),
            languages: languages_from(&label),
            size_bytes: crate::utils::parse_size(&label),
            priority: resolution_priority(resolution),
            resolution: Some(resolution),
            label,
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
    host.contains("gdflix")
        || host.contains("filesdl")
        || host.contains("hubcloud")
        || host.contains("gofile")
        || host.contains("pixeldrain")
}

fn year_in(text: &str) -> Option<u16> {
    let re = regex::Regex::new(r"\b(19|20)\d{2}\b").ok()?;
    re.find(text)?.as_str().parse().ok()
}
