//! 4khdhub provider.
//!
//! Card-grid search plus detail pages whose download sections link into
//! hubcloud/filesdl-style wrapper pages. Labels carry quality, size and
//! audio markers; season packs carry per-episode rows.

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::errors::ProviderError;
use crate::models::{LoadedPage, MediaKey, Metadata, ProviderLink, ResolutionTag, SearchResult};

use super::{
    discover_via_search, episode_hint_from, languages_from, link_fingerprint,
    resolution_priority, Provider, ProviderContext,
};

const BASE_URL: &str = "https://4khdhub.dev";

pub struct FourKHdHub {
    base_url: String,
}

impl FourKHdHub {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
        }
    }
}

impl Default for FourKHdHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FourKHdHub {
    fn id(&self) -> &'static str {
        "fourkhdhub"
    }

    async fn search(
        &self,
        query: &str,
        ctx: &ProviderContext,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let url = format!("{}/?s={}", self.base_url, urlencoding::encode(query));
        let page = ctx.fetch_page(&url).await?;
        Ok(parse_search(&page.body, &self.base_url))
    }

    async fn load(&self, url: &str, ctx: &ProviderContext) -> Result<LoadedPage, ProviderError> {
        let page = ctx.fetch_page(url).await?;
        parse_detail(&page.body, &page.final_url)
            .ok_or_else(|| ProviderError::parse("fourkhdhub", "detail page had no title"))
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

fn parse_search(html: &str, base_url: &str) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    let cards = Selector::parse("div.card-grid a.movie-card").unwrap();
    let title = Selector::parse("h3").unwrap();
    let meta = Selector::parse("span.movie-card-meta").unwrap();

    document
        .select(&cards)
        .filter_map(|card| {
            let href = card.value().attr("href")?;
            let title = card
                .select(&title)
                .next()
                .map(|t| t.text().collect::<String>().trim().to_string())?;
            let year = card
                .select(&meta)
                .next()
                .and_then(|m| m.text().collect::<String>().trim().parse().ok());
            let url = if href.starts_with("http") {
                href.to_string()
            } else {
                format!("{base_url}{href}")
            };
            Some(SearchResult { title, url, year })
        })
        .collect()
}

fn parse_detail(html: &str, page_url: &str) -> Option<LoadedPage> {
    let document = Html::parse_document(html);
    let title_selector = Selector::parse("h1.page-title, h1").unwrap();
    let items = Selector::parse("div.download-item").unwrap();
    let file_title = Selector::parse("div.file-title, h4").unwrap();
    let anchors = Selector::parse("a[href]").unwrap();

    let title = document
        .select(&title_selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())?;
    let year = extract_year(&title);

    let base = url::Url::parse(page_url).ok();
    let mut download_links = Vec::new();

    for item in document.select(&items) {
        let label = item
            .select(&file_title)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .unwrap_or_else(|| title.clone());
        let resolution = ResolutionTag::from_label(&label);

        for anchor in item.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let text = anchor.text().collect::<String>().to_lowercase();
            if !text.contains("download") && !text.contains("hubcloud") && !text.contains("server")
            {
                continue;
            }
            let url = match &base {
                Some(base) => base
                    .join(href)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.to_string()),
                None => href.to_string(),
            };
            if !url.starts_with("http") {
                continue;
            }

            download_links.push(ProviderLink {
                fingerprint: Some(link_fingerprint(&url)),
                host_hint: crate::utils::domain_of(&url)
                    .and_then(|h| h.split('.').rev().nth(1).map(|s| s.to_string())),
                episode_hint: episode_hint_from(&label),
                languages: languages_from(&label),
                size_bytes: crate::utils::parse_size(&label),
                priority: resolution_priority(resolution),
                resolution: Some(resolution),
                label: label.clone(),
                url,
            });
        }
    }

    Some(LoadedPage {
        title,
        year,
        download_links,
    })
}

fn extract_year(title: &str) -> Option<u16> {
    let re = regex::Regex::new(r"\((19|20)\d{2}\)").ok()?;
    let matched = re.find(title)?;
    matched.as_str().trim_matches(['(', ')']).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"
        <div class="card-grid">
          <a class="movie-card" href="/movie/interstellar-2014">
            <h3>Interstellar (2014) 4K HDR</h3>
            <span class="movie-card-meta">2014</span>
          </a>
          <a class="movie-card" href="https://4khdhub.dev/movie/inception-2010">
            <h3>Inception</h3>
            <span class="movie-card-meta">2010</span>
          </a>
        </div>
    "#;

    const DETAIL_PAGE: &str = r#"
        <h1 class="page-title">Interstellar (2014)</h1>
        <div class="download-item">
          <div class="file-title">Interstellar.2014.2160p.WEB-DL.Hindi-English.[14.2GB]</div>
          <a href="https://hubcloud.foo/drive/aaa">HubCloud Download</a>
        </div>
        <div class="download-item">
          <div class="file-title">Interstellar.2014.1080p.BluRay.[4.5GB]</div>
          <a href="/goto/filesdl-bbb">Download Now</a>
          <a href="/contact">Report broken link</a>
        </div>
    "#;

    #[test]
    fn search_cards_parsed() {
        let results = parse_search(SEARCH_PAGE, "https://4khdhub.dev");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Interstellar (2014) 4K HDR");
        assert_eq!(results[0].url, "https://4khdhub.dev/movie/interstellar-2014");
        assert_eq!(results[0].year, Some(2014));
    }

    #[test]
    fn detail_links_carry_quality_metadata() {
        let page = parse_detail(DETAIL_PAGE, "https://4khdhub.dev/movie/interstellar-2014")
            .unwrap();
        assert_eq!(page.title, "Interstellar (2014)");
        assert_eq!(page.year, Some(2014));
        assert_eq!(page.download_links.len(), 2);

        let uhd = &page.download_links[0];
        assert_eq!(uhd.resolution, Some(ResolutionTag::P2160));
        assert!(uhd.priority > page.download_links[1].priority);
        assert!(uhd.languages.contains(&"Hindi".to_string()));
        assert!(uhd.size_bytes.is_some());
        assert!(uhd.fingerprint.is_some());

        // relative link resolved against the page URL
        assert_eq!(
            page.download_links[1].url,
            "https://4khdhub.dev/goto/filesdl-bbb"
        );
    }
}
