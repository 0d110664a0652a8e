//! filesdl watch/cloud extractor.
//!
//! `/watch/{id}` pages embed the download target in a script variable;
//! `/cloud/{id}` pages list mirror servers as buttons. The watch form ranks
//! above the cloud mirrors of the same file.

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::errors::ProviderError;
use crate::models::ExtractedLink;
use crate::providers::ProviderContext;
use crate::utils;

pub struct FilesDl;

#[async_trait]
impl super::HostExtractor for FilesDl {
    fn id(&self) -> &'static str {
        "filesdl"
    }

    fn matches(&self, host: &str) -> bool {
        host.contains("filesdl")
    }

    async fn extract(
        &self,
        url: &str,
        priority: i32,
        ctx: &ProviderContext,
    ) -> Result<Vec<ExtractedLink>, ProviderError> {
        let page = ctx.fetch_page(url).await?;

        let mut links = if url.contains("/watch/") {
            parse_watch_page(&page.body, priority)
        } else {
            parse_cloud_page(&page.body, &page.final_url, priority)
        };

        if links.is_empty() {
            return Err(ProviderError::parse(
                "filesdl",
                format!("no servers found: {}", utils::snippet(&page.body, 120)),
            ));
        }
        links.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(links)
    }
}

/// `/watch/` pages stash the stream target in `var url = '...'` (or
/// `downloadUrl`, depending on the template revision).
fn parse_watch_page(html: &str, base_priority: i32) -> Vec<ExtractedLink> {
    let re = regex::Regex::new(r#"(?:var\s+(?:url|downloadUrl)|data-url)\s*=\s*['"](https?://[^'"]+)['"]"#)
        .unwrap();
    let label = page_title(html).unwrap_or_default();

    re.captures_iter(html)
        .map(|caps| ExtractedLink {
            url: caps[1].to_string(),
            label: label.clone(),
            size_bytes: utils::parse_size(html),
            // watch targets outrank cloud mirrors
            priority: base_priority + 10,
        })
        .collect()
}

fn server_offset(text: &str) -> Option<i32> {
    let lower = text.to_lowercase();
    if !lower.contains("download") && !lower.contains("server") {
        return None;
    }
    if lower.contains("10gbps") || lower.contains("fsl") {
        Some(8)
    } else if lower.contains("pixeldrain") {
        Some(6)
    } else if lower.contains("gofile") {
        Some(2)
    } else {
        Some(4)
    }
}

fn parse_cloud_page(html: &str, page_url: &str, base_priority: i32) -> Vec<ExtractedLink> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a.btn, a[href]").unwrap();
    let label = page_title(html).unwrap_or_default();
    let size = utils::parse_size(html);
    let base = url::Url::parse(page_url).ok();

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let text = anchor.text().collect::<String>();
        let Some(offset) = server_offset(&text) else {
            continue;
        };
        let absolute = match &base {
            Some(base) => base
                .join(href)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };
        if !absolute.starts_with("http") || !seen.insert(absolute.clone()) {
            continue;
        }
        links.push(ExtractedLink {
            url: absolute,
            label: label.clone(),
            size_bytes: size,
            priority: base_priority + offset,
        });
    }
    links
}

fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").unwrap();
    document
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}
