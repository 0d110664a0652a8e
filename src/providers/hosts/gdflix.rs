//! gdflix file-page extractor.
//!
//! A gdflix file page lists several mirrors as big buttons. The instant /
//! direct buttons are worth much more than the cloud mirrors, so the
//! priority offsets encode that before the resolver ever probes anything.

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::errors::ProviderError;
use crate::models::ExtractedLink;
use crate::providers::ProviderContext;
use crate::utils;

pub struct GdFlix;

#[async_trait]
impl super::HostExtractor for GdFlix {
    fn id(&self) -> &'static str {
        "gdflix"
    }

    fn matches(&self, host: &str) -> bool {
        host.contains("gdflix")
    }

    async fn extract(
        &self,
        url: &str,
        priority: i32,
        ctx: &ProviderContext,
    ) -> Result<Vec<ExtractedLink>, ProviderError> {
        let page = ctx.fetch_page(url).await?;
        let mut links = parse_file_page(&page.body, &page.final_url, priority);
        if links.is_empty() {
            return Err(ProviderError::parse(
                "gdflix",
                format!("no mirrors on page: {}", utils::snippet(&page.body, 120)),
            ));
        }
        links.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(links)
    }
}

/// Mirror buttons carry their kind in the button text.
fn mirror_offset(text: &str) -> Option<i32> {
    let lower = text.to_lowercase();
    if lower.contains("instant") || lower.contains("direct") {
        Some(10)
    } else if lower.contains("pixeldrain") {
        Some(8)
    } else if lower.contains("cloud") || lower.contains("index") {
        Some(5)
    } else if lower.contains("gofile") {
        Some(3)
    } else if lower.contains("telegram") || lower.contains("login") {
        // Account-gated mirrors are useless to us.
        None
    } else {
        None
    }
}

fn parse_file_page(html: &str, page_url: &str, base_priority: i32) -> Vec<ExtractedLink> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a.btn, div.file-body a, a[href]").unwrap();
    let title_selector = Selector::parse("title, li.list-group-item").unwrap();

    let label = document
        .select(&title_selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .unwrap_or_default();
    let size = utils::parse_size(html);

    let base = url::Url::parse(page_url).ok();
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let text = anchor.text().collect::<String>();
        let Some(offset) = mirror_offset(&text) else {
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
            label: if label.is_empty() {
                text.trim().to_string()
            } else {
                label.clone()
            },
            size_bytes: size,
            priority: base_priority + offset,
        });
    }

    links
}
