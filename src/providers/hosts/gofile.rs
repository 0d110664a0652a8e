//! gofile.io extractor.
//!
//! The API dance: create a guest account once (token cached module-wide),
//! then list the folder contents and keep the video files. Download links
//! only work with the account token attached.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use tracing::debug;

use crate::errors::ProviderError;
use crate::fetch::FetchOptions;
use crate::models::ExtractedLink;
use crate::providers::ProviderContext;

const ACCOUNTS_URL: &str = "https://api.gofile.io/accounts";
const CONTENTS_URL: &str = "https://api.gofile.io/contents";
// Site-wide token embedded in the gofile web app.
const WEBSITE_TOKEN: &str = "4fd6sg89d7s6";

const VIDEO_EXTENSIONS: [&str; 6] = [".mkv", ".mp4", ".avi", ".webm", ".ts", ".m2ts"];

/// Guest account token shared across requests.
static ACCOUNT_TOKEN: Mutex<Option<String>> = Mutex::new(None);

pub struct GoFile;

#[derive(Debug, Deserialize)]
struct AccountEnvelope {
    status: String,
    data: AccountData,
}

#[derive(Debug, Deserialize)]
struct AccountData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ContentsEnvelope {
    status: String,
    data: ContentsData,
}

#[derive(Debug, Deserialize)]
struct ContentsData {
    #[serde(default)]
    children: std::collections::HashMap<String, ContentChild>,
}

#[derive(Debug, Deserialize)]
struct ContentChild {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    link: Option<String>,
}

#[async_trait]
impl super::HostExtractor for GoFile {
    fn id(&self) -> &'static str {
        "gofile"
    }

    fn matches(&self, host: &str) -> bool {
        host.contains("gofile")
    }

    async fn extract(
        &self,
        url: &str,
        priority: i32,
        ctx: &ProviderContext,
    ) -> Result<Vec<ExtractedLink>, ProviderError> {
        let content_id = content_id_from(url).ok_or_else(|| {
            ProviderError::parse("gofile", format!("no content id in {url}"))
        })?;

        let token = self.account_token(ctx).await?;
        let listing_url = format!("{CONTENTS_URL}/{content_id}?wt={WEBSITE_TOKEN}");

        let response = ctx
            .fetch
            .fetch(
                &listing_url,
                FetchOptions::with_cancel(ctx.cancel.clone())
                    .header("Authorization", format!("Bearer {token}")),
            )
            .await?;

        let envelope: ContentsEnvelope = response
            .json()
            .map_err(|e| ProviderError::parse("gofile", format!("bad contents payload: {e}")))?;
        if envelope.status != "ok" {
            // A stale guest token is the common cause; forget it.
            *ACCOUNT_TOKEN.lock().unwrap() = None;
            return Err(ProviderError::parse(
                "gofile",
                format!("contents status {}", envelope.status),
            ));
        }

        let mut links: Vec<ExtractedLink> = envelope
            .data
            .children
            .into_values()
            .filter(|child| child.kind == "file" && is_video(&child.name))
            .filter_map(|child| {
                let link = child.link?;
                Some(ExtractedLink {
                    // downloads require the account token on the query
                    url: format!("{link}?accountToken={token}"),
                    label: child.name,
                    size_bytes: child.size,
                    priority,
                })
            })
            .collect();

        links.sort_by(|a, b| b.size_bytes.unwrap_or(0).cmp(&a.size_bytes.unwrap_or(0)));
        Ok(links)
    }
}

impl GoFile {
    async fn account_token(&self, ctx: &ProviderContext) -> Result<String, ProviderError> {
        if let Some(token) = ACCOUNT_TOKEN.lock().unwrap().clone() {
            return Ok(token);
        }

        debug!("creating gofile guest account");
        let response = ctx
            .fetch
            .fetch(
                ACCOUNTS_URL,
                FetchOptions {
                    method: reqwest::Method::POST,
                    cancel: ctx.cancel.clone(),
                    use_cookies: false,
                    ..FetchOptions::default()
                },
            )
            .await?;

        let envelope: AccountEnvelope = response
            .json()
            .map_err(|e| ProviderError::parse("gofile", format!("bad account payload: {e}")))?;
        if envelope.status != "ok" {
            return Err(ProviderError::parse(
                "gofile",
                format!("account status {}", envelope.status),
            ));
        }

        let token = envelope.data.token;
        *ACCOUNT_TOKEN.lock().unwrap() = Some(token.clone());
        Ok(token)
    }
}

fn content_id_from(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let mut segments = parsed.path_segments()?;
    match segments.next()? {
        "d" => segments.next().map(|s| s.to_string()),
        other if !other.is_empty() => Some(other.to_string()),
        _ => None,
    }
}

fn is_video(name: &str) -> bool {
    let lower = name.to_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_ids() {
        assert_eq!(
            content_id_from("https://gofile.io/d/AbC123").as_deref(),
            Some("AbC123")
        );
        assert!(content_id_from("https://gofile.io/").is_none());
    }

    #[test]
    fn contents_payload_filtering() {
        let raw = r#"{
            "status": "ok",
            "data": {
                "children": {
                    "a": {"type":"file","name":"Movie.2024.1080p.mkv","size":2147483648,"link":"https://store3.gofile.io/download/a/Movie.mkv"},
                    "b": {"type":"file","name":"readme.txt","size":100,"link":"https://store3.gofile.io/download/b/readme.txt"},
                    "c": {"type":"folder","name":"extras"}
                }
            }
        }"#;
        let envelope: ContentsEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.status, "ok");
        let videos: Vec<_> = envelope
            .data
            .children
            .values()
            .filter(|c| c.kind == "file" && is_video(&c.name))
            .collect();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].name, "Movie.2024.1080p.mkv");
    }
}
