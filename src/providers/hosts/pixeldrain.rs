//! pixeldrain extractor.
//!
//! The direct download URL is derivable from the file id alone; the info
//! endpoint fills in name and size when it answers in time.

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::ProviderError;
use crate::models::ExtractedLink;
use crate::providers::ProviderContext;

pub struct PixelDrain;

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[async_trait]
impl super::HostExtractor for PixelDrain {
    fn id(&self) -> &'static str {
        "pixeldrain"
    }

    fn matches(&self, host: &str) -> bool {
        host.contains("pixeldrain") || host == "pixeldra.in"
    }

    async fn extract(
        &self,
        url: &str,
        priority: i32,
        ctx: &ProviderContext,
    ) -> Result<Vec<ExtractedLink>, ProviderError> {
        let file_id = file_id_from(url).ok_or_else(|| {
            ProviderError::parse("pixeldrain", format!("no file id in {url}"))
        })?;

        let direct = format!("https://pixeldrain.com/api/file/{file_id}?download");

        // Name and size are cosmetic; a failed info call never blocks the link.
        let (label, size_bytes) = match ctx
            .fetch
            .get(
                &format!("https://pixeldrain.com/api/file/{file_id}/info"),
                ctx.cancel.clone(),
            )
            .await
        {
            Ok(response) if response.status == 200 => match response.json::<FileInfo>() {
                Ok(info) => (info.name, info.size),
                Err(_) => (String::new(), None),
            },
            _ => (String::new(), None),
        };

        Ok(vec![ExtractedLink {
            url: direct,
            label,
            size_bytes,
            priority: priority + 8,
        }])
    }
}

fn file_id_from(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    match segments.as_slice() {
        ["u", id, ..] | ["api", "file", id, ..] if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids() {
        assert_eq!(
            file_id_from("https://pixeldrain.com/u/AbC123").as_deref(),
            Some("AbC123")
        );
        assert_eq!(
            file_id_from("https://pixeldrain.com/api/file/ZZZ?download").as_deref(),
            Some("ZZZ")
        );
        assert!(file_id_from("https://pixeldrain.com/").is_none());
    }
}
