//! MetaService client.
//!
//! Resolves a media id to its display metadata (title, year, alternative
//! titles) through the cache fabric: TTL one hour, stale-while-revalidate
//! allowed, negative results cached so unknown ids do not hammer the
//! service.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheFabric, ComputeOptions, NS_META};
use crate::config::MetaConfig;
use crate::errors::CacheError;
use crate::fetch::{FetchClient, FetchOptions};
use crate::models::{MediaKey, MediaKind, Metadata};

#[derive(Clone)]
pub struct MetaClient {
    fetch: FetchClient,
    cache: CacheFabric,
    config: MetaConfig,
    ttl: Duration,
}

#[derive(Debug, serde::Deserialize)]
struct MetaEnvelope {
    meta: WireMeta,
}

#[derive(Debug, serde::Deserialize)]
struct WireMeta {
    name: String,
    #[serde(default)]
    year: Option<serde_json::Value>,
    #[serde(rename = "originalTitle", default)]
    original_title: Option<String>,
    #[serde(rename = "alternativeTitles", default)]
    alternative_titles: Vec<String>,
}

impl MetaClient {
    pub fn new(fetch: FetchClient, cache: CacheFabric, config: &MetaConfig, ttl: Duration) -> Self {
        Self {
            fetch,
            cache,
            config: config.clone(),
            ttl,
        }
    }

    /// The catalog keys episode lookups by their series id.
    fn catalog_kind(key: &MediaKey) -> &'static str {
        match key.kind {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "series",
        }
    }

    pub async fn get(
        &self,
        key: &MediaKey,
        cancel: CancellationToken,
    ) -> Result<Option<Metadata>, CacheError> {
        let kind = Self::catalog_kind(key);
        let cache_key = format!("{kind}:{}", key.external_id);

        let fetch = self.fetch.clone();
        let url = format!(
            "{}/meta/{kind}/{}.json",
            self.config.base_url.trim_end_matches('/'),
            key.external_id
        );
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let retries = self.config.retries;

        self.cache
            .get_or_compute(
                NS_META,
                &cache_key,
                self.ttl,
                ComputeOptions::default(),
                move || async move {
                    debug!(url = %url, "fetching metadata");
                    let response = fetch
                        .fetch(
                            &url,
                            FetchOptions {
                                timeout: Some(timeout),
                                retries: Some(retries),
                                cancel,
                                use_cookies: false,
                                ..FetchOptions::default()
                            },
                        )
                        .await
                        .map_err(|e| e.to_string())?;

                    if response.status == 404 {
                        return Ok(None);
                    }
                    if response.status != 200 {
                        return Err(format!("meta service returned {}", response.status));
                    }

                    let envelope: MetaEnvelope =
                        response.json().map_err(|e| format!("bad meta payload: {e}"))?;
                    Ok(Some(normalize(envelope.meta)))
                },
            )
            .await
    }
}

fn normalize(wire: WireMeta) -> Metadata {
    Metadata {
        name: wire.name,
        year: wire.year.as_ref().and_then(coerce_year),
        original_title: wire.original_title,
        alternative_titles: wire.alternative_titles,
    }
}

/// The catalog serves years as numbers or strings like "2008-2013".
fn coerce_year(value: &serde_json::Value) -> Option<u16> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|y| u16::try_from(y).ok()),
        serde_json::Value::String(s) => {
            let leading: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
            leading.parse().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_meta_year_forms() {
        let numeric: MetaEnvelope =
            serde_json::from_str(r#"{"meta":{"name":"The Shawshank Redemption","year":1994}}"#)
                .unwrap();
        assert_eq!(normalize(numeric.meta).year, Some(1994));

        let range: MetaEnvelope =
            serde_json::from_str(r#"{"meta":{"name":"Game of Thrones","year":"2011-2019"}}"#)
                .unwrap();
        let normalized = normalize(range.meta);
        assert_eq!(normalized.year, Some(2011));
        assert!(normalized.alternative_titles.is_empty());

        let missing: MetaEnvelope =
            serde_json::from_str(r#"{"meta":{"name":"Unknown"}}"#).unwrap();
        assert_eq!(normalize(missing.meta).year, None);
    }
}
