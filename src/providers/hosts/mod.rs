//! Terminal file-host extractors.
//!
//! A host extractor implements one host's decrypt / API dance and yields
//! prioritized direct-download candidates. The registry matches on the URL
//! host so the resolver can treat every terminal host uniformly.

pub mod filesdl;
pub mod gdflix;
pub mod gofile;
pub mod pixeldrain;

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::ProviderError;
use crate::models::ExtractedLink;
use crate::utils;

use super::ProviderContext;

#[async_trait]
pub trait HostExtractor: Send + Sync {
    fn id(&self) -> &'static str;

    /// Whether this extractor handles the given URL host.
    fn matches(&self, host: &str) -> bool;

    /// Walk the host's page or API into direct candidates. `priority` is
    /// the base the caller assigned; extractors add their own offsets.
    async fn extract(
        &self,
        url: &str,
        priority: i32,
        ctx: &ProviderContext,
    ) -> Result<Vec<ExtractedLink>, ProviderError>;
}

pub struct HostRegistry {
    extractors: Vec<Arc<dyn HostExtractor>>,
}

impl HostRegistry {
    pub fn standard() -> Self {
        Self {
            extractors: vec![
                Arc::new(gdflix::GdFlix),
                Arc::new(filesdl::FilesDl),
                Arc::new(gofile::GoFile),
                Arc::new(pixeldrain::PixelDrain),
            ],
        }
    }

    pub fn for_url(&self, url: &str) -> Option<Arc<dyn HostExtractor>> {
        let host = utils::domain_of(url)?;
        self.extractors
            .iter()
            .find(|extractor| extractor.matches(&host))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_by_host() {
        let registry = HostRegistry::standard();
        assert_eq!(
            registry
                .for_url("https://new.gdflix.dad/file/abc")
                .unwrap()
                .id(),
            "gdflix"
        );
        assert_eq!(
            registry
                .for_url("https://pixeldrain.com/u/xyz")
                .unwrap()
                .id(),
            "pixeldrain"
        );
        assert_eq!(
            registry.for_url("https://gofile.io/d/abc").unwrap().id(),
            "gofile"
        );
        assert!(registry.for_url("https://unknown.example/x").is_none());
        assert!(registry.for_url("garbage").is_none());
    }
}
