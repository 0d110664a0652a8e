//! Resolve hints carried in the opaque URL's hash fragment.
//!
//! The fragment (`ep=S01E02&res=1080p&host=pixeldrain`) carries just enough
//! state for the resolver to narrow the chain without re-running discovery.
//! The encoding is stable across versions.

use serde::{Deserialize, Serialize};

use super::ResolutionTag;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveHints {
    /// `SxxExx` episode key
    pub episode: Option<String>,
    pub resolution: Option<ResolutionTag>,
    /// Preferred terminal host (`pixeldrain`, `gofile`, ...)
    pub host: Option<String>,
}

impl ResolveHints {
    pub fn is_empty(&self) -> bool {
        self.episode.is_none() && self.resolution.is_none() && self.host.is_none()
    }

    /// Render as a hash-fragment query string. Empty hints render empty.
    pub fn to_fragment(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ep) = &self.episode {
            parts.push(format!("ep={ep}"));
        }
        if let Some(res) = self.resolution {
            parts.push(format!("res={}", res.as_str()));
        }
        if let Some(host) = &self.host {
            parts.push(format!("host={host}"));
        }
        parts.join("&")
    }

    /// Parse a hash-fragment query string; unknown keys are ignored.
    pub fn from_fragment(fragment: &str) -> Self {
        let mut hints = Self::default();
        for pair in fragment.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "ep" => hints.episode = Some(value.to_string()),
                "res" => hints.resolution = ResolutionTag::parse(value),
                "host" => hints.host = Some(value.to_string()),
                _ => {}
            }
        }
        hints
    }

    /// Split a raw URL into `(url-without-fragment, parsed hints)`.
    pub fn split_url(raw: &str) -> (String, Self) {
        match raw.split_once('#') {
            Some((url, fragment)) => (url.to_string(), Self::from_fragment(fragment)),
            None => (raw.to_string(), Self::default()),
        }
    }

    /// Append these hints to a URL as a hash fragment.
    pub fn attach(&self, url: &str) -> String {
        if self.is_empty() {
            url.to_string()
        } else {
            format!("{url}#{}", self.to_fragment())
        }
    }
}
