//! Core data model: media identity, discovery and resolution link shapes.
//!
//! Every external response is normalized into these well-typed variants;
//! nothing downstream of a provider adapter handles raw provider JSON.

use serde::{Deserialize, Serialize};

pub mod hints;

pub use hints::ResolveHints;

/// Kind of media a lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Episode,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Episode => "episode",
        }
    }
}

/// Identity for any lookup; equality defines the cache key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaKey {
    pub kind: MediaKind,
    pub external_id: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl MediaKey {
    pub fn movie<S: Into<String>>(external_id: S) -> Self {
        Self {
            kind: MediaKind::Movie,
            external_id: external_id.into(),
            season: None,
            episode: None,
        }
    }

    pub fn episode<S: Into<String>>(external_id: S, season: u32, episode: u32) -> Self {
        Self {
            kind: MediaKind::Episode,
            external_id: external_id.into(),
            season: Some(season),
            episode: Some(episode),
        }
    }

    /// Parse a player-facing path id: `tt0111161` or `tt0944947:1:2`.
    ///
    /// The URL-path kind (`movie`/`series`) decides movie vs episode; an id
    /// without season/episode under `series` is rejected.
    pub fn parse(kind_segment: &str, id: &str) -> Option<Self> {
        let id = id.strip_suffix(".json").unwrap_or(id);
        let mut parts = id.split(':');
        let external_id = parts.next()?.trim();
        if external_id.is_empty() {
            return None;
        }

        match kind_segment {
            "movie" => Some(Self::movie(external_id)),
            "series" | "episode" => {
                let season = parts.next()?.parse().ok()?;
                let episode = parts.next()?.parse().ok()?;
                Some(Self::episode(external_id, season, episode))
            }
            _ => None,
        }
    }

    /// Structural cache key prefix: `{provider}:{kind}:{externalId}[:S:E]`.
    pub fn cache_key(&self, provider: &str) -> String {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => format!(
                "{}:{}:{}:{}:{}",
                provider,
                self.kind.as_str(),
                self.external_id,
                s,
                e
            ),
            _ => format!("{}:{}:{}", provider, self.kind.as_str(), self.external_id),
        }
    }

    /// `SxxExx` rendering used in hints and provider episode matching.
    pub fn episode_tag(&self) -> Option<String> {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => Some(format!("S{:02}E{:02}", s, e)),
            _ => None,
        }
    }
}

/// Metadata produced by the MetaService; immutable per key for the cache TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub alternative_titles: Vec<String>,
}

/// Video resolution classes recognized in provider labels and hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTag {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
    Unknown,
}

impl ResolutionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::P2160 => "2160p",
            Self::Unknown => "unknown",
        }
    }

    /// Best-effort detection from a free-form label or filename.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("2160") || lower.contains("4k") || lower.contains("uhd") {
            Self::P2160
        } else if lower.contains("1080") {
            Self::P1080
        } else if lower.contains("720") {
            Self::P720
        } else if lower.contains("480") {
            Self::P480
        } else {
            Self::Unknown
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "480p" => Some(Self::P480),
            "720p" => Some(Self::P720),
            "1080p" => Some(Self::P1080),
            "2160p" => Some(Self::P2160),
            _ => None,
        }
    }
}

/// Ordered host preference used when ranking intermediary candidates.
///
/// Derive order is declaration order, so `CdnDirect` sorts before
/// `ShareableCloud`; lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HostPreference {
    /// Direct CDN URL, no further dance
    CdnDirect,
    /// Wrapper page that exposes a direct link (gdflix-style)
    WrapperWithDirect,
    /// Wrapper that typically sits behind a challenge (filesdl watch/cloud)
    WrapperRequiringSolve,
    /// Shareable cloud storage (gofile-style), slowest path
    ShareableCloud,
}

impl HostPreference {
    /// Classify a URL into the preference ladder.
    pub fn of(url: &str) -> Self {
        let host = crate::utils::domain_of(url).unwrap_or_default();
        let lower = url.to_lowercase();
        if host.ends_with("workers.dev")
            || host.ends_with("r2.dev")
            || lower.ends_with(".mkv")
            || lower.ends_with(".mp4")
            || lower.ends_with(".m3u8")
        {
            Self::CdnDirect
        } else if host.contains("gdflix") {
            Self::WrapperWithDirect
        } else if host.contains("filesdl") {
            // `/watch` pages rank above `/cloud` mirrors of the same host;
            // both sit in the solve tier.
            Self::WrapperRequiringSolve
        } else if host.contains("gofile") {
            Self::ShareableCloud
        } else {
            Self::WrapperRequiringSolve
        }
    }
}

/// Provider-native link produced during discovery.
///
/// This is the tagged, well-typed shape every heterogeneous provider
/// envelope collapses into.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderLink {
    pub url: String,
    pub label: String,
    #[serde(default)]
    pub resolution: Option<ResolutionTag>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub languages: Vec<String>,
    /// `SxxExx` the link belongs to, when the provider lists whole seasons
    #[serde(default)]
    pub episode_hint: Option<String>,
    /// Preferred terminal host, carried into the opaque URL hints
    #[serde(default)]
    pub host_hint: Option<String>,
    /// Provider-assigned ranking; higher wins inside a provider
    #[serde(default)]
    pub priority: i32,
    /// Stable fingerprint for the cache merge rule, when the provider has one
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// A discovery-phase link handed to the player, wrapped through `/resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewStream {
    pub provider: String,
    pub opaque_url: String,
    pub display_label: String,
    pub resolution: ResolutionTag,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub languages: Vec<String>,
    pub needs_resolution: bool,
    /// Opaque query state (episode key, resolution, preferred host)
    pub hints: String,
}

/// A resolved, playable link.
///
/// Never constructed from a candidate that failed the range probe, except
/// for hosts on the trusted allowlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStream {
    pub direct_url: String,
    pub seekable: bool,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
}

/// One search hit from a provider's search operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub year: Option<u16>,
}

/// A loaded provider detail page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedPage {
    pub title: String,
    #[serde(default)]
    pub year: Option<u16>,
    pub download_links: Vec<ProviderLink>,
}

/// Candidate produced by a host extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedLink {
    pub url: String,
    pub label: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub priority: i32,
}

/// Player-facing stream list wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsResponse {
    pub streams: Vec<WireStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireStream {
    pub name: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "behaviorHints", skip_serializing_if = "Option::is_none")]
    pub behavior_hints: Option<serde_json::Value>,
}

impl From<&PreviewStream> for WireStream {
    fn from(p: &PreviewStream) -> Self {
        let mut title = p.display_label.clone();
        if let Some(size) = p.size_bytes {
            title.push_str(&format!("\n{}", crate::utils::human_size(size)));
        }
        if !p.languages.is_empty() {
            title.push_str(&format!("\n{}", p.languages.join(" / ")));
        }
        Self {
            name: format!("[{}] {}", p.provider, p.resolution.as_str()),
            title,
            url: p.opaque_url.clone(),
            behavior_hints: p.needs_resolution.then(|| {
                serde_json::json!({
                    "notWebReady": true,
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_key_cache_prefix() {
        let movie = MediaKey::movie("tt0111161");
        assert_eq!(movie.cache_key("moviesdrive"), "moviesdrive:movie:tt0111161");

        let ep = MediaKey::episode("tt0944947", 1, 2);
        assert_eq!(ep.cache_key("uhdmovies"), "uhdmovies:episode:tt0944947:1:2");
        assert_eq!(ep.episode_tag().as_deref(), Some("S01E02"));
    }

    #[test]
    fn media_key_parse_path_forms() {
        let movie = MediaKey::parse("movie", "tt0111161.json").unwrap();
        assert_eq!(movie.kind, MediaKind::Movie);
        assert_eq!(movie.external_id, "tt0111161");

        let ep = MediaKey::parse("series", "tt0944947:3:9.json").unwrap();
        assert_eq!(ep.kind, MediaKind::Episode);
        assert_eq!(ep.season, Some(3));
        assert_eq!(ep.episode, Some(9));

        assert!(MediaKey::parse("series", "tt0944947").is_none());
        assert!(MediaKey::parse("album", "x").is_none());
        assert!(MediaKey::parse("movie", ".json").is_none());
    }

    #[test]
    fn resolution_detection() {
        assert_eq!(ResolutionTag::from_label("Show.S01.2160p.WEB-DL"), ResolutionTag::P2160);
        assert_eq!(ResolutionTag::from_label("Movie 1080P x265"), ResolutionTag::P1080);
        assert_eq!(ResolutionTag::from_label("4K HDR remux"), ResolutionTag::P2160);
        assert_eq!(ResolutionTag::from_label("plain label"), ResolutionTag::Unknown);
    }

    #[test]
    fn host_preference_ladder() {
        assert!(HostPreference::of("https://pub.r2.dev/file.mkv") < HostPreference::of("https://new.gdflix.dad/file/1"));
        assert!(
            HostPreference::of("https://new.gdflix.dad/file/1")
                < HostPreference::of("https://filesdl.in/watch/abc")
        );
        assert!(
            HostPreference::of("https://filesdl.site/cloud/abc")
                < HostPreference::of("https://gofile.io/d/abc")
        );
    }
}
