//! The opaque URL scheme.
//!
//! `{base}/resolve/{tag}/{urlencode(origUrl#hints)}?provider={tag}`, where
//! the hash fragment carries episode, resolution and preferred-host hints
//! so the resolver can skip discovery. The scheme is stable across
//! versions; `unwrap(wrap(u, hints)) == (u, hints)` always holds.

use crate::models::ResolveHints;

/// Wrap an origin URL (plus hints) into the player-facing resolve URL.
pub fn wrap(base_url: &str, provider_tag: &str, origin_url: &str, hints: &ResolveHints) -> String {
    let carrying = hints.attach(origin_url);
    format!(
        "{}/resolve/{}/{}?provider={}",
        base_url.trim_end_matches('/'),
        provider_tag,
        urlencoding::encode(&carrying),
        provider_tag,
    )
}

/// Decode the opaque path segment back into `(origin URL, hints)`.
pub fn unwrap(opaque: &str) -> Option<(String, ResolveHints)> {
    let decoded = urlencoding::decode(opaque).ok()?;
    let (url, hints) = ResolveHints::split_url(&decoded);
    if url.is_empty() {
        return None;
    }
    Some((url, hints))
}
