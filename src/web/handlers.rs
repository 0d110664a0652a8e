//! HTTP handlers: the discovery catalog, the on-click resolver, health.
//!
//! Handlers are thin; the interesting property is cancellation: dropping a
//! handler future (client gone) trips the request token, which aborts every
//! in-flight provider fetch at its next I/O boundary.

use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ComputeOptions, NS_RESOLVE};
use crate::models::{FinalStream, MediaKey, ResolveHints, StreamsResponse, WireStream};

use super::{opaque, AppState};

/// `GET /streams/{movie|series}/{id}[:S:E].json`
///
/// 200 always; total failure is an empty list.
pub async fn streams(State(state): State<AppState>, uri: Uri) -> Response {
    let Some((kind, id)) = parse_streams_path(uri.path()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(StreamsResponse { streams: vec![] }),
        )
            .into_response();
    };
    let Some(key) = MediaKey::parse(&kind, &id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(StreamsResponse { streams: vec![] }),
        )
            .into_response();
    };

    // Dropped on disconnect; cancels every child fetch.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let previews = state.aggregator.aggregate(&key, cancel).await;
    info!(
        kind = %kind,
        id = %id,
        count = previews.len(),
        "discovery finished"
    );

    let streams = previews.iter().map(WireStream::from).collect();
    Json(StreamsResponse { streams }).into_response()
}

/// `GET /resolve/{tag}/{opaque}`
///
/// 302 to the direct URL, 200 with a rewritten playlist for HLS, 502 on
/// any failure.
pub async fn resolve(State(state): State<AppState>, uri: Uri) -> Response {
    let Some((tag, raw_opaque)) = parse_resolve_path(uri.path()) else {
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let Some((origin_url, hints)) = opaque::unwrap(&raw_opaque) else {
        warn!(tag = %tag, "opaque segment failed to decode");
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    // Click bursts coalesce on the raw opaque string; replaying it within
    // the resolution TTL yields the same FinalStream.
    let resolver = state.resolver.clone();
    let producer_url = origin_url.clone();
    let producer_hints = hints.clone();
    let producer_cancel = cancel.child_token();
    let ttl = std::time::Duration::from_secs(state.config.cache.resolve_ttl_secs);

    let resolved: Option<FinalStream> = match state
        .cache
        .get_or_compute(
            NS_RESOLVE,
            &raw_opaque,
            ttl,
            ComputeOptions::default(),
            move || async move {
                Ok(resolver
                    .resolve(&producer_url, &producer_hints, producer_cancel)
                    .await)
            },
        )
        .await
    {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(tag = %tag, error = %e, "resolution producer failed");
            None
        }
    };

    let Some(stream) = resolved else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    if looks_like_playlist(&stream.direct_url) {
        return rewrite_playlist(&state, &tag, &stream, cancel).await;
    }

    debug!(tag = %tag, url = %stream.direct_url, "redirecting to direct url");
    (
        StatusCode::FOUND,
        [(header::LOCATION, stream.direct_url.clone())],
    )
        .into_response()
}

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Response {
    let sizes = state.cache.sizes();
    Json(serde_json::json!({
        "worker": state.worker_id,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "cache": sizes,
    }))
    .into_response()
}

fn parse_streams_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/streams/")?;
    let (kind, id) = rest.split_once('/')?;
    if kind.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((kind.to_string(), id.to_string()))
}

/// The opaque segment is taken raw off the URI so percent-encoding
/// survives exactly as the wrapper produced it.
fn parse_resolve_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/resolve/")?;
    let (tag, opaque) = rest.split_once('/')?;
    if tag.is_empty() || opaque.is_empty() {
        return None;
    }
    Some((tag.to_string(), opaque.to_string()))
}

fn looks_like_playlist(url: &str) -> bool {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase());
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// Fetch the playlist and re-wrap every child URI through `/resolve/` so
/// the player re-enters the resolver for segments and variant playlists.
async fn rewrite_playlist(
    state: &AppState,
    tag: &str,
    stream: &FinalStream,
    cancel: CancellationToken,
) -> Response {
    let response = match state
        .fetch
        .fetch(
            &stream.direct_url,
            crate::fetch::FetchOptions::with_cancel(cancel),
        )
        .await
    {
        Ok(response) if response.status == 200 => response,
        Ok(response) => {
            warn!(url = %stream.direct_url, status = response.status, "playlist fetch bad status");
            return StatusCode::BAD_GATEWAY.into_response();
        }
        Err(e) => {
            warn!(url = %stream.direct_url, error = %e, "playlist fetch failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let rewritten = match rewrite_playlist_body(
        &response.body,
        &stream.direct_url,
        &state.config.web.base_url,
        tag,
    ) {
        Some(rewritten) => rewritten,
        None => {
            warn!(url = %stream.direct_url, "playlist did not parse");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        rewritten,
    )
        .into_response()
}

/// Rewrite every URI in an M3U8 through the opaque scheme. Master and
/// media playlists both come through here.
pub(crate) fn rewrite_playlist_body(
    body: &[u8],
    playlist_url: &str,
    base_url: &str,
    tag: &str,
) -> Option<Vec<u8>> {
    let base = url::Url::parse(playlist_url).ok()?;
    let wrap_child = |uri: &str| -> String {
        let absolute = base
            .join(uri)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| uri.to_string());
        opaque::wrap(base_url, tag, &absolute, &ResolveHints::default())
    };

    match m3u8_rs::parse_playlist_res(body).ok()? {
        m3u8_rs::Playlist::MasterPlaylist(mut master) => {
            for variant in &mut master.variants {
                variant.uri = wrap_child(&variant.uri);
            }
            for alternative in &mut master.alternatives {
                if let Some(uri) = &alternative.uri {
                    alternative.uri = Some(wrap_child(uri));
                }
            }
            let mut out = Vec::new();
            master.write_to(&mut out).ok()?;
            Some(out)
        }
        m3u8_rs::Playlist::MediaPlaylist(mut media) => {
            for segment in &mut media.segments {
                segment.uri = wrap_child(&segment.uri);
            }
            let mut out = Vec::new();
            media.write_to(&mut out).ok()?;
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_streams_path("/streams/movie/tt0111161.json"),
            Some(("movie".to_string(), "tt0111161.json".to_string()))
        );
        assert!(parse_streams_path("/streams/movie/").is_none());
        assert!(parse_streams_path("/streams/movie").is_none());

        let (tag, opaque) =
            parse_resolve_path("/resolve/uhdmovies/https%3A%2F%2Fouo.io%2Fabc%23res%3D1080p")
                .unwrap();
        assert_eq!(tag, "uhdmovies");
        // percent-encoding intact
        assert!(opaque.contains("%3A%2F%2F"));
    }

    #[test]
    fn playlist_detection() {
        assert!(looks_like_playlist("https://cdn.example/stream/index.m3u8"));
        assert!(looks_like_playlist(
            "https://cdn.example/stream/index.m3u8?token=1"
        ));
        assert!(!looks_like_playlist("https://cdn.example/movie.mkv"));
    }

    #[test]
    fn media_playlist_rewrite_wraps_segments() {
        let playlist = b"#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXTINF:6.0,\n\
            seg-001.ts\n\
            #EXTINF:6.0,\n\
            https://other-cdn.example/seg-002.ts\n\
            #EXT-X-ENDLIST\n";

        let rewritten = rewrite_playlist_body(
            playlist,
            "https://cdn.example/hls/index.m3u8",
            "http://localhost:7011",
            "alpha",
        )
        .unwrap();
        let text = String::from_utf8(rewritten).unwrap();

        // relative segment absolutized against the playlist, then wrapped
        let expected_rel = opaque::wrap(
            "http://localhost:7011",
            "alpha",
            "https://cdn.example/hls/seg-001.ts",
            &ResolveHints::default(),
        );
        assert!(text.contains(&expected_rel));
        assert!(text.contains("/resolve/alpha/"));
    }

    #[test]
    fn master_playlist_rewrite_wraps_variants() {
        let playlist = b"#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=1280x720\n\
            720p/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1920x1080\n\
            1080p/index.m3u8\n";

        let rewritten = rewrite_playlist_body(
            playlist,
            "https://cdn.example/hls/master.m3u8",
            "http://localhost:7011",
            "alpha",
        )
        .unwrap();
        let text = String::from_utf8(rewritten).unwrap();
        assert_eq!(text.matches("/resolve/alpha/").count(), 2);
    }
}
