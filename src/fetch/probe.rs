//! Range-request seekability probe.
//!
//! A candidate URL is only playable if the host answers `Range: bytes=0-1`
//! with a real 206. Hosts on the trusted allowlist skip the I/O entirely,
//! but the non-video classifier always wins: an archive extension visible
//! in the URL or `Content-Disposition` rejects the candidate even on a
//! trusted host.

use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ResolverConfig;
use crate::utils;

const ARCHIVE_EXTENSIONS: [&str; 7] = [".zip", ".rar", ".7z", ".iso", ".tar", ".gz", ".tgz"];

const ARCHIVE_CONTENT_TYPES: [&str; 5] = [
    "application/zip",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/x-iso9660-image",
];

/// Probe classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekProbe {
    /// 206 with a valid `Content-Range`, or a trusted host
    Seekable {
        filename: Option<String>,
        content_length: Option<u64>,
        trusted: bool,
    },
    /// 200 but no partial support; the caller decides whether to accept
    Unseekable {
        filename: Option<String>,
        content_length: Option<u64>,
    },
    /// Archive or otherwise non-playable content
    NonVideo { filename: Option<String> },
    /// Anything else, with the observed status when there was one
    Invalid { status: Option<u16> },
}

impl SeekProbe {
    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::Seekable { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Reject `Unseekable` outcomes instead of passing them to the caller
    pub require_partial_content: bool,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            require_partial_content: true,
            timeout: Duration::from_secs(6),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone)]
pub struct SeekProber {
    client: reqwest::Client,
    trusted_hosts: Vec<String>,
    timeout: Duration,
}

impl SeekProber {
    pub fn new(config: &ResolverConfig, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self {
            client,
            trusted_hosts: config.trusted_hosts.clone(),
            timeout: Duration::from_secs(config.probe_timeout_secs),
        })
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        let Some(host) = utils::domain_of(url) else {
            return false;
        };
        self.trusted_hosts
            .iter()
            .any(|trusted| utils::host_matches(&host, trusted))
    }

    /// Probe a URL. Network failures classify as `Invalid` so callers can
    /// treat the result uniformly as accept/reject.
    pub async fn probe(&self, url: &str, opts: &ProbeOptions) -> SeekProbe {
        // Archive visible without I/O rejects first, even for trusted hosts.
        if let Some(name) = archive_name_in_path(url) {
            debug!(url, "probe rejected archive by url path");
            return SeekProbe::NonVideo {
                filename: Some(name),
            };
        }

        if self.is_trusted(url) {
            trace!(url, "trusted host, probe skipped");
            return SeekProbe::Seekable {
                filename: None,
                content_length: None,
                trusted: true,
            };
        }

        let request = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-1")
            .timeout(opts.timeout.min(self.timeout).max(Duration::from_secs(1)));

        let response = tokio::select! {
            _ = opts.cancel.cancelled() => return SeekProbe::Invalid { status: None },
            result = request.send() => match result {
                Ok(response) => response,
                Err(e) => {
                    debug!(url, error = %e, "probe transport failure");
                    return SeekProbe::Invalid { status: None };
                }
            },
        };

        let probe = classify(response.status().as_u16(), response.headers());
        match (&probe, opts.require_partial_content) {
            (SeekProbe::Unseekable { .. }, true) => SeekProbe::Invalid {
                status: Some(response.status().as_u16()),
            },
            _ => probe,
        }
    }
}

/// Pure classification of a probe response.
pub fn classify(status: u16, headers: &HeaderMap) -> SeekProbe {
    let filename = filename_from_disposition(headers);
    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    // Non-video classification wins over everything else.
    let archive_by_name = filename.as_deref().map(is_archive_name).unwrap_or(false);
    let archive_by_type = ARCHIVE_CONTENT_TYPES
        .iter()
        .any(|t| content_type.starts_with(t));
    if archive_by_name || archive_by_type {
        return SeekProbe::NonVideo { filename };
    }

    let content_length = total_length(headers);

    if status == 206 {
        let has_range = headers.contains_key(reqwest::header::CONTENT_RANGE);
        if has_range && content_length.map(|l| l >= 2).unwrap_or(false) {
            return SeekProbe::Seekable {
                filename,
                content_length,
                trusted: false,
            };
        }
        return SeekProbe::Invalid {
            status: Some(status),
        };
    }

    if status == 200 {
        return SeekProbe::Unseekable {
            filename,
            content_length,
        };
    }

    SeekProbe::Invalid {
        status: Some(status),
    }
}

/// Total size: the `Content-Range` total when present, else `Content-Length`.
fn total_length(headers: &HeaderMap) -> Option<u64> {
    if let Some(range) = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        // "bytes 0-1/12345"
        if let Some(total) = range.rsplit('/').next() {
            if let Ok(total) = total.trim().parse() {
                return Some(total);
            }
        }
    }
    headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Filename out of `Content-Disposition`, both quoted and RFC 5987 forms.
pub fn filename_from_disposition(headers: &HeaderMap) -> Option<String> {
    let disposition = headers
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())?;

    for part in disposition.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            let value = value.trim_matches('"');
            let value = value.rsplit("''").next().unwrap_or(value);
            if let Ok(decoded) = urlencoding::decode(value) {
                return Some(decoded.into_owned());
            }
            return Some(value.to_string());
        }
        if let Some(value) = part.strip_prefix("filename=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

fn is_archive_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Archive extension visible in a URL path, ignoring the query string.
fn archive_name_in_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let path = parsed.path();
    let name = path.rsplit('/').next().unwrap_or(path);
    if is_archive_name(name) {
        Some(name.to_string())
    } else {
        None
    }
}
