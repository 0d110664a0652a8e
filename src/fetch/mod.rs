//! Bounded, retried, cancellable HTTP fetcher.
//!
//! All outbound provider traffic goes through `FetchClient`. Redirects are
//! followed manually so every hop observes the request's cancellation token
//! and merges its `Set-Cookie` headers; body reads are streamed against a
//! hard cap because scraped hosts can serve multi-gigabyte files where an
//! HTML page is expected.

pub mod probe;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::config::FetchConfig;
use crate::cookies::CookieJarService;
use crate::errors::FetchError;
use crate::utils;

/// Challenge marker strings looked for in 403/429/5xx bodies.
const CHALLENGE_MARKERS: [&str; 6] = [
    "cf-browser-verification",
    "just a moment",
    "checking your browser",
    "challenge-platform",
    "__cf_chl",
    "enable javascript and cookies to continue",
];

/// True when a response looks like an anti-bot interstitial.
pub fn is_challenge(status: u16, body: &str) -> bool {
    if status != 403 && status != 429 && !(500..600).contains(&status) {
        return false;
    }
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub follow_redirects: bool,
    pub max_redirects: Option<usize>,
    pub max_body_bytes: Option<usize>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub cancel: CancellationToken,
    /// Inject and collect cookies through the jar service
    pub use_cookies: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            follow_redirects: true,
            max_redirects: None,
            max_body_bytes: None,
            timeout: None,
            retries: None,
            cancel: CancellationToken::new(),
            use_cookies: true,
        }
    }
}

impl FetchOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn post_form(cancel: CancellationToken, body: String) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            cancel,
            ..Self::default()
        }
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL after the redirect chain, for resolving relative links
    pub final_url: String,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Lazily parse the body as HTML. The handle is not `Send`; query it in
    /// a synchronous scope and extract owned data before the next await.
    pub fn document(&self) -> scraper::Html {
        scraper::Html::parse_document(&self.text())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_challenge(&self) -> bool {
        is_challenge(self.status, &self.text())
    }
}

#[derive(Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    config: FetchConfig,
    jars: CookieJarService,
}

impl FetchClient {
    pub fn new(config: &FetchConfig, jars: CookieJarService) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .gzip(true);

        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
            config: config.clone(),
            jars,
        })
    }

    pub fn jars(&self) -> &CookieJarService {
        &self.jars
    }

    /// Convenience GET with default options.
    pub async fn get(&self, url: &str, cancel: CancellationToken) -> Result<FetchResponse, FetchError> {
        self.fetch(url, FetchOptions::with_cancel(cancel)).await
    }

    /// One fetch with retries. Retries fire only for network/timeout
    /// classes with exponential backoff and jitter; 4xx is final.
    pub async fn fetch(&self, url: &str, opts: FetchOptions) -> Result<FetchResponse, FetchError> {
        let retries = opts.retries.unwrap_or(self.config.retries);
        let mut attempt: u32 = 0;

        loop {
            match self.fetch_once(url, &opts).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(1 << (attempt - 1)),
                    );
                    let backoff = utils::with_jitter(backoff, 0.2);
                    debug!(url, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying fetch");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = opts.cancel.cancelled() => {
                            return Err(FetchError::Canceled { url: url.to_string() });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: manual redirect walk, bounded body read.
    async fn fetch_once(&self, url: &str, opts: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let timeout = opts.timeout.unwrap_or(Duration::from_secs(self.config.timeout_secs));
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;
        let max_redirects = opts.max_redirects.unwrap_or(self.config.max_redirects);
        let max_body = opts.max_body_bytes.unwrap_or(self.config.max_body_bytes);

        let mut current = Url::parse(url)?;
        let mut method = opts.method.clone();
        let mut body = opts.body.clone();
        let mut hops = 0usize;

        loop {
            let response = self
                .send_one(&current, &method, body.as_deref(), opts, deadline, timeout_ms)
                .await?;

            if opts.use_cookies {
                if let Some(host) = current.host_str() {
                    self.jars.merge_response(host, response.headers()).await;
                }
            }

            let status = response.status();
            if opts.follow_redirects && status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let Some(location) = location else {
                    // Redirect status without a target; hand it to the caller.
                    return self
                        .read_body(response, &current, max_body, opts, deadline, timeout_ms)
                        .await;
                };

                hops += 1;
                if hops > max_redirects {
                    return Err(FetchError::TooManyRedirects {
                        url: url.to_string(),
                        max: max_redirects,
                    });
                }

                let next = current
                    .join(&location)
                    .map_err(FetchError::InvalidUrl)?;
                trace!(from = %current, to = %next, hop = hops, "following redirect");

                // 303 (and the browsers' 301/302-on-POST behavior) demotes to GET.
                if status == reqwest::StatusCode::SEE_OTHER
                    || (method == Method::POST
                        && (status == reqwest::StatusCode::MOVED_PERMANENTLY
                            || status == reqwest::StatusCode::FOUND))
                {
                    method = Method::GET;
                    body = None;
                }
                current = next;
                continue;
            }

            return self
                .read_body(response, &current, max_body, opts, deadline, timeout_ms)
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_one(
        &self,
        url: &Url,
        method: &Method,
        body: Option<&str>,
        opts: &FetchOptions,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<reqwest::Response, FetchError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &opts.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) else {
                debug!(key, "skipping invalid header");
                continue;
            };
            headers.insert(name, value);
        }

        if opts.use_cookies {
            if let Some(host) = url.host_str() {
                if let Some(jar) = self.jars.load(host).await {
                    if let Some(cookie_header) = jar.cookie_header() {
                        if let Ok(value) = HeaderValue::from_str(&cookie_header) {
                            headers.insert(reqwest::header::COOKIE, value);
                        }
                    }
                    // The clearance is bound to the solving browser's UA.
                    if let Some(ua) = jar.user_agent {
                        if let Ok(value) = HeaderValue::from_str(&ua) {
                            headers.insert(reqwest::header::USER_AGENT, value);
                        }
                    }
                }
            }
        }

        let mut request = self.client.request(method.clone(), url.clone()).headers(headers);
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let send = request.send();
        tokio::select! {
            _ = opts.cancel.cancelled() => Err(FetchError::Canceled { url: url.to_string() }),
            result = tokio::time::timeout_at(deadline, send) => match result {
                Err(_) => Err(FetchError::Timeout {
                    url: url.to_string(),
                    millis: timeout_ms,
                }),
                Ok(Err(e)) => Err(classify_reqwest_error(url.as_str(), e)),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }

    /// Stream the body against the cap. The response (and with it the
    /// transport stream) is dropped the moment the cap is crossed.
    async fn read_body(
        &self,
        response: reqwest::Response,
        url: &Url,
        max_body: usize,
        opts: &FetchOptions,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<FetchResponse, FetchError> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().to_string();

        if let Some(advertised) = response.content_length() {
            if advertised as usize > max_body {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: max_body,
                });
            }
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = opts.cancel.cancelled() => {
                    return Err(FetchError::Canceled { url: url.to_string() });
                }
                result = tokio::time::timeout_at(deadline, stream.next()) => match result {
                    Err(_) => {
                        return Err(FetchError::Timeout {
                            url: url.to_string(),
                            millis: timeout_ms,
                        });
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        return Err(FetchError::network(format!("body read failed: {e}")));
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                },
            };

            if buffer.len() + chunk.len() > max_body {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: max_body,
                });
            }
            buffer.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: Bytes::from(buffer),
            final_url,
        })
    }
}

fn classify_reqwest_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            millis: 0,
        }
    } else {
        FetchError::network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheFabric, KvStore};
    use crate::config::{CacheConfig, DatabaseConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn client() -> FetchClient {
        let store = KvStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .unwrap();
        let fabric = CacheFabric::new(store, &CacheConfig::default());
        let jars = CookieJarService::new(fabric, Duration::from_secs(1500));
        FetchClient::new(&FetchConfig::default(), jars).unwrap()
    }

    /// Serve each scripted raw HTTP/1.1 response to one connection, in order.
    async fn spawn_server(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = hits.clone();

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                hits_inner.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn response_with_body(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn fetch_reads_small_body() {
        let (base, _) = spawn_server(vec![response_with_body("<html>ok</html>")]).await;
        let client = client().await;

        let response = client.get(&base, CancellationToken::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "<html>ok</html>");
    }

    #[tokio::test]
    async fn advertised_oversize_body_is_rejected_without_reading() {
        let huge = "HTTP/1.1 200 OK\r\nContent-Length: 9999999999\r\nConnection: close\r\n\r\n"
            .to_string();
        let (base, _) = spawn_server(vec![huge]).await;
        let client = client().await;

        let err = client.get(&base, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::BodyTooLarge { .. }));
    }

    #[tokio::test]
    async fn streamed_oversize_body_is_capped() {
        // Chunked response that would stream forever without the cap.
        let body = "x".repeat(64 * 1024);
        let mut response = String::from(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        );
        for _ in 0..8 {
            response.push_str(&format!("{:x}\r\n{}\r\n", body.len(), body));
        }
        response.push_str("0\r\n\r\n");
        let (base, _) = spawn_server(vec![response]).await;
        let client = client().await;

        let err = client
            .fetch(
                &base,
                FetchOptions {
                    max_body_bytes: Some(100 * 1024),
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BodyTooLarge { limit, .. } if limit == 100 * 1024));
    }

    #[tokio::test]
    async fn redirects_are_followed_and_final_url_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // hop 1: redirect to /target
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    format!(
                        "HTTP/1.1 302 Found\r\nLocation: http://{addr}/target\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    )
                    .as_bytes(),
                )
                .await;
            drop(socket);
            // hop 2: final page
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(response_with_body("arrived").as_bytes())
                .await;
        });

        let client = client().await;
        let response = client
            .get(&format!("http://{addr}/start"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "arrived");
        assert!(response.final_url.ends_with("/target"));
    }

    #[tokio::test]
    async fn http_status_is_not_retried() {
        let not_found = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string();
        let (base, hits) = spawn_server(vec![not_found.clone(), not_found]).await;
        let client = client().await;

        let response = client
            .fetch(
                &base,
                FetchOptions {
                    retries: Some(1),
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap();
        // 4xx is returned as a response, exactly one connection was made
        assert_eq!(response.status, 404);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        // Server that accepts and never responds.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = client().await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = client
            .get(&format!("http://{addr}/"), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Canceled { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn challenge_markers() {
        assert!(is_challenge(403, "<title>Just a moment...</title>"));
        assert!(is_challenge(503, "checking your browser before accessing"));
        assert!(!is_challenge(200, "Just a moment"));
        assert!(!is_challenge(403, "plain forbidden"));
    }
}
