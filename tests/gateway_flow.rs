//! Gateway-level flows: challenge clearance reuse and resolution caching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use streamgate::cache::{CacheFabric, KvStore};
use streamgate::config::{CacheConfig, Config, DatabaseConfig, FetchConfig, SolverConfig};
use streamgate::cookies::CookieJarService;
use streamgate::fetch::FetchClient;
use streamgate::providers::ProviderContext;
use streamgate::solver::CfSolver;
use streamgate::web::{build_router, AppState};

/// Server that routes on (path, cookies) and counts hits.
async fn spawn_site<F>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&str, &str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_inner = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            hits_inner.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 16384];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            let path = head
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/")
                .to_string();
            let cookies = head
                .lines()
                .find(|line| line.to_lowercase().starts_with("cookie:"))
                .unwrap_or("")
                .to_string();
            let response = handler(&path, &cookies);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), hits)
}

fn html(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn forbidden_challenge() -> String {
    let body = "<html><title>Just a moment...</title>cf-browser-verification</html>";
    format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn json(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// A challenged provider: 403 with markers until the clearance cookie is
/// presented, then real content. The solver grants the cookie; afterwards
/// direct fetches must succeed without the solver.
#[tokio::test]
async fn challenge_cleared_then_cookie_reused_without_solver() {
    let (provider_base, _provider_hits) = spawn_site(|_path, cookies| {
        if cookies.contains("cf_clearance=tok123") {
            html("<html>real catalog</html>")
        } else {
            forbidden_challenge()
        }
    })
    .await;

    let solver_calls = Arc::new(AtomicUsize::new(0));
    let solver_calls_inner = solver_calls.clone();
    let (solver_base, _) = spawn_site(move |_path, _cookies| {
        let call = solver_calls_inner.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            json(r#"{"status":"ok","session":"session:127.0.0.1"}"#)
        } else {
            json(
                r#"{
                    "status": "ok",
                    "solution": {
                        "url": "http://upstream/page",
                        "status": 200,
                        "response": "<html>solved page</html>",
                        "cookies": [{"name":"cf_clearance","value":"tok123"}],
                        "userAgent": "Solver-UA"
                    }
                }"#,
            )
        }
    })
    .await;

    let store = KvStore::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap();
    let fabric = CacheFabric::new(store, &CacheConfig::default());
    let jars = CookieJarService::new(fabric, Duration::from_secs(25 * 60));
    let fetch = FetchClient::new(&FetchConfig::default(), jars.clone()).unwrap();
    let solver = CfSolver::new(
        &SolverConfig {
            url: Some(solver_base),
            session_ttl_secs: 600,
            max_timeout_ms: 5_000,
        },
        jars.clone(),
    )
    .unwrap();

    let ctx = ProviderContext {
        fetch: fetch.clone(),
        solver,
        cancel: CancellationToken::new(),
        solver_first: false,
        origin: "test-provider".to_string(),
    };

    // First page load observes the challenge and escalates to the solver.
    let url = format!("{provider_base}/catalog");
    let page = ctx.fetch_page(&url).await.unwrap();
    assert!(page.via_solver);
    assert!(page.body.contains("solved page"));
    // sessions.create + request.get
    assert_eq!(solver_calls.load(Ordering::SeqCst), 2);

    // The clearance is now in the jar: a direct fetch succeeds and the
    // solver is not consulted again.
    let page = ctx.fetch_page(&url).await.unwrap();
    assert!(!page.via_solver);
    assert!(page.body.contains("real catalog"));
    assert_eq!(solver_calls.load(Ordering::SeqCst), 2);

    let jar = jars.load("127.0.0.1").await.unwrap();
    assert!(jar.has_clearance());
}

/// Scenario: resolve of a wrapper whose best mirror is on a trusted CDN.
/// First click walks the chain; the second click is served from the
/// resolution cache with zero outbound HTTP.
#[tokio::test]
async fn resolve_endpoint_caches_resolution() {
    let (site_base, site_hits) = spawn_site(|path, _cookies| {
        if path.starts_with("/wrap") {
            html(r#"<a href="https://cdn-abc.workers.dev/Movie.mkv">Mirror [1080p]</a>"#)
        } else {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
        }
    })
    .await;

    let mut config = Config {
        providers: Config::default_providers(),
        ..Config::default()
    };
    for provider in &mut config.providers {
        provider.enabled = false;
    }
    config.resolver.intermediary_hosts = vec!["127.0.0.1".to_string()];

    let store = KvStore::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap();
    let state = AppState::build(Arc::new(config), store, 0).unwrap();
    let router = build_router(state);

    let opaque = urlencoding::encode(&format!("{site_base}/wrap")).into_owned();
    let path = format!("/resolve/testtag/{opaque}");

    let response = router
        .clone()
        .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://cdn-abc.workers.dev/Movie.mkv"
    );
    let hits_after_first = site_hits.load(Ordering::SeqCst);
    assert!(hits_after_first >= 1);

    // Second click: same Location, zero additional outbound HTTP.
    let response = router
        .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://cdn-abc.workers.dev/Movie.mkv"
    );
    assert_eq!(site_hits.load(Ordering::SeqCst), hits_after_first);
}
