//! Per-domain cookie jars.
//!
//! Clearance cookies earned from a challenge solve are expensive; they are
//! kept in process and persisted under `cf_cookie:{domain}` so direct
//! fetches (and other workers) can reuse them until they expire or a new
//! challenge invalidates them.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheFabric, NS_CF_COOKIE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCookies {
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub stored_at: DateTime<Utc>,
}

impl DomainCookies {
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let mut header = String::new();
        for (name, value) in &self.cookies {
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(name);
            header.push('=');
            header.push_str(value);
        }
        Some(header)
    }

    pub fn has_clearance(&self) -> bool {
        self.cookies.contains_key("cf_clearance")
    }
}

#[derive(Clone)]
pub struct CookieJarService {
    inner: std::sync::Arc<JarInner>,
}

struct JarInner {
    fabric: CacheFabric,
    ttl: Duration,
    // A mutex guards merges; writers hold it only for the map update.
    domains: Mutex<HashMap<String, DomainCookies>>,
}

impl CookieJarService {
    pub fn new(fabric: CacheFabric, ttl: Duration) -> Self {
        Self {
            inner: std::sync::Arc::new(JarInner {
                fabric,
                ttl,
                domains: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn is_live(&self, jar: &DomainCookies) -> bool {
        let age = Utc::now().signed_duration_since(jar.stored_at);
        age.num_milliseconds() >= 0 && (age.num_milliseconds() as u128) < self.inner.ttl.as_millis()
    }

    /// Current jar for a domain, falling back to the persistent tier so a
    /// clearance earned by another worker is reused.
    pub async fn load(&self, domain: &str) -> Option<DomainCookies> {
        {
            let domains = self.inner.domains.lock().unwrap();
            if let Some(jar) = domains.get(domain) {
                if self.is_live(jar) {
                    return Some(jar.clone());
                }
            }
        }

        let stored: Option<DomainCookies> =
            self.inner.fabric.get(NS_CF_COOKIE, domain).await.ok().flatten();
        if let Some(jar) = stored {
            if self.is_live(&jar) {
                self.inner
                    .domains
                    .lock()
                    .unwrap()
                    .insert(domain.to_string(), jar.clone());
                return Some(jar);
            }
        }
        None
    }

    /// Replace a domain's jar, typically after a successful challenge solve.
    pub async fn store(
        &self,
        domain: &str,
        cookies: HashMap<String, String>,
        user_agent: Option<String>,
    ) {
        let jar = DomainCookies {
            cookies,
            user_agent,
            stored_at: Utc::now(),
        };
        self.inner
            .domains
            .lock()
            .unwrap()
            .insert(domain.to_string(), jar.clone());
        if let Err(e) = self
            .inner
            .fabric
            .set(NS_CF_COOKIE, domain, &jar, self.inner.ttl)
            .await
        {
            debug!(domain, error = %e, "cookie jar persist failed");
        }
    }

    /// Merge `Set-Cookie` headers from a response hop into the domain jar.
    pub async fn merge_response(&self, domain: &str, headers: &HeaderMap) {
        let mut parsed: Vec<(String, String)> = Vec::new();
        for value in headers.get_all(reqwest::header::SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                if let Some((name, value)) = parse_set_cookie(raw) {
                    parsed.push((name, value));
                }
            }
        }
        if parsed.is_empty() {
            return;
        }

        let jar = {
            let mut domains = self.inner.domains.lock().unwrap();
            let jar = domains
                .entry(domain.to_string())
                .or_insert_with(|| DomainCookies {
                    cookies: HashMap::new(),
                    user_agent: None,
                    stored_at: Utc::now(),
                });
            for (name, value) in parsed {
                jar.cookies.insert(name, value);
            }
            jar.stored_at = Utc::now();
            jar.clone()
        };

        if let Err(e) = self
            .inner
            .fabric
            .set(NS_CF_COOKIE, domain, &jar, self.inner.ttl)
            .await
        {
            debug!(domain, error = %e, "cookie jar persist failed");
        }
    }

    /// Drop a domain's jar; called when a challenge page is observed with
    /// cookies attached, meaning the clearance no longer works.
    pub async fn invalidate(&self, domain: &str) {
        self.inner.domains.lock().unwrap().remove(domain);
        let _ = self.inner.fabric.invalidate(NS_CF_COOKIE, domain).await;
    }
}

/// First `name=value` pair of a Set-Cookie line; attributes are dropped.
fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let first = raw.split(';').next()?;
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}
