//! Client for the external challenge-solving service.
//!
//! Each solve spins a real browser on the solver side, so this client pools
//! one named session per domain and reuses it for 10 minutes. A successful
//! solve also persists the earned `cf_clearance` cookie into the jar so
//! subsequent direct fetches skip the solver entirely. Callers only come
//! here after observing a challenge signature, except providers marked
//! solver-first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SolverConfig;
use crate::cookies::CookieJarService;
use crate::errors::{FetchError, SolverError};
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    pub post_data: Option<String>,
    pub timeout: Option<Duration>,
}

/// What a successful solve hands back to the caller.
#[derive(Debug, Clone)]
pub struct Solution {
    pub status: u16,
    pub body: String,
    pub final_url: String,
    pub cookies: HashMap<String, String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
struct SolverCommand<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(rename = "postData", skip_serializing_if = "Option::is_none")]
    post_data: Option<&'a str>,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolverEnvelope {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
struct SolverSolution {
    #[serde(default)]
    url: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    response: String,
    #[serde(default)]
    cookies: Vec<SolverCookie>,
    #[serde(rename = "userAgent", default)]
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SolverCookie {
    name: String,
    value: String,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    id: String,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CfSolver {
    inner: std::sync::Arc<SolverInner>,
}

struct SolverInner {
    client: reqwest::Client,
    config: SolverConfig,
    jars: CookieJarService,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl CfSolver {
    pub fn new(config: &SolverConfig, jars: CookieJarService) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.max_timeout_ms + 15_000))
            .build()?;
        Ok(Self {
            inner: std::sync::Arc::new(SolverInner {
                client,
                config: config.clone(),
                jars,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn enabled(&self) -> bool {
        self.inner.config.url.is_some()
    }

    /// Solve a challenged URL, reusing the domain session when one is live.
    pub async fn solve(&self, url: &str, opts: &SolveOptions) -> Result<Solution, SolverError> {
        let domain = utils::domain_of(url).unwrap_or_default();
        let session = self.ensure_session(&domain).await?;

        let cmd = if opts.post_data.is_some() {
            "request.post"
        } else {
            "request.get"
        };
        let max_timeout = opts
            .timeout
            .map(|t| t.as_millis() as u64)
            .unwrap_or(self.inner.config.max_timeout_ms);

        let envelope = self
            .send(&SolverCommand {
                cmd,
                url: Some(url),
                session: Some(&session),
                post_data: opts.post_data.as_deref(),
                max_timeout,
            })
            .await?;

        if envelope.status != "ok" {
            // A dead session is the usual culprit; drop it so the next call
            // creates a fresh one.
            self.invalidate_session(&domain).await;
            return Err(SolverError::Unsolved {
                url: url.to_string(),
                message: envelope.message,
            });
        }

        let Some(solution) = envelope.solution else {
            self.invalidate_session(&domain).await;
            return Err(SolverError::Unsolved {
                url: url.to_string(),
                message: "solver returned ok without a solution".to_string(),
            });
        };

        let cookies: HashMap<String, String> = solution
            .cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect();

        // Persist the clearance so direct fetches reuse it until expiry.
        if cookies.contains_key("cf_clearance") {
            info!(domain, "challenge cleared, persisting clearance cookie");
            self.inner
                .jars
                .store(&domain, cookies.clone(), solution.user_agent.clone())
                .await;
        }

        Ok(Solution {
            status: solution.status,
            body: solution.response,
            final_url: if solution.url.is_empty() {
                url.to_string()
            } else {
                solution.url
            },
            cookies,
            user_agent: solution.user_agent,
        })
    }

    /// Session id for a domain, creating one on first use.
    ///
    /// The insert is compare-and-swap shaped: when two callers race, the
    /// first inserted session wins and the loser's session is destroyed.
    async fn ensure_session(&self, domain: &str) -> Result<String, SolverError> {
        let ttl = Duration::from_secs(self.inner.config.session_ttl_secs);
        {
            let sessions = self.inner.sessions.lock().unwrap();
            if let Some(entry) = sessions.get(domain) {
                let age = Utc::now().signed_duration_since(entry.created_at);
                if age.num_milliseconds() >= 0 && (age.num_milliseconds() as u128) < ttl.as_millis()
                {
                    return Ok(entry.id.clone());
                }
            }
        }

        let session_name = format!("session:{domain}");
        let envelope = self
            .send(&SolverCommand {
                cmd: "sessions.create",
                url: None,
                session: Some(&session_name),
                post_data: None,
                max_timeout: self.inner.config.max_timeout_ms,
            })
            .await?;

        if envelope.status != "ok" {
            return Err(SolverError::Session {
                command: "sessions.create".to_string(),
                message: envelope.message,
            });
        }
        let created = envelope.session.unwrap_or(session_name);

        let (winner, lost) = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            match sessions.get(domain) {
                Some(existing) => (existing.id.clone(), true),
                None => {
                    sessions.insert(
                        domain.to_string(),
                        SessionEntry {
                            id: created.clone(),
                            created_at: Utc::now(),
                        },
                    );
                    (created.clone(), false)
                }
            }
        };

        if lost {
            debug!(domain, "concurrent session create lost the race, destroying ours");
            self.destroy_session(&created).await;
        }
        Ok(winner)
    }

    async fn invalidate_session(&self, domain: &str) {
        let removed = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.remove(domain)
        };
        if let Some(entry) = removed {
            self.destroy_session(&entry.id).await;
        }
    }

    async fn destroy_session(&self, session_id: &str) {
        let result = self
            .send(&SolverCommand {
                cmd: "sessions.destroy",
                url: None,
                session: Some(session_id),
                post_data: None,
                max_timeout: self.inner.config.max_timeout_ms,
            })
            .await;
        if let Err(e) = result {
            warn!(session_id, error = %e, "session destroy failed");
        }
    }

    async fn send(&self, command: &SolverCommand<'_>) -> Result<SolverEnvelope, SolverError> {
        let Some(base) = &self.inner.config.url else {
            return Err(SolverError::Session {
                command: command.cmd.to_string(),
                message: "no solver configured".to_string(),
            });
        };
        let endpoint = format!("{}/v1", base.trim_end_matches('/'));

        let response = self
            .inner
            .client
            .post(&endpoint)
            .json(command)
            .send()
            .await
            .map_err(|e| SolverError::Fetch(FetchError::network(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SolverError::Fetch(FetchError::HttpStatus {
                code: status.as_u16(),
                url: endpoint,
            }));
        }

        response
            .json::<SolverEnvelope>()
            .await
            .map_err(|e| SolverError::Session {
                command: command.cmd.to_string(),
                message: format!("malformed solver response: {e}"),
            })
    }
}
