//! Error type definitions for the streamgate application
//!
//! Every subsystem has its own error enum; provider and resolver failures
//! are absorbed as values long before they can reach a client response.

use thiserror::Error;

/// Top-level application error type
///
/// Used at the binary and web boundary. Subsystem errors convert into this
/// via `#[from]` so `?` works across layers.
#[derive(Error, Debug)]
pub enum AppError {
    /// Persistent store errors
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Cache fabric errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Outbound HTTP errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Challenge-solver errors
    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Outbound HTTP fetch errors
///
/// Only `Network` and `Timeout` are retryable; an HTTP status is never
/// retried at this layer.
#[derive(Error, Debug)]
pub enum FetchError {
    /// DNS, connect, reset, TLS
    #[error("Network error: {message}")]
    Network { message: String },

    /// Per-attempt deadline exceeded
    #[error("Timeout after {millis}ms: {url}")]
    Timeout { url: String, millis: u64 },

    /// Advertised or streamed body exceeded the cap
    #[error("Body too large: {url} exceeded {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },

    /// Request-scoped cancellation fired
    #[error("Canceled: {url}")]
    Canceled { url: String },

    /// Unexpected (non-success) HTTP status
    #[error("HTTP status {code}: {url}")]
    HttpStatus { code: u16, url: String },

    /// Redirect chain exceeded the hop limit
    #[error("Too many redirects (>{max}): {url}")]
    TooManyRedirects { url: String, max: usize },

    /// URL failed to parse
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl FetchError {
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Retry only network/timeout classes, never HTTP statuses.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

/// Cache fabric errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The single-flight producer failed; every joined waiter observes
    /// the same message.
    #[error("Producer failed for {key}: {message}")]
    ProducerFailed { key: String, message: String },
}

/// Challenge-solver client errors
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Solver unreachable: {0}")]
    Fetch(#[from] FetchError),

    #[error("Session {command} failed: {message}")]
    Session { command: String, message: String },

    /// The solver responded but did not produce a solution
    #[error("Challenge unsolved for {url}: {message}")]
    Unsolved { url: String, message: String },
}

/// Provider adapter errors
///
/// These never propagate past the aggregation layer; a failed provider
/// contributes an empty result and a log line.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Parse failed for {provider}: {message}")]
    Parse { provider: String, message: String },

    /// Challenge observed and the solver could not clear it
    #[error("Challenge not cleared for {provider}")]
    Challenge { provider: String },

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),
}

impl ProviderError {
    pub fn parse<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::Parse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Fetch(f) if f.is_canceled())
    }
}

/// Link-chain resolver errors
///
/// Internal to the resolver; the public surface collapses all of these to
/// `None` (the API returns 502).
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    /// Loop detector tripped on a repeated (method, url, body) triple
    #[error("Redirect loop detected at {url}")]
    LoopDetected { url: String },

    #[error("Hop budget exhausted after {hops} hops")]
    HopsExhausted { hops: usize },

    /// Every candidate was rejected by the seek gate
    #[error("All {count} candidates rejected")]
    CandidatesExhausted { count: usize },

    #[error("Encrypted payload rejected: {message}")]
    BadPayload { message: String },
}
