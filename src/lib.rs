//! streamgate: a multi-source streaming-link aggregation gateway.
//!
//! For a media id the gateway concurrently interrogates scraping providers,
//! normalizes their links into one ordered catalog, and resolves individual
//! links on demand through shortener / intermediary / host chains down to a
//! seekable direct URL.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod cookies;
pub mod errors;
pub mod fetch;
pub mod meta;
pub mod models;
pub mod providers;
pub mod resolver;
pub mod solver;
pub mod supervisor;
pub mod utils;
pub mod web;

pub use config::Config;
pub use errors::AppError;
