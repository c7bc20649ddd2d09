//! Multi-provider game catalogue ingestion: provider clients behind shared
//! token buckets, an identity resolver that folds provider records into
//! canonical products, a trending aggregator, a mirror of TheGamesDB, and a
//! retryable job pipeline tying them together.

pub mod catalogue;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod normalization;
pub mod rate_limit;
pub mod tracing;

pub mod util {
    pub mod env;
}
