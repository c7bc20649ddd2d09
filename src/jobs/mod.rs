//! Retryable, idempotent ingestion jobs and the worker pool that runs them.
//!
//! A job is a value describing one unit of work (`product_id`, window,
//! regions). It is dispatched onto a named queue under its idempotency key;
//! while a job with that key is queued or running, duplicate dispatches are
//! dropped. Workers run it with a [`JobContext`] built for that invocation
//! (fresh config, fresh provider clients) and settle the result:
//! success, retry with jittered backoff, release after a rate-limit denial,
//! or terminal failure.

pub mod context;
pub mod enrich;
pub mod media;
pub mod offers;
pub mod queue;
pub mod retry;
pub mod series;
pub mod tgdb_sync;
pub mod top_games;
pub mod verify;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::JobError;

pub use context::{JobContext, Services};
pub use enrich::EnrichGameJob;
pub use media::FetchMediaJob;
pub use offers::{FetchOffersForProductJob, FetchPricesJob, PriceIngestionManager};
pub use queue::{JobQueue, JobRecord, JobState};
pub use retry::RetryPolicy;
pub use series::{series_key, BuildSeriesJob};
pub use tgdb_sync::{TgdbFullSyncJob, TgdbIncrementalUpdateJob, TgdbSweepShardJob};
pub use top_games::FetchTopGamesJob;
pub use verify::{HttpLinkProber, LinkProber, VerifyLinksJob};
pub use worker::{DrainReport, Settlement, WorkerPool};

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Finished; the value is a short report kept in the job history.
    Completed(Value),
    /// Put back on the queue after `delay` without spending an attempt.
    Release { delay: Duration, reason: String },
}

#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn queue(&self) -> &'static str;

    /// Derived from the job's semantic inputs only.
    fn idempotency_key(&self) -> String;

    fn retry_policy(&self, defaults: RetryPolicy) -> RetryPolicy {
        defaults
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError>;
}

/// Names accepted by [`build_job`].
pub const JOB_NAMES: [&str; 12] = [
    "fetch_top_games",
    "enrich_game",
    "fetch_offers",
    "fetch_prices",
    "fetch_media",
    "verify_links",
    "build_series",
    "tgdb_full_sync",
    "tgdb_incremental",
    "tgdb_sweep",
    "tgdb_sweep_shard",
    "tgdb_discovery",
];

/// Build a job from its name and a small context map, e.g.
/// `{"window": 30, "limit": 50}` or `{"product_id": 7, "regions": ["US"]}`.
pub fn build_job(name: &str, context: &Value) -> Result<Arc<dyn Job>, JobError> {
    let product_id = || {
        context
            .get("product_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| JobError::terminal(format!("{name} needs an integer product_id")))
    };
    let regions = || -> Option<Vec<String>> {
        let list = context.get("regions")?.as_array()?;
        Some(
            list.iter()
                .filter_map(Value::as_str)
                .map(|r| r.trim().to_ascii_uppercase())
                .filter(|r| !r.is_empty())
                .collect(),
        )
    };
    let u64_field = |key: &str| context.get(key).and_then(Value::as_u64);

    let job: Arc<dyn Job> = match name {
        "fetch_top_games" => Arc::new(FetchTopGamesJob::new(
            u64_field("limit").map_or(top_games::DEFAULT_LIMIT, |v| v as usize),
            u64_field("window").map_or(top_games::DEFAULT_WINDOW_DAYS, |v| v as u32),
        )),
        "enrich_game" => Arc::new(EnrichGameJob::new(product_id()?)),
        "fetch_offers" => Arc::new(FetchOffersForProductJob::new(product_id()?, regions())),
        "fetch_prices" => {
            let provider = context
                .get("provider")
                .and_then(Value::as_str)
                .ok_or_else(|| JobError::terminal("fetch_prices needs a provider"))?;
            Arc::new(FetchPricesJob::new(
                product_id()?,
                provider,
                regions().unwrap_or_default(),
            ))
        }
        "fetch_media" => Arc::new(FetchMediaJob::new(product_id()?)),
        "verify_links" => Arc::new(VerifyLinksJob::new(product_id()?)),
        "build_series" => Arc::new(BuildSeriesJob::new(product_id()?)),
        "tgdb_full_sync" => {
            let queries = context.get("queries").and_then(Value::as_array).map(|q| {
                q.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            });
            Arc::new(TgdbFullSyncJob::new(queries))
        }
        "tgdb_incremental" => Arc::new(TgdbIncrementalUpdateJob::new()),
        "tgdb_sweep" | "tgdb_sweep_shard" => {
            Arc::new(TgdbSweepShardJob::new(u64_field("shard").map(|s| s as u32)))
        }
        "tgdb_discovery" => Arc::new(TgdbSweepShardJob::discovery_only()),
        other => return Err(JobError::terminal(format!("unknown job: {other}"))),
    };
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jobs_build_from_context_maps() {
        let top = build_job("fetch_top_games", &json!({"window": 7, "limit": 25})).unwrap();
        assert_eq!(top.idempotency_key(), "fetch:top_games:7:25");
        assert_eq!(top.queue(), "fetch");

        let offers = build_job("fetch_offers", &json!({"product_id": 9, "regions": ["us", "gb"]})).unwrap();
        assert_eq!(offers.idempotency_key(), "offers:9:US,GB");

        let prices = build_job("fetch_prices", &json!({"product_id": 9, "provider": "itad"})).unwrap();
        assert_eq!(prices.queue(), "offers");

        assert!(build_job("enrich_game", &json!({})).is_err());
        assert!(build_job("nope", &json!({})).is_err());
        for name in JOB_NAMES {
            let ctx = json!({"product_id": 1, "provider": "nexarda"});
            assert!(build_job(name, &ctx).is_ok(), "{name}");
        }
    }
}
