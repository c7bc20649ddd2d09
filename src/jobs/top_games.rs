use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::context::JobContext;
use super::enrich::EnrichGameJob;
use super::media::FetchMediaJob;
use super::offers::FetchOffersForProductJob;
use super::series::BuildSeriesJob;
use super::verify::VerifyLinksJob;
use super::{Job, JobOutcome};
use crate::catalogue::{AggregateResult, TrendingGameData};
use crate::database_ops::models::SnapshotStatus;
use crate::error::{JobError, StoreError};
use crate::identity::popularity_from_rank;

pub const DEFAULT_LIMIT: usize = 50;
pub const DEFAULT_WINDOW_DAYS: u32 = 30;
const SNAPSHOT_KIND: &str = "catalogue_aggregate";

/// Aggregate the trending sources, reconcile every entry into the catalogue
/// in one transaction, then fan out per-product follow-ups.
///
/// Each provider client takes its own rate-limit permit per request. A source
/// whose bucket is empty sits the pass out while the others carry on; when
/// that leaves nothing to ingest the job releases for the shortest wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopGamesJob {
    pub limit: usize,
    pub window_days: u32,
}

#[derive(Debug, Default)]
struct Persisted {
    product_ids: Vec<i64>,
    created: usize,
}

impl FetchTopGamesJob {
    pub fn new(limit: usize, window_days: u32) -> Self {
        Self {
            limit: limit.max(1),
            window_days: window_days.max(1),
        }
    }

    async fn persist(
        &self,
        ctx: &JobContext,
        entries: &[TrendingGameData],
    ) -> Result<Persisted, StoreError> {
        let now = ctx.now();
        let total = entries.len();
        let mut out = Persisted::default();
        let mut tx = ctx.catalogue().begin().await?;
        for (index, entry) in entries.iter().enumerate() {
            let incoming = entry.to_incoming(Some(popularity_from_rank(index, total)));
            let resolution = ctx.resolver.resolve(tx.as_mut(), &incoming, now).await?;
            if resolution.created {
                out.created += 1;
            }
            if !out.product_ids.contains(&resolution.product.id) {
                out.product_ids.push(resolution.product.id);
            }
        }
        tx.commit().await?;
        Ok(out)
    }

    fn fan_out(&self, ctx: &JobContext, product_ids: &[i64]) -> usize {
        let mut dispatched = 0;
        for &id in product_ids {
            dispatched += [
                ctx.dispatch(EnrichGameJob::new(id)),
                ctx.dispatch(FetchOffersForProductJob::new(id, None)),
                ctx.dispatch(FetchMediaJob::new(id)),
                ctx.dispatch(VerifyLinksJob::new(id)),
                ctx.dispatch(BuildSeriesJob::new(id)),
            ]
            .iter()
            .filter(|accepted| **accepted)
            .count();
        }
        dispatched
    }
}

#[async_trait]
impl Job for FetchTopGamesJob {
    fn name(&self) -> &'static str {
        "fetch_top_games"
    }

    fn queue(&self) -> &'static str {
        "fetch"
    }

    fn idempotency_key(&self) -> String {
        format!("fetch:top_games:{}:{}", self.window_days, self.limit)
    }

    #[instrument(skip(self, ctx), fields(limit = self.limit, window_days = self.window_days))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let result = ctx
            .aggregator()
            .aggregate(&ctx.config.catalogue, self.limit, self.window_days)
            .await;
        if result.entries.is_empty() {
            if let Some(delay) = result.rate_limited() {
                info!(?delay, "no entries and a source was rate limited; releasing");
                return Ok(JobOutcome::Release {
                    delay,
                    reason: "trending sources rate limited".into(),
                });
            }
        }
        let AggregateResult {
            entries,
            sources,
            total_requested,
        } = result;

        let snapshot = ctx
            .snapshots()
            .start(
                SNAPSHOT_KIND,
                json!({
                    "limit": self.limit,
                    "window_days": self.window_days,
                    "total_requested": total_requested,
                    "sources": sources,
                }),
            )
            .await?;

        let persisted = match self.persist(ctx, &entries).await {
            Ok(p) => p,
            Err(e) => {
                if let Err(finish_err) = ctx
                    .snapshots()
                    .finish(snapshot.id, SnapshotStatus::Failed, 0, Some(e.to_string()))
                    .await
                {
                    warn!(error = %finish_err, "could not close failed snapshot");
                }
                return Err(e.into());
            }
        };
        ctx.snapshots()
            .finish(
                snapshot.id,
                SnapshotStatus::Succeeded,
                persisted.product_ids.len() as i64,
                None,
            )
            .await?;

        let dispatched = self.fan_out(ctx, &persisted.product_ids);
        info!(
            entries = entries.len(),
            products = persisted.product_ids.len(),
            created = persisted.created,
            dispatched,
            "top games ingested"
        );
        Ok(JobOutcome::Completed(json!({
            "entries": entries.len(),
            "products": persisted.product_ids,
            "created": persisted.created,
            "dispatched": dispatched,
            "snapshot_id": snapshot.id,
            "sources": sources,
        })))
    }
}
