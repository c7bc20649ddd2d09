//! Three ways of keeping the TheGamesDB mirror current: re-pull a list of
//! name queries (full), follow the edit log (incremental), or refresh one
//! id shard per run under a daily call budget, optionally probing unseen ids
//! past the end of the mirror (sweep / discovery).
//!
//! Unlike trending imports, every client failure here is promoted to
//! `SyncFailed` so the job retries with backoff.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::JobContext;
use super::{Job, JobOutcome};
use crate::catalogue::policy;
use crate::database_ops::models::{MirrorGameUpsert, SnapshotStatus};
use crate::database_ops::repository::MirrorRepository;
use crate::database_ops::tgdb::{TgdbApi, MAX_IDS_PER_CALL};
use crate::error::{JobError, ProviderError, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTally {
    pub calls: u32,
    pub upserted: usize,
    pub skipped_pc: usize,
}

impl SyncTally {
    async fn upsert_all(
        &mut self,
        mirror: &dyn MirrorRepository,
        games: Vec<MirrorGameUpsert>,
    ) -> Result<(), StoreError> {
        for game in games {
            if policy::excludes_upsert(&game) {
                debug!(external_id = game.external_id, "skipping pre-2015 pc title");
                self.skipped_pc += 1;
                continue;
            }
            mirror.upsert_game(game).await?;
            self.upserted += 1;
        }
        Ok(())
    }
}

fn hard(err: ProviderError) -> JobError {
    JobError::from_provider(err.into_sync_failure())
}

fn skipped(reason: &str) -> JobOutcome {
    JobOutcome::Completed(json!({ "skipped": reason }))
}

fn mirror_api(ctx: &JobContext) -> Option<Arc<dyn TgdbApi>> {
    ctx.registry.tgdb().filter(|api| api.enabled())
}

async fn close_snapshot<T>(ctx: &JobContext, id: Uuid, result: &Result<T, JobError>, rows: i64) {
    let (status, details) = match result {
        Ok(_) => (SnapshotStatus::Succeeded, None),
        Err(e) => (SnapshotStatus::Failed, Some(e.to_string())),
    };
    if let Err(e) = ctx.snapshots().finish(id, status, rows, details).await {
        warn!(snapshot_id = %id, error = %e, "could not close sync snapshot");
    }
}

/// Re-pull every configured name query, page by page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgdbFullSyncJob {
    /// `None` uses the configured query list.
    pub queries: Option<Vec<String>>,
}

impl TgdbFullSyncJob {
    pub fn new(queries: Option<Vec<String>>) -> Self {
        Self { queries }
    }

    async fn sync(
        &self,
        ctx: &JobContext,
        api: &dyn TgdbApi,
        queries: &[String],
        tally: &mut SyncTally,
    ) -> Result<(), JobError> {
        let max_pages = ctx.config.tgdb.max_pages.max(1);
        for query in queries {
            for page in 1..=max_pages {
                let result = api.search_by_name(query, page).await.map_err(hard)?;
                tally.calls += 1;
                let has_more = result.has_more;
                tally.upsert_all(ctx.mirror(), result.games).await?;
                if !has_more {
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for TgdbFullSyncJob {
    fn name(&self) -> &'static str {
        "tgdb_full_sync"
    }

    fn queue(&self) -> &'static str {
        "fetch"
    }

    fn idempotency_key(&self) -> String {
        match &self.queries {
            Some(q) => format!("tgdb:full:{}", q.join("|")),
            None => "tgdb:full".to_string(),
        }
    }

    #[instrument(skip(self, ctx))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let Some(api) = mirror_api(ctx) else {
            return Ok(skipped("tgdb disabled"));
        };
        let queries = self
            .queries
            .clone()
            .unwrap_or_else(|| ctx.config.tgdb.full_queries.clone());
        let snapshot = ctx
            .snapshots()
            .start("tgdb_full_sync", json!({ "queries": queries }))
            .await?;

        let mut tally = SyncTally::default();
        let result = self.sync(ctx, api.as_ref(), &queries, &mut tally).await;
        close_snapshot(ctx, snapshot.id, &result, tally.upserted as i64).await;
        result?;

        ctx.mirror()
            .update_full_sync_state(ctx.now(), json!({ "queries": queries.len(), "tally": tally }))
            .await?;
        info!(?tally, "tgdb full sync finished");
        Ok(JobOutcome::Completed(json!(tally)))
    }
}

/// Follow the edit log from the last stored edit id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TgdbIncrementalUpdateJob;

impl TgdbIncrementalUpdateJob {
    pub fn new() -> Self {
        Self
    }

    async fn sync(
        &self,
        ctx: &JobContext,
        api: &dyn TgdbApi,
        last_edit_id: i64,
        tally: &mut SyncTally,
    ) -> Result<(i64, usize), JobError> {
        let mut changed = Vec::new();
        let mut next_edit_id = last_edit_id;
        for page in 1..=ctx.config.tgdb.max_pages.max(1) {
            let updates = api.updates_since(last_edit_id, page).await.map_err(hard)?;
            tally.calls += 1;
            changed.extend(updates.game_ids);
            if let Some(id) = updates.next_edit_id {
                next_edit_id = next_edit_id.max(id);
            }
            if !updates.has_more {
                break;
            }
        }
        let ids: Vec<i64> = changed.into_iter().sorted_unstable().dedup().collect();
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            let games = api.by_ids(chunk).await.map_err(hard)?;
            tally.calls += 1;
            tally.upsert_all(ctx.mirror(), games).await?;
        }
        Ok((next_edit_id, ids.len()))
    }
}

#[async_trait]
impl Job for TgdbIncrementalUpdateJob {
    fn name(&self) -> &'static str {
        "tgdb_incremental"
    }

    fn queue(&self) -> &'static str {
        "fetch"
    }

    fn idempotency_key(&self) -> String {
        "tgdb:incremental".to_string()
    }

    #[instrument(skip(self, ctx))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let Some(api) = mirror_api(ctx) else {
            return Ok(skipped("tgdb disabled"));
        };
        let state = ctx.mirror().latest_sync_state().await?;
        let last_edit_id = state
            .incremental
            .extra
            .get("last_edit_id")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let snapshot = ctx
            .snapshots()
            .start(
                "tgdb_incremental",
                json!({ "last_edit_id": last_edit_id, "since": state.incremental.at }),
            )
            .await?;

        let mut tally = SyncTally::default();
        let result = self.sync(ctx, api.as_ref(), last_edit_id, &mut tally).await;
        close_snapshot(ctx, snapshot.id, &result, tally.upserted as i64).await;
        let (next_edit_id, changed) = result?;

        ctx.mirror()
            .update_incremental_sync_state(
                ctx.now(),
                json!({ "last_edit_id": next_edit_id, "changed": changed, "tally": tally }),
            )
            .await?;
        info!(last_edit_id, next_edit_id, changed, "tgdb incremental update finished");
        Ok(JobOutcome::Completed(json!({
            "last_edit_id": next_edit_id,
            "changed": changed,
            "tally": tally,
        })))
    }
}

/// Calls left today, shared by sweep and discovery.
#[derive(Debug, Clone, Copy)]
struct Budget {
    remaining: u32,
    used: u32,
}

impl Budget {
    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.used += 1;
        true
    }
}

/// Refresh one shard of mirrored ids (`id % total_shards == shard`), then
/// optionally probe unseen ids, all within the daily call budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgdbSweepShardJob {
    /// `None` continues from the stored cursor.
    pub shard: Option<u32>,
    pub discovery_only: bool,
}

#[derive(Debug, Default, Serialize)]
struct SweepReport {
    shard: Option<u32>,
    shard_ids: usize,
    shard_complete: bool,
    next_shard: u32,
    discovery: Option<Value>,
    tally: SyncTally,
}

impl TgdbSweepShardJob {
    pub fn new(shard: Option<u32>) -> Self {
        Self {
            shard,
            discovery_only: false,
        }
    }

    pub fn discovery_only() -> Self {
        Self {
            shard: None,
            discovery_only: true,
        }
    }

    async fn sweep(
        &self,
        ctx: &JobContext,
        api: &dyn TgdbApi,
        shard: u32,
        total: u32,
        budget: &mut Budget,
        report: &mut SweepReport,
    ) -> Result<(), JobError> {
        let ids = ctx.mirror().ids_in_shard(shard, total).await?;
        report.shard = Some(shard);
        report.shard_ids = ids.len();
        report.shard_complete = true;
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            if !budget.take() {
                report.shard_complete = false;
                break;
            }
            let games = api.by_ids(chunk).await.map_err(hard)?;
            report.tally.calls += 1;
            report.tally.upsert_all(ctx.mirror(), games).await?;
        }
        Ok(())
    }

    /// Probe `[next_id, next_id + batch)` and stop after too many
    /// consecutive misses. Returns the discovery cursor to store.
    async fn discover(
        &self,
        ctx: &JobContext,
        api: &dyn TgdbApi,
        cursor: &Value,
        budget: &mut Budget,
        tally: &mut SyncTally,
    ) -> Result<Value, JobError> {
        let cfg = &ctx.config.tgdb;
        let max_misses = cfg.discovery_max_misses.max(1);
        let stored_next = cursor.get("next_id").and_then(Value::as_i64);
        let stored_misses = cursor.get("misses").and_then(Value::as_u64).unwrap_or(0) as u32;
        let tail = ctx.mirror().max_external_id().await?.unwrap_or(0) + 1;
        // a run that ended on a miss streak starts again past the mirror's tail
        let (start, mut misses) = match stored_next {
            Some(next) if stored_misses < max_misses => (next.max(1), stored_misses),
            _ => (tail, 0),
        };

        let end = start + i64::from(cfg.discovery_batch.max(1));
        let ids: Vec<i64> = (start..end).collect();
        let mut next_id = start;
        let mut found = 0usize;
        'probe: for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            if misses >= max_misses || !budget.take() {
                break;
            }
            let games = api.by_ids(chunk).await.map_err(hard)?;
            tally.calls += 1;
            let hits: BTreeSet<i64> = games.iter().map(|g| g.external_id).collect();
            found += hits.len();
            tally.upsert_all(ctx.mirror(), games).await?;
            for id in chunk {
                next_id = id + 1;
                if hits.contains(id) {
                    misses = 0;
                } else {
                    misses += 1;
                    if misses >= max_misses {
                        break 'probe;
                    }
                }
            }
        }
        debug!(start, next_id, found, misses, "tgdb discovery pass");
        Ok(json!({ "next_id": next_id, "misses": misses, "found": found }))
    }
}

#[async_trait]
impl Job for TgdbSweepShardJob {
    fn name(&self) -> &'static str {
        if self.discovery_only {
            "tgdb_discovery"
        } else {
            "tgdb_sweep"
        }
    }

    fn queue(&self) -> &'static str {
        "fetch"
    }

    fn idempotency_key(&self) -> String {
        match (self.discovery_only, self.shard) {
            (true, _) => "tgdb:discovery".to_string(),
            (false, Some(shard)) => format!("tgdb:sweep:{shard}"),
            (false, None) => "tgdb:sweep:next".to_string(),
        }
    }

    #[instrument(skip(self, ctx), fields(shard = ?self.shard, discovery_only = self.discovery_only))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let Some(api) = mirror_api(ctx) else {
            return Ok(skipped("tgdb disabled"));
        };
        let cfg = ctx.config.tgdb.clone();
        let total = cfg.total_shards.max(1);
        let now = ctx.now();
        let today = now.date_naive().to_string();
        let state = ctx.mirror().latest_sync_state().await?;
        let sweep = &state.sweep.extra;

        let used_today = if sweep.get("day").and_then(Value::as_str) == Some(today.as_str()) {
            sweep.get("calls_today").and_then(Value::as_u64).unwrap_or(0) as u32
        } else {
            0
        };
        let mut budget = Budget {
            remaining: cfg.daily_budget.saturating_sub(used_today),
            used: 0,
        };
        if budget.remaining == 0 {
            info!(used_today, "tgdb daily budget exhausted");
            return Ok(skipped("daily budget exhausted"));
        }
        let stored_next = sweep.get("next_shard").and_then(Value::as_u64).unwrap_or(0) as u32 % total;

        let snapshot = ctx
            .snapshots()
            .start(
                "tgdb_sweep",
                json!({
                    "shard": self.shard,
                    "total_shards": total,
                    "budget_remaining": budget.remaining,
                    "discovery_only": self.discovery_only,
                }),
            )
            .await?;

        let mut report = SweepReport {
            next_shard: stored_next,
            ..SweepReport::default()
        };
        let result = async {
            if !self.discovery_only {
                let shard = self.shard.map_or(stored_next, |s| s % total);
                self.sweep(ctx, api.as_ref(), shard, total, &mut budget, &mut report)
                    .await?;
                if self.shard.is_none() && report.shard_complete {
                    report.next_shard = (shard + 1) % total;
                }
            }
            if (cfg.discovery_enabled || self.discovery_only) && budget.remaining > 0 {
                let cursor = self
                    .discover(ctx, api.as_ref(), &state.discovery.extra, &mut budget, &mut report.tally)
                    .await?;
                ctx.mirror().update_discovery_state(now, cursor.clone()).await?;
                report.discovery = Some(cursor);
            }
            Ok::<(), JobError>(())
        }
        .await;

        // spent calls count against today's budget even when the run failed
        ctx.mirror()
            .update_sweep_state(
                now,
                json!({
                    "next_shard": report.next_shard,
                    "last_shard": report.shard,
                    "total_shards": total,
                    "day": today,
                    "calls_today": used_today + budget.used,
                }),
            )
            .await?;
        close_snapshot(ctx, snapshot.id, &result, report.tally.upserted as i64).await;
        result?;

        info!(
            shard = ?report.shard,
            next_shard = report.next_shard,
            calls = budget.used,
            upserted = report.tally.upserted,
            "tgdb sweep finished"
        );
        Ok(JobOutcome::Completed(json!(report)))
    }
}
