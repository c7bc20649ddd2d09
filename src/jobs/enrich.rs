use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::context::JobContext;
use super::{Job, JobOutcome};
use crate::database_ops::giantbomb::best_match;
use crate::database_ops::provider_client::{FetchRequest, NormalizedRecord};
use crate::error::{JobError, ProviderError};
use crate::identity::IncomingGame;

const PROVIDER: &str = "giantbomb";
const SEARCH_LIMIT: usize = 10;

/// Fill gaps in a Product from GiantBomb's best-matching search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichGameJob {
    pub product_id: i64,
}

impl EnrichGameJob {
    pub fn new(product_id: i64) -> Self {
        Self { product_id }
    }
}

fn skipped(reason: &str) -> JobOutcome {
    JobOutcome::Completed(json!({ "skipped": reason }))
}

#[async_trait]
impl Job for EnrichGameJob {
    fn name(&self) -> &'static str {
        "enrich_game"
    }

    fn queue(&self) -> &'static str {
        "fetch"
    }

    fn idempotency_key(&self) -> String {
        format!("enrich:{PROVIDER}:{}", self.product_id)
    }

    #[instrument(skip(self, ctx), fields(product_id = self.product_id))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let Some(client) = ctx.registry.enabled(PROVIDER) else {
            debug!("giantbomb not configured; nothing to enrich with");
            return Ok(skipped("provider disabled"));
        };
        let product = ctx.product(self.product_id).await?;

        let records = match client.fetch(&FetchRequest::search(&product.name, SEARCH_LIMIT)).await {
            Ok(records) => records,
            Err(e) if e.is_soft() && !matches!(e, ProviderError::RateLimited { .. }) => {
                warn!(provider = PROVIDER, error = %e, "enrichment lookup failed; skipping");
                return Ok(skipped("lookup failed"));
            }
            Err(e) => return Err(JobError::from_provider(e)),
        };
        let candidates: Vec<_> = records
            .into_iter()
            .filter_map(NormalizedRecord::into_game)
            .collect();
        let Some(found) = best_match(&product.name, &candidates) else {
            info!(candidates = candidates.len(), "no giantbomb match");
            return Ok(skipped("no match"));
        };

        let incoming = IncomingGame::from(found);
        let mut tx = ctx.catalogue().begin().await?;
        let merged = ctx
            .resolver
            .enrich(tx.as_mut(), self.product_id, &incoming, ctx.now())
            .await?;
        tx.commit().await?;
        info!(matched = %found.name, external_id = %found.external_id, "product enriched");
        Ok(JobOutcome::Completed(json!({
            "matched": found.name,
            "external_id": found.external_id,
            "release_date": merged.release_date,
            "rating": merged.rating,
        })))
    }
}
