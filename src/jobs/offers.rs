use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::context::{product_ref, JobContext};
use super::{Job, JobOutcome};
use crate::database_ops::models::NewOffer;
use crate::database_ops::provider_client::{FetchRequest, NormalizedRecord, PriceRecord, ProductRef};
use crate::database_ops::repository::CatalogueTx;
use crate::error::{JobError, ProviderError, StoreError};

/// Providers that only price one market.
const US_ONLY: [&str; 1] = ["pricecharting"];

fn regions_key(regions: &[String]) -> String {
    regions.join(",")
}

/// Fan out one [`FetchPricesJob`] per configured, enabled pricing provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOffersForProductJob {
    pub product_id: i64,
    /// `None` uses the configured pricing regions.
    pub regions: Option<Vec<String>>,
}

impl FetchOffersForProductJob {
    pub fn new(product_id: i64, regions: Option<Vec<String>>) -> Self {
        Self { product_id, regions }
    }
}

#[async_trait]
impl Job for FetchOffersForProductJob {
    fn name(&self) -> &'static str {
        "fetch_offers"
    }

    fn queue(&self) -> &'static str {
        "offers"
    }

    fn idempotency_key(&self) -> String {
        match &self.regions {
            Some(regions) => format!("offers:{}:{}", self.product_id, regions_key(regions)),
            None => format!("offers:{}", self.product_id),
        }
    }

    #[instrument(skip(self, ctx), fields(product_id = self.product_id))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        ctx.product(self.product_id).await?;
        let regions = self
            .regions
            .clone()
            .unwrap_or_else(|| ctx.config.pricing.regions.clone());

        let mut dispatched = Vec::new();
        for provider in &ctx.config.pricing.providers {
            if ctx.registry.enabled(provider).is_none() {
                debug!(%provider, "pricing provider not enabled");
                continue;
            }
            if ctx.dispatch(FetchPricesJob::new(self.product_id, provider, regions.clone())) {
                dispatched.push(provider.clone());
            }
        }
        info!(providers = ?dispatched, "price fetches dispatched");
        Ok(JobOutcome::Completed(json!({
            "dispatched": dispatched,
            "regions": regions,
        })))
    }
}

/// Fetch one provider's prices for one product and store them as offers.
/// Provider failures propagate so the job-level retry engages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPricesJob {
    pub product_id: i64,
    pub provider: String,
    pub regions: Vec<String>,
}

impl FetchPricesJob {
    pub fn new(product_id: i64, provider: &str, regions: Vec<String>) -> Self {
        Self {
            product_id,
            provider: provider.to_string(),
            regions,
        }
    }
}

/// Request in the shape each provider expects.
pub fn price_request(provider: &str, product: ProductRef, regions: &[String]) -> FetchRequest {
    let regions = if US_ONLY.contains(&provider) || regions.is_empty() {
        vec!["US".to_string()]
    } else {
        regions.iter().map(|r| r.to_ascii_uppercase()).collect()
    };
    let mut request = FetchRequest::prices(product.clone(), regions);
    request.term = Some(product.name.clone());
    request.external_id = product.external_ids.get(provider).cloned();
    request.platforms = product.platform.into_iter().collect();
    request
}

#[async_trait]
impl Job for FetchPricesJob {
    fn name(&self) -> &'static str {
        "fetch_prices"
    }

    fn queue(&self) -> &'static str {
        "offers"
    }

    fn idempotency_key(&self) -> String {
        format!(
            "prices:{}:{}:{}",
            self.provider,
            self.product_id,
            regions_key(&self.regions)
        )
    }

    #[instrument(skip(self, ctx), fields(product_id = self.product_id, provider = %self.provider))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let Some(client) = ctx.registry.enabled(&self.provider) else {
            return Ok(JobOutcome::Completed(json!({ "skipped": "provider disabled" })));
        };
        let product = ctx.product(self.product_id).await?;
        let request = price_request(&self.provider, product_ref(&product), &self.regions);

        let records = match client.fetch(&request).await {
            Ok(records) => records,
            Err(e) => {
                let e = e.into_sync_failure();
                if !matches!(e, ProviderError::RateLimited { .. }) {
                    warn!(provider = %self.provider, error = %e, "provider failure while fetching prices");
                }
                return Err(JobError::from_provider(e));
            }
        };
        let prices: Vec<PriceRecord> = records
            .into_iter()
            .filter_map(NormalizedRecord::into_price)
            .collect();

        let summary = async {
            let mut tx = ctx.catalogue().begin().await?;
            let summary = PriceIngestionManager::new()
                .ingest(tx.as_mut(), self.product_id, prices)
                .await?;
            tx.commit().await?;
            Ok::<_, StoreError>(summary)
        }
        .await
        .map_err(|e| {
            error!(provider = %self.provider, error = %e, "failed to store offers");
            e
        })?;

        info!(upserted = summary.upserted, skipped = summary.skipped, "offers stored");
        Ok(JobOutcome::Completed(json!(summary)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub upserted: usize,
    pub skipped: usize,
}

/// Turns provider price records into offer rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriceIngestionManager;

impl PriceIngestionManager {
    pub fn new() -> Self {
        Self
    }

    /// `None` for records that cannot be shown as a price.
    pub fn to_offer(record: PriceRecord) -> Option<NewOffer> {
        if !record.price.is_finite() || record.price < 0.0 {
            return None;
        }
        let store = record.store.trim();
        let currency = record.currency.trim().to_ascii_uppercase();
        if store.is_empty() || currency.len() != 3 {
            return None;
        }
        let regular_price = record.regular_price.filter(|p| p.is_finite() && *p >= record.price);
        let discount_percent = record.discount_percent.or_else(|| {
            regular_price
                .filter(|r| *r > 0.0)
                .map(|r| (((r - record.price) / r) * 100.0).round() as i32)
        });
        Some(NewOffer {
            provider: record.provider,
            store: store.to_string(),
            region_code: record.region_code.trim().to_ascii_uppercase(),
            currency,
            price: record.price,
            regular_price,
            discount_percent,
            url: record.url.filter(|u| !u.trim().is_empty()),
            metadata: record.payload,
        })
    }

    pub async fn ingest(
        &self,
        tx: &mut dyn CatalogueTx,
        product_id: i64,
        records: Vec<PriceRecord>,
    ) -> Result<IngestSummary, StoreError> {
        let mut summary = IngestSummary::default();
        for record in records {
            match Self::to_offer(record) {
                Some(offer) => {
                    tx.upsert_offer(product_id, &offer).await?;
                    summary.upserted += 1;
                }
                None => summary.skipped += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::provider_client::{FetchKind, ProviderRegistry};
    use crate::database_ops::repository::CatalogueStore;
    use crate::identity::{IdentityResolver, IncomingGame};
    use crate::jobs::testing::{game, services, FakeClient, Reply};
    use crate::jobs::JobQueue;
    use std::sync::Arc;

    fn price(provider: &str, store: &str, region: &str, amount: f64) -> PriceRecord {
        PriceRecord {
            provider: provider.into(),
            store: store.into(),
            region_code: region.into(),
            currency: "usd".into(),
            price: amount,
            regular_price: Some(59.99),
            discount_percent: None,
            url: Some(format!("https://{store}.example/game")),
            payload: json!({}),
        }
    }

    async fn seed(store: &MemoryStore) -> i64 {
        let record = game("rawg", "elden-ring", "Elden Ring", "PlayStation 5", None);
        let mut tx = store.begin().await.unwrap();
        let id = IdentityResolver::new()
            .resolve(tx.as_mut(), &IncomingGame::from(&record), chrono::Utc::now())
            .await
            .unwrap()
            .product
            .id;
        tx.commit().await.unwrap();
        id
    }

    #[test]
    fn offers_are_normalised() {
        let offer = PriceIngestionManager::to_offer(price("itad", "steam", "us", 29.99)).unwrap();
        assert_eq!(offer.currency, "USD");
        assert_eq!(offer.region_code, "US");
        assert_eq!(offer.discount_percent, Some(50));
        assert!(PriceIngestionManager::to_offer(price("itad", " ", "US", 9.99)).is_none());
        assert!(PriceIngestionManager::to_offer(price("itad", "steam", "US", f64::NAN)).is_none());
    }

    #[test]
    fn request_shape_depends_on_provider() {
        let product = ProductRef {
            id: 1,
            name: "Elden Ring".into(),
            slug: "elden-ring".into(),
            platform: Some("PlayStation 5".into()),
            ..ProductRef::default()
        };
        let regions = vec!["gb".to_string(), "de".to_string()];
        let itad = price_request("itad", product.clone(), &regions);
        assert_eq!(itad.regions, vec!["GB", "DE"]);
        let pc = price_request("pricecharting", product, &regions);
        assert_eq!(pc.regions, vec!["US"]);
        assert_eq!(pc.platforms, vec!["PlayStation 5"]);
    }

    #[tokio::test]
    async fn offers_fan_out_to_enabled_providers_only() {
        let store = MemoryStore::default();
        let id = seed(&store).await;
        let registry = ProviderRegistry::new()
            .with_client(Arc::new(FakeClient::new("nexarda")))
            .with_client(Arc::new(FakeClient::new("itad")));
        let queue = JobQueue::new();
        let ctx = services(&store, registry, IngestConfig::default()).context(&queue);

        FetchOffersForProductJob::new(id, None).run(&ctx).await.unwrap();
        let mut keys = queue.pending_keys();
        keys.sort();
        assert_eq!(keys, vec![format!("prices:itad:{id}:US"), format!("prices:nexarda:{id}:US")]);
    }

    #[tokio::test]
    async fn prices_are_upserted_and_failures_propagate() {
        let store = MemoryStore::default();
        let id = seed(&store).await;
        let client = Arc::new(FakeClient::new("nexarda").reply(
            FetchKind::Prices,
            Reply::Records(vec![
                NormalizedRecord::Price(price("nexarda", "steam", "US", 39.99)),
                NormalizedRecord::Price(price("nexarda", "gog", "US", 35.0)),
            ]),
        ));
        let registry = ProviderRegistry::new().with_client(client.clone());
        let queue = JobQueue::new();
        let svc = services(&store, registry, IngestConfig::default());
        let job = FetchPricesJob::new(id, "nexarda", vec!["US".into()]);

        job.run(&svc.context(&queue)).await.unwrap();
        job.run(&svc.context(&queue)).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let offers = tx.list_offers(id).await.unwrap();
        drop(tx);
        assert_eq!(offers.len(), 2);
        assert!(offers.iter().all(|o| o.is_active && o.currency == "USD"));

        client.set_reply(FetchKind::Prices, Reply::Unavailable);
        let err = job.run(&svc.context(&queue)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, JobError::Provider(ProviderError::SyncFailed { .. })));
    }
}
