use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::context::JobContext;
use super::{Job, JobOutcome};
use crate::database_ops::models::NewMedia;
use crate::database_ops::provider_client::{FetchRequest, MediaRecord, NormalizedRecord};
use crate::error::{JobError, ProviderError};

/// Pull trailers, covers and screenshots from every media provider the
/// product has an id for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMediaJob {
    pub product_id: i64,
}

impl FetchMediaJob {
    pub fn new(product_id: i64) -> Self {
        Self { product_id }
    }
}

fn to_new_media(record: MediaRecord) -> Option<NewMedia> {
    let url = Url::parse(record.url.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(NewMedia {
        provider: record.provider,
        url: url.to_string(),
        role: record.role,
        title: record.title,
        metadata: record.metadata,
    })
}

#[async_trait]
impl Job for FetchMediaJob {
    fn name(&self) -> &'static str {
        "fetch_media"
    }

    fn queue(&self) -> &'static str {
        "media"
    }

    fn idempotency_key(&self) -> String {
        format!("media:{}", self.product_id)
    }

    #[instrument(skip(self, ctx), fields(product_id = self.product_id))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let product = ctx.product(self.product_id).await?;
        let limit = ctx.config.media.max_screenshots.max(1);

        let mut collected: Vec<NewMedia> = Vec::new();
        let mut providers = Vec::new();
        for provider in &ctx.config.media.providers {
            let Some(client) = ctx.registry.enabled(provider) else {
                continue;
            };
            let Some(external_id) = product.external_ids.get(provider) else {
                debug!(%provider, "product has no id for media provider");
                continue;
            };
            match client.fetch(&FetchRequest::media(external_id.clone(), limit)).await {
                Ok(records) => {
                    providers.push(provider.clone());
                    collected.extend(
                        records
                            .into_iter()
                            .filter_map(NormalizedRecord::into_media)
                            .filter_map(to_new_media),
                    );
                }
                Err(e @ ProviderError::RateLimited { .. }) => return Err(JobError::from_provider(e)),
                Err(e) => warn!(%provider, error = %e, "media lookup failed; skipping provider"),
            }
        }

        let mut tx = ctx.catalogue().begin().await?;
        for media in &collected {
            tx.upsert_media(self.product_id, media).await?;
        }
        tx.commit().await?;
        info!(count = collected.len(), providers = ?providers, "media stored");
        Ok(JobOutcome::Completed(json!({
            "stored": collected.len(),
            "providers": providers,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::models::MediaRole;
    use crate::database_ops::provider_client::{FetchKind, ProviderRegistry};
    use crate::database_ops::repository::CatalogueStore;
    use crate::identity::{IdentityResolver, IncomingGame};
    use crate::jobs::testing::{game, services, FakeClient, Reply};
    use crate::jobs::JobQueue;
    use std::sync::Arc;

    fn media(url: &str, role: MediaRole) -> NormalizedRecord {
        NormalizedRecord::Media(MediaRecord {
            provider: "rawg".into(),
            url: url.into(),
            role,
            title: None,
            metadata: json!({}),
        })
    }

    #[tokio::test]
    async fn media_is_upserted_by_url() {
        let store = MemoryStore::default();
        let record = game("rawg", "hades", "Hades", "PC", None);
        let mut tx = store.begin().await.unwrap();
        let id = IdentityResolver::new()
            .resolve(tx.as_mut(), &IncomingGame::from(&record), chrono::Utc::now())
            .await
            .unwrap()
            .product
            .id;
        tx.commit().await.unwrap();

        let rawg = Arc::new(FakeClient::new("rawg").reply(
            FetchKind::Media,
            Reply::Records(vec![
                media("https://media.rawg.io/hades/trailer.mp4", MediaRole::Trailer),
                media("https://media.rawg.io/hades/1.jpg", MediaRole::Screenshot),
                media("not a url", MediaRole::Screenshot),
            ]),
        ));
        let gb = Arc::new(FakeClient::new("giantbomb").reply(FetchKind::Media, Reply::Unavailable));
        let registry = ProviderRegistry::new().with_client(rawg.clone()).with_client(gb.clone());
        let queue = JobQueue::new();
        let svc = services(&store, registry, IngestConfig::default());

        FetchMediaJob::new(id).run(&svc.context(&queue)).await.unwrap();
        FetchMediaJob::new(id).run(&svc.context(&queue)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let rows = tx.list_media(id).await.unwrap();
        drop(tx);
        assert_eq!(rows.len(), 2);
        assert_eq!(rawg.requests.lock().unwrap()[0].external_id.as_deref(), Some("hades"));
        // no giantbomb id on the product, so it is never asked
        assert_eq!(gb.calls(), 0);

        rawg.set_reply(FetchKind::Media, Reply::RateLimited(1.5));
        let err = FetchMediaJob::new(id).run(&svc.context(&queue)).await.unwrap_err();
        assert!(matches!(err, JobError::RateLimited { .. }));
    }
}
