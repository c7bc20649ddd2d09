use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::context::JobContext;
use super::{Job, JobOutcome};
use crate::database_ops::models::{LinkCheck, LinkStatus};
use crate::error::{JobError, StoreError};

/// Checks whether a stored URL still resolves.
#[async_trait]
pub trait LinkProber: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> LinkCheck;
}

/// HEAD first; GET when the server refuses HEAD with 405.
#[derive(Debug, Clone)]
pub struct HttpLinkProber {
    client: Client,
}

impl Default for HttpLinkProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpLinkProber {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent(concat!("catalogue-ingest/", env!("CARGO_PKG_VERSION")))
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
                .unwrap_or_default(),
        }
    }
}

fn classify(code: StatusCode) -> LinkStatus {
    if code.is_success() || code.is_redirection() {
        LinkStatus::Ok
    } else {
        LinkStatus::Failed
    }
}

#[async_trait]
impl LinkProber for HttpLinkProber {
    async fn probe(&self, url: &str, timeout: Duration) -> LinkCheck {
        let mut response = self.client.head(url).timeout(timeout).send().await;
        if matches!(&response, Ok(r) if r.status() == StatusCode::METHOD_NOT_ALLOWED) {
            response = self.client.get(url).timeout(timeout).send().await;
        }
        let checked_at = Utc::now();
        match response {
            Ok(r) => {
                let status = classify(r.status());
                LinkCheck {
                    status,
                    code: Some(r.status().as_u16()),
                    checked_at,
                    reason: (status != LinkStatus::Ok)
                        .then(|| r.status().canonical_reason().unwrap_or("error").to_string()),
                }
            }
            Err(e) => LinkCheck {
                status: LinkStatus::Error,
                code: None,
                checked_at,
                reason: Some(if e.is_timeout() {
                    "timeout".to_string()
                } else {
                    e.to_string()
                }),
            },
        }
    }
}

/// Probe a product's media and offer URLs and record the result on each row.
/// Offers whose link fails are deactivated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyLinksJob {
    pub product_id: i64,
}

impl VerifyLinksJob {
    pub fn new(product_id: i64) -> Self {
        Self { product_id }
    }
}

#[async_trait]
impl Job for VerifyLinksJob {
    fn name(&self) -> &'static str {
        "verify_links"
    }

    fn queue(&self) -> &'static str {
        "verify"
    }

    fn idempotency_key(&self) -> String {
        format!("verify:{}", self.product_id)
    }

    #[instrument(skip(self, ctx), fields(product_id = self.product_id))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        ctx.product(self.product_id).await?;
        let timeout = Duration::from_secs(ctx.config.verify.timeout_secs.max(1));
        let max_links = ctx.config.verify.max_links;

        // read, probe without holding the transaction, then write
        let (media, offers) = {
            let mut tx = ctx.catalogue().begin().await?;
            (tx.list_media(self.product_id).await?, tx.list_offers(self.product_id).await?)
        };
        let media_targets: Vec<(i64, String, bool)> = media
            .into_iter()
            .map(|m| (m.id, m.url, m.is_active))
            .take(max_links)
            .collect();
        let offer_targets: Vec<(i64, String)> = offers
            .into_iter()
            .filter_map(|o| o.url.map(|u| (o.id, u)))
            .take(max_links.saturating_sub(media_targets.len()))
            .collect();

        let mut media_checks = Vec::with_capacity(media_targets.len());
        for (id, url, active) in media_targets {
            let check = ctx.services.prober.probe(&url, timeout).await;
            debug!(%url, status = ?check.status, "media link probed");
            media_checks.push((id, check, active));
        }
        let mut offer_checks = Vec::with_capacity(offer_targets.len());
        for (id, url) in offer_targets {
            let check = ctx.services.prober.probe(&url, timeout).await;
            debug!(%url, status = ?check.status, "offer link probed");
            offer_checks.push((id, check));
        }

        let mut deactivated = 0usize;
        let mut tx = ctx.catalogue().begin().await?;
        for (id, check, active) in &media_checks {
            tx.record_media_check(*id, serde_json::to_value(check).map_err(StoreError::from)?, *active)
                .await?;
        }
        for (id, check) in &offer_checks {
            let ok = check.status == LinkStatus::Ok;
            if !ok {
                deactivated += 1;
            }
            tx.record_offer_check(*id, serde_json::to_value(check).map_err(StoreError::from)?, ok)
                .await?;
        }
        tx.commit().await?;

        let checked = media_checks.len() + offer_checks.len();
        info!(checked, deactivated, "links verified");
        Ok(JobOutcome::Completed(json!({
            "checked": checked,
            "deactivated": deactivated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::models::{MediaRole, NewMedia, NewOffer};
    use crate::database_ops::provider_client::ProviderRegistry;
    use crate::database_ops::repository::CatalogueStore;
    use crate::identity::{IdentityResolver, IncomingGame};
    use crate::jobs::testing::{game, services, FakeProber};
    use crate::jobs::JobQueue;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn offer(store: &str, url: &str) -> NewOffer {
        NewOffer {
            provider: "itad".into(),
            store: store.into(),
            region_code: "US".into(),
            currency: "USD".into(),
            price: 19.99,
            regular_price: None,
            discount_percent: None,
            url: Some(url.into()),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn failed_offer_links_are_deactivated() {
        let store = MemoryStore::default();
        let mut tx = store.begin().await.unwrap();
        let id = IdentityResolver::new()
            .resolve(
                tx.as_mut(),
                &IncomingGame::from(&game("rawg", "celeste", "Celeste", "PC", None)),
                Utc::now(),
            )
            .await
            .unwrap()
            .product
            .id;
        tx.upsert_offer(id, &offer("steam", "https://steam.example/celeste")).await.unwrap();
        tx.upsert_offer(id, &offer("gone", "https://gone.example/celeste")).await.unwrap();
        tx.upsert_offer(id, &offer("down", "https://down.example/celeste")).await.unwrap();
        tx.upsert_media(
            id,
            &NewMedia {
                provider: "rawg".into(),
                url: "https://media.example/celeste.jpg".into(),
                role: MediaRole::Cover,
                title: None,
                metadata: json!({}),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let prober = FakeProber(HashMap::from([
            ("https://steam.example/celeste".to_string(), 200),
            ("https://gone.example/celeste".to_string(), 404),
            ("https://media.example/celeste.jpg".to_string(), 301),
        ]));
        let queue = JobQueue::new();
        let ctx = services(&store, ProviderRegistry::new(), IngestConfig::default())
            .with_prober(Arc::new(prober))
            .context(&queue);

        let JobOutcome::Completed(report) = VerifyLinksJob::new(id).run(&ctx).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report["checked"], 4);
        assert_eq!(report["deactivated"], 2);

        let mut tx = store.begin().await.unwrap();
        let offers = tx.list_offers(id).await.unwrap();
        let media = tx.list_media(id).await.unwrap();
        drop(tx);
        let active: HashMap<_, _> = offers.iter().map(|o| (o.store.as_str(), o.is_active)).collect();
        assert_eq!(active["steam"], true);
        assert_eq!(active["gone"], false);
        assert_eq!(active["down"], false);
        let gone = offers.iter().find(|o| o.store == "gone").unwrap();
        assert_eq!(gone.metadata["link_check"]["status"], "failed");
        assert_eq!(gone.metadata["link_check"]["code"], 404);
        let down = offers.iter().find(|o| o.store == "down").unwrap();
        assert_eq!(down.metadata["link_check"]["status"], "error");
        assert!(media[0].is_active);
        assert_eq!(media[0].metadata["link_check"]["status"], "ok");
    }
}
