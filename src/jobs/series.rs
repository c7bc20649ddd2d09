use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::context::JobContext;
use super::{Job, JobOutcome};
use crate::database_ops::models::Product;
use crate::error::JobError;
use crate::normalization::normalize_name;

const MAX_CANDIDATES: usize = 500;
const ROMAN_NUMERALS: [&str; 15] = [
    "ii", "iii", "iv", "v", "vi", "vii", "viii", "ix", "x", "xi", "xii", "xiii", "xiv", "xv", "xvi",
];

/// Series key of a title: the part before any subtitle, normalised, without
/// trailing sequel numbers. `"Halo 3: ODST"` and `"Halo Infinite"` differ;
/// `"Halo 2"` and `"Halo: Reach"` share `"halo"`.
pub fn series_key(name: &str) -> Option<String> {
    let head = name.split(':').next().unwrap_or(name);
    let head = head.split(" - ").next().unwrap_or(head);
    let normalized = normalize_name(head)?;
    let mut tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| is_sequel_marker(t)) {
        tokens.pop();
    }
    let key = tokens.join(" ");
    (!key.is_empty()).then_some(key)
}

fn is_sequel_marker(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii_digit()) || ROMAN_NUMERALS.contains(&token)
}

fn release_order(a: &Product, b: &Product) -> Ordering {
    match (a.release_date, b.release_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.name.cmp(&b.name))
    .then_with(|| a.id.cmp(&b.id))
}

/// Group a product with its sequels and write the group onto every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSeriesJob {
    pub product_id: i64,
}

impl BuildSeriesJob {
    pub fn new(product_id: i64) -> Self {
        Self { product_id }
    }
}

#[async_trait]
impl Job for BuildSeriesJob {
    fn name(&self) -> &'static str {
        "build_series"
    }

    fn queue(&self) -> &'static str {
        "aggregate"
    }

    fn idempotency_key(&self) -> String {
        format!("series:{}", self.product_id)
    }

    #[instrument(skip(self, ctx), fields(product_id = self.product_id))]
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let product = ctx.product(self.product_id).await?;
        let Some(key) = series_key(&product.name) else {
            return Ok(JobOutcome::Completed(json!({ "skipped": "no series key" })));
        };
        // longest token narrows the containment search the most
        let fragment = key
            .split(' ')
            .max_by_key(|t| t.len())
            .unwrap_or(key.as_str())
            .to_string();

        let mut tx = ctx.catalogue().begin().await?;
        let mut members: Vec<Product> = tx
            .search_products_by_name(&fragment, MAX_CANDIDATES)
            .await?
            .into_iter()
            .filter(|p| series_key(&p.name).as_deref() == Some(key.as_str()))
            .collect();
        if !members.iter().any(|p| p.id == product.id) {
            if let Some(current) = tx.get_product(product.id).await? {
                members.push(current);
            }
        }
        members.sort_by(release_order);

        let series = json!({
            "key": key,
            "size": members.len(),
            "members": members
                .iter()
                .map(|m| json!({ "id": m.id, "name": m.name, "release_date": m.release_date }))
                .collect::<Vec<Value>>(),
        });
        let mut updated = 0usize;
        for member in &mut members {
            if member.metadata.get("series") == Some(&series) {
                continue;
            }
            member.set_metadata_key("series", series.clone());
            tx.update_product(member).await?;
            updated += 1;
        }
        tx.commit().await?;

        if updated == 0 {
            debug!(%key, "series unchanged");
        } else {
            info!(%key, size = members.len(), updated, "series written");
        }
        Ok(JobOutcome::Completed(json!({
            "key": key,
            "size": members.len(),
            "updated": updated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::provider_client::ProviderRegistry;
    use crate::database_ops::repository::CatalogueStore;
    use crate::identity::{IdentityResolver, IncomingGame};
    use crate::jobs::testing::{game, services, ymd};
    use crate::jobs::JobQueue;

    #[test]
    fn keys_drop_subtitles_and_sequel_numbers() {
        assert_eq!(series_key("Halo 2").as_deref(), Some("halo"));
        assert_eq!(series_key("Halo: Infinite").as_deref(), Some("halo"));
        assert_eq!(series_key("Final Fantasy VII").as_deref(), Some("final fantasy"));
        assert_eq!(series_key("Resident Evil 4 - Remake").as_deref(), Some("resident evil"));
        assert_eq!(series_key("Spider-Man 2").as_deref(), Some("spider man"));
        assert_eq!(series_key("2048").as_deref(), Some("2048"));
        assert_eq!(series_key("   "), None);
    }

    #[tokio::test]
    async fn series_is_written_to_every_member_once() {
        let store = MemoryStore::default();
        let now = chrono::Utc::now();
        let mut ids = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for (id, name, date) in [
            ("halo-3", "Halo 3", ymd(2007, 9, 25)),
            ("halo-2", "Halo 2", ymd(2004, 11, 9)),
            ("halo-infinite", "Halo: Infinite", ymd(2021, 12, 8)),
            ("halogen", "Halogen Lamp Sim", ymd(2020, 1, 1)),
        ] {
            let record = game("rawg", id, name, "Xbox", date);
            let res = IdentityResolver::new()
                .resolve(tx.as_mut(), &IncomingGame::from(&record), now)
                .await
                .unwrap();
            ids.push(res.product.id);
        }
        tx.commit().await.unwrap();

        let queue = JobQueue::new();
        let svc = services(&store, ProviderRegistry::new(), IngestConfig::default());
        let outcome = BuildSeriesJob::new(ids[0]).run(&svc.context(&queue)).await.unwrap();
        let JobOutcome::Completed(first) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(first["size"], 3);
        assert_eq!(first["updated"], 3);

        let halo2 = store.product(ids[1]).await.unwrap().unwrap();
        let series = &halo2.metadata["series"];
        assert_eq!(series["key"], "halo");
        assert_eq!(series["members"][0]["name"], "Halo 2");
        assert_eq!(series["members"][2]["name"], "Halo: Infinite");
        let lamp = store.product(ids[3]).await.unwrap().unwrap();
        assert!(lamp.metadata.get("series").is_none());

        let outcome = BuildSeriesJob::new(ids[2]).run(&svc.context(&queue)).await.unwrap();
        let JobOutcome::Completed(again) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(again["updated"], 0);
    }

    #[tokio::test]
    async fn accented_and_plain_names_share_a_series() {
        let store = MemoryStore::default();
        let now = chrono::Utc::now();
        let mut ids = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for (id, name, date) in [
            ("snap", "Pokémon Snap", ymd(1999, 3, 21)),
            ("snap-2", "Pokemon Snap 2", ymd(2021, 4, 30)),
        ] {
            let record = game("rawg", id, name, "N64", date);
            let res = IdentityResolver::new()
                .resolve(tx.as_mut(), &IncomingGame::from(&record), now)
                .await
                .unwrap();
            ids.push(res.product.id);
        }
        tx.commit().await.unwrap();
        assert_ne!(ids[0], ids[1]);

        let queue = JobQueue::new();
        let svc = services(&store, ProviderRegistry::new(), IngestConfig::default());
        // built from the plain name; the accented one must still be found
        let outcome = BuildSeriesJob::new(ids[1]).run(&svc.context(&queue)).await.unwrap();
        let JobOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report["key"], "pokemon snap");
        assert_eq!(report["size"], 2);

        let original = store.product(ids[0]).await.unwrap().unwrap();
        assert_eq!(original.metadata["series"]["members"][0]["name"], "Pokémon Snap");
    }
}
