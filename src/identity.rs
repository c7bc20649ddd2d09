//! Cross-provider identity resolution.
//!
//! Every provider record that reaches the catalogue goes through
//! [`IdentityResolver::resolve`]: it computes the uid, finds the existing
//! Product (uid first, slug second) or creates it, merges the provider's
//! contribution, and links platforms, genres and the provider alias. All
//! writes go through the caller's transaction.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::database_ops::models::{GameAlias, NewProduct, Product, ProductCategory};
use crate::database_ops::provider_client::GameRecord;
use crate::database_ops::repository::CatalogueTx;
use crate::error::StoreError;
use crate::normalization::{
    classify_platform_family, compute_uid, primary_family, slugify, PlatformFamily, PlatformKey,
};

/// A provider's view of one game, ready to be reconciled.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingGame {
    pub provider: String,
    pub external_id: String,
    pub name: String,
    pub slug: Option<String>,
    pub platforms: Vec<String>,
    pub genres: Vec<String>,
    pub released: Option<NaiveDate>,
    pub rating: Option<f64>,
    pub popularity: Option<f64>,
    pub category: ProductCategory,
    /// Stored under `metadata.sources[provider]`.
    pub source_metadata: Value,
}

impl From<&GameRecord> for IncomingGame {
    fn from(record: &GameRecord) -> Self {
        let mut meta = record.payload.clone();
        if let Some(map) = meta.as_object_mut() {
            map.insert("external_id".into(), json!(record.external_id));
            map.insert("name".into(), json!(record.name));
            if let Some(summary) = &record.summary {
                map.insert("summary".into(), json!(summary));
            }
            if let Some(image) = &record.image_url {
                map.insert("image_url".into(), json!(image));
            }
            if let Some(mc) = record.metacritic {
                map.insert("metacritic".into(), json!(mc));
            }
        }
        Self {
            provider: record.provider.clone(),
            external_id: record.external_id.clone(),
            name: record.name.clone(),
            slug: record.slug.clone(),
            platforms: record.platforms.clone(),
            genres: record.genres.clone(),
            released: record.released,
            rating: record.rating,
            popularity: None,
            category: ProductCategory::Game,
            source_metadata: meta,
        }
    }
}

/// Derived identity of an incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub slug: String,
    pub family: Option<PlatformFamily>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub product: Product,
    pub alias: GameAlias,
    pub created: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl IdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// Pure: uid, slug and family for an incoming record.
    pub fn identify(&self, incoming: &IncomingGame) -> Identity {
        let family = primary_family(&incoming.platforms);
        let slug = incoming
            .slug
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&incoming.name));
        Identity {
            uid: compute_uid(&incoming.name, incoming.released, family),
            slug,
            family,
        }
    }

    /// Resolve-or-create the Product for `incoming` and link everything to it.
    #[instrument(skip(self, tx, incoming), fields(provider = %incoming.provider, external_id = %incoming.external_id))]
    pub async fn resolve(
        &self,
        tx: &mut dyn CatalogueTx,
        incoming: &IncomingGame,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StoreError> {
        let identity = self.identify(incoming);

        let existing = match tx.find_product_by_uid(&identity.uid).await? {
            Some(p) => Some(p),
            None => tx.find_product_by_slug(&identity.slug).await?,
        };

        let (product, created) = match existing {
            Some(mut product) => {
                merge_into(&mut product, incoming, identity.family, now);
                tx.update_product(&product).await?;
                (product, false)
            }
            None => {
                let new = new_product(incoming, &identity, now);
                let expected_metadata = new.metadata.clone();
                let mut product = tx.insert_product(new).await?;
                // a concurrent writer may have won the uid; fold ours in
                let created = product.metadata == expected_metadata;
                if !created {
                    merge_into(&mut product, incoming, identity.family, now);
                    tx.update_product(&product).await?;
                }
                (product, created)
            }
        };
        debug!(product_id = product.id, uid = %product.uid, created, "identity resolved");

        let alias = self.link(tx, &product, incoming).await?;
        Ok(Resolution {
            product,
            alias,
            created,
        })
    }

    /// Merge a provider record into a known Product (enrichment path, where
    /// the provider's date may legitimately differ and so its uid would too).
    pub async fn enrich(
        &self,
        tx: &mut dyn CatalogueTx,
        product_id: i64,
        incoming: &IncomingGame,
        now: DateTime<Utc>,
    ) -> Result<Product, StoreError> {
        let mut product = tx
            .get_product(product_id)
            .await?
            .ok_or_else(|| StoreError::not_found("product", product_id))?;
        let family = primary_family(&incoming.platforms);
        merge_into(&mut product, incoming, family, now);
        tx.update_product(&product).await?;
        self.link(tx, &product, incoming).await?;
        Ok(product)
    }

    async fn link(
        &self,
        tx: &mut dyn CatalogueTx,
        product: &Product,
        incoming: &IncomingGame,
    ) -> Result<GameAlias, StoreError> {
        let mut platform_ids = Vec::new();
        for raw in &incoming.platforms {
            let key = PlatformKey::new(raw);
            if key.code().is_empty() {
                continue;
            }
            let platform = tx
                .upsert_platform(key.code(), raw.trim(), classify_platform_family(raw))
                .await?;
            platform_ids.push(platform.id);
        }
        tx.attach_platforms(product.id, &platform_ids).await?;

        let mut genre_ids = Vec::new();
        for raw in &incoming.genres {
            let slug = slugify(raw);
            if slug.is_empty() {
                continue;
            }
            genre_ids.push(tx.upsert_genre(&slug, raw.trim()).await?.id);
        }
        tx.attach_genres(product.id, &genre_ids).await?;

        tx.upsert_alias(
            product.id,
            &incoming.provider,
            &incoming.external_id,
            Some(incoming.name.as_str()),
        )
        .await
    }
}

fn new_product(incoming: &IncomingGame, identity: &Identity, now: DateTime<Utc>) -> NewProduct {
    let mut external_ids = std::collections::BTreeMap::new();
    external_ids.insert(incoming.provider.clone(), incoming.external_id.clone());
    NewProduct {
        uid: identity.uid.clone(),
        slug: identity.slug.clone(),
        name: incoming.name.trim().to_string(),
        platform: incoming.platforms.first().map(|p| p.trim().to_string()),
        primary_platform_family: identity.family,
        category: incoming.category,
        release_date: incoming.released,
        popularity_score: incoming.popularity.map(clamp01),
        rating: incoming.rating.filter(|r| *r > 0.0),
        freshness_score: incoming.released.map(|d| freshness_score(d, now.date_naive())),
        metadata: json!({
            "sources": { incoming.provider.clone(): stamped(&incoming.source_metadata, now) }
        }),
        external_ids,
    }
}

/// Display fields are first-writer-wins; the provider's metadata sub-tree is
/// replaced wholesale; time-varying scores are refreshed.
pub fn merge_into(
    product: &mut Product,
    incoming: &IncomingGame,
    family: Option<PlatformFamily>,
    now: DateTime<Utc>,
) {
    if product.name.trim().is_empty() {
        product.name = incoming.name.trim().to_string();
    }
    if product.platform.as_deref().map_or(true, |p| p.trim().is_empty()) {
        product.platform = incoming.platforms.first().map(|p| p.trim().to_string());
    }
    if product.primary_platform_family.is_none() {
        product.primary_platform_family = family;
    }
    if product.release_date.is_none() {
        product.release_date = incoming.released;
    }
    if product.rating.map_or(true, |r| r <= 0.0) {
        if let Some(r) = incoming.rating.filter(|r| *r > 0.0) {
            product.rating = Some(r);
        }
    }
    if let Some(p) = incoming.popularity {
        product.popularity_score = Some(clamp01(p));
    }
    product.freshness_score = product
        .release_date
        .map(|d| freshness_score(d, now.date_naive()));

    product.set_source_metadata(&incoming.provider, stamped(&incoming.source_metadata, now));
    product
        .external_ids
        .insert(incoming.provider.clone(), incoming.external_id.clone());
}

fn stamped(meta: &Value, now: DateTime<Utc>) -> Value {
    let mut out = if meta.is_object() { meta.clone() } else { json!({ "raw": meta }) };
    if let Some(map) = out.as_object_mut() {
        map.insert("fetched_at".into(), json!(now.to_rfc3339()));
    }
    out
}

/// `1 - days_since_release / 365`, clamped; unreleased titles are fully fresh.
pub fn freshness_score(released: NaiveDate, today: NaiveDate) -> f64 {
    let days = (today - released).num_days();
    if days <= 0 {
        return 1.0;
    }
    clamp01(1.0 - days as f64 / 365.0)
}

/// Rank-derived popularity: first of `n` gets 1.0, last gets `1/n`.
pub fn popularity_from_rank(index: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    clamp01((total.saturating_sub(index)) as f64 / total as f64)
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::repository::CatalogueStore;

    fn incoming(provider: &str, id: &str, name: &str, date: Option<&str>, platforms: &[&str]) -> IncomingGame {
        IncomingGame {
            provider: provider.into(),
            external_id: id.into(),
            name: name.into(),
            slug: None,
            platforms: platforms.iter().map(|s| s.to_string()).collect(),
            genres: vec!["RPG".into()],
            released: date.and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            rating: None,
            popularity: None,
            category: ProductCategory::Game,
            source_metadata: json!({"seen": true}),
        }
    }

    #[test]
    fn identity_ignores_title_formatting() {
        let r = IdentityResolver::new();
        let a = r.identify(&incoming("rawg", "1", "Starfield", Some("2023-09-06"), &["Xbox Series X|S"]));
        let b = r.identify(&incoming("nexarda", "2", "  STARFIELD ", Some("2023-09-06"), &["xbox series s"]));
        assert_eq!(a.uid, b.uid);
        assert_eq!(a.family, Some(PlatformFamily::Xbox));
        assert_eq!(a.slug, "starfield");
    }

    #[tokio::test]
    async fn creates_then_merges() {
        let store = MemoryStore::default();
        let resolver = IdentityResolver::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let mut first = incoming("rawg", "starfield", "Starfield", Some("2023-09-06"), &["Xbox Series X|S", "PC"]);
        first.slug = Some("starfield".into());
        let created = resolver.resolve(tx.as_mut(), &first, now).await.unwrap();
        assert!(created.created);
        assert_eq!(created.product.primary_platform_family, Some(PlatformFamily::Xbox));
        assert_eq!(created.alias.provider, "rawg");
        assert_eq!(created.alias.provider_game_id, "starfield");

        // different provider, same identity; display fields stay, rating fills in
        let mut second = incoming("nexarda", "42", "STARFIELD", Some("2023-09-06"), &["Xbox Series S"]);
        second.rating = Some(88.0);
        second.source_metadata = json!({"price": 1});
        let merged = resolver.resolve(tx.as_mut(), &second, now).await.unwrap();
        assert!(!merged.created);
        assert_eq!(merged.product.id, created.product.id);
        assert_eq!(merged.product.name, "Starfield");
        assert_eq!(merged.product.rating, Some(88.0));
        assert_eq!(merged.product.external_ids.len(), 2);
        assert_eq!(merged.product.source_metadata("nexarda").unwrap()["price"], 1);
        assert!(merged.product.source_metadata("rawg").is_some());

        let platforms = tx.platforms_for(created.product.id).await.unwrap();
        assert_eq!(platforms.len(), 3);
        tx.commit().await.unwrap();
        assert_eq!(store.product_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slug_matches_when_uid_differs() {
        let store = MemoryStore::default();
        let resolver = IdentityResolver::new();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let a = resolver
            .resolve(tx.as_mut(), &incoming("rawg", "halo", "Halo Infinite", Some("2021-12-08"), &["Xbox One"]), now)
            .await
            .unwrap();
        // no date: uid differs, slug does not
        let b = resolver
            .resolve(tx.as_mut(), &incoming("itad", "haloinfinite", "Halo: Infinite", None, &["PC"]), now)
            .await
            .unwrap();
        assert_eq!(a.product.id, b.product.id);
        assert_eq!(b.product.uid, a.product.uid);
        assert_eq!(b.product.release_date, NaiveDate::from_ymd_opt(2021, 12, 8));
    }

    #[tokio::test]
    async fn alias_is_moved_not_duplicated() {
        let store = MemoryStore::default();
        let resolver = IdentityResolver::new();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let one = resolver
            .resolve(tx.as_mut(), &incoming("giantbomb", "123", "Portal", Some("2007-10-10"), &["PC"]), now)
            .await
            .unwrap();
        let two = resolver
            .resolve(tx.as_mut(), &incoming("giantbomb", "123", "Portal 2", Some("2011-04-19"), &["PC"]), now)
            .await
            .unwrap();
        assert_ne!(one.product.id, two.product.id);
        assert_eq!(one.alias.id, two.alias.id);
        tx.commit().await.unwrap();
        let aliases = store.all_aliases().await;
        let gb: Vec<_> = aliases.iter().filter(|a| a.provider == "giantbomb").collect();
        assert_eq!(gb.len(), 1);
        assert_eq!(gb[0].product_id, two.product.id);
        assert_eq!(gb[0].title.as_deref(), Some("Portal 2"));
    }

    #[test]
    fn scores() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(freshness_score(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), today), 1.0);
        assert_eq!(freshness_score(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), today), 0.0);
        let half = freshness_score(today - chrono::Duration::days(182), today);
        assert!((half - 0.5).abs() < 0.01);
        assert_eq!(popularity_from_rank(0, 4), 1.0);
        assert_eq!(popularity_from_rank(3, 4), 0.25);
        assert_eq!(popularity_from_rank(0, 0), 0.0);
    }
}
