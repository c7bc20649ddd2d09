//! In-process implementation of every store trait.
//!
//! Used by tests, dry runs and single-process deployments without a database.
//! A catalogue transaction holds the catalogue lock for its whole lifetime and
//! works on a copy; commit swaps the copy in, drop discards it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::{
    DatasetSnapshot, GameAlias, Genre, MirrorFilters, MirrorGame, MirrorGameUpsert,
    MirrorSyncState, NewMedia, NewOffer, NewProduct, Platform, Product, ProductMedia,
    ProductOffer, SnapshotStatus, SyncCursor, SyncStrategy,
};
use super::repository::{
    CatalogueStore, CatalogueTx, MirrorRepository, SnapshotRepository, StoreResult,
};
use crate::error::StoreError;
use crate::normalization::{classify_platform_family, slugify, PlatformFamily};

#[derive(Debug, Clone, Default)]
struct CatalogueState {
    next_id: i64,
    products: BTreeMap<i64, Product>,
    platforms: Vec<Platform>,
    genres: Vec<Genre>,
    product_platforms: BTreeSet<(i64, i64)>,
    product_genres: BTreeSet<(i64, i64)>,
    aliases: Vec<GameAlias>,
    media: Vec<ProductMedia>,
    offers: Vec<ProductOffer>,
}

impl CatalogueState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
struct MirrorState {
    games: BTreeMap<i64, MirrorGame>,
    sync: MirrorSyncState,
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    catalogue: Arc<Mutex<CatalogueState>>,
    mirror: Arc<Mutex<MirrorState>>,
    snapshots: Arc<Mutex<Vec<DatasetSnapshot>>>,
    mirror_provider: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("tgdb")
    }
}

impl MemoryStore {
    pub fn new(mirror_provider: &str) -> Self {
        let mirror = MirrorState {
            sync: MirrorSyncState {
                provider: mirror_provider.to_string(),
                ..MirrorSyncState::default()
            },
            ..MirrorState::default()
        };
        Self {
            catalogue: Arc::new(Mutex::new(CatalogueState::default())),
            mirror: Arc::new(Mutex::new(mirror)),
            snapshots: Arc::new(Mutex::new(Vec::new())),
            mirror_provider: mirror_provider.to_string(),
        }
    }

    /// Every product, by id. Test and CLI helper.
    pub async fn products(&self) -> Vec<Product> {
        self.catalogue.lock().await.products.values().cloned().collect()
    }

    pub async fn all_aliases(&self) -> Vec<GameAlias> {
        self.catalogue.lock().await.aliases.clone()
    }
}

#[async_trait]
impl CatalogueStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn CatalogueTx>> {
        let guard = self.catalogue.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }

    async fn product(&self, id: i64) -> StoreResult<Option<Product>> {
        Ok(self.catalogue.lock().await.products.get(&id).cloned())
    }

    async fn product_count(&self) -> StoreResult<i64> {
        Ok(self.catalogue.lock().await.products.len() as i64)
    }

    async fn aliases_for(&self, product_id: i64) -> StoreResult<Vec<GameAlias>> {
        Ok(self
            .catalogue
            .lock()
            .await
            .aliases
            .iter()
            .filter(|a| a.product_id == product_id)
            .cloned()
            .collect())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<CatalogueState>,
    work: CatalogueState,
}

#[async_trait]
impl CatalogueTx for MemoryTx {
    async fn find_product_by_uid(&mut self, uid: &str) -> StoreResult<Option<Product>> {
        Ok(self.work.products.values().find(|p| p.uid == uid).cloned())
    }

    async fn find_product_by_slug(&mut self, slug: &str) -> StoreResult<Option<Product>> {
        Ok(self
            .work
            .products
            .values()
            .find(|p| p.slug.eq_ignore_ascii_case(slug))
            .cloned())
    }

    async fn get_product(&mut self, id: i64) -> StoreResult<Option<Product>> {
        Ok(self.work.products.get(&id).cloned())
    }

    async fn insert_product(&mut self, new: NewProduct) -> StoreResult<Product> {
        if let Some(existing) = self.work.products.values().find(|p| p.uid == new.uid) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let id = self.work.next_id();
        let product = Product {
            id,
            uid: new.uid,
            slug: new.slug,
            name: new.name,
            platform: new.platform,
            primary_platform_family: new.primary_platform_family,
            category: new.category,
            release_date: new.release_date,
            popularity_score: new.popularity_score,
            rating: new.rating,
            freshness_score: new.freshness_score,
            metadata: new.metadata,
            external_ids: new.external_ids,
            created_at: now,
            updated_at: now,
        };
        self.work.products.insert(id, product.clone());
        Ok(product)
    }

    async fn update_product(&mut self, product: &Product) -> StoreResult<()> {
        let row = self
            .work
            .products
            .get_mut(&product.id)
            .ok_or_else(|| StoreError::not_found("product", product.id))?;
        if row.uid != product.uid {
            return Err(StoreError::Conflict(format!(
                "uid of product {} cannot change",
                product.id
            )));
        }
        let created_at = row.created_at;
        *row = product.clone();
        row.created_at = created_at;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn search_products_by_name(
        &mut self,
        fragment: &str,
        limit: usize,
    ) -> StoreResult<Vec<Product>> {
        let needle = fragment.to_lowercase();
        let folded = slugify(fragment);
        Ok(self
            .work
            .products
            .values()
            .filter(|p| p.name.to_lowercase().contains(&needle) || p.slug.contains(&folded))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_platform(
        &mut self,
        code: &str,
        name: &str,
        family: Option<PlatformFamily>,
    ) -> StoreResult<Platform> {
        if let Some(existing) = self.work.platforms.iter_mut().find(|p| p.code == code) {
            if existing.family.is_none() {
                existing.family = family;
            }
            return Ok(existing.clone());
        }
        let platform = Platform {
            id: self.work.next_id(),
            code: code.to_string(),
            name: name.to_string(),
            family,
        };
        self.work.platforms.push(platform.clone());
        Ok(platform)
    }

    async fn upsert_genre(&mut self, slug: &str, name: &str) -> StoreResult<Genre> {
        if let Some(existing) = self.work.genres.iter().find(|g| g.slug == slug) {
            return Ok(existing.clone());
        }
        let genre = Genre {
            id: self.work.next_id(),
            slug: slug.to_string(),
            name: name.to_string(),
        };
        self.work.genres.push(genre.clone());
        Ok(genre)
    }

    async fn attach_platforms(&mut self, product_id: i64, platform_ids: &[i64]) -> StoreResult<()> {
        for id in platform_ids {
            self.work.product_platforms.insert((product_id, *id));
        }
        Ok(())
    }

    async fn attach_genres(&mut self, product_id: i64, genre_ids: &[i64]) -> StoreResult<()> {
        for id in genre_ids {
            self.work.product_genres.insert((product_id, *id));
        }
        Ok(())
    }

    async fn platforms_for(&mut self, product_id: i64) -> StoreResult<Vec<Platform>> {
        let ids: BTreeSet<i64> = self
            .work
            .product_platforms
            .iter()
            .filter(|(p, _)| *p == product_id)
            .map(|(_, id)| *id)
            .collect();
        Ok(self
            .work
            .platforms
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn genres_for(&mut self, product_id: i64) -> StoreResult<Vec<Genre>> {
        let ids: BTreeSet<i64> = self
            .work
            .product_genres
            .iter()
            .filter(|(p, _)| *p == product_id)
            .map(|(_, id)| *id)
            .collect();
        Ok(self
            .work
            .genres
            .iter()
            .filter(|g| ids.contains(&g.id))
            .cloned()
            .collect())
    }

    async fn find_alias(
        &mut self,
        provider: &str,
        provider_game_id: &str,
    ) -> StoreResult<Option<GameAlias>> {
        Ok(self
            .work
            .aliases
            .iter()
            .find(|a| a.provider == provider && a.provider_game_id == provider_game_id)
            .cloned())
    }

    async fn upsert_alias(
        &mut self,
        product_id: i64,
        provider: &str,
        provider_game_id: &str,
        title: Option<&str>,
    ) -> StoreResult<GameAlias> {
        let now = Utc::now();
        if let Some(existing) = self
            .work
            .aliases
            .iter_mut()
            .find(|a| a.provider == provider && a.provider_game_id == provider_game_id)
        {
            existing.product_id = product_id;
            if let Some(t) = title {
                existing.title = Some(t.to_string());
            }
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let alias = GameAlias {
            id: self.work.next_id(),
            product_id,
            provider: provider.to_string(),
            provider_game_id: provider_game_id.to_string(),
            title: title.map(str::to_string),
            updated_at: now,
        };
        self.work.aliases.push(alias.clone());
        Ok(alias)
    }

    async fn upsert_media(
        &mut self,
        product_id: i64,
        media: &NewMedia,
    ) -> StoreResult<ProductMedia> {
        let now = Utc::now();
        if let Some(existing) = self
            .work
            .media
            .iter_mut()
            .find(|m| m.product_id == product_id && m.url == media.url)
        {
            existing.provider = media.provider.clone();
            existing.role = media.role;
            existing.kind = media.role.kind();
            existing.title = media.title.clone().or(existing.title.take());
            existing.metadata = merge_objects(&existing.metadata, &media.metadata);
            existing.is_active = true;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let row = ProductMedia {
            id: self.work.next_id(),
            product_id,
            provider: media.provider.clone(),
            url: media.url.clone(),
            kind: media.role.kind(),
            role: media.role,
            title: media.title.clone(),
            is_active: true,
            metadata: media.metadata.clone(),
            updated_at: now,
        };
        self.work.media.push(row.clone());
        Ok(row)
    }

    async fn list_media(&mut self, product_id: i64) -> StoreResult<Vec<ProductMedia>> {
        Ok(self
            .work
            .media
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn record_media_check(
        &mut self,
        media_id: i64,
        check: Value,
        is_active: bool,
    ) -> StoreResult<()> {
        let row = self
            .work
            .media
            .iter_mut()
            .find(|m| m.id == media_id)
            .ok_or_else(|| StoreError::not_found("media", media_id))?;
        set_key(&mut row.metadata, "link_check", check);
        row.is_active = is_active;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_offer(
        &mut self,
        product_id: i64,
        offer: &NewOffer,
    ) -> StoreResult<ProductOffer> {
        let now = Utc::now();
        if let Some(existing) = self.work.offers.iter_mut().find(|o| {
            o.product_id == product_id
                && o.provider == offer.provider
                && o.store == offer.store
                && o.region_code == offer.region_code
        }) {
            existing.currency = offer.currency.clone();
            existing.price = offer.price;
            existing.regular_price = offer.regular_price;
            existing.discount_percent = offer.discount_percent;
            existing.url = offer.url.clone().or(existing.url.take());
            existing.metadata = merge_objects(&existing.metadata, &offer.metadata);
            existing.is_active = true;
            existing.last_seen_at = now;
            return Ok(existing.clone());
        }
        let row = ProductOffer {
            id: self.work.next_id(),
            product_id,
            provider: offer.provider.clone(),
            store: offer.store.clone(),
            region_code: offer.region_code.clone(),
            currency: offer.currency.clone(),
            price: offer.price,
            regular_price: offer.regular_price,
            discount_percent: offer.discount_percent,
            url: offer.url.clone(),
            is_active: true,
            metadata: offer.metadata.clone(),
            last_seen_at: now,
        };
        self.work.offers.push(row.clone());
        Ok(row)
    }

    async fn list_offers(&mut self, product_id: i64) -> StoreResult<Vec<ProductOffer>> {
        Ok(self
            .work
            .offers
            .iter()
            .filter(|o| o.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn record_offer_check(
        &mut self,
        offer_id: i64,
        check: Value,
        is_active: bool,
    ) -> StoreResult<()> {
        let row = self
            .work
            .offers
            .iter_mut()
            .find(|o| o.id == offer_id)
            .ok_or_else(|| StoreError::not_found("offer", offer_id))?;
        set_key(&mut row.metadata, "link_check", check);
        row.is_active = is_active;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

/// Shallow merge of two JSON objects, right side wins. Mirrors the
/// `metadata || EXCLUDED.metadata` upserts on the Postgres side.
fn merge_objects(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = l.clone();
            for (k, v) in r {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        (_, Value::Null) => left.clone(),
        _ => right.clone(),
    }
}

fn set_key(target: &mut Value, key: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Some(map) = target.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

/// Filter predicate shared by `search` and the trending mirror source.
pub(crate) fn mirror_matches(game: &MirrorGame, query: &str, filters: &MirrorFilters) -> bool {
    let query = query.trim().to_lowercase();
    if !query.is_empty() && !game.title.to_lowercase().contains(&query) {
        return false;
    }
    if let Some(category) = filters.category.as_deref() {
        if !game.genres.iter().any(|g| g.eq_ignore_ascii_case(category)) {
            return false;
        }
    }
    if !filters.platforms.is_empty() {
        let Some(platform) = game.platform.as_deref() else {
            return false;
        };
        if !filters
            .platforms
            .iter()
            .any(|p| p.eq_ignore_ascii_case(platform))
        {
            return false;
        }
    }
    if let Some(family) = filters.family {
        if game.family != Some(family) {
            return false;
        }
    }
    if let Some(after) = filters.released_after {
        if !game.release_date.is_some_and(|d| d >= after) {
            return false;
        }
    }
    if let Some(cutoff) = filters.exclude_pc_before {
        if game.family == Some(PlatformFamily::Pc) && game.release_date.is_some_and(|d| d < cutoff)
        {
            return false;
        }
    }
    true
}

#[async_trait]
impl MirrorRepository for MemoryStore {
    fn provider(&self) -> &str {
        &self.mirror_provider
    }

    async fn upsert_game(&self, game: MirrorGameUpsert) -> StoreResult<MirrorGame> {
        let row = MirrorGame {
            external_id: game.external_id,
            slug: slugify(&game.title),
            family: game.platform.as_deref().and_then(classify_platform_family),
            title: game.title,
            platform: game.platform,
            platform_id: game.platform_id,
            release_date: game.release_date,
            overview: game.overview,
            rating: game.rating,
            genres: game.genres,
            payload: game.payload,
            last_synced_at: Utc::now(),
        };
        self.mirror
            .lock()
            .await
            .games
            .insert(row.external_id, row.clone());
        Ok(row)
    }

    async fn get(&self, external_id: i64) -> StoreResult<Option<MirrorGame>> {
        Ok(self.mirror.lock().await.games.get(&external_id).cloned())
    }

    async fn search(
        &self,
        query: &str,
        filters: &MirrorFilters,
        limit: usize,
    ) -> StoreResult<Vec<MirrorGame>> {
        let state = self.mirror.lock().await;
        let mut rows: Vec<&MirrorGame> = state
            .games
            .values()
            .filter(|g| mirror_matches(g, query, filters))
            .collect();
        // newest release first, undated last, id as tiebreak
        rows.sort_by(|a, b| {
            b.release_date
                .cmp(&a.release_date)
                .then(a.external_id.cmp(&b.external_id))
        });
        Ok(rows
            .into_iter()
            .skip(filters.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn for_platform(&self, platform: &str, limit: usize) -> StoreResult<Vec<MirrorGame>> {
        let filters = MirrorFilters {
            platforms: vec![platform.to_string()],
            ..MirrorFilters::default()
        };
        self.search("", &filters, limit).await
    }

    async fn latest_sync_state(&self) -> StoreResult<MirrorSyncState> {
        Ok(self.mirror.lock().await.sync.clone())
    }

    async fn update_sync_state(
        &self,
        strategy: SyncStrategy,
        at: DateTime<Utc>,
        extra: Value,
    ) -> StoreResult<()> {
        let mut state = self.mirror.lock().await;
        *state.sync.cursor_mut(strategy) = SyncCursor {
            at: Some(at),
            extra,
        };
        Ok(())
    }

    async fn ids_in_shard(&self, shard: u32, total_shards: u32) -> StoreResult<Vec<i64>> {
        let total = i64::from(total_shards.max(1));
        let shard = i64::from(shard);
        Ok(self
            .mirror
            .lock()
            .await
            .games
            .keys()
            .copied()
            .filter(|id| id.rem_euclid(total) == shard)
            .collect())
    }

    async fn max_external_id(&self) -> StoreResult<Option<i64>> {
        Ok(self.mirror.lock().await.games.keys().next_back().copied())
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.mirror.lock().await.games.len() as i64)
    }
}

#[async_trait]
impl SnapshotRepository for MemoryStore {
    async fn start(&self, kind: &str, context: Value) -> StoreResult<DatasetSnapshot> {
        let snapshot = DatasetSnapshot {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            status: SnapshotStatus::Running,
            row_count: 0,
            context,
            error_details: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: SnapshotStatus,
        row_count: i64,
        error_details: Option<String>,
    ) -> StoreResult<DatasetSnapshot> {
        let mut snapshots = self.snapshots.lock().await;
        let row = snapshots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::not_found("dataset_snapshot", id))?;
        row.status = status;
        row.row_count = row_count;
        row.error_details = error_details;
        row.finished_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn list(&self, kind: Option<&str>, limit: usize) -> StoreResult<Vec<DatasetSnapshot>> {
        let snapshots = self.snapshots.lock().await;
        Ok(snapshots
            .iter()
            .rev()
            .filter(|s| kind.map_or(true, |k| s.kind == k))
            .take(limit)
            .cloned()
            .collect())
    }
}
