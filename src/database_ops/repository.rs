//! Persistence seams. Jobs and the identity resolver only ever see these
//! traits; `memory` and `postgres` provide the implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::models::{
    DatasetSnapshot, GameAlias, Genre, MirrorFilters, MirrorGame, MirrorGameUpsert,
    MirrorSyncState, NewMedia, NewOffer, NewProduct, Platform, Product, ProductMedia,
    ProductOffer, SnapshotStatus, SyncStrategy,
};
use crate::error::StoreError;
use crate::normalization::PlatformFamily;

pub type StoreResult<T> = Result<T, StoreError>;

/// Entry point to the canonical catalogue.
#[async_trait]
pub trait CatalogueStore: Send + Sync {
    /// Open a unit of work. Nothing is visible to other readers until
    /// [`CatalogueTx::commit`]; dropping the transaction rolls it back.
    async fn begin(&self) -> StoreResult<Box<dyn CatalogueTx>>;

    async fn product(&self, id: i64) -> StoreResult<Option<Product>>;

    async fn product_count(&self) -> StoreResult<i64>;

    async fn aliases_for(&self, product_id: i64) -> StoreResult<Vec<GameAlias>>;
}

#[async_trait]
pub trait CatalogueTx: Send {
    async fn find_product_by_uid(&mut self, uid: &str) -> StoreResult<Option<Product>>;

    async fn find_product_by_slug(&mut self, slug: &str) -> StoreResult<Option<Product>>;

    async fn get_product(&mut self, id: i64) -> StoreResult<Option<Product>>;

    /// Insert, or return the existing row when the uid is already taken.
    async fn insert_product(&mut self, product: NewProduct) -> StoreResult<Product>;

    /// Full write of every mutable column. `uid` is never changed.
    async fn update_product(&mut self, product: &Product) -> StoreResult<()>;

    /// Case-insensitive containment on the name, or on the ASCII-folded slug
    /// so accented names match plain fragments. For series grouping.
    async fn search_products_by_name(
        &mut self,
        fragment: &str,
        limit: usize,
    ) -> StoreResult<Vec<Product>>;

    async fn upsert_platform(
        &mut self,
        code: &str,
        name: &str,
        family: Option<PlatformFamily>,
    ) -> StoreResult<Platform>;

    async fn upsert_genre(&mut self, slug: &str, name: &str) -> StoreResult<Genre>;

    /// Idempotent; existing links are kept.
    async fn attach_platforms(&mut self, product_id: i64, platform_ids: &[i64]) -> StoreResult<()>;

    async fn attach_genres(&mut self, product_id: i64, genre_ids: &[i64]) -> StoreResult<()>;

    async fn platforms_for(&mut self, product_id: i64) -> StoreResult<Vec<Platform>>;

    async fn genres_for(&mut self, product_id: i64) -> StoreResult<Vec<Genre>>;

    async fn find_alias(
        &mut self,
        provider: &str,
        provider_game_id: &str,
    ) -> StoreResult<Option<GameAlias>>;

    /// Upsert by `(provider, provider_game_id)`. A re-attributed id moves the
    /// existing row to the new product.
    async fn upsert_alias(
        &mut self,
        product_id: i64,
        provider: &str,
        provider_game_id: &str,
        title: Option<&str>,
    ) -> StoreResult<GameAlias>;

    /// Upsert by `(product_id, url)`. Re-observed media is re-activated.
    async fn upsert_media(&mut self, product_id: i64, media: &NewMedia)
        -> StoreResult<ProductMedia>;

    async fn list_media(&mut self, product_id: i64) -> StoreResult<Vec<ProductMedia>>;

    async fn record_media_check(
        &mut self,
        media_id: i64,
        check: Value,
        is_active: bool,
    ) -> StoreResult<()>;

    /// Upsert by `(product_id, provider, store, region_code)`.
    async fn upsert_offer(&mut self, product_id: i64, offer: &NewOffer)
        -> StoreResult<ProductOffer>;

    async fn list_offers(&mut self, product_id: i64) -> StoreResult<Vec<ProductOffer>>;

    async fn record_offer_check(
        &mut self,
        offer_id: i64,
        check: Value,
        is_active: bool,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Single-provider bulk mirror, keyed by the provider's `external_id`.
#[async_trait]
pub trait MirrorRepository: Send + Sync {
    fn provider(&self) -> &str;

    async fn upsert_game(&self, game: MirrorGameUpsert) -> StoreResult<MirrorGame>;

    async fn get(&self, external_id: i64) -> StoreResult<Option<MirrorGame>>;

    /// Title containment search; an empty query lists everything that
    /// passes the filters, newest release first.
    async fn search(
        &self,
        query: &str,
        filters: &MirrorFilters,
        limit: usize,
    ) -> StoreResult<Vec<MirrorGame>>;

    async fn for_platform(&self, platform: &str, limit: usize) -> StoreResult<Vec<MirrorGame>>;

    async fn latest_sync_state(&self) -> StoreResult<MirrorSyncState>;

    async fn update_sync_state(
        &self,
        strategy: SyncStrategy,
        at: DateTime<Utc>,
        extra: Value,
    ) -> StoreResult<()>;

    /// Mirrored ids with `id % total_shards == shard`, ascending.
    async fn ids_in_shard(&self, shard: u32, total_shards: u32) -> StoreResult<Vec<i64>>;

    async fn max_external_id(&self) -> StoreResult<Option<i64>>;

    async fn count(&self) -> StoreResult<i64>;

    async fn update_full_sync_state(&self, at: DateTime<Utc>, extra: Value) -> StoreResult<()> {
        self.update_sync_state(SyncStrategy::Full, at, extra).await
    }

    async fn update_incremental_sync_state(
        &self,
        at: DateTime<Utc>,
        extra: Value,
    ) -> StoreResult<()> {
        self.update_sync_state(SyncStrategy::Incremental, at, extra)
            .await
    }

    async fn update_sweep_state(&self, at: DateTime<Utc>, extra: Value) -> StoreResult<()> {
        self.update_sync_state(SyncStrategy::Sweep, at, extra).await
    }

    async fn update_discovery_state(&self, at: DateTime<Utc>, extra: Value) -> StoreResult<()> {
        self.update_sync_state(SyncStrategy::Discovery, at, extra)
            .await
    }
}

/// Audit trail of aggregation and sync runs.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn start(&self, kind: &str, context: Value) -> StoreResult<DatasetSnapshot>;

    async fn finish(
        &self,
        id: Uuid,
        status: SnapshotStatus,
        row_count: i64,
        error_details: Option<String>,
    ) -> StoreResult<DatasetSnapshot>;

    /// Newest first.
    async fn list(&self, kind: Option<&str>, limit: usize) -> StoreResult<Vec<DatasetSnapshot>>;
}
