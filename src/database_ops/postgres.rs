//! sqlx/Postgres implementation of the store traits.
//!
//! Uniqueness lives in the schema (`products.uid`, `game_aliases (provider,
//! provider_game_id)`, `mirror_games (provider, external_id)`), so every write
//! is an `ON CONFLICT` upsert and concurrent workers converge. Token buckets
//! are read and written under `SELECT ... FOR UPDATE`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::db::Db;
use super::models::{
    DatasetSnapshot, GameAlias, Genre, MediaKind, MediaRole, MirrorFilters, MirrorGame,
    MirrorGameUpsert, MirrorSyncState, NewMedia, NewOffer, NewProduct, Platform, Product,
    ProductMedia, ProductOffer, SnapshotStatus, SyncCursor, SyncStrategy,
};
use super::repository::{
    CatalogueStore, CatalogueTx, MirrorRepository, SnapshotRepository, StoreResult,
};
use crate::error::StoreError;
use crate::normalization::{classify_platform_family, slugify, PlatformFamily};
use crate::rate_limit::{BucketState, Decision, RateLimitStore};

const PRODUCT_COLUMNS: &str = "id, uid, slug, name, platform, primary_platform_family, category, \
     release_date, popularity_score, rating, freshness_score, metadata, external_ids, \
     created_at, updated_at";

const MEDIA_COLUMNS: &str =
    "id, product_id, provider, url, kind, role, title, is_active, metadata, updated_at";

const OFFER_COLUMNS: &str = "id, product_id, provider, store, region_code, currency, price, \
     regular_price, discount_percent, url, is_active, metadata, last_seen_at";

const MIRROR_COLUMNS: &str = "external_id, title, slug, platform, platform_id, family, \
     release_date, overview, rating, genres, payload, last_synced_at";

const SNAPSHOT_COLUMNS: &str =
    "id, kind, status, row_count, context, error_details, started_at, finished_at";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
    mirror_provider: String,
}

impl PgStore {
    pub fn new(db: Db, mirror_provider: &str) -> Self {
        Self {
            db,
            mirror_provider: mirror_provider.to_string(),
        }
    }

    fn pool(&self) -> &PgPool {
        &self.db.pool
    }
}

fn parse_family(raw: Option<String>) -> Option<PlatformFamily> {
    raw.and_then(|s| s.parse().ok())
}

#[derive(FromRow)]
struct ProductRow {
    id: i64,
    uid: String,
    slug: String,
    name: String,
    platform: Option<String>,
    primary_platform_family: Option<String>,
    category: String,
    release_date: Option<NaiveDate>,
    popularity_score: Option<f64>,
    rating: Option<f64>,
    freshness_score: Option<f64>,
    metadata: Value,
    external_ids: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(r: ProductRow) -> Self {
        let external_ids: BTreeMap<String, String> =
            serde_json::from_value(r.external_ids).unwrap_or_default();
        Product {
            id: r.id,
            uid: r.uid,
            slug: r.slug,
            name: r.name,
            platform: r.platform,
            primary_platform_family: parse_family(r.primary_platform_family),
            category: r.category.parse().unwrap_or_default(),
            release_date: r.release_date,
            popularity_score: r.popularity_score,
            rating: r.rating,
            freshness_score: r.freshness_score,
            metadata: r.metadata,
            external_ids,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PlatformRow {
    id: i64,
    code: String,
    name: String,
    family: Option<String>,
}

impl From<PlatformRow> for Platform {
    fn from(r: PlatformRow) -> Self {
        Platform {
            id: r.id,
            code: r.code,
            name: r.name,
            family: parse_family(r.family),
        }
    }
}

#[derive(FromRow)]
struct GenreRow {
    id: i64,
    slug: String,
    name: String,
}

#[derive(FromRow)]
struct AliasRow {
    id: i64,
    product_id: i64,
    provider: String,
    provider_game_id: String,
    title: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<AliasRow> for GameAlias {
    fn from(r: AliasRow) -> Self {
        GameAlias {
            id: r.id,
            product_id: r.product_id,
            provider: r.provider,
            provider_game_id: r.provider_game_id,
            title: r.title,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MediaRow {
    id: i64,
    product_id: i64,
    provider: String,
    url: String,
    kind: String,
    role: String,
    title: Option<String>,
    is_active: bool,
    metadata: Value,
    updated_at: DateTime<Utc>,
}

impl From<MediaRow> for ProductMedia {
    fn from(r: MediaRow) -> Self {
        let role: MediaRole = r.role.parse().unwrap_or(MediaRole::Screenshot);
        ProductMedia {
            id: r.id,
            product_id: r.product_id,
            provider: r.provider,
            url: r.url,
            kind: r.kind.parse::<MediaKind>().unwrap_or(role.kind()),
            role,
            title: r.title,
            is_active: r.is_active,
            metadata: r.metadata,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct OfferRow {
    id: i64,
    product_id: i64,
    provider: String,
    store: String,
    region_code: String,
    currency: String,
    price: f64,
    regular_price: Option<f64>,
    discount_percent: Option<i32>,
    url: Option<String>,
    is_active: bool,
    metadata: Value,
    last_seen_at: DateTime<Utc>,
}

impl From<OfferRow> for ProductOffer {
    fn from(r: OfferRow) -> Self {
        ProductOffer {
            id: r.id,
            product_id: r.product_id,
            provider: r.provider,
            store: r.store,
            region_code: r.region_code,
            currency: r.currency,
            price: r.price,
            regular_price: r.regular_price,
            discount_percent: r.discount_percent,
            url: r.url,
            is_active: r.is_active,
            metadata: r.metadata,
            last_seen_at: r.last_seen_at,
        }
    }
}

#[derive(FromRow)]
struct MirrorRow {
    external_id: i64,
    title: String,
    slug: String,
    platform: Option<String>,
    platform_id: Option<i64>,
    family: Option<String>,
    release_date: Option<NaiveDate>,
    overview: Option<String>,
    rating: Option<String>,
    genres: Vec<String>,
    payload: Value,
    last_synced_at: DateTime<Utc>,
}

impl From<MirrorRow> for MirrorGame {
    fn from(r: MirrorRow) -> Self {
        MirrorGame {
            external_id: r.external_id,
            title: r.title,
            slug: r.slug,
            platform: r.platform,
            platform_id: r.platform_id,
            family: parse_family(r.family),
            release_date: r.release_date,
            overview: r.overview,
            rating: r.rating,
            genres: r.genres,
            payload: r.payload,
            last_synced_at: r.last_synced_at,
        }
    }
}

#[derive(FromRow)]
struct SyncStateRow {
    full_at: Option<DateTime<Utc>>,
    full_extra: Value,
    incremental_at: Option<DateTime<Utc>>,
    incremental_extra: Value,
    sweep_at: Option<DateTime<Utc>>,
    sweep_extra: Value,
    discovery_at: Option<DateTime<Utc>>,
    discovery_extra: Value,
}

#[derive(FromRow)]
struct SnapshotRow {
    id: Uuid,
    kind: String,
    status: String,
    row_count: i64,
    context: Value,
    error_details: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<SnapshotRow> for DatasetSnapshot {
    fn from(r: SnapshotRow) -> Self {
        DatasetSnapshot {
            id: r.id,
            kind: r.kind,
            status: r.status.parse().unwrap_or(SnapshotStatus::Pending),
            row_count: r.row_count,
            context: r.context,
            error_details: r.error_details,
            started_at: r.started_at,
            finished_at: r.finished_at,
        }
    }
}

#[async_trait]
impl CatalogueStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn CatalogueTx>> {
        let tx = self.pool().begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn product(&self, id: i64) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Product::from))
    }

    async fn product_count(&self) -> StoreResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    async fn aliases_for(&self, product_id: i64) -> StoreResult<Vec<GameAlias>> {
        let rows = sqlx::query_as::<_, AliasRow>(
            "SELECT id, product_id, provider, provider_game_id, title, updated_at \
             FROM game_aliases WHERE product_id = $1 ORDER BY id",
        )
        .bind(product_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(GameAlias::from).collect())
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CatalogueTx for PgTx {
    async fn find_product_by_uid(&mut self, uid: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE uid = $1"
        ))
        .bind(uid)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Product::from))
    }

    async fn find_product_by_slug(&mut self, slug: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE lower(slug) = lower($1) ORDER BY id LIMIT 1"
        ))
        .bind(slug)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Product::from))
    }

    async fn get_product(&mut self, id: i64) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Product::from))
    }

    #[instrument(skip(self, product), fields(uid = %product.uid))]
    async fn insert_product(&mut self, product: NewProduct) -> StoreResult<Product> {
        let external_ids = serde_json::to_value(&product.external_ids)?;
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "INSERT INTO products (uid, slug, name, platform, primary_platform_family, category, \
             release_date, popularity_score, rating, freshness_score, metadata, external_ids) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (uid) DO UPDATE SET uid = EXCLUDED.uid \
             RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(&product.uid)
        .bind(&product.slug)
        .bind(&product.name)
        .bind(&product.platform)
        .bind(product.primary_platform_family.map(|f| f.as_str()))
        .bind(product.category.as_str())
        .bind(product.release_date)
        .bind(product.popularity_score)
        .bind(product.rating)
        .bind(product.freshness_score)
        .bind(&product.metadata)
        .bind(external_ids)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn update_product(&mut self, product: &Product) -> StoreResult<()> {
        let external_ids = serde_json::to_value(&product.external_ids)?;
        let res = sqlx::query(
            "UPDATE products SET slug = $3, name = $4, platform = $5, primary_platform_family = $6, \
             category = $7, release_date = $8, popularity_score = $9, rating = $10, \
             freshness_score = $11, metadata = $12, external_ids = $13, updated_at = now() \
             WHERE id = $1 AND uid = $2",
        )
        .bind(product.id)
        .bind(&product.uid)
        .bind(&product.slug)
        .bind(&product.name)
        .bind(&product.platform)
        .bind(product.primary_platform_family.map(|f| f.as_str()))
        .bind(product.category.as_str())
        .bind(product.release_date)
        .bind(product.popularity_score)
        .bind(product.rating)
        .bind(product.freshness_score)
        .bind(&product.metadata)
        .bind(external_ids)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found("product", product.id));
        }
        Ok(())
    }

    async fn search_products_by_name(
        &mut self,
        fragment: &str,
        limit: usize,
    ) -> StoreResult<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE strpos(lower(name), lower($1)) > 0 OR strpos(slug, $2) > 0 \
             ORDER BY id LIMIT $3"
        ))
        .bind(fragment)
        .bind(slugify(fragment))
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn upsert_platform(
        &mut self,
        code: &str,
        name: &str,
        family: Option<PlatformFamily>,
    ) -> StoreResult<Platform> {
        let row = sqlx::query_as::<_, PlatformRow>(
            "INSERT INTO platforms (code, name, family) VALUES ($1, $2, $3) \
             ON CONFLICT (code) DO UPDATE SET family = COALESCE(platforms.family, EXCLUDED.family) \
             RETURNING id, code, name, family",
        )
        .bind(code)
        .bind(name)
        .bind(family.map(|f| f.as_str()))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn upsert_genre(&mut self, slug: &str, name: &str) -> StoreResult<Genre> {
        let row = sqlx::query_as::<_, GenreRow>(
            "INSERT INTO genres (slug, name) VALUES ($1, $2) \
             ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug \
             RETURNING id, slug, name",
        )
        .bind(slug)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(Genre {
            id: row.id,
            slug: row.slug,
            name: row.name,
        })
    }

    async fn attach_platforms(&mut self, product_id: i64, platform_ids: &[i64]) -> StoreResult<()> {
        if platform_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO product_platforms (product_id, platform_id) \
             SELECT $1, unnest($2::bigint[]) ON CONFLICT DO NOTHING",
        )
        .bind(product_id)
        .bind(platform_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn attach_genres(&mut self, product_id: i64, genre_ids: &[i64]) -> StoreResult<()> {
        if genre_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO product_genres (product_id, genre_id) \
             SELECT $1, unnest($2::bigint[]) ON CONFLICT DO NOTHING",
        )
        .bind(product_id)
        .bind(genre_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn platforms_for(&mut self, product_id: i64) -> StoreResult<Vec<Platform>> {
        let rows = sqlx::query_as::<_, PlatformRow>(
            "SELECT p.id, p.code, p.name, p.family FROM platforms p \
             JOIN product_platforms pp ON pp.platform_id = p.id \
             WHERE pp.product_id = $1 ORDER BY p.id",
        )
        .bind(product_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Platform::from).collect())
    }

    async fn genres_for(&mut self, product_id: i64) -> StoreResult<Vec<Genre>> {
        let rows = sqlx::query_as::<_, GenreRow>(
            "SELECT g.id, g.slug, g.name FROM genres g \
             JOIN product_genres pg ON pg.genre_id = g.id \
             WHERE pg.product_id = $1 ORDER BY g.id",
        )
        .bind(product_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Genre {
                id: r.id,
                slug: r.slug,
                name: r.name,
            })
            .collect())
    }

    async fn find_alias(
        &mut self,
        provider: &str,
        provider_game_id: &str,
    ) -> StoreResult<Option<GameAlias>> {
        let row = sqlx::query_as::<_, AliasRow>(
            "SELECT id, product_id, provider, provider_game_id, title, updated_at \
             FROM game_aliases WHERE provider = $1 AND provider_game_id = $2",
        )
        .bind(provider)
        .bind(provider_game_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(GameAlias::from))
    }

    async fn upsert_alias(
        &mut self,
        product_id: i64,
        provider: &str,
        provider_game_id: &str,
        title: Option<&str>,
    ) -> StoreResult<GameAlias> {
        let row = sqlx::query_as::<_, AliasRow>(
            "INSERT INTO game_aliases (product_id, provider, provider_game_id, title) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (provider, provider_game_id) DO UPDATE SET \
               product_id = EXCLUDED.product_id, \
               title = COALESCE(EXCLUDED.title, game_aliases.title), \
               updated_at = now() \
             RETURNING id, product_id, provider, provider_game_id, title, updated_at",
        )
        .bind(product_id)
        .bind(provider)
        .bind(provider_game_id)
        .bind(title)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn upsert_media(
        &mut self,
        product_id: i64,
        media: &NewMedia,
    ) -> StoreResult<ProductMedia> {
        let row = sqlx::query_as::<_, MediaRow>(&format!(
            "INSERT INTO product_media (product_id, provider, url, kind, role, title, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (product_id, url) DO UPDATE SET \
               provider = EXCLUDED.provider, kind = EXCLUDED.kind, role = EXCLUDED.role, \
               title = COALESCE(EXCLUDED.title, product_media.title), \
               metadata = product_media.metadata || EXCLUDED.metadata, \
               is_active = TRUE, updated_at = now() \
             RETURNING {MEDIA_COLUMNS}"
        ))
        .bind(product_id)
        .bind(&media.provider)
        .bind(&media.url)
        .bind(media.role.kind().as_str())
        .bind(media.role.as_str())
        .bind(&media.title)
        .bind(&media.metadata)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn list_media(&mut self, product_id: i64) -> StoreResult<Vec<ProductMedia>> {
        let rows = sqlx::query_as::<_, MediaRow>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM product_media WHERE product_id = $1 ORDER BY id"
        ))
        .bind(product_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(ProductMedia::from).collect())
    }

    async fn record_media_check(
        &mut self,
        media_id: i64,
        check: Value,
        is_active: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE product_media SET metadata = jsonb_set(metadata, '{link_check}', $2, true), \
             is_active = $3, updated_at = now() WHERE id = $1",
        )
        .bind(media_id)
        .bind(check)
        .bind(is_active)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_offer(
        &mut self,
        product_id: i64,
        offer: &NewOffer,
    ) -> StoreResult<ProductOffer> {
        let row = sqlx::query_as::<_, OfferRow>(&format!(
            "INSERT INTO product_offers (product_id, provider, store, region_code, currency, price, \
             regular_price, discount_percent, url, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (product_id, provider, store, region_code) DO UPDATE SET \
               currency = EXCLUDED.currency, price = EXCLUDED.price, \
               regular_price = EXCLUDED.regular_price, discount_percent = EXCLUDED.discount_percent, \
               url = COALESCE(EXCLUDED.url, product_offers.url), \
               metadata = product_offers.metadata || EXCLUDED.metadata, \
               is_active = TRUE, last_seen_at = now() \
             RETURNING {OFFER_COLUMNS}"
        ))
        .bind(product_id)
        .bind(&offer.provider)
        .bind(&offer.store)
        .bind(&offer.region_code)
        .bind(&offer.currency)
        .bind(offer.price)
        .bind(offer.regular_price)
        .bind(offer.discount_percent)
        .bind(&offer.url)
        .bind(&offer.metadata)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn list_offers(&mut self, product_id: i64) -> StoreResult<Vec<ProductOffer>> {
        let rows = sqlx::query_as::<_, OfferRow>(&format!(
            "SELECT {OFFER_COLUMNS} FROM product_offers WHERE product_id = $1 ORDER BY id"
        ))
        .bind(product_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(ProductOffer::from).collect())
    }

    async fn record_offer_check(
        &mut self,
        offer_id: i64,
        check: Value,
        is_active: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE product_offers SET metadata = jsonb_set(metadata, '{link_check}', $2, true), \
             is_active = $3 WHERE id = $1",
        )
        .bind(offer_id)
        .bind(check)
        .bind(is_active)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MirrorRepository for PgStore {
    fn provider(&self) -> &str {
        &self.mirror_provider
    }

    async fn upsert_game(&self, game: MirrorGameUpsert) -> StoreResult<MirrorGame> {
        let slug = slugify(&game.title);
        let family = game.platform.as_deref().and_then(classify_platform_family);
        let row = sqlx::query_as::<_, MirrorRow>(&format!(
            "INSERT INTO mirror_games (provider, external_id, title, slug, platform, platform_id, \
             family, release_date, overview, rating, genres, payload, last_synced_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now()) \
             ON CONFLICT (provider, external_id) DO UPDATE SET \
               title = EXCLUDED.title, slug = EXCLUDED.slug, platform = EXCLUDED.platform, \
               platform_id = EXCLUDED.platform_id, family = EXCLUDED.family, \
               release_date = EXCLUDED.release_date, overview = EXCLUDED.overview, \
               rating = EXCLUDED.rating, genres = EXCLUDED.genres, payload = EXCLUDED.payload, \
               last_synced_at = now() \
             RETURNING {MIRROR_COLUMNS}"
        ))
        .bind(&self.mirror_provider)
        .bind(game.external_id)
        .bind(&game.title)
        .bind(slug)
        .bind(&game.platform)
        .bind(game.platform_id)
        .bind(family.map(|f| f.as_str()))
        .bind(game.release_date)
        .bind(&game.overview)
        .bind(&game.rating)
        .bind(&game.genres)
        .bind(&game.payload)
        .fetch_one(self.pool())
        .await?;
        Ok(row.into())
    }

    async fn get(&self, external_id: i64) -> StoreResult<Option<MirrorGame>> {
        let row = sqlx::query_as::<_, MirrorRow>(&format!(
            "SELECT {MIRROR_COLUMNS} FROM mirror_games WHERE provider = $1 AND external_id = $2"
        ))
        .bind(&self.mirror_provider)
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(MirrorGame::from))
    }

    #[instrument(skip(self, filters))]
    async fn search(
        &self,
        query: &str,
        filters: &MirrorFilters,
        limit: usize,
    ) -> StoreResult<Vec<MirrorGame>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {MIRROR_COLUMNS} FROM mirror_games WHERE provider = "
        ));
        qb.push_bind(self.mirror_provider.clone());
        let query = query.trim();
        if !query.is_empty() {
            qb.push(" AND strpos(lower(title), lower(");
            qb.push_bind(query.to_string());
            qb.push(")) > 0");
        }
        if let Some(category) = filters.category.as_ref() {
            qb.push(" AND EXISTS (SELECT 1 FROM unnest(genres) g WHERE lower(g) = lower(");
            qb.push_bind(category.clone());
            qb.push("))");
        }
        if !filters.platforms.is_empty() {
            let lowered: Vec<String> = filters.platforms.iter().map(|p| p.to_lowercase()).collect();
            qb.push(" AND lower(platform) = ANY(");
            qb.push_bind(lowered);
            qb.push(")");
        }
        if let Some(family) = filters.family {
            qb.push(" AND family = ");
            qb.push_bind(family.as_str());
        }
        if let Some(after) = filters.released_after {
            qb.push(" AND release_date >= ");
            qb.push_bind(after);
        }
        if let Some(cutoff) = filters.exclude_pc_before {
            qb.push(" AND NOT (COALESCE(family, '') = 'pc' AND release_date IS NOT NULL AND release_date < ");
            qb.push_bind(cutoff);
            qb.push(")");
        }
        qb.push(" ORDER BY release_date DESC NULLS LAST, external_id ASC OFFSET ");
        qb.push_bind(filters.offset as i64);
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build_query_as::<MirrorRow>()
            .fetch_all(self.pool())
            .await?;
        debug!(rows = rows.len(), "mirror search");
        Ok(rows.into_iter().map(MirrorGame::from).collect())
    }

    async fn for_platform(&self, platform: &str, limit: usize) -> StoreResult<Vec<MirrorGame>> {
        let filters = MirrorFilters {
            platforms: vec![platform.to_string()],
            ..MirrorFilters::default()
        };
        self.search("", &filters, limit).await
    }

    async fn latest_sync_state(&self) -> StoreResult<MirrorSyncState> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            "SELECT full_at, full_extra, incremental_at, incremental_extra, sweep_at, sweep_extra, \
             discovery_at, discovery_extra FROM mirror_sync_state WHERE provider = $1",
        )
        .bind(&self.mirror_provider)
        .fetch_optional(self.pool())
        .await?;
        let mut state = MirrorSyncState {
            provider: self.mirror_provider.clone(),
            ..MirrorSyncState::default()
        };
        if let Some(r) = row {
            state.full = SyncCursor {
                at: r.full_at,
                extra: r.full_extra,
            };
            state.incremental = SyncCursor {
                at: r.incremental_at,
                extra: r.incremental_extra,
            };
            state.sweep = SyncCursor {
                at: r.sweep_at,
                extra: r.sweep_extra,
            };
            state.discovery = SyncCursor {
                at: r.discovery_at,
                extra: r.discovery_extra,
            };
        }
        Ok(state)
    }

    async fn update_sync_state(
        &self,
        strategy: SyncStrategy,
        at: DateTime<Utc>,
        extra: Value,
    ) -> StoreResult<()> {
        let c = strategy.column();
        sqlx::query(&format!(
            "INSERT INTO mirror_sync_state (provider, {c}_at, {c}_extra) VALUES ($1, $2, $3) \
             ON CONFLICT (provider) DO UPDATE SET {c}_at = EXCLUDED.{c}_at, {c}_extra = EXCLUDED.{c}_extra"
        ))
        .bind(&self.mirror_provider)
        .bind(at)
        .bind(extra)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn ids_in_shard(&self, shard: u32, total_shards: u32) -> StoreResult<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT external_id FROM mirror_games WHERE provider = $1 AND mod(external_id, $2) = $3 \
             ORDER BY external_id",
        )
        .bind(&self.mirror_provider)
        .bind(i64::from(total_shards.max(1)))
        .bind(i64::from(shard))
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn max_external_id(&self) -> StoreResult<Option<i64>> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(external_id) FROM mirror_games WHERE provider = $1")
                .bind(&self.mirror_provider)
                .fetch_one(self.pool())
                .await?;
        Ok(max)
    }

    async fn count(&self) -> StoreResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mirror_games WHERE provider = $1")
            .bind(&self.mirror_provider)
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl SnapshotRepository for PgStore {
    async fn start(&self, kind: &str, context: Value) -> StoreResult<DatasetSnapshot> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            "INSERT INTO dataset_snapshots (id, kind, status, context) VALUES ($1, $2, $3, $4) \
             RETURNING {SNAPSHOT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(kind)
        .bind(SnapshotStatus::Running.as_str())
        .bind(context)
        .fetch_one(self.pool())
        .await?;
        Ok(row.into())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: SnapshotStatus,
        row_count: i64,
        error_details: Option<String>,
    ) -> StoreResult<DatasetSnapshot> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            "UPDATE dataset_snapshots SET status = $2, row_count = $3, error_details = $4, \
             finished_at = now() WHERE id = $1 RETURNING {SNAPSHOT_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(row_count)
        .bind(error_details)
        .fetch_optional(self.pool())
        .await?;
        row.map(DatasetSnapshot::from)
            .ok_or_else(|| StoreError::not_found("dataset_snapshot", id))
    }

    async fn list(&self, kind: Option<&str>, limit: usize) -> StoreResult<Vec<DatasetSnapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM dataset_snapshots \
             WHERE ($1::text IS NULL OR kind = $1) ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(kind)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(DatasetSnapshot::from).collect())
    }
}

#[async_trait]
impl RateLimitStore for PgStore {
    async fn attempt(
        &self,
        key: &str,
        max_rps: f64,
        burst: f64,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        if max_rps <= 0.0 {
            return Ok(Decision::ALLOW);
        }
        let fresh = BucketState::full(burst, now);
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO rate_limits (provider_key, tokens, last_refill_at) VALUES ($1, $2, $3) \
             ON CONFLICT (provider_key) DO NOTHING",
        )
        .bind(key)
        .bind(fresh.tokens)
        .bind(fresh.last_refill_at)
        .execute(&mut *tx)
        .await?;
        let (tokens, last_refill_at): (f64, DateTime<Utc>) = sqlx::query_as(
            "SELECT tokens, last_refill_at FROM rate_limits WHERE provider_key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;
        let mut state = BucketState {
            tokens,
            last_refill_at,
        };
        let decision = state.attempt(now, max_rps, burst);
        sqlx::query(
            "UPDATE rate_limits SET tokens = $2, last_refill_at = $3 WHERE provider_key = $1",
        )
        .bind(key)
        .bind(state.tokens)
        .bind(state.last_refill_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(decision)
    }
}
