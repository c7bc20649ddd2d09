use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::normalization::PlatformFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProductCategory {
    #[default]
    Game,
    Hardware,
}

impl ProductCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCategory::Game => "Game",
            ProductCategory::Hardware => "Hardware",
        }
    }
}

impl FromStr for ProductCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "game" | "games" => Ok(ProductCategory::Game),
            "hardware" | "console" => Ok(ProductCategory::Hardware),
            other => Err(format!("unknown product category: {other}")),
        }
    }
}

/// Canonical catalogue entity. `uid` is the merge key and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub uid: String,
    pub slug: String,
    pub name: String,
    pub platform: Option<String>,
    pub primary_platform_family: Option<PlatformFamily>,
    pub category: ProductCategory,
    pub release_date: Option<NaiveDate>,
    pub popularity_score: Option<f64>,
    pub rating: Option<f64>,
    pub freshness_score: Option<f64>,
    /// `{"sources": {provider: {...}}, "series": {...}, ...}`
    pub metadata: Value,
    pub external_ids: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// The sub-tree one provider contributed, if any.
    pub fn source_metadata(&self, provider: &str) -> Option<&Value> {
        self.metadata.get("sources")?.get(provider)
    }

    /// Replace one provider's sub-tree wholesale.
    pub fn set_source_metadata(&mut self, provider: &str, value: Value) {
        if !self.metadata.get("sources").is_some_and(Value::is_object) {
            self.set_metadata_key("sources", json!({}));
        }
        if let Some(sources) = self
            .metadata
            .get_mut("sources")
            .and_then(Value::as_object_mut)
        {
            sources.insert(provider.to_string(), value);
        }
    }

    /// Set a top-level metadata key (series, link checks).
    pub fn set_metadata_key(&mut self, key: &str, value: Value) {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub uid: String,
    pub slug: String,
    pub name: String,
    pub platform: Option<String>,
    pub primary_platform_family: Option<PlatformFamily>,
    pub category: ProductCategory,
    pub release_date: Option<NaiveDate>,
    pub popularity_score: Option<f64>,
    pub rating: Option<f64>,
    pub freshness_score: Option<f64>,
    pub metadata: Value,
    pub external_ids: BTreeMap<String, String>,
}

/// `(provider, provider_game_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameAlias {
    pub id: i64,
    pub product_id: i64,
    pub provider: String,
    pub provider_game_id: String,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub family: Option<PlatformFamily>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub id: i64,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaRole {
    Cover,
    Background,
    Screenshot,
    Trailer,
}

impl MediaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaRole::Cover => "cover",
            MediaRole::Background => "background",
            MediaRole::Screenshot => "screenshot",
            MediaRole::Trailer => "trailer",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaRole::Trailer => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

impl fmt::Display for MediaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cover" => Ok(MediaRole::Cover),
            "background" => Ok(MediaRole::Background),
            "screenshot" => Ok(MediaRole::Screenshot),
            "trailer" => Ok(MediaRole::Trailer),
            other => Err(format!("unknown media role: {other}")),
        }
    }
}

/// Keyed by `(product_id, url)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMedia {
    pub id: i64,
    pub product_id: i64,
    pub provider: String,
    pub url: String,
    pub kind: MediaKind,
    pub role: MediaRole,
    pub title: Option<String>,
    pub is_active: bool,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMedia {
    pub provider: String,
    pub url: String,
    pub role: MediaRole,
    pub title: Option<String>,
    pub metadata: Value,
}

/// One storefront price, keyed by `(product_id, provider, store, region_code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOffer {
    pub id: i64,
    pub product_id: i64,
    pub provider: String,
    pub store: String,
    pub region_code: String,
    pub currency: String,
    pub price: f64,
    pub regular_price: Option<f64>,
    pub discount_percent: Option<i32>,
    pub url: Option<String>,
    pub is_active: bool,
    pub metadata: Value,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOffer {
    pub provider: String,
    pub store: String,
    pub region_code: String,
    pub currency: String,
    pub price: f64,
    pub regular_price: Option<f64>,
    pub discount_percent: Option<i32>,
    pub url: Option<String>,
    pub metadata: Value,
}

/// Outcome of a link probe, written onto media/offer metadata as `link_check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCheck {
    pub status: LinkStatus,
    pub code: Option<u16>,
    pub checked_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Ok,
    Failed,
    Error,
}

/// Local copy of one row of the bulk provider catalogue. Keyed by `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorGame {
    pub external_id: i64,
    pub title: String,
    pub slug: String,
    pub platform: Option<String>,
    pub platform_id: Option<i64>,
    pub family: Option<PlatformFamily>,
    pub release_date: Option<NaiveDate>,
    pub overview: Option<String>,
    pub rating: Option<String>,
    pub genres: Vec<String>,
    pub payload: Value,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorGameUpsert {
    pub external_id: i64,
    pub title: String,
    pub platform: Option<String>,
    pub platform_id: Option<i64>,
    pub release_date: Option<NaiveDate>,
    pub overview: Option<String>,
    pub rating: Option<String>,
    pub genres: Vec<String>,
    pub payload: Value,
}

/// Read-side filters for the mirror. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MirrorFilters {
    /// Matched case-insensitively against the row's genres.
    pub category: Option<String>,
    /// Any-of match against the platform label.
    pub platforms: Vec<String>,
    pub family: Option<PlatformFamily>,
    pub released_after: Option<NaiveDate>,
    /// Drop `pc` family rows released before this date.
    pub exclude_pc_before: Option<NaiveDate>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub at: Option<DateTime<Utc>>,
    pub extra: Value,
}

/// Singleton per provider; one cursor per sync strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorSyncState {
    pub provider: String,
    pub full: SyncCursor,
    pub incremental: SyncCursor,
    pub sweep: SyncCursor,
    pub discovery: SyncCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStrategy {
    Full,
    Incremental,
    Sweep,
    Discovery,
}

impl SyncStrategy {
    pub fn column(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::Sweep => "sweep",
            SyncStrategy::Discovery => "discovery",
        }
    }
}

impl MirrorSyncState {
    pub fn cursor(&self, strategy: SyncStrategy) -> &SyncCursor {
        match strategy {
            SyncStrategy::Full => &self.full,
            SyncStrategy::Incremental => &self.incremental,
            SyncStrategy::Sweep => &self.sweep,
            SyncStrategy::Discovery => &self.discovery,
        }
    }

    pub fn cursor_mut(&mut self, strategy: SyncStrategy) -> &mut SyncCursor {
        match strategy {
            SyncStrategy::Full => &mut self.full,
            SyncStrategy::Incremental => &mut self.incremental,
            SyncStrategy::Sweep => &mut self.sweep,
            SyncStrategy::Discovery => &mut self.discovery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Running => "running",
            SnapshotStatus::Succeeded => "succeeded",
            SnapshotStatus::Failed => "failed",
        }
    }
}

impl FromStr for SnapshotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SnapshotStatus::Pending),
            "running" => Ok(SnapshotStatus::Running),
            "succeeded" => Ok(SnapshotStatus::Succeeded),
            "failed" => Ok(SnapshotStatus::Failed),
            other => Err(format!("unknown snapshot status: {other}")),
        }
    }
}

/// Append-only audit row for one aggregation or sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    pub id: Uuid,
    pub kind: String,
    pub status: SnapshotStatus,
    pub row_count: i64,
    pub context: Value,
    pub error_details: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        Product {
            id: 1,
            uid: "u".into(),
            slug: "s".into(),
            name: "n".into(),
            platform: None,
            primary_platform_family: None,
            category: ProductCategory::Game,
            release_date: None,
            popularity_score: None,
            rating: None,
            freshness_score: None,
            metadata: Value::Null,
            external_ids: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn source_metadata_replaces_whole_subtree() {
        let mut p = product();
        p.set_source_metadata("rawg", json!({"a": 1, "b": 2}));
        p.set_source_metadata("giantbomb", json!({"x": true}));
        p.set_source_metadata("rawg", json!({"c": 3}));
        assert_eq!(p.source_metadata("rawg"), Some(&json!({"c": 3})));
        assert_eq!(p.source_metadata("giantbomb"), Some(&json!({"x": true})));
    }

    #[test]
    fn category_parses_loosely() {
        assert_eq!("games".parse::<ProductCategory>(), Ok(ProductCategory::Game));
        assert_eq!("Hardware".parse::<ProductCategory>(), Ok(ProductCategory::Hardware));
        assert!("dlc".parse::<ProductCategory>().is_err());
    }
}
