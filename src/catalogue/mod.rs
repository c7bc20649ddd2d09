//! Trending catalogue aggregation across heterogeneous sources.

pub mod aggregator;
pub mod policy;
pub mod sources;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::database_ops::models::ProductCategory;
use crate::database_ops::provider_client::GameRecord;
use crate::identity::IncomingGame;

pub use aggregator::{AggregateResult, CatalogueAggregator, SourceStatus, SourceTally};
pub use sources::{MirrorTrendingSource, ProviderTrendingSource, SourceOptions, TrendingSource};

/// Normalised entry every trending source returns. Lives for one pass only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingGameData {
    pub name: String,
    pub slug: Option<String>,
    pub platforms: Vec<String>,
    pub genres: Vec<String>,
    pub released_at: Option<NaiveDate>,
    /// 0-100
    pub rating: Option<f64>,
    pub metacritic: Option<i32>,
    /// Provider that owns `external_id` (the alias namespace).
    pub provider: String,
    pub external_id: String,
    source: String,
    metadata: Value,
}

impl TrendingGameData {
    pub fn new(source: &str, provider: &str, external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: None,
            platforms: Vec::new(),
            genres: Vec::new(),
            released_at: None,
            rating: None,
            metacritic: None,
            provider: provider.to_string(),
            external_id: external_id.into(),
            source: source.to_string(),
            metadata: json!({}),
        }
    }

    pub fn from_record(source: &str, record: GameRecord) -> Self {
        let metadata = record.payload.clone();
        Self {
            name: record.name,
            slug: record.slug,
            platforms: record.platforms,
            genres: record.genres,
            released_at: record.released,
            rating: record.rating,
            metacritic: record.metacritic,
            provider: record.provider,
            external_id: record.external_id,
            source: source.to_string(),
            metadata,
        }
    }

    /// Key of the source that produced this entry.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Identity-resolver input; `popularity` is the rank-derived score.
    pub fn to_incoming(&self, popularity: Option<f64>) -> IncomingGame {
        let mut meta = if self.metadata.is_object() {
            self.metadata.clone()
        } else {
            json!({})
        };
        if let Some(map) = meta.as_object_mut() {
            map.insert("source".into(), json!(self.source));
            map.insert("external_id".into(), json!(self.external_id));
            map.insert("name".into(), json!(self.name));
            if let Some(mc) = self.metacritic {
                map.insert("metacritic".into(), json!(mc));
            }
        }
        IncomingGame {
            provider: self.provider.clone(),
            external_id: self.external_id.clone(),
            name: self.name.clone(),
            slug: self.slug.clone(),
            platforms: self.platforms.clone(),
            genres: self.genres.clone(),
            released: self.released_at,
            rating: self.rating,
            popularity,
            category: ProductCategory::Game,
            source_metadata: meta,
        }
    }
}
