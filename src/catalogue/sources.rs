use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::json;
use tracing::debug;

use super::policy;
use super::TrendingGameData;
use crate::config::SourceConfig;
use crate::database_ops::models::{MirrorFilters, MirrorGame};
use crate::database_ops::provider_client::{FetchRequest, NormalizedRecord, ProviderClient};
use crate::database_ops::repository::MirrorRepository;
use crate::error::ProviderError;
use crate::normalization::{primary_family, PlatformFamily};

/// Everything one source call needs, passed explicitly per call.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOptions {
    pub limit: usize,
    pub window_days: u32,
    pub min_score: Option<f64>,
    pub min_reviews: Option<u32>,
    pub offset: usize,
    pub family: Option<PlatformFamily>,
    pub platforms: Vec<String>,
    pub category: Option<String>,
}

impl SourceOptions {
    pub fn from_config(config: &SourceConfig, limit: usize, window_days: u32) -> Self {
        Self {
            limit,
            window_days,
            min_score: config.min_score,
            min_reviews: config.min_reviews,
            offset: config.offset,
            family: config.family,
            platforms: config.platforms.clone(),
            category: config.category.clone(),
        }
    }

    /// Inclusive lower bound of the release window.
    pub fn window_start(&self, today: NaiveDate) -> NaiveDate {
        today - ChronoDuration::days(i64::from(self.window_days.max(1)))
    }
}

#[async_trait]
pub trait TrendingSource: Send + Sync {
    fn key(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    async fn fetch(&self, options: &SourceOptions) -> Result<Vec<TrendingGameData>, ProviderError>;
}

/// Trending listing of an API-backed provider (RAWG, NEXARDA feed, ITAD
/// popularity chart), narrowed to the release window.
pub struct ProviderTrendingSource {
    key: String,
    client: Arc<dyn ProviderClient>,
}

impl ProviderTrendingSource {
    pub fn new(key: &str, client: Arc<dyn ProviderClient>) -> Self {
        Self {
            key: key.to_string(),
            client,
        }
    }
}

#[async_trait]
impl TrendingSource for ProviderTrendingSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn enabled(&self) -> bool {
        self.client.enabled()
    }

    async fn fetch(&self, options: &SourceOptions) -> Result<Vec<TrendingGameData>, ProviderError> {
        let mut request = FetchRequest::trending(options.limit, options.window_days);
        request.offset = options.offset;
        request.min_score = options.min_score;
        request.min_reviews = options.min_reviews;
        request.platforms = options.platforms.clone();

        let records = self.client.fetch(&request).await?;
        let today = Utc::now().date_naive();
        let entries: Vec<TrendingGameData> = records
            .into_iter()
            .filter_map(NormalizedRecord::into_game)
            .map(|g| TrendingGameData::from_record(&self.key, g))
            .filter(|e| in_window(e, options, today))
            .filter(|e| family_matches(e, options.family))
            .take(options.limit)
            .collect();
        debug!(source = %self.key, count = entries.len(), "provider trending source fetched");
        Ok(entries)
    }
}

/// Undated entries are kept; feeds like ITAD's chart carry no dates.
fn in_window(entry: &TrendingGameData, options: &SourceOptions, today: NaiveDate) -> bool {
    match entry.released_at {
        Some(d) => d >= options.window_start(today),
        None => true,
    }
}

fn family_matches(entry: &TrendingGameData, family: Option<PlatformFamily>) -> bool {
    match family {
        Some(f) => primary_family(&entry.platforms) == Some(f),
        None => true,
    }
}

/// Local mirror as a trending source: newest releases matching the
/// configured category / platforms / family, minus old PC titles.
pub struct MirrorTrendingSource {
    key: String,
    mirror: Arc<dyn MirrorRepository>,
}

impl MirrorTrendingSource {
    pub fn new(key: &str, mirror: Arc<dyn MirrorRepository>) -> Self {
        Self {
            key: key.to_string(),
            mirror,
        }
    }

    fn to_entry(&self, game: MirrorGame) -> TrendingGameData {
        let mut entry = TrendingGameData::new(
            &self.key,
            self.mirror.provider(),
            game.external_id.to_string(),
            game.title,
        );
        entry.slug = Some(game.slug);
        entry.platforms = game.platform.into_iter().collect();
        entry.genres = game.genres;
        entry.released_at = game.release_date;
        entry.with_metadata(json!({
            "platform_id": game.platform_id,
            "rating": game.rating,
            "overview": game.overview,
            "last_synced_at": game.last_synced_at,
        }))
    }
}

#[async_trait]
impl TrendingSource for MirrorTrendingSource {
    fn key(&self) -> &str {
        &self.key
    }

    async fn fetch(&self, options: &SourceOptions) -> Result<Vec<TrendingGameData>, ProviderError> {
        let filters = MirrorFilters {
            category: options.category.clone(),
            platforms: options.platforms.clone(),
            family: options.family,
            released_after: None,
            exclude_pc_before: Some(policy::pc_cutoff()),
            offset: options.offset,
        };
        let rows = self
            .mirror
            .search("", &filters, options.limit)
            .await
            .map_err(|e| ProviderError::unavailable(self.mirror.provider(), e.to_string()))?;
        Ok(rows.into_iter().map(|g| self.to_entry(g)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::models::MirrorGameUpsert;
    use crate::database_ops::provider_client::{FetchKind, GameRecord};

    struct FixedClient(Vec<GameRecord>);

    #[async_trait]
    impl ProviderClient for FixedClient {
        fn key(&self) -> &str {
            "rawg"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
            assert_eq!(request.kind, FetchKind::Trending);
            Ok(self.0.iter().cloned().map(NormalizedRecord::Game).collect())
        }
    }

    fn record(slug: &str, released: Option<NaiveDate>, platform: &str) -> GameRecord {
        GameRecord {
            provider: "rawg".into(),
            external_id: slug.into(),
            name: slug.into(),
            slug: Some(slug.into()),
            platforms: vec![platform.into()],
            genres: vec![],
            released,
            rating: None,
            metacritic: None,
            review_count: None,
            summary: None,
            image_url: None,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn provider_source_applies_window_and_family() {
        let today = Utc::now().date_naive();
        let client = FixedClient(vec![
            record("recent", Some(today - ChronoDuration::days(3)), "PlayStation 5"),
            record("ancient", Some(today - ChronoDuration::days(400)), "PlayStation 5"),
            record("undated", None, "PlayStation 5"),
            record("xbox", Some(today), "Xbox Series X"),
        ]);
        let source = ProviderTrendingSource::new("rawg", Arc::new(client));
        let mut opts = SourceOptions::from_config(&SourceConfig::new("rawg"), 10, 30);
        let all = source.fetch(&opts).await.unwrap();
        let slugs: Vec<_> = all.iter().filter_map(|e| e.slug.as_deref()).collect();
        assert_eq!(slugs, vec!["recent", "undated", "xbox"]);
        assert!(all.iter().all(|e| e.source() == "rawg"));

        opts.family = Some(PlatformFamily::Playstation);
        let ps = source.fetch(&opts).await.unwrap();
        assert_eq!(ps.len(), 2);
    }

    #[tokio::test]
    async fn mirror_source_excludes_old_pc() {
        let store = MemoryStore::new("tgdb");
        for (id, platform, date) in [
            (1, "PC", "2012-01-01"),
            (2, "PlayStation 5", "2012-01-01"),
            (3, "PC", "2020-05-05"),
        ] {
            store
                .upsert_game(MirrorGameUpsert {
                    external_id: id,
                    title: format!("Game {id}"),
                    platform: Some(platform.into()),
                    platform_id: None,
                    release_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
                    overview: None,
                    rating: None,
                    genres: vec![],
                    payload: json!({}),
                })
                .await
                .unwrap();
        }
        let source = MirrorTrendingSource::new("tgdb_mirror", Arc::new(store));
        let opts = SourceOptions::from_config(&SourceConfig::new("tgdb_mirror"), 10, 30);
        let entries = source.fetch(&opts).await.unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
        assert!(entries.iter().all(|e| e.provider == "tgdb"));
    }
}
