//! GiantBomb client used for enrichment: search with an in-process cache and
//! game detail lookups.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderSettings;
use crate::database_ops::models::MediaRole;
use crate::database_ops::provider_client::{
    non_empty_str, parse_date_prefix, value_as_id, FetchKind, FetchRequest, GameRecord,
    MediaRecord, NormalizedRecord, ProviderClient, ProviderHttp,
};
use crate::error::ProviderError;
use crate::normalization::normalize_name;

/// Fuzzy matches below this Sørensen-Dice score are rejected.
pub const MIN_FUZZY_SCORE: f64 = 0.6;

const SEARCH_RESOURCE: &str = "game";

type SearchKey = (String, String, usize);

pub struct GiantBombClient {
    settings: ProviderSettings,
    http: ProviderHttp,
    search_cache: Mutex<HashMap<SearchKey, Vec<GameRecord>>>,
}

impl GiantBombClient {
    pub fn new(settings: ProviderSettings, http: ProviderHttp) -> Self {
        Self {
            settings,
            http,
            search_cache: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn query(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut q = vec![("format", "json".to_string())];
        if let Some(key) = &self.settings.api_key {
            q.push(("api_key", key.clone()));
        }
        q.extend(extra.iter().cloned());
        q
    }

    fn cached(&self, key: &SearchKey) -> Option<Vec<GameRecord>> {
        self.search_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<GameRecord>, ProviderError> {
        let key = (term.to_lowercase(), SEARCH_RESOURCE.to_string(), limit);
        if let Some(hit) = self.cached(&key) {
            debug!(term, "giantbomb search cache hit");
            return Ok(hit);
        }
        let body = self
            .http
            .get_json(
                &self.url("search/"),
                &self.query(&[
                    ("query", term.to_string()),
                    ("resources", SEARCH_RESOURCE.to_string()),
                    ("limit", limit.max(1).to_string()),
                ]),
            )
            .await?;
        check_status(&body)?;
        let games = parse_results(&body);
        if let Ok(mut cache) = self.search_cache.lock() {
            cache.insert(key, games.clone());
        }
        Ok(games)
    }

    async fn detail(&self, id: &str) -> Result<Value, ProviderError> {
        let guid = if id.contains('-') {
            id.to_string()
        } else {
            format!("3030-{id}")
        };
        let body = self
            .http
            .get_json(&self.url(&format!("game/{guid}/")), &self.query(&[]))
            .await?;
        check_status(&body)?;
        Ok(body.get("results").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ProviderClient for GiantBombClient {
    fn key(&self) -> &str {
        "giantbomb"
    }

    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.enabled() {
            return Err(ProviderError::Disabled {
                provider: "giantbomb".into(),
            });
        }
        match request.kind {
            FetchKind::Search => {
                let Some(term) = request.term.as_deref().filter(|t| !t.trim().is_empty()) else {
                    return Ok(Vec::new());
                };
                let games = self.search(term.trim(), request.limit).await?;
                Ok(games.into_iter().map(NormalizedRecord::Game).collect())
            }
            FetchKind::ById => {
                let Some(id) = request.external_id.as_deref() else {
                    return Ok(Vec::new());
                };
                let detail = self.detail(id).await?;
                Ok(parse_game(&detail)
                    .map(NormalizedRecord::Game)
                    .into_iter()
                    .collect())
            }
            FetchKind::Media => {
                let Some(id) = request.external_id.as_deref() else {
                    return Ok(Vec::new());
                };
                let detail = self.detail(id).await?;
                Ok(parse_media(&detail, request.limit)
                    .into_iter()
                    .map(NormalizedRecord::Media)
                    .collect())
            }
            FetchKind::Trending | FetchKind::Prices => Ok(Vec::new()),
        }
    }
}

/// GiantBomb reports API errors in-band with HTTP 200.
fn check_status(body: &Value) -> Result<(), ProviderError> {
    match body.get("status_code").and_then(Value::as_i64) {
        Some(1) | None => Ok(()),
        Some(code) => {
            let msg = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(ProviderError::unavailable(
                "giantbomb",
                format!("status_code {code}: {msg}"),
            ))
        }
    }
}

pub fn parse_results(body: &Value) -> Vec<GameRecord> {
    body.get("results")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(parse_game).collect())
        .unwrap_or_default()
}

pub fn parse_game(row: &Value) -> Option<GameRecord> {
    let name = non_empty_str(row.get("name"))?;
    let external_id = row.get("id").and_then(value_as_id)?;
    let released = row
        .get("original_release_date")
        .and_then(Value::as_str)
        .and_then(parse_date_prefix)
        .or_else(|| expected_release(row));
    let platforms = names(row.get("platforms"));
    let genres = names(row.get("genres"));
    let image_url = row
        .get("image")
        .and_then(|img| non_empty_str(img.get("super_url")).or_else(|| non_empty_str(img.get("original_url"))));

    Some(GameRecord {
        provider: "giantbomb".into(),
        external_id,
        slug: None,
        platforms,
        genres,
        released,
        rating: None,
        metacritic: None,
        review_count: row
            .get("number_of_user_reviews")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        summary: non_empty_str(row.get("deck")),
        image_url,
        payload: json!({
            "guid": row.get("guid").cloned().unwrap_or(Value::Null),
            "deck": row.get("deck").cloned().unwrap_or(Value::Null),
            "site_detail_url": row.get("site_detail_url").cloned().unwrap_or(Value::Null),
            "aliases": row.get("aliases").cloned().unwrap_or(Value::Null),
            "original_release_date": row.get("original_release_date").cloned().unwrap_or(Value::Null),
        }),
        name,
    })
}

fn expected_release(row: &Value) -> Option<chrono::NaiveDate> {
    let year = row.get("expected_release_year").and_then(Value::as_i64)?;
    let month = row
        .get("expected_release_month")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let day = row
        .get("expected_release_day")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    chrono::NaiveDate::from_ymd_opt(
        i32::try_from(year).ok()?,
        u32::try_from(month).ok()?,
        u32::try_from(day).ok()?,
    )
}

fn names(list: Option<&Value>) -> Vec<String> {
    list.and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| non_empty_str(v.get("name"))).collect())
        .unwrap_or_default()
}

/// Cover from `image`, screenshots from `images`.
pub fn parse_media(detail: &Value, limit: usize) -> Vec<MediaRecord> {
    let mut out = Vec::new();
    if let Some(url) = detail
        .get("image")
        .and_then(|img| non_empty_str(img.get("original_url")))
    {
        out.push(MediaRecord {
            provider: "giantbomb".into(),
            url,
            role: MediaRole::Cover,
            title: non_empty_str(detail.get("name")),
            metadata: json!({ "asset": "image" }),
        });
    }
    let shots = detail
        .get("images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|img| non_empty_str(img.get("original")))
                .take(limit.max(1))
                .map(|url| MediaRecord {
                    provider: "giantbomb".into(),
                    url,
                    role: MediaRole::Screenshot,
                    title: None,
                    metadata: json!({ "asset": "images" }),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    out.extend(shots);
    out
}

/// Pick the candidate that best matches `wanted`: an exact normalised name
/// match first, then a substring match either way, then the highest fuzzy
/// score at or above [`MIN_FUZZY_SCORE`].
pub fn best_match<'a>(wanted: &str, candidates: &'a [GameRecord]) -> Option<&'a GameRecord> {
    let target = normalize_name(wanted)?;
    let normalized: Vec<(usize, String)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| normalize_name(&c.name).map(|n| (i, n)))
        .collect();

    if let Some((i, _)) = normalized.iter().find(|(_, n)| *n == target) {
        return candidates.get(*i);
    }
    if let Some((i, _)) = normalized
        .iter()
        .find(|(_, n)| n.contains(&target) || target.contains(n.as_str()))
    {
        return candidates.get(*i);
    }
    normalized
        .iter()
        .map(|(i, n)| (*i, strsim::sorensen_dice(&target, n)))
        .filter(|(_, score)| *score >= MIN_FUZZY_SCORE)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .and_then(|(i, _)| candidates.get(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(name: &str, id: &str) -> GameRecord {
        parse_game(&json!({"name": name, "id": id})).unwrap()
    }

    #[test]
    fn parses_search_results() {
        let body = json!({
            "status_code": 1,
            "results": [
                {
                    "id": 123, "guid": "3030-123", "name": "Halo Infinite",
                    "original_release_date": "2021-12-08",
                    "platforms": [{"name": "Xbox Series X|S"}, {"name": "PC"}],
                    "image": {"super_url": "s.jpg", "original_url": "o.jpg"},
                    "deck": "Master Chief returns."
                },
                {"name": "no id"},
                {
                    "id": 7, "name": "Upcoming",
                    "expected_release_year": 2027, "expected_release_month": 3
                }
            ]
        });
        let games = parse_results(&body);
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].external_id, "123");
        assert_eq!(games[0].released, NaiveDate::from_ymd_opt(2021, 12, 8));
        assert_eq!(games[0].image_url.as_deref(), Some("s.jpg"));
        assert_eq!(games[1].released, NaiveDate::from_ymd_opt(2027, 3, 1));
        assert!(parse_results(&json!({"results": "oops"})).is_empty());
    }

    #[test]
    fn in_band_errors_are_unavailable() {
        assert!(check_status(&json!({"status_code": 1})).is_ok());
        let err = check_status(&json!({"status_code": 100, "error": "Invalid API Key"}))
            .unwrap_err();
        assert!(err.is_soft());
        assert!(err.to_string().contains("Invalid API Key"));
    }

    #[test]
    fn best_match_priority() {
        let candidates = vec![
            record("Halo Infinite Deluxe Soundtrack", "1"),
            record("Halo: Infinite", "2"),
            record("Hello Infinity", "3"),
        ];
        // exact (after normalisation) beats an earlier substring hit
        assert_eq!(best_match("halo infinite", &candidates).unwrap().external_id, "2");

        let substring_only = vec![record("Hello Infinity", "3"), record("Halo Infinite Deluxe", "1")];
        assert_eq!(best_match("Halo Infinite", &substring_only).unwrap().external_id, "1");

        let fuzzy = vec![record("Completely Different", "9"), record("Starfeld", "4")];
        assert_eq!(best_match("Starfield", &fuzzy).unwrap().external_id, "4");

        let none = vec![record("Tetris", "5")];
        assert!(best_match("Starfield", &none).is_none());
        assert!(best_match("   ", &none).is_none());
    }

    #[test]
    fn media_from_detail() {
        let detail = json!({
            "name": "Halo",
            "image": {"original_url": "cover.jpg"},
            "images": [{"original": "a.jpg"}, {"original": "b.jpg"}, {"nope": 1}]
        });
        let media = parse_media(&detail, 1);
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].role, MediaRole::Cover);
        assert_eq!(media[1].url, "a.jpg");
    }
}
