//! RAWG client: windowed trending listing, search, detail and media.
//!
//! RAWG slugs are stable and human readable, so they double as the external id
//! recorded on aliases (`rawg:starfield`).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::ProviderSettings;
use crate::database_ops::models::MediaRole;
use crate::database_ops::provider_client::{
    non_empty_str, parse_date_prefix, value_as_id, FetchKind, FetchRequest, GameRecord,
    MediaRecord, NormalizedRecord, ProviderClient, ProviderHttp,
};
use crate::error::ProviderError;
use crate::normalization::RatingMapper;

const PAGE_SIZE_MAX: usize = 40;
const MAX_PAGES: usize = 5;

#[derive(Debug, Deserialize)]
struct RawgListResponse {
    next: Option<String>,
    #[serde(default)]
    results: Vec<Value>,
}

pub struct RawgClient {
    settings: ProviderSettings,
    http: ProviderHttp,
    ratings: RatingMapper,
}

impl RawgClient {
    pub fn new(settings: ProviderSettings, http: ProviderHttp) -> Self {
        Self {
            settings,
            http,
            ratings: RatingMapper::with_defaults(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::new();
        if let Some(key) = &self.settings.api_key {
            q.push(("key", key.clone()));
        }
        q
    }

    async fn list_games(
        &self,
        request: &FetchRequest,
        extra: Vec<(&'static str, String)>,
    ) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let want = request.limit.max(1);
        let page_size = want.min(PAGE_SIZE_MAX);
        let mut page = 1 + request.offset / page_size;
        let mut out = Vec::new();

        for _ in 0..MAX_PAGES {
            let mut query = self.base_query();
            query.extend(extra.iter().cloned());
            query.push(("page_size", page_size.to_string()));
            query.push(("page", page.to_string()));
            let body = self.http.get_json(&self.url("games"), &query).await?;
            let parsed: RawgListResponse = serde_json::from_value(body)
                .map_err(|e| ProviderError::malformed("rawg", e.to_string()))?;

            let fetched = parsed.results.len();
            out.extend(
                parsed
                    .results
                    .iter()
                    .filter_map(|row| parse_game(row, &self.ratings))
                    .filter(|g| passes_filters(g, request)),
            );
            debug!(page, fetched, kept = out.len(), "rawg page");
            if out.len() >= want || parsed.next.is_none() || fetched == 0 {
                break;
            }
            page += 1;
        }
        out.truncate(want);
        Ok(out.into_iter().map(NormalizedRecord::Game).collect())
    }

    async fn trending(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let window = request.window_days.unwrap_or(30).max(1);
        let to = Utc::now().date_naive();
        let from = to - ChronoDuration::days(i64::from(window));
        let records = self
            .list_games(
                request,
                vec![
                    ("dates", format!("{from},{to}")),
                    ("ordering", "-added".to_string()),
                ],
            )
            .await?;
        info!(window_days = window, count = records.len(), "rawg trending fetched");
        Ok(records)
    }

    async fn detail(&self, id: &str) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let path = format!("games/{}", urlencoding::encode(id));
        let body = self.http.get_json(&self.url(&path), &self.base_query()).await?;
        Ok(parse_game(&body, &self.ratings)
            .map(NormalizedRecord::Game)
            .into_iter()
            .collect())
    }

    async fn media(&self, id: &str, limit: usize) -> Result<Vec<NormalizedRecord>, ProviderError> {
        let encoded = urlencoding::encode(id);
        let movies = self
            .http
            .get_json(&self.url(&format!("games/{encoded}/movies")), &self.base_query())
            .await?;
        let shots = self
            .http
            .get_json(
                &self.url(&format!("games/{encoded}/screenshots")),
                &self.base_query(),
            )
            .await?;
        let mut out = parse_movies(&movies);
        out.extend(parse_screenshots(&shots, limit));
        Ok(out.into_iter().map(NormalizedRecord::Media).collect())
    }
}

#[async_trait]
impl ProviderClient for RawgClient {
    fn key(&self) -> &str {
        "rawg"
    }

    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.enabled() {
            return Err(ProviderError::Disabled {
                provider: "rawg".into(),
            });
        }
        match request.kind {
            FetchKind::Trending => self.trending(request).await,
            FetchKind::Search => {
                let Some(term) = request.term.as_deref().filter(|t| !t.trim().is_empty()) else {
                    return Ok(Vec::new());
                };
                self.list_games(request, vec![("search", term.to_string())])
                    .await
            }
            FetchKind::ById => match request.external_id.as_deref() {
                Some(id) => self.detail(id).await,
                None => Ok(Vec::new()),
            },
            FetchKind::Media => match request.external_id.as_deref() {
                Some(id) => self.media(id, request.limit).await,
                None => Ok(Vec::new()),
            },
            FetchKind::Prices => Ok(Vec::new()),
        }
    }
}

/// Map one RAWG game row (list or detail shape).
pub fn parse_game(row: &Value, ratings: &RatingMapper) -> Option<GameRecord> {
    let name = non_empty_str(row.get("name"))?;
    let slug = non_empty_str(row.get("slug"));
    let external_id = slug.clone().or_else(|| row.get("id").and_then(value_as_id))?;

    let platforms = named_list(row.get("platforms"), "platform");
    let genres = named_list(row.get("genres"), "");
    let released = row
        .get("released")
        .and_then(Value::as_str)
        .and_then(parse_date_prefix);
    let metacritic = row
        .get("metacritic")
        .and_then(Value::as_i64)
        .and_then(|m| i32::try_from(m).ok());
    let review_count = row
        .get("ratings_count")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());

    Some(GameRecord {
        provider: "rawg".into(),
        external_id,
        name,
        slug,
        platforms,
        genres,
        released,
        rating: ratings.map("rawg", row),
        metacritic,
        review_count,
        summary: non_empty_str(row.get("description_raw")),
        image_url: non_empty_str(row.get("background_image")),
        payload: json!({
            "id": row.get("id").cloned().unwrap_or(Value::Null),
            "slug": row.get("slug").cloned().unwrap_or(Value::Null),
            "rating": row.get("rating").cloned().unwrap_or(Value::Null),
            "ratings_count": row.get("ratings_count").cloned().unwrap_or(Value::Null),
            "added": row.get("added").cloned().unwrap_or(Value::Null),
            "metacritic": row.get("metacritic").cloned().unwrap_or(Value::Null),
            "background_image": row.get("background_image").cloned().unwrap_or(Value::Null),
        }),
    })
}

/// `[{platform: {name}}]` (nested under `wrapper`) or `[{name}]`.
fn named_list(list: Option<&Value>, wrapper: &str) -> Vec<String> {
    let Some(items) = list.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let inner = if wrapper.is_empty() {
                Some(item)
            } else {
                item.get(wrapper).or(Some(item))
            };
            inner.and_then(|v| non_empty_str(v.get("name")))
        })
        .collect()
}

fn passes_filters(game: &GameRecord, request: &FetchRequest) -> bool {
    if let Some(min) = request.min_score {
        let score = game
            .metacritic
            .map(f64::from)
            .or(game.rating)
            .unwrap_or(0.0);
        if score < min {
            return false;
        }
    }
    if let Some(min) = request.min_reviews {
        if game.review_count.unwrap_or(0) < min {
            return false;
        }
    }
    true
}

/// Trailers from `/games/{id}/movies`; the `max` rendition wins over `480`.
pub fn parse_movies(body: &Value) -> Vec<MediaRecord> {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|movie| {
            let data = movie.get("data")?;
            let url = non_empty_str(data.get("max")).or_else(|| non_empty_str(data.get("480")))?;
            Some(MediaRecord {
                provider: "rawg".into(),
                url,
                role: MediaRole::Trailer,
                title: non_empty_str(movie.get("name")),
                metadata: json!({
                    "rawg_movie_id": movie.get("id").cloned().unwrap_or(Value::Null),
                    "preview": movie.get("preview").cloned().unwrap_or(Value::Null),
                }),
            })
        })
        .collect()
}

pub fn parse_screenshots(body: &Value, limit: usize) -> Vec<MediaRecord> {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .filter(|shot| !shot.get("is_deleted").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|shot| {
            let url = non_empty_str(shot.get("image"))?;
            Some(MediaRecord {
                provider: "rawg".into(),
                url,
                role: MediaRole::Screenshot,
                title: None,
                metadata: json!({
                    "rawg_screenshot_id": shot.get("id").cloned().unwrap_or(Value::Null),
                    "width": shot.get("width").cloned().unwrap_or(Value::Null),
                    "height": shot.get("height").cloned().unwrap_or(Value::Null),
                }),
            })
        })
        .take(limit.max(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn starfield() -> Value {
        json!({
            "id": 795632,
            "slug": "starfield",
            "name": "Starfield",
            "released": "2023-09-06",
            "rating": 3.4,
            "ratings_count": 412,
            "metacritic": 83,
            "background_image": "https://media.rawg.io/starfield.jpg",
            "platforms": [
                {"platform": {"id": 186, "name": "Xbox Series S/X"}},
                {"platform": {"id": 4, "name": "PC"}}
            ],
            "genres": [{"id": 5, "name": "RPG"}]
        })
    }

    #[test]
    fn parses_list_row() {
        let game = parse_game(&starfield(), &RatingMapper::with_defaults()).unwrap();
        assert_eq!(game.external_id, "starfield");
        assert_eq!(game.platforms, vec!["Xbox Series S/X", "PC"]);
        assert_eq!(game.genres, vec!["RPG"]);
        assert_eq!(game.released, NaiveDate::from_ymd_opt(2023, 9, 6));
        assert_eq!(game.metacritic, Some(83));
        assert_eq!(game.rating, Some(83.0));
        assert_eq!(game.review_count, Some(412));
    }

    #[test]
    fn missing_name_or_ids_yield_nothing() {
        let ratings = RatingMapper::with_defaults();
        assert!(parse_game(&json!({"slug": "x"}), &ratings).is_none());
        assert!(parse_game(&json!({"name": "No Id"}), &ratings).is_none());
        let numeric = parse_game(&json!({"name": "Numeric", "id": 9}), &ratings).unwrap();
        assert_eq!(numeric.external_id, "9");
        // garbage platform shapes are ignored rather than fatal
        let odd = parse_game(
            &json!({"name": "Odd", "slug": "odd", "platforms": "pc", "released": 2020}),
            &ratings,
        )
        .unwrap();
        assert!(odd.platforms.is_empty());
        assert!(odd.released.is_none());
    }

    #[test]
    fn min_score_and_reviews_filter() {
        let game = parse_game(&starfield(), &RatingMapper::with_defaults()).unwrap();
        let mut req = FetchRequest::trending(10, 30);
        assert!(passes_filters(&game, &req));
        req.min_score = Some(90.0);
        assert!(!passes_filters(&game, &req));
        req.min_score = Some(80.0);
        req.min_reviews = Some(500);
        assert!(!passes_filters(&game, &req));
    }

    #[test]
    fn media_shapes() {
        let movies = json!({"results": [
            {"id": 1, "name": "Launch", "preview": "p.jpg", "data": {"480": "a.mp4", "max": "b.mp4"}},
            {"id": 2, "data": {}}
        ]});
        let parsed = parse_movies(&movies);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].url, "b.mp4");
        assert_eq!(parsed[0].role, MediaRole::Trailer);

        let shots = json!({"results": [
            {"id": 1, "image": "1.jpg"},
            {"id": 2, "image": "2.jpg", "is_deleted": true},
            {"id": 3, "image": "3.jpg"},
            {"id": 4, "image": "4.jpg"}
        ]});
        let parsed = parse_screenshots(&shots, 2);
        let urls: Vec<&str> = parsed.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(urls, vec!["1.jpg", "3.jpg"]);
        assert!(parse_screenshots(&json!({"results": null}), 5).is_empty());
    }
}
