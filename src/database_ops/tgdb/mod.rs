//! TheGamesDB bulk API used to feed the local mirror.
//!
//! Unlike the enrichment clients, every failure here is surfaced to the sync
//! jobs so job-level retry can engage.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderSettings;
use crate::database_ops::models::MirrorGameUpsert;
use crate::database_ops::provider_client::{parse_date_prefix, ProviderHttp};
use crate::error::ProviderError;

const GAME_FIELDS: &str = "players,publishers,genres,overview,rating,platform,coop";
/// TGDB caps `ByGameID` id lists.
pub const MAX_IDS_PER_CALL: usize = 20;

/// One page of name-search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TgdbPage {
    pub games: Vec<MirrorGameUpsert>,
    pub has_more: bool,
}

/// One page of the edit log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TgdbUpdates {
    pub game_ids: Vec<i64>,
    /// Highest edit id seen; resume from here next run.
    pub next_edit_id: Option<i64>,
    pub has_more: bool,
}

#[async_trait]
pub trait TgdbApi: Send + Sync {
    fn enabled(&self) -> bool;

    async fn search_by_name(&self, name: &str, page: u32) -> Result<TgdbPage, ProviderError>;

    /// Unknown ids are simply absent from the result.
    async fn by_ids(&self, ids: &[i64]) -> Result<Vec<MirrorGameUpsert>, ProviderError>;

    async fn updates_since(&self, last_edit_id: i64, page: u32) -> Result<TgdbUpdates, ProviderError>;
}

// ---------- API shapes ----------
// Optional wrappers reflect sporadic omissions in upstream responses.

#[derive(Debug, Deserialize)]
struct GamesResponse {
    data: Option<GamesData>,
    include: Option<GamesInclude>,
    pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
struct GamesData {
    #[serde(default)]
    games: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GamesInclude {
    platform: Option<IncludePlatform>,
}

#[derive(Debug, Deserialize)]
struct IncludePlatform {
    // keyed by platform id string
    data: Option<HashMap<String, IncludedPlatform>>,
}

#[derive(Debug, Deserialize, Clone)]
struct IncludedPlatform {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pages {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    data: Option<UpdatesData>,
    pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
struct UpdatesData {
    #[serde(default)]
    updates: Vec<UpdateEntry>,
}

#[derive(Debug, Deserialize)]
struct UpdateEntry {
    edit_id: Option<i64>,
    game_id: Option<i64>,
}

pub struct TgdbClient {
    settings: ProviderSettings,
    http: ProviderHttp,
}

impl TgdbClient {
    pub fn new(settings: ProviderSettings, http: ProviderHttp) -> Self {
        Self { settings, http }
    }

    async fn get(&self, path: &str, extra: Vec<(&'static str, String)>) -> Result<Value, ProviderError> {
        let url = format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path);
        let mut query = Vec::with_capacity(extra.len() + 1);
        if let Some(key) = &self.settings.api_key {
            query.push(("apikey", key.clone()));
        }
        query.extend(extra);
        self.http.get_json(&url, &query).await
    }
}

#[async_trait]
impl TgdbApi for TgdbClient {
    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn search_by_name(&self, name: &str, page: u32) -> Result<TgdbPage, ProviderError> {
        let body = self
            .get(
                "Games/ByGameName",
                vec![
                    ("name", name.to_string()),
                    ("fields", GAME_FIELDS.to_string()),
                    ("include", "platform".to_string()),
                    ("page", page.max(1).to_string()),
                ],
            )
            .await?;
        parse_games_page(body)
    }

    async fn by_ids(&self, ids: &[i64]) -> Result<Vec<MirrorGameUpsert>, ProviderError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_CALL) {
            let list = chunk
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let body = self
                .get(
                    "Games/ByGameID",
                    vec![
                        ("id", list),
                        ("fields", GAME_FIELDS.to_string()),
                        ("include", "platform".to_string()),
                    ],
                )
                .await?;
            out.extend(parse_games_page(body)?.games);
        }
        debug!(requested = ids.len(), found = out.len(), "tgdb by_ids");
        Ok(out)
    }

    async fn updates_since(&self, last_edit_id: i64, page: u32) -> Result<TgdbUpdates, ProviderError> {
        let body = self
            .get(
                "Games/Updates",
                vec![
                    ("last_edit_id", last_edit_id.to_string()),
                    ("page", page.max(1).to_string()),
                ],
            )
            .await?;
        parse_updates(body)
    }
}

pub fn parse_games_page(body: Value) -> Result<TgdbPage, ProviderError> {
    let parsed: GamesResponse =
        serde_json::from_value(body).map_err(|e| ProviderError::malformed("tgdb", e.to_string()))?;
    let platforms: HashMap<String, IncludedPlatform> = parsed
        .include
        .and_then(|i| i.platform)
        .and_then(|p| p.data)
        .unwrap_or_default();
    let games = parsed
        .data
        .map(|d| d.games)
        .unwrap_or_default()
        .iter()
        .filter_map(|g| parse_game(g, &platforms))
        .collect();
    Ok(TgdbPage {
        games,
        has_more: parsed.pages.and_then(|p| p.next).is_some(),
    })
}

fn parse_game(row: &Value, platforms: &HashMap<String, IncludedPlatform>) -> Option<MirrorGameUpsert> {
    let external_id = row.get("id").and_then(Value::as_i64)?;
    let title = row
        .get("game_title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();
    let platform_id = row.get("platform").and_then(Value::as_i64);
    let platform = platform_id
        .and_then(|id| platforms.get(&id.to_string()))
        .and_then(|p| p.name.clone());
    let genres = row
        .get("genres")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).map(genre_name).collect())
        .unwrap_or_default();

    Some(MirrorGameUpsert {
        external_id,
        title,
        platform,
        platform_id,
        release_date: row
            .get("release_date")
            .and_then(Value::as_str)
            .and_then(parse_date_prefix),
        overview: row
            .get("overview")
            .and_then(Value::as_str)
            .map(str::to_string),
        rating: row.get("rating").and_then(Value::as_str).map(str::to_string),
        genres,
        payload: json!({
            "players": row.get("players").cloned().unwrap_or(Value::Null),
            "coop": row.get("coop").cloned().unwrap_or(Value::Null),
            "publishers": row.get("publishers").cloned().unwrap_or(Value::Null),
        }),
    })
}

pub fn parse_updates(body: Value) -> Result<TgdbUpdates, ProviderError> {
    let parsed: UpdatesResponse =
        serde_json::from_value(body).map_err(|e| ProviderError::malformed("tgdb", e.to_string()))?;
    let entries = parsed.data.map(|d| d.updates).unwrap_or_default();
    let next_edit_id = entries.iter().filter_map(|e| e.edit_id).max();
    let mut game_ids: Vec<i64> = entries.iter().filter_map(|e| e.game_id).collect();
    game_ids.sort_unstable();
    game_ids.dedup();
    Ok(TgdbUpdates {
        game_ids,
        next_edit_id,
        has_more: parsed.pages.and_then(|p| p.next).is_some(),
    })
}

/// TGDB genre ids (the `/Genres` table rarely changes).
pub fn genre_name(id: i64) -> String {
    let name = match id {
        1 => "Action",
        2 => "Adventure",
        3 => "Construction and Management Simulation",
        4 => "Role-Playing",
        5 => "Puzzle",
        6 => "Strategy",
        7 => "Racing",
        8 => "Shooter",
        9 => "Life Simulation",
        10 => "Fighting",
        11 => "Sports",
        12 => "Sandbox",
        13 => "Flight Simulator",
        14 => "MMO",
        15 => "Platform",
        16 => "Stealth",
        17 => "Music",
        18 => "Horror",
        19 => "Vehicle Simulation",
        20 => "Board",
        21 => "Education",
        22 => "Family",
        23 => "Party",
        24 => "Productivity",
        25 => "Quiz",
        26 => "Utility",
        27 => "Virtual Console",
        28 => "Unofficial",
        29 => "GBA Video / PSP Video",
        _ => return format!("genre-{id}"),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_games_with_included_platforms() {
        let body = json!({
            "data": {"count": 2, "games": [
                {"id": 1, "game_title": "Halo: Combat Evolved", "release_date": "2001-11-15",
                 "platform": 14, "genres": [8, 99], "rating": "M - Mature 17+", "overview": "Ring world."},
                {"id": 2, "game_title": "  "},
                {"game_title": "no id"}
            ]},
            "include": {"platform": {"data": {"14": {"id": 14, "name": "Microsoft Xbox"}}}},
            "pages": {"previous": null, "current": "x", "next": "https://api/next"}
        });
        let page = parse_games_page(body).unwrap();
        assert!(page.has_more);
        assert_eq!(page.games.len(), 1);
        let halo = &page.games[0];
        assert_eq!(halo.platform.as_deref(), Some("Microsoft Xbox"));
        assert_eq!(halo.release_date, NaiveDate::from_ymd_opt(2001, 11, 15));
        assert_eq!(halo.genres, vec!["Shooter", "genre-99"]);
    }

    #[test]
    fn empty_and_malformed_pages() {
        let page = parse_games_page(json!({"data": null, "pages": {"next": null}})).unwrap();
        assert!(page.games.is_empty());
        assert!(!page.has_more);
        let err = parse_games_page(json!({"data": {"games": "nope"}})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[test]
    fn updates_collapse_game_ids() {
        let body = json!({
            "data": {"updates": [
                {"edit_id": 10, "game_id": 5, "type": "overview"},
                {"edit_id": 12, "game_id": 3, "type": "rating"},
                {"edit_id": 11, "game_id": 5, "type": "genres"}
            ]},
            "pages": {"next": null}
        });
        let updates = parse_updates(body).unwrap();
        assert_eq!(updates.game_ids, vec![3, 5]);
        assert_eq!(updates.next_edit_id, Some(12));
        assert!(!updates.has_more);
    }
}
