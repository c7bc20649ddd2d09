//! NEXARDA client: search, product info, the public feed (trending source)
//! and multi-store prices per currency.

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::database_ops::provider_client::{
    non_empty_str, parse_date_prefix, value_as_f64, value_as_id, FetchKind, FetchRequest,
    GameRecord, NormalizedRecord, PriceRecord, ProductRef, ProviderClient, ProviderHttp,
};
use crate::error::ProviderError;
use crate::normalization::{normalize_name, slugify, RatingMapper};

pub struct NexardaClient {
    settings: ProviderSettings,
    http: ProviderHttp,
    ratings: RatingMapper,
}

impl NexardaClient {
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

    async fn get(&self, path: &str, mut query: Vec<(&'static str, String)>) -> Result<Value, ProviderError> {
        let url = self.url(path);
        let api_key = self.settings.api_key.clone();
        if let Some(k) = api_key.as_deref().filter(|k| !k.is_empty()) {
            query.push(("key", k.to_string()));
        }
        self.http
            .send_json(|c| {
                let mut req = c
                    .get(&url)
                    .header(header::ACCEPT, "application/json")
                    .query(&query);
                if let Some(k) = api_key.as_deref().filter(|k| !k.is_empty()) {
                    req = req.header("X-Api-Key", k);
                }
                req
            })
            .await
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<GameRecord>, ProviderError> {
        let body = self
            .get("search", vec![("q", term.to_string()), ("type", "games".to_string())])
            .await?;
        let mut games: Vec<GameRecord> = list_items(&body)
            .iter()
            .filter_map(|item| parse_game(item, &self.ratings))
            .collect();
        games.truncate(limit.max(1));
        Ok(games)
    }

    async fn feed(&self, request: &FetchRequest) -> Result<Vec<GameRecord>, ProviderError> {
        let body = self.get("feed", Vec::new()).await?;
        let mut games: Vec<GameRecord> = list_items(&body)
            .iter()
            .filter_map(|item| parse_game(item, &self.ratings))
            .skip(request.offset)
            .collect();
        games.truncate(request.limit);
        Ok(games)
    }

    async fn product(&self, id: &str) -> Result<Option<GameRecord>, ProviderError> {
        let body = self
            .get("product", vec![("type", "game".to_string()), ("id", id.to_string())])
            .await?;
        let info = body.get("info").unwrap_or(&body);
        Ok(parse_game(info, &self.ratings))
    }

    /// NEXARDA id from the product's aliases, or the best search hit.
    async fn resolve_id(&self, product: &ProductRef) -> Result<Option<String>, ProviderError> {
        if let Some(id) = product.external_ids.get("nexarda") {
            return Ok(Some(id.clone()));
        }
        let hits = self.search(&product.name, 5).await?;
        let wanted = normalize_name(&product.name);
        Ok(hits
            .into_iter()
            .find(|g| normalize_name(&g.name) == wanted)
            .map(|g| g.external_id))
    }

    async fn prices(&self, request: &FetchRequest) -> Result<Vec<PriceRecord>, ProviderError> {
        let Some(product) = request.product.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(id) = self.resolve_id(product).await? else {
            debug!(product_id = product.id, "nexarda: no matching product");
            return Ok(Vec::new());
        };
        let regions = if request.regions.is_empty() {
            vec!["US".to_string()]
        } else {
            request.regions.clone()
        };
        let mut out = Vec::new();
        for region in regions {
            let currency = currency_for_region(&region);
            let body = self
                .get(
                    "prices",
                    vec![
                        ("type", "game".to_string()),
                        ("id", id.clone()),
                        ("currency", currency.to_string()),
                    ],
                )
                .await?;
            if body.get("success").and_then(Value::as_bool) != Some(true) {
                warn!(nexarda_id = %id, %region, "nexarda: unsuccessful price response");
                continue;
            }
            out.extend(parse_prices(&body, &region, currency));
        }
        Ok(out)
    }
}

#[async_trait]
impl ProviderClient for NexardaClient {
    fn key(&self) -> &str {
        "nexarda"
    }

    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.enabled() {
            return Err(ProviderError::Disabled {
                provider: "nexarda".into(),
            });
        }
        let games = match request.kind {
            FetchKind::Trending => self.feed(request).await?,
            FetchKind::Search => match request.term.as_deref().filter(|t| !t.trim().is_empty()) {
                Some(term) => self.search(term, request.limit).await?,
                None => Vec::new(),
            },
            FetchKind::ById => match request.external_id.as_deref() {
                Some(id) => self.product(id).await?.into_iter().collect(),
                None => Vec::new(),
            },
            FetchKind::Prices => {
                let prices = self.prices(request).await?;
                return Ok(prices.into_iter().map(NormalizedRecord::Price).collect());
            }
            FetchKind::Media => Vec::new(),
        };
        Ok(games.into_iter().map(NormalizedRecord::Game).collect())
    }
}

/// Search and feed responses have moved around between API revisions; accept
/// any of the known list locations.
fn list_items(body: &Value) -> Vec<Value> {
    ["/results/items", "/results", "/items", "/feed", "/games"]
        .iter()
        .find_map(|p| body.pointer(p).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

pub fn parse_game(item: &Value, ratings: &RatingMapper) -> Option<GameRecord> {
    let info = item.get("game_info").unwrap_or(item);
    let name = non_empty_str(item.get("title"))
        .or_else(|| non_empty_str(info.get("name")))
        .or_else(|| non_empty_str(item.get("name")))?;
    let external_id = info
        .get("id")
        .and_then(value_as_id)
        .or_else(|| item.get("id").and_then(value_as_id))?;
    let slug = non_empty_str(info.get("slug"))
        .or_else(|| non_empty_str(item.get("slug")))
        .map(|s| slugify(&s));
    let released = info
        .get("release")
        .or_else(|| item.get("release_date"))
        .and_then(release_date);
    let platforms = info
        .get("platforms")
        .and_then(Value::as_array)
        .map(|ps| {
            ps.iter()
                .filter_map(|p| non_empty_str(p.get("name")).or_else(|| p.as_str().map(str::to_string)))
                .collect()
        })
        .unwrap_or_default();
    let genres = info
        .get("genres")
        .and_then(Value::as_array)
        .map(|gs| {
            gs.iter()
                .filter_map(|g| non_empty_str(g.get("name")).or_else(|| g.as_str().map(str::to_string)))
                .collect()
        })
        .unwrap_or_default();

    Some(GameRecord {
        provider: "nexarda".into(),
        external_id,
        name,
        slug,
        platforms,
        genres,
        released,
        rating: ratings.map("nexarda", info),
        metacritic: None,
        review_count: None,
        summary: non_empty_str(info.get("short_desc")),
        image_url: non_empty_str(item.get("image")).or_else(|| non_empty_str(info.get("cover"))),
        payload: json!({
            "id": info.get("id").cloned().unwrap_or(Value::Null),
            "cover": info.get("cover").cloned().unwrap_or(Value::Null),
            "banner": info.get("banner").cloned().unwrap_or(Value::Null),
            "lowest_price": item.pointer("/game_info/lowest_price").cloned().unwrap_or(Value::Null),
        }),
    })
}

/// NEXARDA sends release dates as unix seconds or ISO strings.
fn release_date(v: &Value) -> Option<chrono::NaiveDate> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .filter(|ts| *ts > 0)
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.date_naive()),
        Value::String(s) => parse_date_prefix(s),
        _ => None,
    }
}

/// One record per store listed under `/prices/list`. Free or zero prices are dropped.
pub fn parse_prices(payload: &Value, region: &str, currency: &str) -> Vec<PriceRecord> {
    let Some(offers) = payload.pointer("/prices/list").and_then(Value::as_array) else {
        return Vec::new();
    };
    let highest = payload.pointer("/prices/highest").and_then(value_as_f64);
    offers
        .iter()
        .filter(|o| o.is_object())
        .filter_map(|offer| {
            let price = offer.get("price").and_then(value_as_f64).map(round2)?;
            if price <= 0.0 {
                return None;
            }
            let store_name = non_empty_str(offer.pointer("/store/name"))?;
            let regular = offer
                .pointer("/coupon/price_without")
                .and_then(value_as_f64)
                .or(highest)
                .map(round2)
                .filter(|r| *r >= price);
            let discount = regular
                .filter(|r| *r > 0.0)
                .map(|r| ((1.0 - price / r) * 100.0).round() as i32)
                .filter(|d| *d > 0);
            Some(PriceRecord {
                provider: "nexarda".into(),
                store: slugify(&store_name),
                region_code: region.to_ascii_uppercase(),
                currency: currency.to_string(),
                price,
                regular_price: regular,
                discount_percent: discount,
                url: non_empty_str(offer.get("url")),
                payload: json!({
                    "store": offer.get("store").cloned().unwrap_or(Value::Null),
                    "edition": offer.get("edition").cloned().unwrap_or(Value::Null),
                    "max_discount": payload.pointer("/prices/max_discount").cloned().unwrap_or(Value::Null),
                }),
            })
        })
        .collect()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn currency_for_region(region: &str) -> &'static str {
    match region.to_ascii_uppercase().as_str() {
        "GB" | "UK" => "GBP",
        "EU" | "DE" | "FR" | "ES" | "IT" | "NL" | "IE" | "PT" | "FI" | "AT" | "BE" => "EUR",
        "JP" => "JPY",
        "CA" => "CAD",
        "AU" => "AUD",
        "NZ" => "NZD",
        "BR" => "BRL",
        "KR" => "KRW",
        _ => "USD",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_price_list() {
        let payload = json!({
            "success": true,
            "prices": {
                "highest": 69.99,
                "max_discount": 30,
                "list": [
                    {"price": 48.993, "store": {"name": "Green Man Gaming"}, "url": "https://gmg/x",
                     "coupon": {"price_without": 69.99}},
                    {"price": 59.99, "store": {"name": "Steam"}},
                    {"price": 0, "store": {"name": "Free Store"}},
                    {"price": 10.0},
                    "junk"
                ]
            }
        });
        let prices = parse_prices(&payload, "us", "USD");
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].store, "green-man-gaming");
        assert_eq!(prices[0].price, 48.99);
        assert_eq!(prices[0].regular_price, Some(69.99));
        assert_eq!(prices[0].discount_percent, Some(30));
        assert_eq!(prices[0].region_code, "US");
        // falls back to the highest observed price
        assert_eq!(prices[1].regular_price, Some(69.99));
        assert!(parse_prices(&json!({"prices": {}}), "US", "USD").is_empty());
    }

    #[test]
    fn parses_feed_and_search_shapes() {
        let ratings = RatingMapper::with_defaults();
        let body = json!({"results": {"items": [
            {"title": "Starfield", "slug": "starfield",
             "game_info": {"id": 42, "release": 1693958400, "platforms": [{"name": "Xbox Series X|S"}]}},
            {"title": "Nameless"}
        ]}});
        let games: Vec<GameRecord> = list_items(&body)
            .iter()
            .filter_map(|i| parse_game(i, &ratings))
            .collect();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].external_id, "42");
        assert_eq!(games[0].slug.as_deref(), Some("starfield"));
        assert_eq!(games[0].released, NaiveDate::from_ymd_opt(2023, 9, 6));
        assert_eq!(games[0].platforms, vec!["Xbox Series X|S"]);

        let flat = json!({"feed": [{"name": "Halo", "id": "7", "release_date": "2021-12-08"}]});
        assert_eq!(list_items(&flat).len(), 1);
        assert!(list_items(&json!({"results": "none"})).is_empty());
    }

    #[test]
    fn region_currency() {
        assert_eq!(currency_for_region("gb"), "GBP");
        assert_eq!(currency_for_region("DE"), "EUR");
        assert_eq!(currency_for_region("ZZ"), "USD");
    }
}
