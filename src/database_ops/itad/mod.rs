//! IsThereAnyDeal client: plain-id search, current prices per region and the
//! popularity chart used as a trending source.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderSettings;
use crate::database_ops::provider_client::{
    non_empty_str, value_as_f64, FetchKind, FetchRequest, GameRecord, NormalizedRecord,
    PriceRecord, ProductRef, ProviderClient, ProviderHttp,
};
use crate::error::ProviderError;
use crate::normalization::{normalize_name, slugify};

pub struct ItadClient {
    settings: ProviderSettings,
    http: ProviderHttp,
}

impl ItadClient {
    pub fn new(settings: ProviderSettings, http: ProviderHttp) -> Self {
        Self { settings, http }
    }

    async fn get(&self, path: &str, extra: Vec<(&'static str, String)>) -> Result<Value, ProviderError> {
        let url = format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path);
        let mut query = Vec::with_capacity(extra.len() + 1);
        if let Some(key) = &self.settings.api_key {
            query.push(("key", key.clone()));
        }
        query.extend(extra);
        self.http.get_json(&url, &query).await
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<GameRecord>, ProviderError> {
        let body = self
            .get(
                "v02/search/search/",
                vec![("q", term.to_string()), ("limit", limit.max(1).to_string())],
            )
            .await?;
        Ok(parse_search(&body))
    }

    async fn popular(&self, request: &FetchRequest) -> Result<Vec<GameRecord>, ProviderError> {
        let body = self
            .get(
                "v01/stats/popularity/chart/",
                vec![
                    ("offset", request.offset.to_string()),
                    ("limit", request.limit.max(1).to_string()),
                ],
            )
            .await?;
        Ok(parse_popularity(&body))
    }

    async fn resolve_plain(&self, product: &ProductRef) -> Result<Option<String>, ProviderError> {
        if let Some(plain) = product.external_ids.get("itad") {
            return Ok(Some(plain.clone()));
        }
        let wanted = normalize_name(&product.name);
        Ok(self
            .search(&product.name, 5)
            .await?
            .into_iter()
            .find(|g| normalize_name(&g.name) == wanted)
            .map(|g| g.external_id))
    }

    async fn prices(&self, request: &FetchRequest) -> Result<Vec<PriceRecord>, ProviderError> {
        let Some(product) = request.product.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(plain) = self.resolve_plain(product).await? else {
            debug!(product_id = product.id, "itad: no plain for product");
            return Ok(Vec::new());
        };
        let regions = if request.regions.is_empty() {
            vec!["US".to_string()]
        } else {
            request.regions.clone()
        };
        let mut out = Vec::new();
        for country in regions {
            let body = self
                .get(
                    "v01/game/prices/",
                    vec![
                        ("plains", plain.clone()),
                        ("region", itad_region(&country).to_string()),
                        ("country", country.to_ascii_uppercase()),
                    ],
                )
                .await?;
            out.extend(parse_prices(&body, &plain, &country));
        }
        Ok(out)
    }
}

#[async_trait]
impl ProviderClient for ItadClient {
    fn key(&self) -> &str {
        "itad"
    }

    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.enabled() {
            return Err(ProviderError::Disabled {
                provider: "itad".into(),
            });
        }
        let games = match request.kind {
            FetchKind::Trending => self.popular(request).await?,
            FetchKind::Search => match request.term.as_deref().filter(|t| !t.trim().is_empty()) {
                Some(term) => self.search(term, request.limit).await?,
                None => Vec::new(),
            },
            FetchKind::Prices => {
                return Ok(self
                    .prices(request)
                    .await?
                    .into_iter()
                    .map(NormalizedRecord::Price)
                    .collect())
            }
            FetchKind::ById | FetchKind::Media => Vec::new(),
        };
        Ok(games.into_iter().map(NormalizedRecord::Game).collect())
    }
}

fn itad_region(country: &str) -> &'static str {
    match country.to_ascii_uppercase().as_str() {
        "GB" | "UK" => "uk",
        "DE" | "FR" | "ES" | "IT" | "NL" | "IE" | "PT" | "FI" | "AT" | "BE" | "EU" => "eu1",
        "AU" | "NZ" => "au2",
        "CA" => "ca",
        "BR" => "br2",
        _ => "us",
    }
}

fn game_from(plain: String, title: String, payload: Value) -> GameRecord {
    GameRecord {
        provider: "itad".into(),
        slug: Some(slugify(&title)),
        external_id: plain,
        name: title,
        platforms: vec!["PC".into()],
        genres: Vec::new(),
        released: None,
        rating: None,
        metacritic: None,
        review_count: None,
        summary: None,
        image_url: None,
        payload,
    }
}

pub fn parse_search(body: &Value) -> Vec<GameRecord> {
    let Some(results) = body.pointer("/data/results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|row| {
            let plain = non_empty_str(row.get("plain"))?;
            let title = non_empty_str(row.get("title"))?;
            Some(game_from(
                plain,
                title,
                json!({ "id": row.get("id").cloned().unwrap_or(Value::Null) }),
            ))
        })
        .collect()
}

pub fn parse_popularity(body: &Value) -> Vec<GameRecord> {
    let rows = body
        .get("data")
        .and_then(Value::as_array)
        .or_else(|| body.as_array());
    let Some(rows) = rows else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let plain = non_empty_str(row.get("plain"))
                .or_else(|| non_empty_str(row.get("slug")))?;
            let title = non_empty_str(row.get("title"))?;
            Some(game_from(
                plain,
                title,
                json!({
                    "position": row.get("position").cloned().unwrap_or(Value::Null),
                    "count": row.get("count").cloned().unwrap_or(Value::Null),
                }),
            ))
        })
        .collect()
}

/// `data.{plain}.list[]`: `price_new`, `price_old`, `price_cut`, `shop`, `url`.
pub fn parse_prices(body: &Value, plain: &str, country: &str) -> Vec<PriceRecord> {
    let Some(game) = body.get("data").and_then(|d| d.get(plain)) else {
        return Vec::new();
    };
    let currency = body
        .pointer("/.meta/currency")
        .and_then(Value::as_str)
        .unwrap_or("USD")
        .to_ascii_uppercase();
    let Some(list) = game.get("list").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|row| {
            let price = row.get("price_new").and_then(value_as_f64)?;
            if price <= 0.0 {
                return None;
            }
            let shop = non_empty_str(row.pointer("/shop/id"))
                .or_else(|| non_empty_str(row.pointer("/shop/name")))?;
            let regular = row
                .get("price_old")
                .and_then(value_as_f64)
                .filter(|p| *p >= price);
            let cut = row
                .get("price_cut")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .filter(|c| *c > 0);
            Some(PriceRecord {
                provider: "itad".into(),
                store: slugify(&shop),
                region_code: country.to_ascii_uppercase(),
                currency: currency.clone(),
                price,
                regular_price: regular,
                discount_percent: cut,
                url: non_empty_str(row.get("url")),
                payload: json!({
                    "plain": plain,
                    "shop": row.get("shop").cloned().unwrap_or(Value::Null),
                    "drm": row.get("drm").cloned().unwrap_or(Value::Null),
                }),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_and_popularity() {
        let body = json!({"data": {"results": [
            {"id": 1, "plain": "starfield", "title": "Starfield"},
            {"id": 2, "title": "no plain"}
        ]}});
        let games = parse_search(&body);
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].external_id, "starfield");
        assert_eq!(games[0].platforms, vec!["PC"]);

        let chart = json!({"data": [
            {"position": 1, "plain": "baldursgateiii", "title": "Baldur's Gate 3", "count": 900}
        ]});
        let games = parse_popularity(&chart);
        assert_eq!(games[0].slug.as_deref(), Some("baldur-s-gate-3"));
        assert!(parse_popularity(&json!({"data": {}})).is_empty());
    }

    #[test]
    fn prices_for_plain() {
        let body = json!({
            ".meta": {"currency": "eur"},
            "data": {"starfield": {"list": [
                {"price_new": 41.99, "price_old": 69.99, "price_cut": 40,
                 "shop": {"id": "steam", "name": "Steam"}, "url": "https://store/x"},
                {"price_new": "n/a", "shop": {"id": "gog"}},
                {"price_new": 69.99, "price_old": 69.99, "price_cut": 0, "shop": {"name": "Epic Game Store"}}
            ]}}
        });
        let prices = parse_prices(&body, "starfield", "de");
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].currency, "EUR");
        assert_eq!(prices[0].discount_percent, Some(40));
        assert_eq!(prices[0].region_code, "DE");
        assert_eq!(prices[1].store, "epic-game-store");
        assert_eq!(prices[1].discount_percent, None);
        assert!(parse_prices(&body, "other", "US").is_empty());
        assert_eq!(itad_region("de"), "eu1");
    }
}
