//! PriceCharting client. Prices come back in pennies, one per condition
//! (loose / complete-in-box / new); each condition becomes its own offer.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ProviderSettings;
use crate::database_ops::provider_client::{
    non_empty_str, parse_date_prefix, value_as_f64, value_as_id, FetchKind, FetchRequest,
    GameRecord, NormalizedRecord, PriceRecord, ProductRef, ProviderClient, ProviderHttp,
};
use crate::error::ProviderError;
use crate::normalization::{normalize_name, PlatformKey};

const CONDITIONS: [(&str, &str); 3] = [
    ("loose-price", "loose"),
    ("cib-price", "cib"),
    ("new-price", "new"),
];

pub struct PriceChartingClient {
    settings: ProviderSettings,
    http: ProviderHttp,
}

impl PriceChartingClient {
    pub fn new(settings: ProviderSettings, http: ProviderHttp) -> Self {
        Self { settings, http }
    }

    async fn get(&self, path: &str, extra: Vec<(&'static str, String)>) -> Result<Value, ProviderError> {
        let url = format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path);
        let mut query = Vec::with_capacity(extra.len() + 1);
        if let Some(token) = &self.settings.api_key {
            query.push(("t", token.clone()));
        }
        query.extend(extra);
        let body = self.http.get_json(&url, &query).await?;
        match body.get("status").and_then(Value::as_str) {
            Some("error") => Err(ProviderError::unavailable(
                "pricecharting",
                body.get("error-message")
                    .and_then(Value::as_str)
                    .unwrap_or("error status")
                    .to_string(),
            )),
            _ => Ok(body),
        }
    }

    async fn search(&self, term: &str) -> Result<Vec<Value>, ProviderError> {
        let body = self.get("products", vec![("q", term.to_string())]).await?;
        Ok(body
            .get("products")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Matching product row: aliased id first, else a search hit whose name
    /// normalises equal and whose console matches the product platform.
    async fn locate(&self, product: &ProductRef) -> Result<Option<Value>, ProviderError> {
        if let Some(id) = product.external_ids.get("pricecharting") {
            let body = self.get("product", vec![("id", id.clone())]).await?;
            return Ok(Some(body));
        }
        let rows = self.search(&product.name).await?;
        Ok(pick_product(&rows, &product.name, product.platform.as_deref()).cloned())
    }
}

#[async_trait]
impl ProviderClient for PriceChartingClient {
    fn key(&self) -> &str {
        "pricecharting"
    }

    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if !self.enabled() {
            return Err(ProviderError::Disabled {
                provider: "pricecharting".into(),
            });
        }
        match request.kind {
            FetchKind::Search => {
                let Some(term) = request.term.as_deref().filter(|t| !t.trim().is_empty()) else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .search(term)
                    .await?
                    .iter()
                    .filter_map(parse_game)
                    .take(request.limit.max(1))
                    .map(NormalizedRecord::Game)
                    .collect())
            }
            FetchKind::ById => {
                let Some(id) = request.external_id.as_deref() else {
                    return Ok(Vec::new());
                };
                let body = self.get("product", vec![("id", id.to_string())]).await?;
                Ok(parse_game(&body).map(NormalizedRecord::Game).into_iter().collect())
            }
            FetchKind::Prices => {
                let Some(product) = request.product.as_ref() else {
                    return Ok(Vec::new());
                };
                let Some(row) = self.locate(product).await? else {
                    return Ok(Vec::new());
                };
                // PriceCharting only prices the US market
                Ok(parse_prices(&row)
                    .into_iter()
                    .map(NormalizedRecord::Price)
                    .collect())
            }
            FetchKind::Trending | FetchKind::Media => Ok(Vec::new()),
        }
    }
}

pub fn pick_product<'a>(rows: &'a [Value], name: &str, platform: Option<&str>) -> Option<&'a Value> {
    let wanted = normalize_name(name)?;
    let wanted_platform = platform.map(PlatformKey::new);
    rows.iter().find(|row| {
        let same_name = row
            .get("product-name")
            .and_then(Value::as_str)
            .and_then(normalize_name)
            .is_some_and(|n| n == wanted);
        let console_ok = match (&wanted_platform, row.get("console-name").and_then(Value::as_str)) {
            (Some(want), Some(console)) => want.matches(&PlatformKey::new(console)),
            _ => true,
        };
        same_name && console_ok
    })
}

pub fn parse_game(row: &Value) -> Option<GameRecord> {
    let name = non_empty_str(row.get("product-name"))?;
    let external_id = row.get("id").and_then(value_as_id)?;
    Some(GameRecord {
        provider: "pricecharting".into(),
        external_id,
        name,
        slug: None,
        platforms: non_empty_str(row.get("console-name")).into_iter().collect(),
        genres: non_empty_str(row.get("genre")).into_iter().collect(),
        released: row
            .get("release-date")
            .and_then(Value::as_str)
            .and_then(parse_date_prefix),
        rating: None,
        metacritic: None,
        review_count: None,
        summary: None,
        image_url: None,
        payload: json!({
            "console-name": row.get("console-name").cloned().unwrap_or(Value::Null),
            "upc": row.get("upc").cloned().unwrap_or(Value::Null),
        }),
    })
}

pub fn parse_prices(row: &Value) -> Vec<PriceRecord> {
    let id = row.get("id").and_then(value_as_id);
    CONDITIONS
        .iter()
        .filter_map(|(field, condition)| {
            let pennies = row.get(*field).and_then(value_as_f64)?;
            if pennies <= 0.0 {
                return None;
            }
            Some(PriceRecord {
                provider: "pricecharting".into(),
                store: format!("pricecharting-{condition}"),
                region_code: "US".into(),
                currency: "USD".into(),
                price: (pennies).round() / 100.0,
                regular_price: None,
                discount_percent: None,
                url: id
                    .as_ref()
                    .map(|id| format!("https://www.pricecharting.com/offers?product={id}")),
                payload: json!({
                    "condition": condition,
                    "pricecharting_id": id,
                    "console-name": row.get("console-name").cloned().unwrap_or(Value::Null),
                }),
            })
        })
        .collect()
}
