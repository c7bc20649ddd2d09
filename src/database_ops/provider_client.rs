//! Provider client seam: normalized record shapes, the `ProviderClient` trait,
//! the shared HTTP helper every concrete client goes through, and the registry
//! jobs dispatch by provider key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use indexmap::IndexMap;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::models::MediaRole;
use super::tgdb::TgdbApi;
use crate::config::{HttpSettings, IngestConfig, ProviderLimit, ProviderSettings};
use crate::error::ProviderError;
use crate::rate_limit::RateLimiter;

/// One game as a provider describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub provider: String,
    /// Id used for aliasing and follow-up lookups.
    pub external_id: String,
    pub name: String,
    pub slug: Option<String>,
    pub platforms: Vec<String>,
    pub genres: Vec<String>,
    pub released: Option<NaiveDate>,
    /// Already on the 0-100 catalogue scale.
    pub rating: Option<f64>,
    pub metacritic: Option<i32>,
    pub review_count: Option<u32>,
    pub summary: Option<String>,
    pub image_url: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub provider: String,
    pub url: String,
    pub role: MediaRole,
    pub title: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub provider: String,
    pub store: String,
    pub region_code: String,
    pub currency: String,
    pub price: f64,
    pub regular_price: Option<f64>,
    pub discount_percent: Option<i32>,
    pub url: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedRecord {
    Game(GameRecord),
    Media(MediaRecord),
    Price(PriceRecord),
}

impl NormalizedRecord {
    pub fn into_game(self) -> Option<GameRecord> {
        match self {
            NormalizedRecord::Game(g) => Some(g),
            _ => None,
        }
    }

    pub fn into_media(self) -> Option<MediaRecord> {
        match self {
            NormalizedRecord::Media(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_price(self) -> Option<PriceRecord> {
        match self {
            NormalizedRecord::Price(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// Provider's trending / popular / feed listing.
    Trending,
    Search,
    ById,
    Media,
    Prices,
}

/// What a price or media lookup knows about the catalogue product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub platform: Option<String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub kind: FetchKind,
    pub term: Option<String>,
    pub external_id: Option<String>,
    pub product: Option<ProductRef>,
    pub window_days: Option<u32>,
    pub limit: usize,
    pub offset: usize,
    pub regions: Vec<String>,
    pub platforms: Vec<String>,
    pub min_score: Option<f64>,
    pub min_reviews: Option<u32>,
}

impl FetchRequest {
    pub fn new(kind: FetchKind) -> Self {
        Self {
            kind,
            term: None,
            external_id: None,
            product: None,
            window_days: None,
            limit: 20,
            offset: 0,
            regions: Vec::new(),
            platforms: Vec::new(),
            min_score: None,
            min_reviews: None,
        }
    }

    pub fn trending(limit: usize, window_days: u32) -> Self {
        Self {
            limit,
            window_days: Some(window_days),
            ..Self::new(FetchKind::Trending)
        }
    }

    pub fn search(term: impl Into<String>, limit: usize) -> Self {
        Self {
            term: Some(term.into()),
            limit,
            ..Self::new(FetchKind::Search)
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            external_id: Some(id.into()),
            limit: 1,
            ..Self::new(FetchKind::ById)
        }
    }

    pub fn media(id: impl Into<String>, limit: usize) -> Self {
        Self {
            external_id: Some(id.into()),
            limit,
            ..Self::new(FetchKind::Media)
        }
    }

    pub fn prices(product: ProductRef, regions: Vec<String>) -> Self {
        Self {
            product: Some(product),
            regions,
            ..Self::new(FetchKind::Prices)
        }
    }
}

/// One concrete provider.
///
/// Errors are typed: soft failures (`SourceUnavailable`, `Malformed`,
/// `RateLimited`) are for the caller to absorb or escalate.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn key(&self) -> &str;

    /// Configured and credentialed.
    fn enabled(&self) -> bool;

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError>;
}

/// Shared HTTP plumbing: bounded timeout, a few fixed-delay retries for
/// transport errors / 5xx / 429, and a rate-limit permit per attempt.
#[derive(Clone)]
pub struct ProviderHttp {
    key: String,
    client: Client,
    settings: HttpSettings,
    limiter: RateLimiter,
    limit: ProviderLimit,
}

impl ProviderHttp {
    pub fn new(
        key: &str,
        settings: &ProviderSettings,
        limiter: RateLimiter,
        limit: ProviderLimit,
    ) -> Result<Self, ProviderError> {
        let http = settings.http.clamped();
        let client = Client::builder()
            .user_agent(concat!("catalogue-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()
            .map_err(|e| ProviderError::unavailable(key, format!("http client: {e}")))?;
        Ok(Self {
            key: key.to_string(),
            client,
            settings: http,
            limiter,
            limit,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, ProviderError> {
        self.send_json(|c| {
            c.get(url)
                .header(header::ACCEPT, "application/json")
                .query(query)
        })
        .await
    }

    /// Run `build` up to `attempts` times. Rate-limit denials are returned
    /// immediately; the caller reschedules instead of sleeping here.
    pub async fn send_json<F>(&self, build: F) -> Result<Value, ProviderError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire(&self.key, self.limit).await?;
            let last = attempt >= self.settings.attempts;
            match build(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| ProviderError::malformed(&self.key, e.to_string()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retryable =
                        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if status == StatusCode::TOO_MANY_REQUESTS && last {
                        return Err(ProviderError::RateLimited {
                            provider: self.key.clone(),
                            retry_after_secs: retry_after_header(&resp).unwrap_or(60.0),
                        });
                    }
                    if !retryable || last {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ProviderError::unavailable(
                            &self.key,
                            format!("HTTP {status}: {}", truncate_for_log(body, 300)),
                        ));
                    }
                    debug!(provider = %self.key, %status, attempt, "retrying provider request");
                }
                Err(e) => {
                    if last {
                        return Err(ProviderError::unavailable(&self.key, e.to_string()));
                    }
                    warn!(provider = %self.key, error = %e, attempt, "provider request error; retrying");
                }
            }
            sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
        }
    }
}

fn retry_after_header(resp: &reqwest::Response) -> Option<f64> {
    resp.headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
}

pub(crate) fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Lenient numeric read: numbers or numeric strings.
pub(crate) fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Lenient id read: strings or integers.
pub(crate) fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}

pub(crate) fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse the leading `YYYY-MM-DD` of a provider date string.
pub(crate) fn parse_date_prefix(raw: &str) -> Option<NaiveDate> {
    let head = raw.trim().get(0..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Provider clients by key, plus the bulk mirror API.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: IndexMap<String, Arc<dyn ProviderClient>>,
    tgdb: Option<Arc<dyn TgdbApi>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.key().to_string(), client);
        self
    }

    pub fn with_tgdb(mut self, api: Arc<dyn TgdbApi>) -> Self {
        self.tgdb = Some(api);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(key).cloned()
    }

    /// Only when registered and enabled.
    pub fn enabled(&self, key: &str) -> Option<Arc<dyn ProviderClient>> {
        self.get(key).filter(|c| c.enabled())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn tgdb(&self) -> Option<Arc<dyn TgdbApi>> {
        self.tgdb.clone()
    }
}

/// Builds a registry from a freshly loaded config.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &IngestConfig, limiter: &RateLimiter) -> ProviderRegistry;
}

/// Real HTTP clients for every provider this crate knows.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, config: &IngestConfig, limiter: &RateLimiter) -> ProviderRegistry {
        use super::{giantbomb, itad, nexarda, pricecharting, rawg, stores, tgdb};

        let http_for = |key: &str| {
            let settings = config.provider(key);
            ProviderHttp::new(key, &settings, limiter.clone(), config.limits.for_provider(key))
                .map(|http| (settings, http))
        };
        let mut registry = ProviderRegistry::new();

        macro_rules! register {
            ($key:expr, $ctor:expr) => {
                match http_for($key) {
                    Ok((settings, http)) => {
                        registry = registry.with_client(Arc::new($ctor(settings, http)));
                    }
                    Err(e) => warn!(provider = $key, error = %e, "provider client not built"),
                }
            };
        }

        register!("rawg", rawg::RawgClient::new);
        register!("giantbomb", giantbomb::GiantBombClient::new);
        register!("nexarda", nexarda::NexardaClient::new);
        register!("itad", itad::ItadClient::new);
        register!("pricecharting", pricecharting::PriceChartingClient::new);
        for key in stores::STORE_KEYS {
            registry = registry.with_client(Arc::new(stores::StoreStubClient::new(
                key,
                config.provider(key),
            )));
        }
        match http_for("tgdb") {
            Ok((settings, http)) => {
                registry = registry.with_tgdb(Arc::new(tgdb::TgdbClient::new(settings, http)));
            }
            Err(e) => warn!(provider = "tgdb", error = %e, "tgdb client not built"),
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_readers() {
        assert_eq!(value_as_f64(&json!("4.5")), Some(4.5));
        assert_eq!(value_as_f64(&json!(3)), Some(3.0));
        assert_eq!(value_as_f64(&json!(null)), None);
        assert_eq!(value_as_id(&json!(123)), Some("123".into()));
        assert_eq!(value_as_id(&json!(" abc ")), Some("abc".into()));
        assert_eq!(value_as_id(&json!("")), None);
        assert_eq!(
            parse_date_prefix("2023-09-06 00:00:00"),
            NaiveDate::from_ymd_opt(2023, 9, 6)
        );
        assert_eq!(parse_date_prefix("2023"), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = truncate_for_log("ééééé".to_string(), 3);
        assert_eq!(s, "é…");
    }

    #[test]
    fn factory_registers_every_client() {
        let registry = HttpProviderFactory.build(&IngestConfig::default(), &RateLimiter::in_memory());
        let keys: Vec<&str> = registry.keys().collect();
        for key in ["rawg", "giantbomb", "nexarda", "itad", "pricecharting", "eshop"] {
            assert!(keys.contains(&key), "missing {key}");
        }
        assert!(registry.tgdb().is_some());
        // no API keys in the default config
        assert!(registry.enabled("rawg").is_none());
        assert!(registry.enabled("nexarda").is_some());
    }
}
