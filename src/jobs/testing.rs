//! Fakes shared by the job tests. Nothing here touches the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;

use super::context::Services;
use super::verify::LinkProber;
use crate::config::{IngestConfig, ProviderLimit, StaticConfig};
use crate::database_ops::memory::MemoryStore;
use crate::database_ops::models::{LinkCheck, LinkStatus, MirrorGameUpsert};
use crate::database_ops::provider_client::{
    FetchKind, FetchRequest, GameRecord, NormalizedRecord, ProviderClient, ProviderFactory,
    ProviderRegistry,
};
use crate::database_ops::tgdb::{TgdbApi, TgdbPage, TgdbUpdates};
use crate::error::ProviderError;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub enum Reply {
    Records(Vec<NormalizedRecord>),
    Unavailable,
    RateLimited(f64),
}

/// Scripted provider: one reply per fetch kind, every request recorded.
pub struct FakeClient {
    key: String,
    replies: Mutex<HashMap<String, Reply>>,
    pub requests: Mutex<Vec<FetchRequest>>,
    gate: Option<(RateLimiter, ProviderLimit)>,
}

fn kind_key(kind: FetchKind) -> String {
    format!("{kind:?}")
}

impl FakeClient {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            replies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Take a permit before every request, as the HTTP clients do. Denied
    /// requests are not recorded.
    pub fn limited(mut self, limiter: RateLimiter, limit: ProviderLimit) -> Self {
        self.gate = Some((limiter, limit));
        self
    }

    pub fn reply(self, kind: FetchKind, reply: Reply) -> Self {
        self.replies.lock().unwrap().insert(kind_key(kind), reply);
        self
    }

    pub fn set_reply(&self, kind: FetchKind, reply: Reply) {
        self.replies.lock().unwrap().insert(kind_key(kind), reply);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderClient for FakeClient {
    fn key(&self) -> &str {
        &self.key
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        if let Some((limiter, limit)) = &self.gate {
            limiter.acquire(&self.key, *limit).await?;
        }
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().get(&kind_key(request.kind)).cloned();
        match reply {
            Some(Reply::Records(records)) => {
                Ok(records.into_iter().take(request.limit.max(1)).collect())
            }
            Some(Reply::Unavailable) => Err(ProviderError::unavailable(&self.key, "HTTP 503")),
            Some(Reply::RateLimited(secs)) => Err(ProviderError::RateLimited {
                provider: self.key.clone(),
                retry_after_secs: secs,
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Scripted bulk mirror API.
#[derive(Default)]
pub struct FakeTgdb {
    pub pages: Mutex<HashMap<(String, u32), TgdbPage>>,
    pub games: Mutex<BTreeMap<i64, MirrorGameUpsert>>,
    pub updates: Mutex<Vec<TgdbUpdates>>,
    pub fail: Mutex<bool>,
    pub by_id_calls: Mutex<Vec<Vec<i64>>>,
}

impl FakeTgdb {
    pub fn with_game(self, game: MirrorGameUpsert) -> Self {
        self.games.lock().unwrap().insert(game.external_id, game);
        self
    }

    pub fn with_page(self, query: &str, page: u32, result: TgdbPage) -> Self {
        self.pages.lock().unwrap().insert((query.to_string(), page), result);
        self
    }

    pub fn failing(self) -> Self {
        *self.fail.lock().unwrap() = true;
        self
    }

    fn check(&self) -> Result<(), ProviderError> {
        if *self.fail.lock().unwrap() {
            Err(ProviderError::unavailable("tgdb", "HTTP 502"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TgdbApi for FakeTgdb {
    fn enabled(&self) -> bool {
        true
    }

    async fn search_by_name(&self, name: &str, page: u32) -> Result<TgdbPage, ProviderError> {
        self.check()?;
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(name.to_string(), page))
            .cloned()
            .unwrap_or_default())
    }

    async fn by_ids(&self, ids: &[i64]) -> Result<Vec<MirrorGameUpsert>, ProviderError> {
        self.check()?;
        self.by_id_calls.lock().unwrap().push(ids.to_vec());
        let games = self.games.lock().unwrap();
        Ok(ids.iter().filter_map(|id| games.get(id).cloned()).collect())
    }

    async fn updates_since(&self, _last_edit_id: i64, page: u32) -> Result<TgdbUpdates, ProviderError> {
        self.check()?;
        Ok(self
            .updates
            .lock()
            .unwrap()
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default())
    }
}

/// Hands out the same registry on every build.
pub struct FixedFactory(pub ProviderRegistry);

impl ProviderFactory for FixedFactory {
    fn build(&self, _config: &IngestConfig, _limiter: &RateLimiter) -> ProviderRegistry {
        self.0.clone()
    }
}

/// URL → HTTP status; unknown URLs are transport errors.
#[derive(Default)]
pub struct FakeProber(pub HashMap<String, u16>);

#[async_trait]
impl LinkProber for FakeProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> LinkCheck {
        match self.0.get(url) {
            Some(code) => LinkCheck {
                status: if *code < 400 { LinkStatus::Ok } else { LinkStatus::Failed },
                code: Some(*code),
                checked_at: Utc::now(),
                reason: None,
            },
            None => LinkCheck {
                status: LinkStatus::Error,
                code: None,
                checked_at: Utc::now(),
                reason: Some("connection refused".into()),
            },
        }
    }
}

pub fn services(store: &MemoryStore, registry: ProviderRegistry, config: IngestConfig) -> Services {
    Services::in_memory(
        store.clone(),
        Arc::new(StaticConfig(config)),
        Arc::new(FixedFactory(registry)),
    )
    .with_prober(Arc::new(FakeProber::default()))
}

pub fn game(provider: &str, id: &str, name: &str, platform: &str, released: Option<NaiveDate>) -> GameRecord {
    GameRecord {
        provider: provider.into(),
        external_id: id.into(),
        name: name.into(),
        slug: None,
        platforms: vec![platform.into()],
        genres: vec!["Action".into()],
        released,
        rating: Some(84.0),
        metacritic: None,
        review_count: None,
        summary: None,
        image_url: None,
        payload: json!({ "id": id }),
    }
}

pub fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}
