//! Typed ingestion configuration.
//!
//! Everything is read from the environment (dotenv is loaded once by
//! [`crate::util::env::init_env`]) into plain structs with documented defaults.
//! Jobs obtain a fresh [`IngestConfig`] through a [`ConfigProvider`] at
//! invocation time, so operators can retune limits between runs without a
//! restart. Nothing in here is mutated after construction; per-run overrides
//! are made on a clone.

use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;

use crate::normalization::PlatformFamily;
use crate::util::env;

pub const DEFAULT_SOURCES: [&str; 4] = ["rawg", "nexarda_feed", "itad_popular", "tgdb_mirror"];

/// Providers with an HTTP client in this crate.
pub const PROVIDER_KEYS: [&str; 9] = [
    "rawg",
    "giantbomb",
    "nexarda",
    "itad",
    "pricecharting",
    "tgdb",
    "eshop",
    "psstore",
    "xbox",
];

/// Per trending-source knobs (`CATALOGUE_SOURCE_<KEY>_*`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceConfig {
    pub key: String,
    pub enabled: bool,
    /// Hard cap on entries taken from this source per pass; `None` means
    /// "whatever the pass still needs".
    pub limit: Option<usize>,
    /// Fetch even when earlier sources already satisfied the pass limit.
    pub always_fetch: bool,
    pub min_score: Option<f64>,
    pub min_reviews: Option<u32>,
    pub offset: usize,
    pub family: Option<PlatformFamily>,
    pub platforms: Vec<String>,
    pub category: Option<String>,
}

impl SourceConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enabled: true,
            limit: None,
            always_fetch: false,
            min_score: None,
            min_reviews: None,
            offset: 0,
            family: None,
            platforms: Vec::new(),
            category: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn always(mut self) -> Self {
        self.always_fetch = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogueConfig {
    /// Iteration order is priority order.
    pub sources: IndexMap<String, SourceConfig>,
    pub source_timeout_secs: u64,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            sources: DEFAULT_SOURCES
                .iter()
                .map(|k| (k.to_string(), SourceConfig::new(*k)))
                .collect(),
            source_timeout_secs: 30,
        }
    }
}

impl CatalogueConfig {
    pub fn from_sources(sources: impl IntoIterator<Item = SourceConfig>) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.key.clone(), s)).collect(),
            ..Self::default()
        }
    }

    /// Copy of this config with one source adjusted. Used to retarget a source
    /// for a single run without touching shared state.
    pub fn with_source(&self, key: &str, f: impl FnOnce(&mut SourceConfig)) -> Self {
        let mut next = self.clone();
        let entry = next
            .sources
            .entry(key.to_string())
            .or_insert_with(|| SourceConfig::new(key));
        f(entry);
        next
    }
}

/// Token bucket parameters for one provider key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProviderLimit {
    pub max_rps: f64,
    pub burst: f64,
}

impl ProviderLimit {
    pub const fn new(max_rps: f64, burst: f64) -> Self {
        Self { max_rps, burst }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderLimits {
    pub default: ProviderLimit,
    pub per_provider: IndexMap<String, ProviderLimit>,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        let per_provider = [
            ("rawg", ProviderLimit::new(4.0, 4.0)),
            ("giantbomb", ProviderLimit::new(0.5, 1.0)),
            ("nexarda", ProviderLimit::new(2.0, 2.0)),
            ("itad", ProviderLimit::new(2.0, 4.0)),
            ("pricecharting", ProviderLimit::new(1.0, 1.0)),
            ("tgdb", ProviderLimit::new(1.0, 2.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            default: ProviderLimit::new(1.0, 1.0),
            per_provider,
        }
    }
}

impl ProviderLimits {
    pub fn for_provider(&self, key: &str) -> ProviderLimit {
        self.per_provider.get(key).copied().unwrap_or(self.default)
    }
}

/// Client-level HTTP behaviour, independent of job retry/backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            attempts: 2,
            retry_delay_ms: 500,
        }
    }
}

impl HttpSettings {
    /// Timeouts live in 8..=15s and attempts in 1..=3 whatever the env says.
    pub fn clamped(self) -> Self {
        Self {
            timeout_secs: self.timeout_secs.clamp(8, 15),
            attempts: self.attempts.clamp(1, 3),
            retry_delay_ms: self.retry_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSettings {
    pub key: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub requires_key: bool,
    pub http: HttpSettings,
}

impl ProviderSettings {
    pub fn defaults_for(key: &str) -> Self {
        let (base_url, requires_key) = match key {
            "rawg" => ("https://api.rawg.io/api", true),
            "giantbomb" => ("https://www.giantbomb.com/api", true),
            "nexarda" => ("https://www.nexarda.com/api/v3", false),
            "itad" => ("https://api.isthereanydeal.com", true),
            "pricecharting" => ("https://www.pricecharting.com/api", true),
            "tgdb" => ("https://api.thegamesdb.net/v1", true),
            _ => ("", false),
        };
        Self {
            key: key.to_string(),
            api_key: None,
            base_url: base_url.to_string(),
            requires_key,
            http: HttpSettings::default(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Usable: has a base URL and, where the provider demands one, a key.
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && (!self.requires_key || self.api_key.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingConfig {
    pub providers: Vec<String>,
    pub regions: Vec<String>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            providers: vec!["nexarda".into(), "itad".into(), "pricecharting".into()],
            regions: vec!["US".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaConfig {
    pub providers: Vec<String>,
    pub max_screenshots: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            providers: vec!["rawg".into(), "giantbomb".into()],
            max_screenshots: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TgdbSyncConfig {
    pub full_queries: Vec<String>,
    pub max_pages: u32,
    pub total_shards: u32,
    pub daily_budget: u32,
    pub discovery_enabled: bool,
    pub discovery_batch: u32,
    pub discovery_max_misses: u32,
}

impl Default for TgdbSyncConfig {
    fn default() -> Self {
        Self {
            full_queries: [
                "mario",
                "zelda",
                "pokemon",
                "final fantasy",
                "call of duty",
                "assassin's creed",
                "resident evil",
                "sonic",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_pages: 3,
            total_shards: 24,
            daily_budget: 500,
            discovery_enabled: false,
            discovery_batch: 50,
            discovery_max_misses: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobConfig {
    pub tries: u32,
    pub backoff_secs: Vec<u64>,
    pub jitter_secs: u64,
    pub retry_until_mins: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            tries: 5,
            backoff_secs: vec![30, 60, 120, 240, 480],
            jitter_secs: 15,
            retry_until_mins: 360,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queues: ["fetch", "media", "offers", "aggregate", "verify"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifyConfig {
    pub timeout_secs: u64,
    pub max_links: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 8,
            max_links: 50,
        }
    }
}

/// Root of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestConfig {
    pub catalogue: CatalogueConfig,
    pub limits: ProviderLimits,
    pub providers: IndexMap<String, ProviderSettings>,
    pub pricing: PricingConfig,
    pub media: MediaConfig,
    pub tgdb: TgdbSyncConfig,
    pub jobs: JobConfig,
    pub worker: WorkerConfig,
    pub verify: VerifyConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            catalogue: CatalogueConfig::default(),
            limits: ProviderLimits::default(),
            providers: PROVIDER_KEYS
                .iter()
                .map(|k| (k.to_string(), ProviderSettings::defaults_for(k)))
                .collect(),
            pricing: PricingConfig::default(),
            media: MediaConfig::default(),
            tgdb: TgdbSyncConfig::default(),
            jobs: JobConfig::default(),
            worker: WorkerConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        env::init_env();
        Self::from_lookup(&env::env_opt)
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process env.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let r = Reader { lookup };
        let defaults = Self::default();

        let source_keys = r
            .list("CATALOGUE_SOURCES")
            .unwrap_or_else(|| DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect());
        let sources = source_keys
            .iter()
            .map(|key| {
                let p = format!("CATALOGUE_SOURCE_{}", key.to_ascii_uppercase());
                let base = SourceConfig::new(key.as_str());
                let cfg = SourceConfig {
                    enabled: r.flag(&format!("{p}_ENABLED"), base.enabled),
                    limit: r.parse_opt(&format!("{p}_LIMIT")),
                    always_fetch: r.flag(&format!("{p}_ALWAYS_FETCH"), false),
                    min_score: r.parse_opt(&format!("{p}_MIN_SCORE")),
                    min_reviews: r.parse_opt(&format!("{p}_MIN_REVIEWS")),
                    offset: r.parse(&format!("{p}_OFFSET"), 0),
                    family: r.parse_opt(&format!("{p}_FAMILY")),
                    platforms: r.list(&format!("{p}_PLATFORMS")).unwrap_or_default(),
                    category: r.get(&format!("{p}_CATEGORY")),
                    ..base
                };
                (key.clone(), cfg)
            })
            .collect();
        let catalogue = CatalogueConfig {
            sources,
            source_timeout_secs: r.parse(
                "CATALOGUE_SOURCE_TIMEOUT_SECS",
                defaults.catalogue.source_timeout_secs,
            ),
        };

        let mut limits = defaults.limits.clone();
        limits.default = ProviderLimit::new(
            r.parse("PROVIDER_LIMIT_DEFAULT_MAX_RPS", limits.default.max_rps),
            r.parse("PROVIDER_LIMIT_DEFAULT_BURST", limits.default.burst),
        );
        for key in PROVIDER_KEYS {
            let base = limits.for_provider(key);
            let p = format!("PROVIDER_LIMIT_{}", key.to_ascii_uppercase());
            let limit = ProviderLimit::new(
                r.parse(&format!("{p}_MAX_RPS"), base.max_rps),
                r.parse(&format!("{p}_BURST"), base.burst),
            );
            if limit != limits.default || limits.per_provider.contains_key(key) {
                limits.per_provider.insert(key.to_string(), limit);
            }
        }

        let providers = PROVIDER_KEYS
            .iter()
            .map(|key| {
                let base = ProviderSettings::defaults_for(key);
                let p = key.to_ascii_uppercase();
                let http = HttpSettings {
                    timeout_secs: r.parse(&format!("{p}_TIMEOUT_SECS"), base.http.timeout_secs),
                    attempts: r.parse(&format!("{p}_HTTP_ATTEMPTS"), base.http.attempts),
                    retry_delay_ms: r
                        .parse(&format!("{p}_RETRY_DELAY_MS"), base.http.retry_delay_ms),
                }
                .clamped();
                let settings = ProviderSettings {
                    api_key: r.get(&format!("{p}_API_KEY")),
                    base_url: r
                        .get(&format!("{p}_BASE_URL"))
                        .map(|u| u.trim_end_matches('/').to_string())
                        .unwrap_or(base.base_url.clone()),
                    http,
                    ..base
                };
                (key.to_string(), settings)
            })
            .collect();

        let pricing = PricingConfig {
            providers: r
                .list("PRICING_PROVIDERS")
                .unwrap_or(defaults.pricing.providers),
            regions: r
                .list("PRICING_REGIONS")
                .map(|v| v.into_iter().map(|s| s.to_ascii_uppercase()).collect())
                .unwrap_or(defaults.pricing.regions),
        };
        let media = MediaConfig {
            providers: r.list("MEDIA_PROVIDERS").unwrap_or(defaults.media.providers),
            max_screenshots: r.parse("MEDIA_MAX_SCREENSHOTS", defaults.media.max_screenshots),
        };
        let tgdb = TgdbSyncConfig {
            full_queries: r
                .list("TGDB_FULL_QUERIES")
                .unwrap_or(defaults.tgdb.full_queries),
            max_pages: r.parse("TGDB_FULL_MAX_PAGES", defaults.tgdb.max_pages),
            total_shards: r
                .parse("TGDB_SWEEP_TOTAL_SHARDS", defaults.tgdb.total_shards)
                .max(1),
            daily_budget: r.parse("TGDB_SWEEP_DAILY_BUDGET", defaults.tgdb.daily_budget),
            discovery_enabled: r.flag("TGDB_DISCOVERY_ENABLED", defaults.tgdb.discovery_enabled),
            discovery_batch: r.parse("TGDB_DISCOVERY_BATCH", defaults.tgdb.discovery_batch),
            discovery_max_misses: r.parse(
                "TGDB_DISCOVERY_MAX_MISSES",
                defaults.tgdb.discovery_max_misses,
            ),
        };
        let jobs = JobConfig {
            tries: r.parse("JOB_TRIES", defaults.jobs.tries).max(1),
            backoff_secs: r
                .list("JOB_BACKOFF_SECS")
                .map(|v| v.iter().filter_map(|s| s.parse().ok()).collect::<Vec<u64>>())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.jobs.backoff_secs),
            jitter_secs: r.parse("JOB_BACKOFF_JITTER_SECS", defaults.jobs.jitter_secs),
            retry_until_mins: r.parse("JOB_RETRY_UNTIL_MINS", defaults.jobs.retry_until_mins),
        };
        let worker = WorkerConfig {
            concurrency: r
                .parse("WORKER_CONCURRENCY", defaults.worker.concurrency)
                .max(1),
            queues: r.list("WORKER_QUEUES").unwrap_or(defaults.worker.queues),
            poll_ms: r.parse("WORKER_POLL_MS", defaults.worker.poll_ms),
        };
        let verify = VerifyConfig {
            timeout_secs: r.parse("VERIFY_TIMEOUT_SECS", defaults.verify.timeout_secs),
            max_links: r.parse("VERIFY_MAX_LINKS", defaults.verify.max_links),
        };

        Self {
            catalogue,
            limits,
            providers,
            pricing,
            media,
            tgdb,
            jobs,
            worker,
            verify,
        }
    }

    /// Settings for a provider; unknown keys get unconfigured defaults.
    pub fn provider(&self, key: &str) -> ProviderSettings {
        self.providers
            .get(key)
            .cloned()
            .unwrap_or_else(|| ProviderSettings::defaults_for(key))
    }
}

struct Reader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Reader<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(_) => {
                    warn!(env_key = key, raw_value = %raw, "invalid config value; using default");
                    default
                }
            },
            None => default,
        }
    }

    fn parse_opt<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(env_key = key, raw_value = %raw, "invalid config value; ignoring");
                None
            }
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(raw) => matches!(
                raw.to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "yes"
            ),
            None => default,
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        (self.lookup)(key).map(|raw| env::split_list(&raw))
    }
}

/// Where jobs get their configuration from. Called once per job invocation.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> IngestConfig;
}

/// Re-reads the process environment on every load.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl ConfigProvider for EnvConfig {
    fn load(&self) -> IngestConfig {
        IngestConfig::from_env()
    }
}

/// Fixed configuration, used by tests and one-shot CLI runs.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub IngestConfig);

impl ConfigProvider for StaticConfig {
    fn load(&self) -> IngestConfig {
        self.0.clone()
    }
}
