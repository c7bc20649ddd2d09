use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::sources::{
    MirrorTrendingSource, ProviderTrendingSource, SourceOptions, TrendingSource,
};
use super::TrendingGameData;
use crate::config::CatalogueConfig;
use crate::database_ops::provider_client::ProviderRegistry;
use crate::database_ops::repository::MirrorRepository;
use crate::error::ProviderError;
use crate::normalization::dedupe_slug;

/// Trending source key to the provider client that backs it.
pub const PROVIDER_SOURCES: [(&str, &str); 3] = [
    ("rawg", "rawg"),
    ("nexarda_feed", "nexarda"),
    ("itad_popular", "itad"),
];

pub const MIRROR_SOURCE: &str = "tgdb_mirror";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SourceStatus {
    Fetched,
    Disabled,
    /// Nothing registered under the configured key.
    Missing,
    /// Limit already satisfied and not `always_fetch`.
    Skipped,
    /// The provider's bucket was empty; nothing was sent.
    RateLimited { retry_after_secs: f64 },
    Failed(String),
}

/// Per-source diagnostics for one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTally {
    /// Unique entries this source contributed.
    pub count: usize,
    pub requested: usize,
    pub status: SourceStatus,
}

impl SourceTally {
    fn with_status(status: SourceStatus) -> Self {
        Self {
            count: 0,
            requested: 0,
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub entries: Vec<TrendingGameData>,
    pub sources: IndexMap<String, SourceTally>,
    pub total_requested: usize,
}

impl AggregateResult {
    /// Shortest wait among sources whose bucket was empty this pass.
    pub fn rate_limited(&self) -> Option<Duration> {
        self.sources
            .values()
            .filter_map(|tally| match tally.status {
                SourceStatus::RateLimited { retry_after_secs } => {
                    Some(Duration::from_secs_f64(retry_after_secs.max(0.0)))
                }
                _ => None,
            })
            .min()
    }
}

/// Merges trending sources into one ranked, deduplicated list.
///
/// Sources run in configured order, which is also the dedupe priority. Each
/// source takes at most `min(its limit, remaining need)`; once the overall
/// limit is met only `always_fetch` sources still run. A failing or slow
/// source contributes nothing and never aborts the pass.
#[derive(Clone, Default)]
pub struct CatalogueAggregator {
    sources: IndexMap<String, Arc<dyn TrendingSource>>,
}

impl CatalogueAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn TrendingSource>) -> Self {
        self.sources.insert(source.key().to_string(), source);
        self
    }

    /// The standard source set: API-backed trending listings plus the mirror.
    pub fn from_registry(registry: &ProviderRegistry, mirror: Arc<dyn MirrorRepository>) -> Self {
        let mut aggregator = Self::new();
        for (source_key, provider_key) in PROVIDER_SOURCES {
            if let Some(client) = registry.get(provider_key) {
                aggregator =
                    aggregator.with_source(Arc::new(ProviderTrendingSource::new(source_key, client)));
            }
        }
        aggregator.with_source(Arc::new(MirrorTrendingSource::new(MIRROR_SOURCE, mirror)))
    }

    pub fn has_source(&self, key: &str) -> bool {
        self.sources.contains_key(key)
    }

    #[instrument(skip(self, config))]
    pub async fn aggregate(
        &self,
        config: &CatalogueConfig,
        limit: usize,
        window_days: u32,
    ) -> AggregateResult {
        let per_source_timeout = Duration::from_secs(config.source_timeout_secs.max(1));
        let mut entries: Vec<TrendingGameData> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut tallies: IndexMap<String, SourceTally> = IndexMap::new();
        let mut total_requested = 0usize;

        for (key, source_cfg) in &config.sources {
            if !source_cfg.enabled {
                debug!(source = %key, "source disabled by config");
                tallies.insert(key.clone(), SourceTally::with_status(SourceStatus::Disabled));
                continue;
            }
            let Some(source) = self.sources.get(key) else {
                debug!(source = %key, "no source registered");
                tallies.insert(key.clone(), SourceTally::with_status(SourceStatus::Missing));
                continue;
            };
            if !source.enabled() {
                info!(source = %key, "source not configured; skipping");
                tallies.insert(key.clone(), SourceTally::with_status(SourceStatus::Disabled));
                continue;
            }

            let remaining = limit.saturating_sub(entries.len());
            let take = match (remaining, source_cfg.limit) {
                (0, _) if !source_cfg.always_fetch => 0,
                (0, Some(cap)) => cap,
                (0, None) => limit,
                (need, Some(cap)) => cap.min(need),
                (need, None) => need,
            };
            if take == 0 {
                tallies.insert(key.clone(), SourceTally::with_status(SourceStatus::Skipped));
                continue;
            }
            total_requested += take;

            let options = SourceOptions::from_config(source_cfg, take, window_days);
            let fetched = match timeout(per_source_timeout, source.fetch(&options)).await {
                Ok(Ok(items)) => Ok(items),
                Ok(Err(ProviderError::RateLimited {
                    retry_after_secs, ..
                })) => Err(SourceStatus::RateLimited { retry_after_secs }),
                Ok(Err(e)) => Err(SourceStatus::Failed(e.to_string())),
                Err(_) => Err(SourceStatus::Failed(format!(
                    "timed out after {}s",
                    per_source_timeout.as_secs()
                ))),
            };

            let tally = match fetched {
                Ok(items) => {
                    let mut count = 0;
                    for entry in items.into_iter().take(take) {
                        let dedupe_key = dedupe_slug(entry.slug.as_deref(), &entry.name);
                        if dedupe_key.is_empty() || !seen.insert(dedupe_key) {
                            continue;
                        }
                        entries.push(entry);
                        count += 1;
                    }
                    debug!(source = %key, requested = take, count, "source merged");
                    SourceTally {
                        count,
                        requested: take,
                        status: SourceStatus::Fetched,
                    }
                }
                Err(status) => {
                    warn!(source = %key, ?status, "trending source failed; continuing");
                    SourceTally {
                        count: 0,
                        requested: take,
                        status,
                    }
                }
            };
            tallies.insert(key.clone(), tally);
        }

        entries.truncate(limit);
        info!(
            entries = entries.len(),
            total_requested,
            "catalogue aggregation finished"
        );
        AggregateResult {
            entries,
            sources: tallies,
            total_requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        key: &'static str,
        names: Vec<String>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(key: &'static str, names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                key,
                names: names.iter().map(|s| s.to_string()).collect(),
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(key: &'static str) -> Arc<Self> {
            Arc::new(Self {
                key,
                names: vec![],
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn numbered(key: &'static str, n: usize) -> Arc<Self> {
            let names: Vec<String> = (0..n).map(|i| format!("{key} game {i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            Self::new(key, &refs)
        }
    }

    #[async_trait]
    impl TrendingSource for FakeSource {
        fn key(&self) -> &str {
            self.key
        }

        async fn fetch(&self, options: &SourceOptions) -> Result<Vec<TrendingGameData>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::unavailable(self.key, "HTTP 503"));
            }
            Ok(self
                .names
                .iter()
                .take(options.limit)
                .map(|n| TrendingGameData::new(self.key, self.key, n.clone(), n.clone()))
                .collect())
        }
    }

    #[tokio::test]
    async fn quotas_are_respected() {
        let a = FakeSource::numbered("a", 20);
        let b = FakeSource::numbered("b", 20);
        let agg = CatalogueAggregator::new().with_source(a).with_source(b);
        let config = CatalogueConfig::from_sources([
            SourceConfig::new("a").with_limit(5),
            SourceConfig::new("b"),
        ]);
        let result = agg.aggregate(&config, 8, 30).await;
        assert_eq!(result.entries.len(), 8);
        assert_eq!(result.sources["a"].count, 5);
        assert_eq!(result.sources["a"].requested, 5);
        assert_eq!(result.sources["b"].requested, 3);
        assert_eq!(result.total_requested, 8);
        assert_eq!(result.entries.iter().filter(|e| e.source() == "a").count(), 5);
    }

    #[tokio::test]
    async fn dedupe_keeps_first_source() {
        let a = FakeSource::new("a", &["Halo: Infinite"]);
        let b = FakeSource::new("b", &["halo infinite", "Forza"]);
        let agg = CatalogueAggregator::new().with_source(a).with_source(b);
        let config = CatalogueConfig::from_sources([SourceConfig::new("a"), SourceConfig::new("b")]);
        let result = agg.aggregate(&config, 10, 30).await;
        let names: Vec<_> = result.entries.iter().map(|e| (e.source(), e.name.as_str())).collect();
        assert_eq!(names, vec![("a", "Halo: Infinite"), ("b", "Forza")]);
        assert_eq!(result.sources["b"].count, 1);
    }

    #[tokio::test]
    async fn failing_source_is_isolated() {
        let broken = FakeSource::failing("broken");
        let ok = FakeSource::numbered("ok", 3);
        let agg = CatalogueAggregator::new().with_source(broken).with_source(ok);
        let config = CatalogueConfig::from_sources([SourceConfig::new("broken"), SourceConfig::new("ok")]);
        let result = agg.aggregate(&config, 3, 30).await;
        assert_eq!(result.entries.len(), 3);
        assert!(matches!(result.sources["broken"].status, SourceStatus::Failed(_)));
        assert_eq!(result.sources["ok"].count, 3);
    }

    struct Throttled;

    #[async_trait]
    impl TrendingSource for Throttled {
        fn key(&self) -> &str {
            "throttled"
        }

        async fn fetch(
            &self,
            _options: &SourceOptions,
        ) -> Result<Vec<TrendingGameData>, ProviderError> {
            Err(ProviderError::RateLimited {
                provider: "throttled".into(),
                retry_after_secs: 2.5,
            })
        }
    }

    #[tokio::test]
    async fn empty_bucket_is_reported_with_its_wait() {
        let ok = FakeSource::numbered("ok", 2);
        let agg = CatalogueAggregator::new().with_source(Arc::new(Throttled)).with_source(ok);
        let config = CatalogueConfig::from_sources([
            SourceConfig::new("throttled"),
            SourceConfig::new("ok"),
        ]);
        let result = agg.aggregate(&config, 5, 30).await;
        assert_eq!(
            result.sources["throttled"].status,
            SourceStatus::RateLimited { retry_after_secs: 2.5 }
        );
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.rate_limited(), Some(Duration::from_millis(2500)));

        let calm = CatalogueAggregator::new().with_source(FakeSource::numbered("ok", 2));
        let result = calm
            .aggregate(&CatalogueConfig::from_sources([SourceConfig::new("ok")]), 5, 30)
            .await;
        assert_eq!(result.rate_limited(), None);
    }

    #[tokio::test]
    async fn satisfied_limit_skips_unless_always_fetch() {
        let first = FakeSource::numbered("first", 5);
        let lazy = FakeSource::numbered("lazy", 5);
        let eager = FakeSource::numbered("eager", 5);
        let agg = CatalogueAggregator::new()
            .with_source(first.clone())
            .with_source(lazy.clone())
            .with_source(eager.clone());
        let config = CatalogueConfig::from_sources([
            SourceConfig::new("first"),
            SourceConfig::new("lazy"),
            SourceConfig::new("eager").with_limit(2).always(),
            SourceConfig::new("unknown"),
            SourceConfig::new("off").disabled(),
        ]);
        let result = agg.aggregate(&config, 5, 30).await;
        assert_eq!(result.entries.len(), 5);
        assert_eq!(lazy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(eager.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.sources["lazy"].status, SourceStatus::Skipped);
        assert_eq!(result.sources["eager"].requested, 2);
        assert_eq!(result.sources["unknown"].status, SourceStatus::Missing);
        assert_eq!(result.sources["off"].status, SourceStatus::Disabled);
        assert_eq!(result.total_requested, 7);
    }

    #[test]
    fn standard_sources_follow_registry() {
        use crate::database_ops::memory::MemoryStore;
        let agg = CatalogueAggregator::from_registry(
            &ProviderRegistry::new(),
            Arc::new(MemoryStore::default()),
        );
        assert!(agg.has_source("tgdb_mirror"));
        assert!(!agg.has_source("rawg"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        struct Slow;
        #[async_trait]
        impl TrendingSource for Slow {
            fn key(&self) -> &str {
                "slow"
            }
            async fn fetch(&self, _: &SourceOptions) -> Result<Vec<TrendingGameData>, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(vec![])
            }
        }
        let agg = CatalogueAggregator::new()
            .with_source(Arc::new(Slow))
            .with_source(FakeSource::numbered("fast", 2));
        let mut config = CatalogueConfig::from_sources([SourceConfig::new("slow"), SourceConfig::new("fast")]);
        config.source_timeout_secs = 5;
        let result = agg.aggregate(&config, 2, 30).await;
        assert_eq!(result.entries.len(), 2);
        assert!(matches!(result.sources["slow"].status, SourceStatus::Failed(_)));
    }
}
