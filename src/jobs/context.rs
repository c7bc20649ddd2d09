use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::queue::JobQueue;
use super::verify::{HttpLinkProber, LinkProber};
use super::Job;
use crate::catalogue::CatalogueAggregator;
use crate::config::{ConfigProvider, IngestConfig};
use crate::database_ops::memory::MemoryStore;
use crate::database_ops::models::Product;
use crate::database_ops::postgres::PgStore;
use crate::database_ops::provider_client::{ProductRef, ProviderFactory, ProviderRegistry};
use crate::database_ops::repository::{CatalogueStore, MirrorRepository, SnapshotRepository};
use crate::error::JobError;
use crate::identity::IdentityResolver;
use crate::rate_limit::RateLimiter;

/// Long-lived collaborators shared by every job run.
#[derive(Clone)]
pub struct Services {
    pub catalogue: Arc<dyn CatalogueStore>,
    pub mirror: Arc<dyn MirrorRepository>,
    pub snapshots: Arc<dyn SnapshotRepository>,
    pub limiter: RateLimiter,
    pub config: Arc<dyn ConfigProvider>,
    pub providers: Arc<dyn ProviderFactory>,
    pub prober: Arc<dyn LinkProber>,
}

impl Services {
    /// Every store backed by one [`MemoryStore`].
    pub fn in_memory(
        store: MemoryStore,
        config: Arc<dyn ConfigProvider>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            catalogue: store.clone(),
            mirror: store.clone(),
            snapshots: store,
            limiter: RateLimiter::in_memory(),
            config,
            providers,
            prober: Arc::new(HttpLinkProber::new()),
        }
    }

    /// Every store, and the rate-limit buckets, in Postgres.
    pub fn postgres(
        store: PgStore,
        config: Arc<dyn ConfigProvider>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            catalogue: store.clone(),
            mirror: store.clone(),
            snapshots: store.clone(),
            limiter: RateLimiter::new(store),
            config,
            providers,
            prober: Arc::new(HttpLinkProber::new()),
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn LinkProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Fresh config and provider clients for one invocation.
    pub fn context(&self, queue: &JobQueue) -> JobContext {
        let config = self.config.load();
        let registry = self.providers.build(&config, &self.limiter);
        JobContext {
            services: self.clone(),
            config,
            registry,
            queue: queue.clone(),
            resolver: IdentityResolver::new(),
        }
    }
}

/// What a running job sees. Built per invocation; never shared across runs.
pub struct JobContext {
    pub services: Services,
    pub config: IngestConfig,
    pub registry: ProviderRegistry,
    pub resolver: IdentityResolver,
    queue: JobQueue,
}

impl JobContext {
    pub fn catalogue(&self) -> &dyn CatalogueStore {
        self.services.catalogue.as_ref()
    }

    pub fn mirror(&self) -> &dyn MirrorRepository {
        self.services.mirror.as_ref()
    }

    pub fn snapshots(&self) -> &dyn SnapshotRepository {
        self.services.snapshots.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Enqueue a follow-up job; false when an identical one is pending.
    pub fn dispatch(&self, job: impl Job + 'static) -> bool {
        self.queue.dispatch(Arc::new(job))
    }

    pub fn aggregator(&self) -> CatalogueAggregator {
        CatalogueAggregator::from_registry(&self.registry, self.services.mirror.clone())
    }

    /// A missing product cannot be fixed by retrying.
    pub async fn product(&self, id: i64) -> Result<Product, JobError> {
        self.catalogue()
            .product(id)
            .await?
            .ok_or_else(|| JobError::terminal(format!("product {id} not found")))
    }
}

pub fn product_ref(product: &Product) -> ProductRef {
    ProductRef {
        id: product.id,
        name: product.name.clone(),
        slug: product.slug.clone(),
        platform: product.platform.clone(),
        external_ids: product.external_ids.clone(),
    }
}
