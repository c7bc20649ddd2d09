//! Error taxonomy shared by provider clients, stores and jobs.

use std::time::Duration;

/// Failures raised by provider clients.
///
/// Trending importers and enrichment treat the soft variants as "no data this
/// pass"; bulk mirror syncs and price ingestion convert them with
/// [`ProviderError::into_sync_failure`] so job-level retry engages.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} unavailable: {reason}")]
    SourceUnavailable { provider: String, reason: String },

    #[error("{provider} sync failed: {reason}")]
    SyncFailed { provider: String, reason: String },

    #[error("{provider} rate limited; retry after {retry_after_secs:.2}s")]
    RateLimited {
        provider: String,
        retry_after_secs: f64,
    },

    #[error("{provider} returned an unusable payload: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("{provider} is disabled or missing credentials")]
    Disabled { provider: String },
}

impl ProviderError {
    pub fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(provider: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::SourceUnavailable { provider, .. }
            | Self::SyncFailed { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Malformed { provider, .. }
            | Self::Disabled { provider } => provider,
        }
    }

    /// Soft errors never abort an aggregation pass.
    pub fn is_soft(&self) -> bool {
        !matches!(self, Self::SyncFailed { .. })
    }

    /// Promote soft failures to `SyncFailed`. Rate-limit denials are kept as-is
    /// because they reschedule rather than fail.
    pub fn into_sync_failure(self) -> Self {
        match self {
            Self::SourceUnavailable { provider, reason } | Self::Malformed { provider, reason } => {
                Self::SyncFailed { provider, reason }
            }
            Self::Disabled { provider } => Self::SyncFailed {
                reason: "provider disabled".to_string(),
                provider,
            },
            other => other,
        }
    }
}

/// Persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflicting write: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// Job execution failures.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Not a failure: the job gives its slot back and asks to run again later.
    #[error("rate limit denied for {provider}; retry in {delay:?}")]
    RateLimited { provider: String, delay: Duration },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Retrying cannot help (missing product, invalid context).
    #[error("terminal: {0}")]
    Terminal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::Terminal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal(_))
    }

    /// Lift provider rate-limit denials into the release signal.
    pub fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited {
                provider,
                retry_after_secs,
            } => Self::RateLimited {
                provider,
                delay: Duration::from_secs_f64(retry_after_secs.max(0.0)),
            },
            other => Self::Provider(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_failure_promotion_keeps_rate_limits() {
        let soft = ProviderError::unavailable("tgdb", "timeout");
        assert!(soft.is_soft());
        let hard = soft.into_sync_failure();
        assert!(matches!(hard, ProviderError::SyncFailed { ref provider, .. } if provider == "tgdb"));
        assert!(!hard.is_soft());

        let limited = ProviderError::RateLimited {
            provider: "tgdb".into(),
            retry_after_secs: 2.5,
        };
        assert!(matches!(
            limited.into_sync_failure(),
            ProviderError::RateLimited { .. }
        ));
    }

    #[test]
    fn provider_rate_limit_becomes_release_signal() {
        let err = JobError::from_provider(ProviderError::RateLimited {
            provider: "rawg".into(),
            retry_after_secs: 1.5,
        });
        match err {
            JobError::RateLimited { provider, delay } => {
                assert_eq!(provider, "rawg");
                assert_eq!(delay, Duration::from_millis(1500));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!JobError::terminal("missing product").is_retryable());
    }
}
