use std::time::Duration;

use rand::Rng;

use crate::config::JobConfig;

const FALLBACK_BACKOFF: Duration = Duration::from_secs(30);

/// Attempt budget and delay schedule for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub tries: u32,
    pub backoff: Vec<Duration>,
    pub jitter: Duration,
    /// Measured from first dispatch; bounds retries and rate-limit releases alike.
    pub retry_until: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&JobConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &JobConfig) -> Self {
        Self {
            tries: cfg.tries.max(1),
            backoff: cfg.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            jitter: Duration::from_secs(cfg.jitter_secs),
            retry_until: Duration::from_secs(cfg.retry_until_mins.saturating_mul(60)),
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    /// Scheduled delay after failed attempt number `attempt` (1-based). The
    /// last step repeats once the schedule runs out.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(FALLBACK_BACKOFF)
    }

    /// `base_delay` shifted by `offset_secs`, never below one second.
    pub fn delay_with_offset(&self, attempt: u32, offset_secs: i64) -> Duration {
        let base = self.base_delay(attempt).as_secs() as i64;
        Duration::from_secs((base + offset_secs).max(1) as u64)
    }

    /// Jittered delay: `base ± random(jitter)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = self.jitter.as_secs() as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        self.delay_with_offset(attempt, offset)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.tries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_follows_config_and_repeats_last_step() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.tries, 5);
        assert_eq!(policy.base_delay(1), Duration::from_secs(30));
        assert_eq!(policy.base_delay(3), Duration::from_secs(120));
        assert_eq!(policy.base_delay(5), Duration::from_secs(480));
        assert_eq!(policy.base_delay(9), Duration::from_secs(480));
        assert_eq!(policy.retry_until, Duration::from_secs(360 * 60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let base = policy.base_delay(attempt).as_secs();
            for _ in 0..50 {
                let d = policy.backoff(attempt).as_secs();
                assert!(d + 15 >= base && d <= base + 15, "{d} vs {base}");
            }
        }
        assert_eq!(policy.delay_with_offset(1, -100), Duration::from_secs(1));
    }

    #[test]
    fn exhaustion_counts_attempts() {
        let policy = RetryPolicy::default().with_tries(2);
        assert!(!policy.exhausted(1));
        assert!(policy.exhausted(2));
        assert!(RetryPolicy::default().with_tries(0).exhausted(1));
    }
}
