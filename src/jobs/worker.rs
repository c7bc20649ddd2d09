use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use super::context::Services;
use super::queue::{JobQueue, JobState, QueuedJob};
use super::retry::RetryPolicy;
use super::JobOutcome;
use crate::error::JobError;

/// How one execution was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Succeeded,
    /// Failed, re-queued with backoff.
    Retrying,
    /// Gave its slot back (rate limit); attempt not counted.
    Released,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub retried: usize,
    pub released: usize,
    pub failed: usize,
}

impl DrainReport {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Succeeded => self.succeeded += 1,
            Settlement::Retrying => self.retried += 1,
            Settlement::Released => self.released += 1,
            Settlement::Failed => self.failed += 1,
        }
    }
}

/// Pulls jobs from named queues and runs up to `concurrency` at once.
#[derive(Clone)]
pub struct WorkerPool {
    services: Services,
    queue: JobQueue,
    concurrency: usize,
    queues: Vec<String>,
    poll: Duration,
}

impl WorkerPool {
    pub fn new(services: Services, queue: JobQueue) -> Self {
        let worker = services.config.load().worker;
        Self {
            services,
            queue,
            concurrency: worker.concurrency.max(1),
            queues: worker.queues,
            poll: Duration::from_millis(worker.poll_ms.max(10)),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run one taken job and settle it back into the queue.
    pub async fn execute(&self, mut queued: QueuedJob) -> Settlement {
        let ctx = self.services.context(&self.queue);
        let policy = queued.job.retry_policy(RetryPolicy::from_config(&ctx.config.jobs));
        let deadline = queued.enqueued_at + policy.retry_until;
        let span = info_span!(
            "job",
            job = queued.job.name(),
            idempotency_key = %queued.key,
            attempt = queued.attempts + 1
        );

        let result = match queued.job.run(&ctx).instrument(span).await {
            Err(JobError::RateLimited { provider, delay }) => Ok(JobOutcome::Release {
                delay,
                reason: format!("rate limited by {provider}"),
            }),
            other => other,
        };

        match result {
            Ok(JobOutcome::Completed(report)) => {
                info!(job = queued.job.name(), idempotency_key = %queued.key, "job succeeded");
                self.queue.finish(&queued, JobState::Succeeded, report);
                Settlement::Succeeded
            }
            Ok(JobOutcome::Release { delay, reason }) => {
                if Instant::now() + delay > deadline {
                    error!(
                        job = queued.job.name(),
                        idempotency_key = %queued.key,
                        releases = queued.releases,
                        %reason,
                        "job released past its retry deadline; abandoning"
                    );
                    self.queue.finish(
                        &queued,
                        JobState::Failed,
                        json!({ "error": "retry_until passed", "reason": reason }),
                    );
                    return Settlement::Failed;
                }
                queued.releases += 1;
                info!(
                    job = queued.job.name(),
                    idempotency_key = %queued.key,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "job released"
                );
                self.queue.requeue(queued, delay);
                Settlement::Released
            }
            Err(err) => {
                queued.attempts += 1;
                let give_up = if !err.is_retryable() {
                    Some("terminal error")
                } else if policy.exhausted(queued.attempts) {
                    Some("tries exhausted")
                } else {
                    None
                };
                let delay = policy.backoff(queued.attempts);
                let give_up = give_up.or_else(|| {
                    (Instant::now() + delay > deadline).then_some("retry_until passed")
                });
                if let Some(why) = give_up {
                    error!(
                        job = queued.job.name(),
                        idempotency_key = %queued.key,
                        attempts = queued.attempts,
                        error = %err,
                        why,
                        "job failed"
                    );
                    self.queue.finish(
                        &queued,
                        JobState::Failed,
                        json!({ "error": err.to_string(), "why": why }),
                    );
                    return Settlement::Failed;
                }
                warn!(
                    job = queued.job.name(),
                    idempotency_key = %queued.key,
                    attempts = queued.attempts,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "job failed; retrying"
                );
                self.queue.requeue(queued, delay);
                Settlement::Retrying
            }
        }
    }

    /// Run until nothing is queued, sleeping through backoff delays. For
    /// one-shot CLI runs and tests.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let mut batch = Vec::new();
            while batch.len() < self.concurrency {
                match self.queue.take_ready(&self.queues) {
                    Some(job) => batch.push(job),
                    None => break,
                }
            }
            if batch.is_empty() {
                match self.queue.next_ready_at(&self.queues) {
                    Some(at) => {
                        sleep_until(at).await;
                        continue;
                    }
                    None => break,
                }
            }
            for settlement in join_all(batch.into_iter().map(|job| self.execute(job))).await {
                report.record(settlement);
            }
        }
        info!(?report, "queue drained");
        report
    }

    /// Long-running worker loop; returns after `shutdown` resolves and
    /// in-flight jobs finish.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Settlement> = JoinSet::new();
        tokio::pin!(shutdown);
        info!(concurrency = self.concurrency, queues = ?self.queues, "worker pool started");

        loop {
            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match self.queue.take_ready(&self.queues) {
                Some(job) => {
                    let pool = self.clone();
                    tasks.spawn(async move {
                        let settlement = pool.execute(job).await;
                        drop(permit);
                        settlement
                    });
                }
                None => {
                    drop(permit);
                    let wait = self
                        .queue
                        .next_ready_at(&self.queues)
                        .map(|at| at.saturating_duration_since(Instant::now()))
                        .map_or(self.poll, |d| d.min(self.poll));
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = sleep(wait) => {}
                        _ = self.queue.notified() => {}
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "worker pool stopping");
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "job task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::config::{IngestConfig, JobConfig};
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::provider_client::ProviderRegistry;
    use crate::jobs::testing::services;
    use crate::jobs::{Job, JobContext};

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fail,
        Terminal,
        Release(u64),
        Limited(u64),
    }

    /// Plays its steps in order, then completes.
    #[derive(Debug)]
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
    }

    impl Scripted {
        fn new(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl Job for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn queue(&self) -> &'static str {
            "fetch"
        }
        fn idempotency_key(&self) -> String {
            "scripted".into()
        }
        async fn run(&self, _: &JobContext) -> Result<JobOutcome, JobError> {
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                None => Ok(JobOutcome::Completed(json!({ "done": true }))),
                Some(Step::Fail) => Err(JobError::Other(anyhow::anyhow!("upstream hiccup"))),
                Some(Step::Terminal) => Err(JobError::terminal("bad input")),
                Some(Step::Release(secs)) => Ok(JobOutcome::Release {
                    delay: Duration::from_secs(secs),
                    reason: "waiting".into(),
                }),
                Some(Step::Limited(secs)) => Err(JobError::RateLimited {
                    provider: "rawg".into(),
                    delay: Duration::from_secs(secs),
                }),
            }
        }
    }

    fn pool(tries: u32, retry_until_mins: u64, job: Arc<Scripted>) -> WorkerPool {
        let mut cfg = IngestConfig::default();
        cfg.jobs = JobConfig {
            tries,
            backoff_secs: vec![30, 60],
            jitter_secs: 0,
            retry_until_mins,
        };
        let queue = JobQueue::new();
        assert!(queue.dispatch(job as Arc<dyn Job>));
        WorkerPool::new(services(&MemoryStore::default(), ProviderRegistry::new(), cfg), queue)
    }

    fn only_record(pool: &WorkerPool) -> (u32, u32, Value, bool) {
        let history = pool.queue().history();
        assert_eq!(history.len(), 1);
        let rec = &history[0];
        let ok = matches!(rec.state, JobState::Succeeded);
        (rec.attempts, rec.releases, rec.detail.clone(), ok)
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_back_off_and_count_tries() {
        let pool = pool(5, 60, Scripted::new(&[Step::Fail, Step::Fail]));
        let start = Instant::now();
        let report = pool.drain().await;

        assert_eq!(
            report,
            DrainReport {
                succeeded: 1,
                retried: 2,
                released: 0,
                failed: 0
            }
        );
        // 30s then 60s from the schedule
        assert!(start.elapsed() >= Duration::from_secs(90));
        let (attempts, releases, detail, ok) = only_record(&pool);
        assert!(ok);
        assert_eq!((attempts, releases), (2, 0));
        assert_eq!(detail["done"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn last_try_fails_the_job() {
        let pool = pool(2, 60, Scripted::new(&[Step::Fail, Step::Fail, Step::Fail]));
        let report = pool.drain().await;

        assert_eq!((report.retried, report.failed, report.succeeded), (1, 1, 0));
        let (attempts, _, detail, ok) = only_record(&pool);
        assert!(!ok);
        assert_eq!(attempts, 2);
        assert_eq!(detail["why"], "tries exhausted");
        assert_eq!(pool.queue().failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_skip_remaining_tries() {
        let pool = pool(5, 60, Scripted::new(&[Step::Terminal]));
        let report = pool.drain().await;

        assert_eq!((report.retried, report.failed), (0, 1));
        let (attempts, _, detail, _) = only_record(&pool);
        assert_eq!(attempts, 1);
        assert_eq!(detail["why"], "terminal error");
    }

    #[tokio::test(start_paused = true)]
    async fn releases_do_not_spend_tries() {
        let steps = [
            Step::Release(10),
            Step::Release(10),
            Step::Limited(5),
            Step::Fail,
            Step::Fail,
        ];
        let pool = pool(2, 60, Scripted::new(&steps));
        let report = pool.drain().await;

        assert_eq!(
            report,
            DrainReport {
                succeeded: 0,
                retried: 1,
                released: 3,
                failed: 1
            }
        );
        let (attempts, releases, detail, _) = only_record(&pool);
        assert_eq!((attempts, releases), (2, 3));
        assert_eq!(detail["why"], "tries exhausted");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_error_is_released_then_completes() {
        let pool = pool(1, 60, Scripted::new(&[Step::Limited(5)]));
        let report = pool.drain().await;

        assert_eq!((report.released, report.succeeded, report.failed), (1, 1, 0));
        let (attempts, releases, _, ok) = only_record(&pool);
        assert!(ok);
        assert_eq!((attempts, releases), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn release_past_the_deadline_fails() {
        let pool = pool(5, 1, Scripted::new(&[Step::Release(120)]));
        let report = pool.drain().await;

        assert_eq!((report.released, report.failed), (0, 1));
        let (attempts, releases, detail, ok) = only_record(&pool);
        assert!(!ok);
        assert_eq!((attempts, releases), (0, 0));
        assert_eq!(detail["error"], "retry_until passed");
        assert_eq!(detail["reason"], "waiting");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_the_deadline_fails() {
        // 30s fits in the minute, the 60s that follows does not
        let pool = pool(5, 1, Scripted::new(&[Step::Fail, Step::Fail]));
        let report = pool.drain().await;

        assert_eq!((report.retried, report.failed), (1, 1));
        let (attempts, _, detail, _) = only_record(&pool);
        assert_eq!(attempts, 2);
        assert_eq!(detail["why"], "retry_until passed");
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_settles_retries_before_shutdown() {
        let pool = pool(3, 60, Scripted::new(&[Step::Fail]));
        pool.run_until(sleep(Duration::from_secs(120))).await;

        let (attempts, _, _, ok) = only_record(&pool);
        assert!(ok);
        assert_eq!(attempts, 1);
        assert_eq!(pool.queue().pending(), 0);
    }
}
