//! Daily renewal runs.
//!
//! Once a day at [`SchedulerConfig::start_time`] the scheduler asks its [`JobSource`] for due
//! certificates and spreads their renewals evenly over [`SchedulerConfig::max_duration`], so a
//! large batch does not hit the CA's rate limits all at once.

use std::sync::Arc;

use async_trait::async_trait;
use time::{OffsetDateTime, Time, UtcOffset};
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SchedulerConfig,
    engine::{Engine, UpdateRequest},
    store::RenewalJob,
    Result,
};

/// Supplies and executes renewal jobs.
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    async fn due_jobs(&self) -> Result<Vec<RenewalJob>>;

    async fn run_job(&self, job: RenewalJob, cancel: CancellationToken) -> Result<()>;
}

/// Outcome counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Scheduler<S> {
    config: SchedulerConfig,
    source: Arc<S>,
}

impl<S: JobSource> Scheduler<S> {
    pub fn new(config: SchedulerConfig, source: Arc<S>) -> Self {
        Self { config, source }
    }

    /// Runs every day at the configured start time until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let start_time = self.config.start_time()?;

        loop {
            let wait = until_next_start(OffsetDateTime::now_utc(), start_time);
            log::info!("next renewal run in {}s", wait.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    log::info!("renewal scheduler stopped");
                    return Ok(());
                }
            }

            let summary = self.run_once(cancel).await;
            log::info!(
                "renewal run finished: {} started, {} succeeded, {} failed",
                summary.started,
                summary.succeeded,
                summary.failed
            );
        }
    }

    /// Fetches due jobs and runs them, job `i` starting `i * max_duration / n` after the first.
    ///
    /// A failing job does not affect the others. Cancellation stops launching further jobs;
    /// those already running receive the token and wind down themselves.
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();

        let jobs = match self.source.due_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                // skipped until tomorrow
                log::error!("failed to list certificates due for renewal: {err}");
                return summary;
            }
        };

        if jobs.is_empty() {
            log::info!("no certificates due for renewal");
            return summary;
        }

        let count = u32::try_from(jobs.len()).unwrap_or(u32::MAX);
        let interval = self.config.max_duration / count;
        log::info!("renewing {count} certificates, one every {interval:?}");

        let start = Instant::now();
        let mut tasks = JoinSet::new();

        for (i, job) in jobs.into_iter().enumerate() {
            let launch_at = start + interval * u32::try_from(i).unwrap_or(u32::MAX);

            tokio::select! {
                _ = tokio::time::sleep_until(launch_at) => {}
                _ = cancel.cancelled() => {
                    log::info!("renewal run cancelled after {} jobs", summary.started);
                    break;
                }
            }

            let source = Arc::clone(&self.source);
            let cancel = cancel.clone();

            log::debug!("starting renewal of {}", job.key_name);
            summary.started += 1;

            tasks.spawn(async move {
                let key_name = job.key_name.clone();
                (key_name, source.run_job(job, cancel).await)
            });
        }

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok((_, Ok(()))) => summary.succeeded += 1,

                Ok((key_name, Err(err))) => {
                    log::warn!("renewal of {key_name} failed: {err}");
                    summary.failed += 1;
                }

                Err(err) => {
                    log::error!("renewal task failed: {err}");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

/// Time from `now` until the next occurrence of `start` (UTC). A run due right now is scheduled
/// for tomorrow.
pub fn until_next_start(now: OffsetDateTime, start: Time) -> std::time::Duration {
    let now = now.to_offset(UtcOffset::UTC);

    let mut next = now.replace_time(start);
    if next <= now {
        next += time::Duration::days(1);
    }

    std::time::Duration::try_from(next - now).unwrap_or_default()
}

/// Renews the due certificates of an [`Engine`].
pub struct RenewalJobs {
    engine: Arc<Engine>,
    lookahead: time::Duration,
    limit: usize,
}

impl RenewalJobs {
    pub fn new(engine: Arc<Engine>, config: &SchedulerConfig) -> Self {
        Self {
            engine,
            lookahead: config.lookahead(),
            limit: config.limit_per_day,
        }
    }
}

#[async_trait]
impl JobSource for RenewalJobs {
    async fn due_jobs(&self) -> Result<Vec<RenewalJob>> {
        self.engine.due_for_renewal(self.lookahead, self.limit).await
    }

    async fn run_job(&self, job: RenewalJob, cancel: CancellationToken) -> Result<()> {
        match self
            .engine
            .trigger_update(UpdateRequest::renew(&job.key_name), &cancel)
            .await
        {
            Ok(outcome) => {
                log::info!(
                    "renewed {}, next renewal at {}",
                    job.key_name,
                    outcome.record.next_renewal_time
                );
                Ok(())
            }

            // renewed in the meantime, or its date was moved
            Err(err) if err.is_no_renewal_due() => {
                log::debug!("{} no longer due: {err}", job.key_name);
                Ok(())
            }

            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use time::macros::datetime;

    use super::*;
    use crate::{
        challenge::RootZones,
        client::AcmeClient,
        config::EngineConfig,
        key::KeyAlgorithm,
        store::{IssuedBy, MemoryStore},
        test::{init_logger, FakeAcmeClient, FakeDns},
        Error,
    };

    #[derive(Default)]
    struct FakeSource {
        jobs: Vec<&'static str>,
        fail_listing: bool,
        cancel_on_listing: Option<CancellationToken>,
        listings: Mutex<usize>,
        started: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl JobSource for FakeSource {
        async fn due_jobs(&self) -> Result<Vec<RenewalJob>> {
            *self.listings.lock() += 1;

            if let Some(cancel) = &self.cancel_on_listing {
                cancel.cancel();
            }

            if self.fail_listing {
                return Err(Error::external("list", eyre::eyre!("database down")));
            }

            Ok(self
                .jobs
                .iter()
                .map(|key_name| RenewalJob {
                    key_name: (*key_name).to_owned(),
                    next_renewal_time: OffsetDateTime::UNIX_EPOCH,
                })
                .collect())
        }

        async fn run_job(&self, job: RenewalJob, _cancel: CancellationToken) -> Result<()> {
            self.started
                .lock()
                .push((job.key_name.clone(), Instant::now()));

            if job.key_name.starts_with("bad") {
                return Err(Error::not_found("certificate", job.key_name));
            }

            Ok(())
        }
    }

    fn scheduler(source: FakeSource) -> Scheduler<FakeSource> {
        Scheduler::new(
            SchedulerConfig {
                max_duration: Duration::from_secs(4 * 3600),
                ..Default::default()
            },
            Arc::new(source),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_are_spaced_evenly() {
        let scheduler = scheduler(FakeSource {
            jobs: vec!["a", "b", "bad-c", "d"],
            ..Default::default()
        });

        let start = Instant::now();
        let summary = scheduler.run_once(&CancellationToken::new()).await;

        assert_eq!(
            summary,
            RunSummary {
                started: 4,
                succeeded: 3,
                failed: 1
            }
        );

        let started = scheduler.source.started.lock().clone();
        let offsets = started
            .iter()
            .map(|(key_name, at)| (key_name.as_str(), (*at - start).as_secs()))
            .collect::<Vec<_>>();
        assert_eq!(
            offsets,
            [("a", 0), ("b", 3600), ("bad-c", 7200), ("d", 10800)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failure_skips_run() {
        let scheduler = scheduler(FakeSource {
            jobs: vec!["a"],
            fail_listing: true,
            ..Default::default()
        });

        let summary = scheduler.run_once(&CancellationToken::new()).await;
        assert_eq!(summary, RunSummary::default());
        assert!(scheduler.source.started.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_launching() {
        let scheduler = scheduler(FakeSource {
            jobs: vec!["a", "b", "c", "d"],
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let run = scheduler.run_once(&cancel);
        let stop = async {
            tokio::time::sleep(Duration::from_secs(90 * 60)).await;
            cancel.cancel();
        };

        let (summary, ()) = tokio::join!(run, stop);
        assert_eq!(summary.started, 2);
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_exits_on_cancel() {
        let cancel = CancellationToken::new();
        let scheduler = scheduler(FakeSource {
            cancel_on_listing: Some(cancel.clone()),
            ..Default::default()
        });

        scheduler.run(&cancel).await.unwrap();
        assert_eq!(*scheduler.source.listings.lock(), 1);
    }

    #[tokio::test]
    async fn invalid_start_time_is_rejected() {
        let scheduler = Scheduler::new(
            SchedulerConfig {
                start_time: "noon".to_owned(),
                ..Default::default()
            },
            Arc::new(FakeSource::default()),
        );

        let err = scheduler.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn next_start() {
        let three = Time::from_hms(3, 0, 0).unwrap();

        assert_eq!(
            until_next_start(datetime!(2024-05-01 01:30 UTC), three),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(
            until_next_start(datetime!(2024-05-01 03:00 UTC), three),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            until_next_start(datetime!(2024-05-01 23:00 UTC), three),
            Duration::from_secs(4 * 3600)
        );
        // 03:00 UTC is 05:00 in UTC+2
        assert_eq!(
            until_next_start(datetime!(2024-05-01 04:00 +2), three),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn engine_jobs_renew_due_certificates() {
        init_logger();

        let store = MemoryStore::new();
        let client = Arc::new(FakeAcmeClient::new());
        let dns = FakeDns::default();
        let zones =
            RootZones::new().with_zone("example.com", Arc::new(dns.provider("fake")), Vec::new());

        let engine = Arc::new(Engine::new(
            EngineConfig {
                key_algorithm: KeyAlgorithm::EcdsaP256,
                ..Default::default()
            },
            Arc::clone(&client) as Arc<dyn AcmeClient>,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(zones),
            Arc::new(dns.resolver()),
        ));
        let cancel = CancellationToken::new();
        let issued_by = IssuedBy::new("Alice", "alice@example.com");

        // short-lived, so inside its renewal window right away
        engine
            .trigger_update(
                UpdateRequest::new("short", "alice", ["short.example.com"], issued_by.clone())
                    .with_ttl(time::Duration::days(7)),
                &cancel,
            )
            .await
            .unwrap();
        engine
            .trigger_update(
                UpdateRequest::new("long", "alice", ["long.example.com"], issued_by),
                &cancel,
            )
            .await
            .unwrap();

        let jobs = RenewalJobs::new(Arc::clone(&engine), &SchedulerConfig::default());
        let due = jobs.due_jobs().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key_name, "short");

        let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(jobs));
        let summary = scheduler.run_once(&cancel).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.cert_writes(), 3);

        // not due is not a failure
        let long = RenewalJob {
            key_name: "long".to_owned(),
            next_renewal_time: OffsetDateTime::now_utc(),
        };
        scheduler.source.run_job(long, cancel.clone()).await.unwrap();
        assert_eq!(store.cert_writes(), 3);
    }
}
