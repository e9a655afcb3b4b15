//! Periodic batch submission and monitoring self-report

use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

/// Work driven by the two timers
#[async_trait]
pub trait ScheduledJobs: Send + Sync + 'static {
    async fn run_batch(&self) -> Result<()>;

    async fn run_monitoring(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
enum Job {
    Batch,
    Monitoring,
}

impl Job {
    async fn run(self, jobs: &dyn ScheduledJobs) -> Result<()> {
        match self {
            Job::Batch => jobs.run_batch().await,
            Job::Monitoring => jobs.run_monitoring().await,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Batch => f.write_str("batch"),
            Job::Monitoring => f.write_str("monitoring"),
        }
    }
}

struct Timers {
    batch: JoinHandle<()>,
    monitoring: JoinHandle<()>,
}

impl Timers {
    fn abort(self) {
        self.batch.abort();
        self.monitoring.abort();
    }
}

/// Owns the batch and monitoring timers.
///
/// `init` may be called again on reconfiguration; the previous timers are
/// cancelled before new ones start.
#[derive(Default)]
pub struct Scheduler {
    timers: Mutex<Option<Timers>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(
        &self,
        jobs: Arc<dyn ScheduledJobs>,
        batch_interval: Duration,
        monitoring_interval: Duration,
    ) -> Result<()> {
        if batch_interval.is_zero() || monitoring_interval.is_zero() {
            return Err(PipelineError::Config(
                "scheduler intervals must be greater than 0".to_string(),
            ));
        }

        let mut timers = self.lock();
        if let Some(previous) = timers.take() {
            debug!("Replacing running timers");
            previous.abort();
        }

        *timers = Some(Timers {
            batch: spawn_timer(jobs.clone(), Job::Batch, batch_interval),
            monitoring: spawn_timer(jobs, Job::Monitoring, monitoring_interval),
        });

        info!(
            "Scheduler started: batch every {:?}, monitoring every {:?}",
            batch_interval, monitoring_interval
        );
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(timers) = self.lock().take() {
            timers.abort();
            info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Timers>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// First tick fires one period after start. Each run happens in its own task
/// so an error or panic is logged and the timer keeps going.
fn spawn_timer(jobs: Arc<dyn ScheduledJobs>, job: Job, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Running scheduled {} job", job);

            let jobs = jobs.clone();
            let run = tokio::spawn(async move { job.run(jobs.as_ref()).await });

            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Scheduled {} job failed: {}", job, e),
                Err(e) if e.is_panic() => error!("Scheduled {} job panicked", job),
                Err(_) => debug!("Scheduled {} job cancelled", job),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Default)]
    struct CountingJobs {
        batches: AtomicUsize,
        reports: AtomicUsize,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl ScheduledJobs for CountingJobs {
        async fn run_batch(&self) -> Result<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("batch job blew up");
            }
            if self.fail {
                return Err(PipelineError::Transport("collector down".to_string()));
            }
            Ok(())
        }

        async fn run_monitoring(&self) -> Result<()> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Transport("collector down".to_string()));
            }
            Ok(())
        }
    }

    fn batches(jobs: &CountingJobs) -> usize {
        jobs.batches.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_on_their_own_periods() {
        let jobs = Arc::new(CountingJobs::default());
        let scheduler = Scheduler::new();
        scheduler
            .init(jobs.clone(), Duration::from_millis(40), Duration::from_millis(100))
            .unwrap();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(batches(&jobs), 0);

        sleep(Duration::from_millis(250)).await;
        let batch_runs = batches(&jobs);
        let report_runs = jobs.reports.load(Ordering::SeqCst);

        // 260ms: batch at 40..=240, monitoring at 100 and 200
        assert_eq!(batch_runs, 6);
        assert_eq!(report_runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinit_does_not_double_timers() {
        let jobs = Arc::new(CountingJobs::default());
        let scheduler = Scheduler::new();
        for _ in 0..3 {
            scheduler
                .init(jobs.clone(), Duration::from_millis(50), Duration::from_secs(60))
                .unwrap();
        }

        sleep(Duration::from_millis(230)).await;

        // one timer gives 4 ticks in this window, three would give 12
        assert_eq!(batches(&jobs), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_ticking() {
        let jobs = Arc::new(CountingJobs {
            fail: true,
            ..CountingJobs::default()
        });
        let scheduler = Scheduler::new();
        scheduler
            .init(jobs.clone(), Duration::from_millis(30), Duration::from_millis(30))
            .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(batches(&jobs), 6);
        assert_eq!(jobs.reports.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_keeps_ticking() {
        let jobs = Arc::new(CountingJobs {
            panic: true,
            ..CountingJobs::default()
        });
        let scheduler = Scheduler::new();
        scheduler
            .init(jobs.clone(), Duration::from_millis(30), Duration::from_secs(60))
            .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(batches(&jobs), 6);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_both_timers() {
        let jobs = Arc::new(CountingJobs::default());
        let scheduler = Scheduler::new();
        scheduler
            .init(jobs.clone(), Duration::from_millis(20), Duration::from_millis(20))
            .unwrap();
        assert!(scheduler.is_running());

        sleep(Duration::from_millis(70)).await;
        assert_eq!(batches(&jobs), 3);
        assert_eq!(jobs.reports.load(Ordering::SeqCst), 3);

        scheduler.stop();
        assert!(!scheduler.is_running());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(batches(&jobs), 3);
        assert_eq!(jobs.reports.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let scheduler = Scheduler::new();
        let result = scheduler.init(
            Arc::new(CountingJobs::default()),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert!(!scheduler.is_running());
    }
}
