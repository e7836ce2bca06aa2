use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use oxsync_slo::{errors, Result};

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self) -> Result<()> {
        (self)().await
    }
}

/// Computes the next fire time, in milliseconds since the epoch.
pub trait Trigger {
    fn next(&self, now: i64) -> Result<i64>;
}

/// Fires every `period`, measured from the previous fire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    period: Duration,
}

impl Interval {
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(errors::bad_request("interval must be positive"));
        }
        Ok(Self { period })
    }

    pub fn from_secs(secs: u64) -> Result<Self> {
        Self::new(Duration::from_secs(secs))
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Trigger for Interval {
    fn next(&self, now: i64) -> Result<i64> {
        let period = i64::try_from(self.period.as_millis()).map_err(errors::any)?;
        now.checked_add(period)
            .ok_or_else(|| errors::bad_request("interval overflows the clock"))
    }
}

#[derive(Debug)]
pub enum Fire {
    Started(JoinHandle<()>),
    /// A previous run still holds the slot.
    Skipped,
}

/// Clears the in-progress flag when the run ends, including on panic.
struct Slot(Arc<AtomicBool>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-slot scheduler: one job, at most one run at a time. Fires that
/// arrive while a run is in progress are dropped, never queued.
pub struct Scheduler<J> {
    job: Arc<J>,
    running: Arc<AtomicBool>,
}

impl<J> fmt::Debug for Scheduler<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<J: Job + 'static> Scheduler<J> {
    pub fn new(job: J) -> Self {
        Self {
            job: Arc::new(job),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn fire(&self) -> Fire {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("previous run still in progress, skipping");
            return Fire::Skipped;
        }
        let slot = Slot(Arc::clone(&self.running));
        let job = Arc::clone(&self.job);
        Fire::Started(tokio::spawn(async move {
            let _slot = slot;
            if let Err(err) = job.run().await {
                tracing::error!("job failed, {}", err);
            }
        }))
    }

    /// Fires the job on every trigger time until `shutdown` resolves.
    pub async fn run<T, S>(&self, trigger: T, shutdown: S) -> Result<()>
    where
        T: Trigger + Send + Sync,
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            let now = Utc::now().timestamp_millis();
            let next = trigger.next(now)?;
            let wait = Duration::from_millis(u64::try_from(next - now).unwrap_or_default());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let _ = self.fire();
                }
                _ = &mut shutdown => {
                    tracing::info!("scheduler stopped");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;

    fn gated(runs: &Arc<AtomicUsize>, gate: &Arc<Notify>) -> impl Job + 'static {
        let runs = Arc::clone(runs);
        let gate = Arc::clone(gate);
        move || {
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn overlapping_fire_is_skipped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let scheduler = Scheduler::new(gated(&runs, &gate));

        let Fire::Started(first) = scheduler.fire() else {
            panic!("first fire must start");
        };
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.fire(), Fire::Skipped));
        assert!(matches!(scheduler.fire(), Fire::Skipped));

        gate.notify_one();
        first.await.unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let Fire::Started(second) = scheduler.fire() else {
            panic!("slot must be free again");
        };
        gate.notify_one();
        second.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_run_releases_slot() {
        let scheduler =
            Scheduler::new(|| async { Err(errors::bad_request("boom")) });
        let Fire::Started(handle) = scheduler.fire() else {
            panic!("fire must start");
        };
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn run_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let scheduler = Scheduler::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let trigger = Interval::new(Duration::from_millis(10)).unwrap();
        scheduler
            .run(trigger, tokio::time::sleep(Duration::from_millis(75)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn interval_rejects_zero() {
        assert!(Interval::from_secs(0).is_err());
        let interval = Interval::from_secs(300).unwrap();
        assert_eq!(interval.next(1_000).unwrap(), 301_000);
    }
}
