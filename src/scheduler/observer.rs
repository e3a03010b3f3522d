//! Job observer: wakes exactly when the next pending job is due
//!
//! While running, the observer keeps a live subscription to the earliest
//! pending job and a single wake timer for its due date. Every change to that
//! job replaces the timer. When the timer fires the subscription is dropped,
//! every due job is executed in (due, priority desc) order, and the observer
//! subscribes again, which also picks up jobs enqueued during the drain.
//!
//! ```text
//!            start()                 added/changed
//!  Stopped ──────────► WatchingIdle ──────────────► Armed ──┐
//!     ▲                     ▲   ◄────── removed ──────┘     │ timer
//!     │ stop()              └────────── resubscribe ────────┤
//!     └─────────────────────────────────────────── Draining ◄┘
//! ```

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clock::{until, SharedClock};
use super::execution::{ExecutionEngine, ExecutionOutcome};
use crate::metrics;
use crate::models::JobId;
use crate::store::{ChangeEvent, FindOptions, JobQuery, JobSort};

/// Delay before retrying a failed subscription
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Observer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Stopped,
    /// Subscribed, no pending job
    WatchingIdle,
    /// Subscribed, timer set for the next pending job
    Armed,
    /// Executing due jobs
    Draining,
}

/// Summary of one drain batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Outcome per executed job, in execution order
    pub outcomes: Vec<(JobId, ExecutionOutcome)>,
    /// Jobs whose execution failed with a store error
    pub errors: usize,
}

impl DrainReport {
    /// Jobs taken from the queue in this batch
    pub fn processed(&self) -> usize {
        self.outcomes.len() + self.errors
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Core {
    engine: ExecutionEngine,
    clock: SharedClock,
    state: watch::Sender<ObserverState>,
}

enum Wake {
    Cancelled,
    Due,
    Lost,
}

/// Scheduler that drains due jobs while this process leads
pub struct JobObserver {
    core: Arc<Core>,
    running: Mutex<Option<Running>>,
}

impl JobObserver {
    pub fn new(engine: ExecutionEngine, clock: SharedClock) -> Self {
        let (state, _) = watch::channel(ObserverState::Stopped);
        Self {
            core: Arc::new(Core {
                engine,
                clock,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> ObserverState {
        *self.core.state.borrow()
    }

    /// Receiver for state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ObserverState> {
        self.core.state.subscribe()
    }

    /// Whether the observer loop is running
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start observing. Does nothing when already running.
    pub fn start(&self) {
        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let core = self.core.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { core.run(token).await });

        tracing::debug!("Job observer started");
        *running = Some(Running { cancel, handle });
    }

    /// Stop observing and wait for the loop to exit.
    ///
    /// A job that is executing finishes first; the rest of its batch is
    /// left for the next leader.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "Job observer task failed");
        }
        self.core.set_state(ObserverState::Stopped);
        tracing::debug!("Job observer stopped");
    }

    /// Execute every due job once, outside the observer loop
    pub async fn drain(&self) -> DrainReport {
        self.core.drain(&CancellationToken::new()).await
    }
}

impl Core {
    fn set_state(&self, state: ObserverState) {
        self.state.send_replace(state);
    }

    async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.watch_until_due(&cancel).await {
                Wake::Cancelled => break,
                Wake::Lost => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
                Wake::Due => {
                    self.set_state(ObserverState::Draining);
                    self.drain(&cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }
        self.set_state(ObserverState::Stopped);
    }

    /// Follow the earliest pending job until its due date arrives
    async fn watch_until_due(&self, cancel: &CancellationToken) -> Wake {
        let query = JobQuery::pending();
        let options = FindOptions::sorted(JobSort::Due).limit(1);
        let mut subscription = match self.engine.lifecycle().store().watch(query, options).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(error = %e, "Failed to watch pending jobs");
                return Wake::Lost;
            }
        };
        self.set_state(ObserverState::WatchingIdle);

        let mut next_due: Option<DateTime<Utc>> = None;
        let wake = loop {
            let wait = next_due.map(|due| until(self.clock.now(), due));

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Wake::Cancelled,

                event = subscription.recv() => match event {
                    Some(ChangeEvent::Added(job)) | Some(ChangeEvent::Changed(job)) => {
                        tracing::debug!(
                            job_id = %job.id,
                            name = %job.name,
                            due = %job.due,
                            "Next job due"
                        );
                        next_due = Some(job.due);
                        self.set_state(ObserverState::Armed);
                    }
                    Some(ChangeEvent::Removed(_)) => {
                        next_due = None;
                        self.set_state(ObserverState::WatchingIdle);
                    }
                    None => {
                        tracing::warn!("Pending job subscription closed");
                        break Wake::Lost;
                    }
                },

                _ = sleep_for(wait) => break Wake::Due,
            }
        };

        subscription.stop();
        wake
    }

    async fn drain(&self, cancel: &CancellationToken) -> DrainReport {
        let mut report = DrainReport::default();
        let now = self.clock.now();
        let query = JobQuery::pending().due_by(now);
        let options = FindOptions::sorted(JobSort::DueThenPriority);

        let jobs = match self.engine.lifecycle().store().find(&query, &options).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load due jobs");
                return report;
            }
        };
        tracing::debug!(count = jobs.len(), "Executing due jobs");

        for job in jobs {
            if cancel.is_cancelled() {
                tracing::info!("Job observer stopped during drain, leaving remaining jobs");
                break;
            }
            let job_id = job.id.clone();
            match self.engine.execute_one(job).await {
                Ok(outcome) => report.outcomes.push((job_id, outcome)),
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                    report.errors += 1;
                }
            }
        }

        metrics::record_drain(report.processed());
        report
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for JobObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobObserver")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobState;
    use crate::scheduler::clock::TokioClock;
    use crate::scheduler::due::DueDateResolver;
    use crate::scheduler::execution::JobContext;
    use crate::scheduler::lifecycle::JobLifecycle;
    use crate::scheduler::options::JobConfig;
    use crate::scheduler::registry::HandlerRegistry;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::Value;

    fn observer() -> (JobObserver, Arc<JobLifecycle>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let clock: SharedClock = Arc::new(TokioClock::starting_at(start));
        let lifecycle = Arc::new(JobLifecycle::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            DueDateResolver::utc(),
        ));

        let mut registry = HandlerRegistry::new();
        registry.register("ok", |ctx: JobContext, _args: Vec<Value>| async move {
            ctx.success().await?;
            anyhow::Ok(())
        });
        let engine = ExecutionEngine::new(lifecycle.clone(), Arc::new(registry));
        (JobObserver::new(engine, clock), lifecycle)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_when_job_becomes_due() {
        let (observer, lifecycle) = observer();
        let job = lifecycle
            .enqueue("ok", vec![], Some(JobConfig::new().after("seconds", 30)))
            .await
            .unwrap()
            .into_job()
            .unwrap();

        observer.start();
        settle().await;
        assert_eq!(observer.state(), ObserverState::Armed);

        tokio::time::sleep(Duration::from_secs(29)).await;
        let pending = lifecycle.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(pending.state, JobState::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        let done = lifecycle.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Success);
        assert_eq!(observer.state(), ObserverState::WatchingIdle);

        observer.stop().await;
        assert_eq!(observer.state(), ObserverState::Stopped);
        assert!(!observer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (observer, _lifecycle) = observer();
        observer.start();
        observer.start();
        settle().await;
        assert!(observer.is_running());
        assert_eq!(observer.state(), ObserverState::WatchingIdle);
        observer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_drain_skips_future_jobs() {
        let (observer, lifecycle) = observer();
        lifecycle.enqueue("ok", vec![], None).await.unwrap();
        lifecycle
            .enqueue("ok", vec![], Some(JobConfig::new().after("hours", 1)))
            .await
            .unwrap();

        let report = observer.drain().await;
        assert_eq!(report.processed(), 1);
        assert_eq!(lifecycle.count_pending("ok", vec![]).await.unwrap(), 1);
    }
}
