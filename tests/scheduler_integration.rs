//! Integration tests for job execution and the observer loop
//!
//! These tests verify:
//! - Drain order (due date, then priority)
//! - Outcome enforcement for unresolved, failing and unknown jobs
//! - Per-job isolation of store failures
//! - Timer-driven execution while leading, under paused time

mod common;

use async_trait::async_trait;
use chrono::TimeDelta;
use common::{settle, start_time, test_clock, Recorder};
use jobwarden::models::{Job, JobId, JobState, LeadershipRecord, NewJob};
use jobwarden::scheduler::{
    ExecutionOutcome, JobConfig, JobContext, LeadershipState, Resolution, SchedulerSettings,
    ServerIdSource,
};
use jobwarden::store::{
    FindOptions, JobQuery, JobStore, JobUpdate, LeaderStore, MemoryStore, StoreError,
    StoreResult, Subscription,
};
use jobwarden::Jobs;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn quick_settings() -> SchedulerSettings {
    SchedulerSettings::default()
        .with_startup_delay(Duration::from_millis(100))
        .with_server_id(ServerIdSource::Literal("node-a".into()))
}

// ============================================================================
// Drain
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_drain_runs_by_due_then_priority() {
    let recorder = Recorder::new();
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .register("work", recorder.succeeding("work"))
        .build();

    let past = |minutes: i64| start_time() - TimeDelta::minutes(minutes);
    for (label, due, priority) in [
        ("late-low", past(10), 0),
        ("late-high", past(10), 5),
        ("early", past(20), 0),
        ("future", start_time() + TimeDelta::minutes(1), 100),
    ] {
        jobs.enqueue(
            "work",
            vec![json!(label)],
            Some(JobConfig::new().at(due).priority(priority)),
        )
        .await
        .unwrap();
    }

    let report = jobs.observer().drain().await;
    assert_eq!(report.processed(), 3);
    assert_eq!(
        recorder.first_args(),
        vec![json!("early"), json!("late-high"), json!("late-low")]
    );
    assert_eq!(jobs.count_pending("work", vec![]).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_errored_and_unknown_jobs_fail() {
    let recorder = Recorder::new();
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .register("forgetful", recorder.forgetful("forgetful"))
        .register("broken", |_ctx: JobContext, _args: Vec<Value>| async move {
            Err::<(), _>(anyhow::anyhow!("smtp unreachable"))
        })
        .build();

    let forgetful = jobs.run("forgetful", vec![]).await.unwrap().into_job().unwrap();
    let broken = jobs.run("broken", vec![]).await.unwrap().into_job().unwrap();
    let unknown = jobs.run("nobody", vec![]).await.unwrap().into_job().unwrap();

    let report = jobs.observer().drain().await;
    let outcomes: Vec<_> = report.outcomes.iter().map(|(_, o)| o.label()).collect();
    assert_eq!(outcomes, vec!["unresolved", "error", "unknown_handler"]);

    for job in [forgetful, broken, unknown] {
        let stored = jobs.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failure, "{}", job.name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_from_handler_keeps_job_pending() {
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .register("retry", |ctx: JobContext, _args: Vec<Value>| async move {
            ctx.reschedule(&JobConfig::new().after("minutes", 5)).await?;
            anyhow::Ok(())
        })
        .build();

    let job = jobs.run("retry", vec![]).await.unwrap().into_job().unwrap();
    let outcome = jobs.execute(&job.id).await.unwrap();
    assert_eq!(outcome, Some(ExecutionOutcome::Resolved(Resolution::Rescheduled)));

    let stored = jobs.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.due, start_time() + TimeDelta::minutes(5));
}

#[tokio::test(start_paused = true)]
async fn test_second_resolution_is_rejected() {
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .register("twice", |ctx: JobContext, _args: Vec<Value>| async move {
            ctx.success().await?;
            assert!(ctx.failure().await.is_err());
            anyhow::Ok(())
        })
        .build();

    let job = jobs.run("twice", vec![]).await.unwrap().into_job().unwrap();
    jobs.execute(&job.id).await.unwrap();

    let stored = jobs.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Success);
}

// ============================================================================
// Failure Isolation
// ============================================================================

/// Memory store whose updates fail for one job id
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    poisoned: Arc<std::sync::Mutex<Option<JobId>>>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            poisoned: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn poison(&self, id: JobId) {
        *self.poisoned.lock().unwrap() = Some(id);
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert(&self, job: NewJob) -> StoreResult<JobId> {
        self.inner.insert(job).await
    }

    async fn find_one(&self, query: &JobQuery) -> StoreResult<Option<Job>> {
        self.inner.find_one(query).await
    }

    async fn find(&self, query: &JobQuery, options: &FindOptions) -> StoreResult<Vec<Job>> {
        self.inner.find(query, options).await
    }

    async fn count(&self, query: &JobQuery) -> StoreResult<u64> {
        self.inner.count(query).await
    }

    async fn update(&self, query: &JobQuery, update: &JobUpdate) -> StoreResult<u64> {
        let poisoned = self.poisoned.lock().unwrap().clone();
        if poisoned.is_some() && query.id == poisoned {
            return Err(StoreError::backend("write rejected"));
        }
        self.inner.update(query, update).await
    }

    async fn remove(&self, query: &JobQuery) -> StoreResult<u64> {
        self.inner.remove(query).await
    }

    async fn watch(&self, query: JobQuery, options: FindOptions) -> StoreResult<Subscription<Job>> {
        self.inner.watch(query, options).await
    }
}

#[async_trait]
impl LeaderStore for FlakyStore {
    async fn read_leader(&self) -> StoreResult<Option<LeadershipRecord>> {
        self.inner.read_leader().await
    }

    async fn upsert_leader(&self, record: &LeadershipRecord) -> StoreResult<()> {
        self.inner.upsert_leader(record).await
    }

    async fn purge_foreign_leaders(&self) -> StoreResult<u64> {
        self.inner.purge_foreign_leaders().await
    }

    async fn watch_leader(&self) -> StoreResult<Subscription<LeadershipRecord>> {
        self.inner.watch_leader().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_does_not_stop_the_batch() {
    let recorder = Recorder::new();
    let store = FlakyStore::new();
    let jobs = Jobs::builder(store.clone())
        .clock(test_clock())
        .register("work", recorder.succeeding("work"))
        .build();

    let mut ids = Vec::new();
    for i in 0..3 {
        let job = jobs
            .enqueue(
                "work",
                vec![json!(i)],
                Some(JobConfig::new().at(start_time() - TimeDelta::minutes(10 - i))),
            )
            .await
            .unwrap()
            .into_job()
            .unwrap();
        ids.push(job.id);
    }
    store.poison(ids[1].clone());

    let report = jobs.observer().drain().await;
    assert_eq!(report.errors, 1);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(recorder.first_args(), vec![json!(0), json!(1), json!(2)]);

    let states: Vec<_> = futures::future::join_all(ids.iter().map(|id| jobs.find_by_id(id)))
        .await
        .into_iter()
        .map(|job| job.unwrap().unwrap().state)
        .collect();
    assert_eq!(
        states,
        vec![JobState::Success, JobState::Pending, JobState::Success]
    );
}

// ============================================================================
// Observer Loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_leader_runs_job_when_due() {
    let recorder = Recorder::new();
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .settings(quick_settings())
        .register("work", recorder.succeeding("work"))
        .build();

    assert_eq!(jobs.start().await.unwrap(), "node-a");
    tokio::time::sleep(Duration::from_millis(150)).await;
    settle().await;
    assert_eq!(jobs.leadership(), LeadershipState::Leader);

    jobs.run("work", vec![json!("soon"), json!({"in": {"minutes": 10}})])
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(9 * 60)).await;
    settle().await;
    assert_eq!(recorder.len(), 0);

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(recorder.first_args(), vec![json!("soon")]);

    jobs.shutdown().await;
    assert_eq!(jobs.leadership(), LeadershipState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_earlier_reschedule_rearms_timer() {
    let recorder = Recorder::new();
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .settings(quick_settings())
        .register("work", recorder.succeeding("work"))
        .build();
    jobs.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    settle().await;

    let job = jobs
        .run("work", vec![json!({"in": {"hours": 1}})])
        .await
        .unwrap()
        .into_job()
        .unwrap();
    settle().await;

    jobs.reschedule(&job.id, &JobConfig::new().after("minutes", 1))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(recorder.len(), 1);

    jobs.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_jobs_added_during_drain_are_picked_up() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let jobs = Jobs::builder(MemoryStore::new())
        .clock(test_clock())
        .settings(quick_settings())
        .register("chain", move |ctx: JobContext, _args: Vec<Value>| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    ctx.replicate(&JobConfig::new()).await?;
                }
                ctx.success().await?;
                anyhow::Ok(())
            }
        })
        .build();

    jobs.run("chain", vec![]).await.unwrap();
    jobs.start().await.unwrap();

    let done = common::wait_until(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) == 3
    })
    .await;
    assert!(done);
    settle().await;
    assert_eq!(jobs.count_pending("chain", vec![]).await.unwrap(), 0);

    jobs.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_does_not_execute() {
    let recorder = Recorder::new();
    let store = MemoryStore::new();
    store
        .upsert_leader(&LeadershipRecord::new("node-z", start_time()))
        .await
        .unwrap();

    let jobs = Jobs::builder(store)
        .clock(test_clock())
        .settings(quick_settings())
        .register("work", recorder.succeeding("work"))
        .build();
    jobs.run("work", vec![]).await.unwrap();
    jobs.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    settle().await;
    assert_eq!(jobs.leadership(), LeadershipState::Follower);
    assert_eq!(recorder.len(), 0);

    // Manual execution ignores leadership
    let job = jobs.find_one("work", vec![]).await.unwrap().unwrap();
    jobs.execute(&job.id).await.unwrap();
    assert_eq!(recorder.len(), 1);

    jobs.shutdown().await;
}
