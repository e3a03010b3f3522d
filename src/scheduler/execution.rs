//! Running one job against its handler
//!
//! The handler resolves its job through a [`JobContext`] with exactly one of
//! `success`, `failure`, `reschedule` or `remove`. A second resolving call is
//! rejected and the first outcome stands. When the handler returns without
//! resolving, returns an error or panics, the job is marked failed. Nothing a
//! handler does escapes [`ExecutionEngine::execute_one`] except store errors
//! from that forced failure.

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use super::error::{SchedulerError, SchedulerResult};
use super::lifecycle::JobLifecycle;
use super::options::JobConfig;
use super::registry::HandlerRegistry;
use crate::metrics;
use crate::models::{Job, JobId, JobState};

/// How a handler resolved its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Success,
    Failure,
    Rescheduled,
    Removed,
}

impl Resolution {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rescheduled => "reschedule",
            Self::Removed => "remove",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Job Context
// ============================================================================

/// Handle given to a handler for one execution
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    lifecycle: Arc<JobLifecycle>,
    resolution: Arc<Mutex<Option<Resolution>>>,
}

impl JobContext {
    pub(crate) fn new(job: Job, lifecycle: Arc<JobLifecycle>) -> Self {
        Self {
            job: Arc::new(job),
            lifecycle,
            resolution: Arc::new(Mutex::new(None)),
        }
    }

    /// The job document as it was when execution started
    pub fn document(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn arguments(&self) -> &[Value] {
        &self.job.arguments
    }

    /// The outcome recorded so far
    pub fn resolution(&self) -> Option<Resolution> {
        *self.slot()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Resolution>> {
        self.resolution.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, resolution: Resolution) -> SchedulerResult<()> {
        let mut slot = self.slot();
        if let Some(first) = *slot {
            tracing::warn!(
                job_id = %self.job.id,
                first = first.name(),
                second = resolution.name(),
                "Job was already resolved, ignoring second resolution"
            );
            return Err(SchedulerError::AlreadyResolved {
                id: self.job.id.clone(),
                first: first.name(),
            });
        }
        *slot = Some(resolution);
        Ok(())
    }

    // A resolution whose store write failed does not count.
    fn release(&self) {
        *self.slot() = None;
    }

    async fn resolve_state(&self, resolution: Resolution, state: JobState) -> SchedulerResult<()> {
        self.claim(resolution)?;
        match self.lifecycle.set_state(&self.job.id, state).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Mark the job successful
    pub async fn success(&self) -> SchedulerResult<()> {
        self.resolve_state(Resolution::Success, JobState::Success).await
    }

    /// Mark the job failed
    pub async fn failure(&self) -> SchedulerResult<()> {
        self.resolve_state(Resolution::Failure, JobState::Failure).await
    }

    /// Keep the job pending with a new due date
    pub async fn reschedule(&self, config: &JobConfig) -> SchedulerResult<u64> {
        self.claim(Resolution::Rescheduled)?;
        self.lifecycle
            .reschedule(&self.job.id, config)
            .await
            .inspect_err(|_| self.release())
    }

    /// Delete the job
    pub async fn remove(&self) -> SchedulerResult<bool> {
        self.claim(Resolution::Removed)?;
        self.lifecycle
            .remove(&self.job.id)
            .await
            .inspect_err(|_| self.release())
    }

    /// Insert a pending copy of this job due per `config`. Does not resolve.
    pub async fn replicate(&self, config: &JobConfig) -> SchedulerResult<Option<JobId>> {
        self.lifecycle.replicate(&self.job.id, config).await
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job.id)
            .field("resolution", &self.resolution())
            .finish()
    }
}

// ============================================================================
// Execution Engine
// ============================================================================

/// What happened when a job was executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler resolved the job
    Resolved(Resolution),
    /// The handler returned without resolving; marked failed
    Unresolved,
    /// The handler returned an error before resolving; marked failed
    Errored(String),
    /// The handler panicked before resolving; marked failed
    Panicked(String),
    /// No handler is registered for the job name; marked failed
    UnknownHandler,
}

impl ExecutionOutcome {
    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved(r) => r.name(),
            Self::Unresolved => "unresolved",
            Self::Errored(_) => "error",
            Self::Panicked(_) => "panic",
            Self::UnknownHandler => "unknown_handler",
        }
    }

    /// Whether the engine had to mark the job failed
    pub fn forced_failure(&self) -> bool {
        !matches!(self, Self::Resolved(_))
    }
}

/// Executes single jobs against the handler registry
#[derive(Clone)]
pub struct ExecutionEngine {
    lifecycle: Arc<JobLifecycle>,
    registry: Arc<HandlerRegistry>,
}

impl ExecutionEngine {
    pub fn new(lifecycle: Arc<JobLifecycle>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            lifecycle,
            registry,
        }
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Run one job and make sure it ends with exactly one outcome
    pub async fn execute_one(&self, job: Job) -> SchedulerResult<ExecutionOutcome> {
        let job_id = job.id.clone();
        let name = job.name.clone();
        tracing::info!(job_id = %job_id, name = %name, "Executing job");

        let Some(handler) = self.registry.get(&name) else {
            tracing::warn!(job_id = %job_id, name = %name, "Job does not exist, marking failed");
            self.lifecycle.set_state(&job_id, JobState::Failure).await?;
            metrics::record_execution(ExecutionOutcome::UnknownHandler.label());
            return Ok(ExecutionOutcome::UnknownHandler);
        };

        let args = job.arguments.clone();
        let ctx = JobContext::new(job, self.lifecycle.clone());

        let result = {
            let _timer = metrics::start_execution_timer(&name);
            AssertUnwindSafe(handler.run(ctx.clone(), args))
                .catch_unwind()
                .await
        };

        let outcome = match (result, ctx.resolution()) {
            (Ok(Ok(())), Some(resolution)) => ExecutionOutcome::Resolved(resolution),
            (Ok(Ok(())), None) => {
                tracing::warn!(
                    job_id = %job_id,
                    name = %name,
                    "Job was not resolved with success, failure, reschedule or remove"
                );
                ExecutionOutcome::Unresolved
            }
            (Ok(Err(e)), resolution) => {
                tracing::error!(job_id = %job_id, name = %name, error = %format!("{e:#}"), "Error in job");
                match resolution {
                    Some(resolution) => ExecutionOutcome::Resolved(resolution),
                    None => ExecutionOutcome::Errored(format!("{e:#}")),
                }
            }
            (Err(payload), resolution) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(job_id = %job_id, name = %name, panic = %message, "Job handler panicked");
                match resolution {
                    Some(resolution) => ExecutionOutcome::Resolved(resolution),
                    None => ExecutionOutcome::Panicked(message),
                }
            }
        };

        if outcome.forced_failure() {
            self.lifecycle.set_state(&job_id, JobState::Failure).await?;
        }

        tracing::info!(job_id = %job_id, name = %name, outcome = outcome.label(), "Done job");
        metrics::record_execution(outcome.label());
        Ok(outcome)
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::clock::TokioClock;
    use crate::scheduler::due::DueDateResolver;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        lifecycle: Arc<JobLifecycle>,
    }

    impl Fixture {
        fn new() -> Self {
            let start = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
            Self {
                lifecycle: Arc::new(JobLifecycle::new(
                    Arc::new(MemoryStore::new()),
                    Arc::new(TokioClock::starting_at(start)),
                    DueDateResolver::utc(),
                )),
            }
        }

        fn engine(&self, registry: HandlerRegistry) -> ExecutionEngine {
            ExecutionEngine::new(self.lifecycle.clone(), Arc::new(registry))
        }

        async fn job(&self, name: &str) -> Job {
            self.lifecycle
                .enqueue(name, vec![json!(1)], None)
                .await
                .unwrap()
                .into_job()
                .unwrap()
        }

        async fn state(&self, job: &Job) -> Option<JobState> {
            self.lifecycle
                .find_by_id(&job.id)
                .await
                .unwrap()
                .map(|j| j.state)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resolution() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("ok", |ctx: JobContext, args: Vec<Value>| async move {
            assert_eq!(args, vec![json!(1)]);
            ctx.success().await?;
            anyhow::Ok(())
        });

        let job = fx.job("ok").await;
        let outcome = fx.engine(registry).execute_one(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Resolved(Resolution::Success));
        assert_eq!(fx.state(&job).await, Some(JobState::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_handler_fails_job() {
        let fx = Fixture::new();
        let job = fx.job("missing").await;

        let outcome = fx.engine(HandlerRegistry::new()).execute_one(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::UnknownHandler);
        assert_eq!(fx.state(&job).await, Some(JobState::Failure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_handler_fails_job() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("idle", |_ctx: JobContext, _args: Vec<Value>| async move { anyhow::Ok(()) });

        let job = fx.job("idle").await;
        let outcome = fx.engine(registry).execute_one(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Unresolved);
        assert_eq!(fx.state(&job).await, Some(JobState::Failure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_and_panic_fail_job() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry
            .register("boom", |_ctx: JobContext, _args: Vec<Value>| async move {
                Err::<(), _>(anyhow::anyhow!("smtp down"))
            })
            .register("panic", |ctx: JobContext, _args: Vec<Value>| async move {
                if ctx.arguments().len() == 1 {
                    panic!("handler exploded");
                }
                anyhow::Ok(())
            });
        let engine = fx.engine(registry);

        let errored = fx.job("boom").await;
        let outcome = engine.execute_one(errored.clone()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Errored(ref m) if m.contains("smtp down")));
        assert_eq!(fx.state(&errored).await, Some(JobState::Failure));

        let panicked = fx.job("panic").await;
        let outcome = engine.execute_one(panicked.clone()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Panicked(ref m) if m.contains("exploded")));
        assert_eq!(fx.state(&panicked).await, Some(JobState::Failure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_resolution_is_rejected() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("twice", |ctx: JobContext, _args: Vec<Value>| async move {
            ctx.success().await?;
            let second = ctx.failure().await;
            assert!(matches!(second, Err(SchedulerError::AlreadyResolved { first: "success", .. })));
            anyhow::Ok(())
        });

        let job = fx.job("twice").await;
        let outcome = fx.engine(registry).execute_one(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Resolved(Resolution::Success));
        assert_eq!(fx.state(&job).await, Some(JobState::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_resolution_keeps_outcome() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("late-error", |ctx: JobContext, _args: Vec<Value>| async move {
            ctx.success().await?;
            Err::<(), _>(anyhow::anyhow!("cleanup failed"))
        });

        let job = fx.job("late-error").await;
        let outcome = fx.engine(registry).execute_one(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Resolved(Resolution::Success));
        assert_eq!(fx.state(&job).await, Some(JobState::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_replicate() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("recurring", |ctx: JobContext, _args: Vec<Value>| async move {
            let copy = ctx.replicate(&JobConfig::new().after("hours", 1)).await?;
            assert!(copy.is_some());
            assert!(ctx.remove().await?);
            anyhow::Ok(())
        });

        let job = fx.job("recurring").await;
        let outcome = fx.engine(registry).execute_one(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Resolved(Resolution::Removed));
        assert_eq!(fx.state(&job).await, None);
        assert_eq!(fx.lifecycle.count_pending("recurring", vec![]).await.unwrap(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
