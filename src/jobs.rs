//! Public facade tying the store, lifecycle, observer and elector together
//!
//! # Example
//!
//! ```no_run
//! use jobwarden::prelude::*;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let jobs = Jobs::builder(MemoryStore::new())
//!         .register("sendEmail", |ctx: JobContext, args: Vec<Value>| async move {
//!             tracing::info!(?args, "sending");
//!             ctx.success().await?;
//!             anyhow::Ok(())
//!         })
//!         .build();
//!
//!     jobs.start().await?;
//!     jobs.run("sendEmail", vec![json!("a@b.c"), json!({"in": {"minutes": 5}})]).await?;
//!     jobs.shutdown().await;
//!     Ok(())
//! }
//! ```

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use crate::models::{Job, JobId, JobState, LeadershipRecord};
use crate::scheduler::{
    ClearFilter, DueDateResolver, EnqueueOutcome, ExecutionEngine, ExecutionOutcome,
    HandlerRegistry, JobConfig, JobHandler, JobLifecycle, JobObserver, LeaderElector,
    LeadershipState, SchedulerResult, SchedulerSettings, SharedClock, SystemClock,
};
use crate::store::{FindOptions, JobQuery, JobStore, LeaderStore};

/// Builder for [`Jobs`]
pub struct JobsBuilder {
    job_store: Arc<dyn JobStore>,
    leader_store: Arc<dyn LeaderStore>,
    settings: SchedulerSettings,
    clock: SharedClock,
    registry: HandlerRegistry,
}

impl JobsBuilder {
    fn new<S>(store: S) -> Self
    where
        S: JobStore + LeaderStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            job_store: store.clone(),
            leader_store: store,
            settings: SchedulerSettings::default(),
            clock: Arc::new(SystemClock),
            registry: HandlerRegistry::new(),
        }
    }

    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the wall clock, e.g. with a [`crate::scheduler::TokioClock`] in tests
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Register a handler for jobs named `name`
    pub fn register(mut self, name: impl Into<String>, handler: impl JobHandler) -> Self {
        self.registry.register(name, handler);
        self
    }

    /// Register every handler of `registry`
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry.register_all(registry);
        self
    }

    /// Freeze the registry and wire the components
    pub fn build(self) -> Jobs {
        tracing::debug!(handlers = ?self.registry.names(), "Building job scheduler");

        let resolver = DueDateResolver::new(self.settings.utc_offset);
        let lifecycle = Arc::new(JobLifecycle::new(
            self.job_store,
            self.clock.clone(),
            resolver,
        ));
        let engine = ExecutionEngine::new(lifecycle.clone(), Arc::new(self.registry));
        let observer = Arc::new(JobObserver::new(engine.clone(), self.clock.clone()));
        let elector = LeaderElector::new(
            self.leader_store.clone(),
            observer.clone(),
            self.clock,
            self.settings,
        );

        Jobs {
            lifecycle,
            engine,
            observer,
            elector,
            leader_store: self.leader_store,
        }
    }
}

/// A scheduler node
pub struct Jobs {
    lifecycle: Arc<JobLifecycle>,
    engine: ExecutionEngine,
    observer: Arc<JobObserver>,
    elector: LeaderElector,
    leader_store: Arc<dyn LeaderStore>,
}

impl Jobs {
    /// Start building a node over `store`
    pub fn builder<S>(store: S) -> JobsBuilder
    where
        S: JobStore + LeaderStore + 'static,
    {
        JobsBuilder::new(store)
    }

    // ========================================================================
    // Runtime
    // ========================================================================

    /// Join the election. Returns this process's server id.
    ///
    /// Leadership records stored under unexpected ids are removed first; the
    /// first leadership decision follows after the startup delay.
    pub async fn start(&self) -> SchedulerResult<String> {
        self.leader_store.purge_foreign_leaders().await?;
        Ok(self.elector.start())
    }

    /// Leave the election and stop dispatching jobs
    pub async fn shutdown(&self) {
        self.elector.stop().await;
        self.observer.stop().await;
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn leadership(&self) -> LeadershipState {
        self.elector.state()
    }

    /// Receiver for leadership changes
    pub fn subscribe_leadership(&self) -> watch::Receiver<LeadershipState> {
        self.elector.subscribe_state()
    }

    pub fn server_id(&self) -> Option<String> {
        self.elector.server_id()
    }

    /// The shared leadership record
    pub async fn leader_record(&self) -> SchedulerResult<Option<LeadershipRecord>> {
        Ok(self.leader_store.read_leader().await?)
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    pub fn observer(&self) -> &Arc<JobObserver> {
        &self.observer
    }

    /// Names with a registered handler
    pub fn handler_names(&self) -> Vec<String> {
        self.engine
            .registry()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    /// Enqueue with loose positional arguments and an optional trailing config object
    pub async fn run(&self, name: &str, args: Vec<Value>) -> SchedulerResult<EnqueueOutcome> {
        self.lifecycle.run(name, args).await
    }

    /// Enqueue with an explicit config
    pub async fn enqueue(
        &self,
        name: &str,
        args: Vec<Value>,
        config: Option<JobConfig>,
    ) -> SchedulerResult<EnqueueOutcome> {
        self.lifecycle.enqueue(name, args, config).await
    }

    /// Run one pending job now, on this process, whoever leads.
    ///
    /// Missing and non-pending jobs are logged and skipped.
    pub async fn execute(&self, id: &JobId) -> SchedulerResult<Option<ExecutionOutcome>> {
        let Some(job) = self.lifecycle.find_by_id(id).await? else {
            tracing::warn!(job_id = %id, "Cannot execute, job not found");
            return Ok(None);
        };
        if job.state != JobState::Pending {
            tracing::warn!(job_id = %id, state = %job.state, "Cannot execute, job is not pending");
            return Ok(None);
        }
        self.engine.execute_one(job).await.map(Some)
    }

    pub async fn reschedule(&self, id: &JobId, config: &JobConfig) -> SchedulerResult<u64> {
        self.lifecycle.reschedule(id, config).await
    }

    pub async fn remove(&self, id: &JobId) -> SchedulerResult<bool> {
        self.lifecycle.remove(id).await
    }

    pub async fn replicate(&self, id: &JobId, config: &JobConfig) -> SchedulerResult<Option<JobId>> {
        self.lifecycle.replicate(id, config).await
    }

    pub async fn clear(&self, filter: &ClearFilter) -> SchedulerResult<u64> {
        self.lifecycle.clear(filter).await
    }

    pub async fn find_one(&self, name: &str, args: Vec<Value>) -> SchedulerResult<Option<Job>> {
        self.lifecycle.find_one(name, args).await
    }

    pub async fn find_by_id(&self, id: &JobId) -> SchedulerResult<Option<Job>> {
        self.lifecycle.find_by_id(id).await
    }

    pub async fn find(&self, query: &JobQuery, options: &FindOptions) -> SchedulerResult<Vec<Job>> {
        self.lifecycle.find(query, options).await
    }

    pub async fn count(&self, name: &str, args: Vec<Value>) -> SchedulerResult<u64> {
        self.lifecycle.count(name, args).await
    }

    pub async fn count_pending(&self, name: &str, args: Vec<Value>) -> SchedulerResult<u64> {
        self.lifecycle.count_pending(name, args).await
    }
}

impl std::fmt::Debug for Jobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jobs")
            .field("elector", &self.elector)
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}
