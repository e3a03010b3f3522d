//! Job creation, dedup guards, state transitions and queue maintenance
//!
//! [`JobLifecycle`] is the single writer of job documents. Application code
//! uses it to enqueue and manage jobs, and the execution engine uses it to
//! record outcomes.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::clock::SharedClock;
use super::due::DueDateResolver;
use super::error::{SchedulerError, SchedulerResult};
use super::options::{split_config, JobConfig};
use crate::metrics;
use crate::models::{Job, JobId, JobState, NewJob};
use crate::store::{FindOptions, JobQuery, JobStore, JobUpdate};

// ============================================================================
// Outcomes
// ============================================================================

/// Why an enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupRejection {
    /// A job with the same name and arguments exists in any state
    Unique,
    /// A pending job with the same name and arguments exists
    Singular,
}

impl DedupRejection {
    /// Guard name, as used in logs and metrics
    pub fn guard(&self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::Singular => "singular",
        }
    }
}

impl fmt::Display for DedupRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unique => f.write_str("Unique job already exists"),
            Self::Singular => f.write_str("Singular job already exists"),
        }
    }
}

/// Result of an enqueue
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// The job was inserted
    Scheduled(Job),
    /// A dedup guard refused the job, nothing was inserted
    Rejected(DedupRejection),
}

impl EnqueueOutcome {
    /// The inserted job, if any
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Scheduled(job) => Some(job),
            Self::Rejected(_) => None,
        }
    }

    /// Consume the outcome, returning the inserted job
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Scheduled(job) => Some(job),
            Self::Rejected(_) => None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }
}

/// What a [`JobConfig`] callback is told
#[derive(Debug)]
pub enum CallbackOutcome<'a> {
    /// Enqueue inserted this job
    Enqueued(&'a Job),
    /// Enqueue was refused
    Rejected(DedupRejection),
    /// Reschedule finished; `failed` when no pending job matched
    Rescheduled { failed: bool, count: u64 },
}

// ============================================================================
// Clear Filters
// ============================================================================

/// Which states `clear` removes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StateSelector {
    /// Every state (`"*"`)
    Any,
    /// Only these states
    Only(Vec<JobState>),
    /// Success and failure
    #[default]
    Finished,
}

impl StateSelector {
    /// Parse `"*"` or a comma separated list of states
    pub fn parse(input: &str) -> SchedulerResult<Self> {
        if input.trim() == "*" {
            return Ok(Self::Any);
        }
        let states = input
            .split(',')
            .map(|s| s.parse::<JobState>().map_err(SchedulerError::invalid_argument))
            .collect::<SchedulerResult<Vec<_>>>()?;
        Ok(Self::Only(states))
    }

    fn states(&self) -> Option<Vec<JobState>> {
        match self {
            Self::Any => None,
            Self::Only(states) => Some(states.clone()),
            Self::Finished => Some(JobState::finished()),
        }
    }
}

/// Which job names `clear` removes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NameSelector {
    #[default]
    Any,
    Only(Vec<String>),
}

impl NameSelector {
    pub fn one(name: impl Into<String>) -> Self {
        Self::Only(vec![name.into()])
    }
}

/// Filter for bulk deletion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearFilter {
    pub states: StateSelector,
    pub names: NameSelector,
    pub arguments: Vec<Value>,
}

impl ClearFilter {
    /// Finished jobs of every name
    pub fn finished() -> Self {
        Self::default()
    }

    pub fn new(states: StateSelector, names: NameSelector) -> Self {
        Self {
            states,
            names,
            arguments: Vec::new(),
        }
    }

    /// Restrict by leading positional arguments
    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    fn to_query(&self) -> JobQuery {
        let mut query = JobQuery::all().with_arguments(self.arguments.clone());
        query.states = self.states.states();
        if let NameSelector::Only(ref names) = self.names {
            query.names = Some(names.clone());
        }
        query
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Creates and transitions job documents
pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    clock: SharedClock,
    resolver: DueDateResolver,
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn JobStore>, clock: SharedClock, resolver: DueDateResolver) -> Self {
        Self {
            store,
            clock,
            resolver,
        }
    }

    /// Underlying job store
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Current time on the scheduler clock
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Enqueue with loose positional arguments.
    ///
    /// A trailing JSON object carrying a truthy config key is taken as the
    /// job config; anything else stays a plain argument.
    pub async fn run(&self, name: &str, args: Vec<Value>) -> SchedulerResult<EnqueueOutcome> {
        let (args, config) = split_config(args)?;
        self.enqueue(name, args, config).await
    }

    /// Enqueue a job
    pub async fn enqueue(
        &self,
        name: &str,
        arguments: Vec<Value>,
        config: Option<JobConfig>,
    ) -> SchedulerResult<EnqueueOutcome> {
        if name.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("job name must not be empty"));
        }
        let config = config.unwrap_or_default();

        if let Some(rejection) = self.check_guards(name, &arguments, &config).await? {
            tracing::info!(name, guard = rejection.guard(), "{}", rejection);
            metrics::record_rejection(rejection.guard());
            config.notify(&CallbackOutcome::Rejected(rejection));
            return Ok(EnqueueOutcome::Rejected(rejection));
        }

        let now = self.clock.now();
        let due = if config.has_schedule() {
            self.resolver.resolve(&config, now)
        } else {
            now
        };
        let new_job = NewJob::pending(name, arguments, due, config.priority.unwrap_or(0), now);

        let id = self.store.insert(new_job.clone()).await?;
        let job = Job::from_new(id, new_job);
        tracing::debug!(job_id = %job.id, name, due = %job.due, priority = job.priority, "Job enqueued");
        metrics::record_enqueued(name);

        config.notify(&CallbackOutcome::Enqueued(&job));
        Ok(EnqueueOutcome::Scheduled(job))
    }

    // Guard and insert are separate store calls; two concurrent enqueues can
    // both pass the guard.
    async fn check_guards(
        &self,
        name: &str,
        arguments: &[Value],
        config: &JobConfig,
    ) -> SchedulerResult<Option<DedupRejection>> {
        if config.unique && self.count(name, arguments.to_vec()).await? > 0 {
            return Ok(Some(DedupRejection::Unique));
        }
        if config.singular && self.count_pending(name, arguments.to_vec()).await? > 0 {
            return Ok(Some(DedupRejection::Singular));
        }
        Ok(None)
    }

    fn named(name: &str, arguments: Vec<Value>) -> JobQuery {
        JobQuery::named(name).with_arguments(arguments)
    }

    /// First job, in creation order, matching name and leading arguments
    pub async fn find_one(&self, name: &str, arguments: Vec<Value>) -> SchedulerResult<Option<Job>> {
        Ok(self.store.find_one(&Self::named(name, arguments)).await?)
    }

    /// Job by id
    pub async fn find_by_id(&self, id: &JobId) -> SchedulerResult<Option<Job>> {
        Ok(self.store.find_one(&JobQuery::by_id(id)).await?)
    }

    /// Jobs matching an arbitrary query
    pub async fn find(&self, query: &JobQuery, options: &FindOptions) -> SchedulerResult<Vec<Job>> {
        Ok(self.store.find(query, options).await?)
    }

    /// Jobs in any state matching name and leading arguments
    pub async fn count(&self, name: &str, arguments: Vec<Value>) -> SchedulerResult<u64> {
        Ok(self.store.count(&Self::named(name, arguments)).await?)
    }

    /// Pending jobs matching name and leading arguments
    pub async fn count_pending(&self, name: &str, arguments: Vec<Value>) -> SchedulerResult<u64> {
        let query = Self::named(name, arguments).with_state(JobState::Pending);
        Ok(self.store.count(&query).await?)
    }

    /// Delete every job matching the filter, returning the count
    pub async fn clear(&self, filter: &ClearFilter) -> SchedulerResult<u64> {
        let removed = self.store.remove(&filter.to_query()).await?;
        tracing::info!(removed, states = ?filter.states, names = ?filter.names, "Cleared jobs");
        Ok(removed)
    }

    /// Move a pending job's due date (and priority when given).
    ///
    /// Returns the number of jobs updated: 0 when the job is missing or no
    /// longer pending.
    pub async fn reschedule(&self, id: &JobId, config: &JobConfig) -> SchedulerResult<u64> {
        let due = self.resolver.resolve(config, self.clock.now());
        let update = JobUpdate::due(due).with_priority(config.priority);
        let query = JobQuery::by_id(id).with_state(JobState::Pending);

        let count = self.store.update(&query, &update).await?;
        tracing::debug!(job_id = %id, due = %due, count, "Rescheduled job");

        config.notify(&CallbackOutcome::Rescheduled {
            failed: count == 0,
            count,
        });
        Ok(count)
    }

    /// Delete a job regardless of state
    pub async fn remove(&self, id: &JobId) -> SchedulerResult<bool> {
        let count = self.store.remove(&JobQuery::by_id(id)).await?;
        tracing::debug!(job_id = %id, count, "Removed job");
        Ok(count > 0)
    }

    /// Insert a pending copy of a job due per `config`.
    ///
    /// Returns the new id, or `None` when the source job does not exist.
    pub async fn replicate(&self, id: &JobId, config: &JobConfig) -> SchedulerResult<Option<JobId>> {
        let Some(source) = self.find_by_id(id).await? else {
            tracing::warn!(job_id = %id, "Cannot replicate, job not found");
            return Ok(None);
        };

        let now = self.clock.now();
        let due = self.resolver.resolve(config, now);
        let new_id = self.store.insert(NewJob::replica_of(&source, due, now)).await?;
        tracing::debug!(job_id = %id, new_job_id = %new_id, due = %due, "Replicated job");
        metrics::record_enqueued(&source.name);

        Ok(Some(new_id))
    }

    /// Move a pending job into a terminal state, returning the match count
    pub(crate) async fn set_state(&self, id: &JobId, state: JobState) -> SchedulerResult<u64> {
        let query = JobQuery::by_id(id).with_state(JobState::Pending);
        let count = self.store.update(&query, &JobUpdate::state(state)).await?;
        if count == 0 {
            tracing::debug!(job_id = %id, %state, "Job was not pending, state left unchanged");
        } else {
            tracing::debug!(job_id = %id, %state, "Job state set");
        }
        Ok(count)
    }
}

impl fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}
