//! Durable store contracts and backends
//!
//! The scheduler never talks to a database directly. It relies on two small
//! contracts:
//!
//! - [`JobStore`] - indexed query, conditional update, removal and a live
//!   change subscription over the job queue
//! - [`LeaderStore`] - read, upsert and watch the single leadership record
//!
//! Two backends implement both:
//!
//! - [`MemoryStore`] - in-process, clones share state (tests, single node)
//! - [`SqliteStore`] - durable SQLite file shared by several processes
//!
//! # Change subscriptions
//!
//! [`JobStore::watch`] returns a [`Subscription`] that first reports the
//! current result set as [`ChangeEvent::Added`] and then every difference in
//! that result set caused by later writes. Dropping or stopping the
//! subscription cancels it.

pub mod error;
pub mod memory;
pub mod sqlite;
mod watch;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use tokio::sync::mpsc;

use crate::models::{Job, JobId, JobState, LeadershipRecord, NewJob};

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ============================================================================
// Queries
// ============================================================================

/// Filter over job documents
///
/// Every populated field must match. `arguments` is compared position by
/// position, so a shorter list matches any job whose leading arguments agree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    pub id: Option<JobId>,
    pub names: Option<Vec<String>>,
    pub states: Option<Vec<JobState>>,
    pub arguments: Vec<Value>,
    pub due_by: Option<DateTime<Utc>>,
}

impl JobQuery {
    /// Match every job
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one job by id
    pub fn by_id(id: &JobId) -> Self {
        Self {
            id: Some(id.clone()),
            ..Self::default()
        }
    }

    /// Match pending jobs
    pub fn pending() -> Self {
        Self::default().with_state(JobState::Pending)
    }

    /// Match jobs with this name
    pub fn named(name: impl Into<String>) -> Self {
        Self::default().with_names([name.into()])
    }

    /// Restrict to a single state
    pub fn with_state(self, state: JobState) -> Self {
        self.with_states([state])
    }

    /// Restrict to any of these states
    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    /// Restrict to any of these names
    pub fn with_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.names = Some(names.into_iter().collect());
        self
    }

    /// Restrict by leading positional arguments
    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Restrict to jobs due at or before `at`
    pub fn due_by(mut self, at: DateTime<Utc>) -> Self {
        self.due_by = Some(at);
        self
    }

    /// Whether the job satisfies every populated field
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ref id) = self.id {
            if &job.id != id {
                return false;
            }
        }
        if let Some(ref names) = self.names {
            if !names.iter().any(|n| n == &job.name) {
                return false;
            }
        }
        if let Some(ref states) = self.states {
            if !states.contains(&job.state) {
                return false;
            }
        }
        if let Some(due_by) = self.due_by {
            if job.due > due_by {
                return false;
            }
        }
        job.matches_arguments(&self.arguments)
    }
}

/// Result ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobSort {
    /// Creation order
    #[default]
    Created,
    /// Due ascending
    Due,
    /// Due ascending, then priority descending
    DueThenPriority,
}

impl JobSort {
    /// Compare two jobs under this ordering.
    ///
    /// Ties fall back to creation time. Backends hand documents over in
    /// insertion order and sort stably, so remaining ties keep that order.
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let primary = match self {
            Self::Created => Ordering::Equal,
            Self::Due => a.due.cmp(&b.due),
            Self::DueThenPriority => a.due.cmp(&b.due).then(b.priority.cmp(&a.priority)),
        };
        primary.then(a.created.cmp(&b.created))
    }
}

/// Sort and limit applied to a query result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: JobSort,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Options with the given ordering and no limit
    pub fn sorted(sort: JobSort) -> Self {
        Self { sort, limit: None }
    }

    /// Keep at most `limit` documents
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sort and truncate an unordered result set
    pub fn apply(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| self.sort.compare(a, b));
        if let Some(limit) = self.limit {
            jobs.truncate(limit);
        }
        jobs
    }
}

/// A query plus its ordering, evaluated against a document set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobView {
    pub query: JobQuery,
    pub options: FindOptions,
}

impl JobView {
    /// Evaluate the view over a set of documents
    pub fn evaluate<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> Vec<Job> {
        let matched = jobs
            .into_iter()
            .filter(|job| self.query.matches(job))
            .cloned()
            .collect();
        self.options.apply(matched)
    }
}

/// Fields set by a conditional update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub due: Option<DateTime<Utc>>,
    pub priority: Option<i64>,
}

impl JobUpdate {
    /// Set the state
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Set the due date
    pub fn due(due: DateTime<Utc>) -> Self {
        Self {
            due: Some(crate::models::truncate_millis(due)),
            ..Self::default()
        }
    }

    /// Also set the priority
    pub fn with_priority(mut self, priority: Option<i64>) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the update changes nothing
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.due.is_none() && self.priority.is_none()
    }

    /// Apply the update to a document in place
    pub fn apply(&self, job: &mut Job) {
        if let Some(state) = self.state {
            job.state = state;
        }
        if let Some(due) = self.due {
            job.due = due;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
    }
}

// ============================================================================
// Change Subscriptions
// ============================================================================

/// A change in a watched result set
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<T> {
    /// A document entered the result set
    Added(T),
    /// A document in the result set was modified
    Changed(T),
    /// A document left the result set
    Removed(T),
}

impl<T> ChangeEvent<T> {
    /// The document carried by the event
    pub fn document(&self) -> &T {
        match self {
            Self::Added(doc) | Self::Changed(doc) | Self::Removed(doc) => doc,
        }
    }

    /// Consume the event, returning its document
    pub fn into_document(self) -> T {
        match self {
            Self::Added(doc) | Self::Changed(doc) | Self::Removed(doc) => doc,
        }
    }
}

/// Live subscription handle
///
/// Events are delivered in write order. The subscription ends when it is
/// stopped or dropped, or when the store goes away.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<ChangeEvent<T>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ChangeEvent<T>>) -> Self {
        Self { rx }
    }

    /// Wait for the next event, `None` once the store side is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent<T>> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<ChangeEvent<T>> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription
    pub fn stop(mut self) {
        self.rx.close();
    }
}

// ============================================================================
// Store Contracts
// ============================================================================

/// Durable job queue
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a document, returning its new id
    async fn insert(&self, job: NewJob) -> StoreResult<JobId>;

    /// First matching document in creation order
    async fn find_one(&self, query: &JobQuery) -> StoreResult<Option<Job>>;

    /// All matching documents, sorted and limited
    async fn find(&self, query: &JobQuery, options: &FindOptions) -> StoreResult<Vec<Job>>;

    /// Number of matching documents
    async fn count(&self, query: &JobQuery) -> StoreResult<u64>;

    /// Apply `update` to every matching document, returning the match count
    async fn update(&self, query: &JobQuery, update: &JobUpdate) -> StoreResult<u64>;

    /// Delete every matching document, returning the removed count
    async fn remove(&self, query: &JobQuery) -> StoreResult<u64>;

    /// Subscribe to changes in the result set of `query` under `options`
    async fn watch(&self, query: JobQuery, options: FindOptions) -> StoreResult<Subscription<Job>>;
}

/// Storage for the single leadership record
#[async_trait]
pub trait LeaderStore: Send + Sync {
    /// Current leadership record, if any
    async fn read_leader(&self) -> StoreResult<Option<LeadershipRecord>>;

    /// Create or overwrite the leadership record
    async fn upsert_leader(&self, record: &LeadershipRecord) -> StoreResult<()>;

    /// Delete leadership records stored under any id other than the fixed one
    async fn purge_foreign_leaders(&self) -> StoreResult<u64>;

    /// Subscribe to writes of the leadership record made after this call
    async fn watch_leader(&self) -> StoreResult<Subscription<LeadershipRecord>>;
}

/// A backend that stores both jobs and the leadership record
pub trait Store: JobStore + LeaderStore {}

impl<T: JobStore + LeaderStore> Store for T {}

// ============================================================================
// Tests
// ============================================================================
