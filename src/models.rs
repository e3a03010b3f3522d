//! Core data structures shared by the store, the scheduler and the CLI
//!
//! - [`Job`] - one durable record per scheduled unit of work
//! - [`JobState`] - lifecycle state of a job
//! - [`LeadershipRecord`] - the single heartbeat record all processes contend for

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Fixed id of the one leadership record shared by every process
pub const LEADERSHIP_RECORD_ID: &str = "dominatorId";

/// Truncate a timestamp to millisecond precision.
///
/// Every timestamp written to a store goes through this so that documents
/// read back from any backend compare equal to the ones that were written.
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(at)
}

// ============================================================================
// Job Identifier
// ============================================================================

/// Opaque job identifier assigned by the store on insert
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle state of a job
///
/// Removed jobs are deleted from the store, so there is no "removed" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its due date
    Pending,
    /// Handler resolved the job successfully
    Success,
    /// Handler failed, did not resolve, or was not registered
    Failure,
}

impl JobState {
    /// All states, in declaration order
    pub fn all() -> [JobState; 3] {
        [Self::Pending, Self::Success, Self::Failure]
    }

    /// States that `clear()` removes when no state filter is given
    pub fn finished() -> Vec<JobState> {
        vec![Self::Success, Self::Failure]
    }

    /// Stable string id used in storage and on the command line
    pub fn id(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Parse from a string id
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" | "failed" => Some(Self::Failure),
            _ => None,
        }
    }

    /// Whether the job has reached an outcome
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s).ok_or_else(|| {
            format!("Invalid job state '{s}'. Valid options: pending, success, failure")
        })
    }
}

// ============================================================================
// Job
// ============================================================================

/// A stored job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier
    pub id: JobId,

    /// Key into the handler registry
    pub name: String,

    /// Positional handler arguments
    #[serde(default)]
    pub arguments: Vec<Value>,

    /// Current lifecycle state
    pub state: JobState,

    /// Earliest time the job may run
    pub due: DateTime<Utc>,

    /// Higher runs first among equally-due jobs
    #[serde(default)]
    pub priority: i64,

    /// Creation time, never modified
    pub created: DateTime<Utc>,
}

impl Job {
    /// Attach an id to a new job document
    pub fn from_new(id: JobId, new_job: NewJob) -> Self {
        Self {
            id,
            name: new_job.name,
            arguments: new_job.arguments,
            state: new_job.state,
            due: new_job.due,
            priority: new_job.priority,
            created: new_job.created,
        }
    }

    /// Whether the job is pending and its due date has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.due <= now
    }

    /// Whether each given argument equals the argument at the same position.
    ///
    /// Positions beyond `prefix.len()` are not compared.
    pub fn matches_arguments(&self, prefix: &[Value]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, expected)| self.arguments.get(i) == Some(expected))
    }

    /// Format as a one-line display string
    pub fn display(&self) -> String {
        format!(
            "{} {:<8} {} prio={} {}({})",
            self.id,
            self.state,
            self.due.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.priority,
            self.name,
            self.arguments
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// A job document that has not been inserted yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub arguments: Vec<Value>,
    pub state: JobState,
    pub due: DateTime<Utc>,
    pub priority: i64,
    pub created: DateTime<Utc>,
}

impl NewJob {
    /// Create a pending job document
    pub fn pending(
        name: impl Into<String>,
        arguments: Vec<Value>,
        due: DateTime<Utc>,
        priority: i64,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments,
            state: JobState::Pending,
            due: truncate_millis(due),
            priority,
            created: truncate_millis(created),
        }
    }

    /// Copy an existing job into a fresh pending document due at `due`
    pub fn replica_of(job: &Job, due: DateTime<Utc>, created: DateTime<Utc>) -> Self {
        Self::pending(
            job.name.clone(),
            job.arguments.clone(),
            due,
            job.priority,
            created,
        )
    }
}

// ============================================================================
// Leadership Record
// ============================================================================

/// Heartbeat written by the process that currently dispatches jobs
///
/// Advisory only: two processes may briefly both believe they lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipRecord {
    /// Server id of the believed leader
    #[serde(rename = "serverId")]
    pub server_id: String,

    /// Time of the leader's most recent heartbeat
    pub date: DateTime<Utc>,
}

impl LeadershipRecord {
    /// Create a heartbeat for `server_id` at `date`
    pub fn new(server_id: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            server_id: server_id.into(),
            date: truncate_millis(date),
        }
    }

    /// Whether the heartbeat is older than `max_wait` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, max_wait: std::time::Duration) -> bool {
        let max_wait = TimeDelta::from_std(max_wait).unwrap_or(TimeDelta::MAX);
        match now.checked_sub_signed(max_wait) {
            Some(cutoff) => self.date < cutoff,
            None => false,
        }
    }

    /// Whether this heartbeat belongs to `server_id`
    pub fn is_owned_by(&self, server_id: &str) -> bool {
        self.server_id == server_id
    }
}

// ============================================================================
// Tests
// ============================================================================
