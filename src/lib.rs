//! jobwarden - distributed, store-backed job scheduler
//!
//! Jobs are named units of work with JSON arguments and a due date, kept in a
//! durable store shared by several server processes. One process at a time
//! leads: it heartbeats a shared record and executes due jobs. The others
//! watch the heartbeat and take over when it goes quiet.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Job and leadership documents
//! - [`store`] - Store traits plus in-memory and SQLite backends
//! - [`scheduler`] - Due dates, lifecycle, execution, observer, election
//! - [`jobs`] - The [`Jobs`] facade wiring it all together
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use jobwarden::prelude::*;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::open("data/jobs.db", std::time::Duration::from_millis(500))?;
//!     let jobs = Jobs::builder(store)
//!         .register("report", |ctx: JobContext, _args: Vec<Value>| async move {
//!             ctx.success().await?;
//!             anyhow::Ok(())
//!         })
//!         .build();
//!
//!     jobs.start().await?;
//!     jobs.run("report", vec![json!({"on": {"hour": 6, "minute": 0}})]).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::jobs::{Jobs, JobsBuilder};
    pub use crate::models::{Job, JobId, JobState, LeadershipRecord};
    pub use crate::scheduler::{
        ClearFilter, EnqueueOutcome, ExecutionOutcome, JobConfig, JobContext, JobHandler,
        LeadershipState, SchedulerError, SchedulerResult, SchedulerSettings, ServerIdSource,
    };
    pub use crate::store::{FindOptions, JobQuery, JobSort, MemoryStore, SqliteStore};
}

// Direct re-exports for convenience
pub use jobs::{Jobs, JobsBuilder};
pub use models::{Job, JobId, JobState};
pub use scheduler::{SchedulerError, SchedulerResult};
pub use store::{StoreError, StoreResult};
