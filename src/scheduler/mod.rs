//! Distributed job scheduling
//!
//! Several server processes share one durable job queue. Exactly one of them,
//! the leader, dispatches due jobs; the others stand by and take over when the
//! leader's heartbeat goes quiet.
//!
//! # Overview
//!
//! Two control loops carry the design:
//!
//! - **Leader election** ([`LeaderElector`]) - heartbeat-based failover over a
//!   single shared record, with no consensus protocol and no shared clock
//! - **Job observation** ([`JobObserver`]) - a single wake timer for the next
//!   due job, then a sequential drain of every due job in (due, priority
//!   desc) order
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Server process                       │
//! │  ┌───────────────┐  start/stop  ┌──────────────┐             │
//! │  │ LeaderElector │─────────────►│  JobObserver │             │
//! │  └───────┬───────┘              └──────┬───────┘             │
//! │          │ heartbeat                   │ due jobs            │
//! │          │                      ┌──────▼──────────┐          │
//! │          │                      │ ExecutionEngine │─► handlers│
//! │          │                      └──────┬──────────┘          │
//! │          │                      ┌──────▼───────┐  enqueue    │
//! │          │                      │ JobLifecycle │◄─── app     │
//! │          │                      └──────┬───────┘             │
//! └──────────┼─────────────────────────────┼─────────────────────┘
//!            ▼                             ▼
//!      ┌───────────────── durable store ─────────────────┐
//!      │  leadership record          jobs (name,due,state)│
//!      └──────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`due`] - due-date resolution from `date`/`in`/`on` configs
//! - [`options`] - per-job scheduling options
//! - [`lifecycle`] - enqueue, dedup guards, reschedule, clear
//! - [`registry`] - handler registry
//! - [`execution`] - single-job execution and outcome enforcement
//! - [`observer`] - wake timer and drain loop
//! - [`dominator`] - leader election
//! - [`settings`] - runtime settings
//! - [`clock`] - wall-clock sources
//!
//! # Settings
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `max_wait` | 5 min | Silence before another process takes over |
//! | `startup_delay` | 1 s | Delay before the first leadership decision |
//! | `server_id` | random | Literal id, generator, or random per start |
//! | `utc_offset` | UTC | Time zone for calendar fields in due dates |

pub mod clock;
pub mod dominator;
pub mod due;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod observer;
pub mod options;
pub mod registry;
pub mod settings;

// Re-export main types
pub use clock::{Clock, SharedClock, SystemClock, TokioClock};
pub use dominator::{LeaderElector, LeadershipState, TakeoverReason};
pub use due::{Adjustment, DateUnit, DueDateResolver};
pub use error::{SchedulerError, SchedulerResult};
pub use execution::{ExecutionEngine, ExecutionOutcome, JobContext, Resolution};
pub use lifecycle::{
    CallbackOutcome, ClearFilter, DedupRejection, EnqueueOutcome, JobLifecycle, NameSelector,
    StateSelector,
};
pub use observer::{DrainReport, JobObserver, ObserverState};
pub use options::{is_config, split_config, JobCallback, JobConfig};
pub use registry::{HandlerRegistry, JobHandler};
pub use settings::{random_server_id, SchedulerSettings, ServerIdSource};
