//! Common test utilities

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use jobwarden::scheduler::{
    DueDateResolver, JobContext, JobHandler, JobLifecycle, SharedClock, TokioClock,
};
use jobwarden::store::{JobStore, MemoryStore, SqliteStore};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wall-clock time every test starts at
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
}

/// Clock driven by the (paused) tokio timer
pub fn test_clock() -> SharedClock {
    Arc::new(TokioClock::starting_at(start_time()))
}

/// A lifecycle over each store backend
pub fn lifecycles(clock: &SharedClock) -> Vec<(&'static str, Arc<JobLifecycle>)> {
    let memory: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn JobStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    vec![
        (
            "memory",
            Arc::new(JobLifecycle::new(memory, clock.clone(), DueDateResolver::utc())),
        ),
        (
            "sqlite",
            Arc::new(JobLifecycle::new(sqlite, clock.clone(), DueDateResolver::utc())),
        ),
    ]
}

/// Let spawned tasks run without advancing time
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records the arguments of every execution, in order
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that records the call and resolves the job successfully
    pub fn succeeding(&self, name: &str) -> impl JobHandler {
        let calls = self.calls.clone();
        let name = name.to_string();
        move |ctx: JobContext, args: Vec<Value>| {
            let calls = calls.clone();
            let name = name.clone();
            async move {
                calls.lock().unwrap().push((name, args));
                ctx.success().await?;
                anyhow::Ok(())
            }
        }
    }

    /// Handler that records the call and returns without resolving
    pub fn forgetful(&self, name: &str) -> impl JobHandler {
        let calls = self.calls.clone();
        let name = name.to_string();
        move |_ctx: JobContext, args: Vec<Value>| {
            let calls = calls.clone();
            let name = name.clone();
            async move {
                calls.lock().unwrap().push((name, args));
                anyhow::Ok(())
            }
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    /// First argument of every call
    pub fn first_args(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|(_, args)| args.into_iter().next())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}
