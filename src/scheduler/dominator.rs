//! Leader election over a shared heartbeat record
//!
//! Every process runs a [`LeaderElector`]. The leader upserts the single
//! leadership record every `max_wait * 0.8` and runs the job observer. Every
//! other process watches the record and arms a takeover timer of `max_wait`
//! whenever a foreign heartbeat arrives; if the timer fires before the next
//! heartbeat, it takes control.
//!
//! On start the elector takes control right away when:
//! - no record exists (fresh installation)
//! - the record carries its own server id (restart)
//! - the record is older than `max_wait` (stale heartbeat)
//!
//! A leader that sees a foreign heartbeat replace its own relinquishes
//! control. The record is advisory: two processes may briefly both lead.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::clock::SharedClock;
use super::observer::JobObserver;
use super::settings::SchedulerSettings;
use crate::metrics;
use crate::models::LeadershipRecord;
use crate::store::{LeaderStore, Subscription};

/// Delay before retrying a failed store call
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fallback timer horizon when a deadline does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Role of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// Not started, or stopped
    Stopped,
    /// Started, waiting for the startup delay and the first record read
    Initializing,
    /// Heartbeating and running the job observer
    Leader,
    /// Watching another process's heartbeat
    Follower,
}

/// Why this process took control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverReason {
    /// No leadership record existed
    FreshInstallation,
    /// The record carried this process's own server id
    Restarted,
    /// The record was older than `max_wait` at start
    StaleHeartbeat,
    /// No heartbeat arrived within `max_wait` of the last one
    TakeoverTimeout,
}

impl TakeoverReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FreshInstallation => "fresh_installation",
            Self::Restarted => "restarted",
            Self::StaleHeartbeat => "stale_heartbeat",
            Self::TakeoverTimeout => "takeover_timeout",
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    server_id: String,
}

struct Core {
    store: Arc<dyn LeaderStore>,
    observer: Arc<JobObserver>,
    clock: SharedClock,
    settings: SchedulerSettings,
    state: watch::Sender<LeadershipState>,
}

/// Heartbeat-based leader elector driving the job observer
pub struct LeaderElector {
    core: Arc<Core>,
    running: Mutex<Option<Running>>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn LeaderStore>,
        observer: Arc<JobObserver>,
        clock: SharedClock,
        settings: SchedulerSettings,
    ) -> Self {
        let (state, _) = watch::channel(LeadershipState::Stopped);
        Self {
            core: Arc::new(Core {
                store,
                observer,
                clock,
                settings,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current role
    pub fn state(&self) -> LeadershipState {
        *self.core.state.borrow()
    }

    /// Receiver for role changes
    pub fn subscribe_state(&self) -> watch::Receiver<LeadershipState> {
        self.core.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeadershipState::Leader
    }

    /// Server id of the current run
    pub fn server_id(&self) -> Option<String> {
        self.lock().as_ref().map(|r| r.server_id.clone())
    }

    pub fn observer(&self) -> &Arc<JobObserver> {
        &self.core.observer
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.core.settings
    }

    /// Resolve the server id and start electing.
    ///
    /// The first leadership decision happens after the startup delay.
    /// Calling `start` while running returns the current server id.
    pub fn start(&self) -> String {
        let mut running = self.lock();
        if let Some(ref r) = *running {
            if !r.handle.is_finished() {
                return r.server_id.clone();
            }
        }

        let server_id = self.core.settings.server_id.resolve();
        tracing::info!(server_id = %server_id, "Starting leader elector");
        self.core.state.send_replace(LeadershipState::Initializing);

        let cancel = CancellationToken::new();
        let election = Election {
            core: self.core.clone(),
            server_id: server_id.clone(),
            last_seen: None,
            leading: false,
            heartbeat: None,
            takeover_at: None,
        };
        let handle = tokio::spawn(election.run(cancel.clone()));

        *running = Some(Running {
            cancel,
            handle,
            server_id: server_id.clone(),
        });
        server_id
    }

    /// Stop electing. A leader relinquishes control; the record is left in
    /// place so a restart under the same server id resumes.
    pub async fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "Leader elector task failed");
        }
        self.core.state.send_replace(LeadershipState::Stopped);
        tracing::info!(server_id = %running.server_id, "Leader elector stopped");
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("state", &self.state())
            .field("server_id", &self.server_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Election Loop
// ============================================================================

struct Election {
    core: Arc<Core>,
    server_id: String,
    last_seen: Option<LeadershipRecord>,
    leading: bool,
    heartbeat: Option<Interval>,
    takeover_at: Option<Instant>,
}

impl Election {
    async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.core.settings.startup_delay) => {}
        }

        let Some((mut subscription, record)) = self.connect(&cancel).await else {
            return;
        };
        self.decide(record).await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = subscription.recv() => match event {
                    Some(event) => self.on_change(event.into_document()).await,
                    None => {
                        tracing::warn!("Leadership subscription closed, resubscribing");
                        let Some((next, record)) = self.connect(&cancel).await else {
                            break;
                        };
                        subscription = next;
                        if let Some(record) = record {
                            self.on_change(record).await;
                        }
                    }
                },

                _ = next_tick(&mut self.heartbeat) => self.ping().await,

                _ = sleep_until(self.takeover_at) => {
                    self.take_control(TakeoverReason::TakeoverTimeout).await;
                }
            }
        }

        subscription.stop();
        if self.leading {
            self.relinquish_control().await;
        }
    }

    /// Subscribe to the record, then read it, retrying until cancelled
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(Subscription<LeadershipRecord>, Option<LeadershipRecord>)> {
        loop {
            let attempt = async {
                let subscription = self.core.store.watch_leader().await?;
                let record = self.core.store.read_leader().await?;
                Ok::<_, crate::store::StoreError>((subscription, record))
            };
            match attempt.await {
                Ok(connected) => return Some(connected),
                Err(e) => tracing::error!(error = %e, "Failed to read leadership record"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    async fn decide(&mut self, record: Option<LeadershipRecord>) {
        let now = self.core.clock.now();
        tracing::info!(
            server_id = %self.server_id,
            record = ?record,
            "Deciding leadership at startup"
        );

        match record {
            None => self.take_control(TakeoverReason::FreshInstallation).await,
            Some(record) if record.is_owned_by(&self.server_id) => {
                self.last_seen = Some(record);
                self.take_control(TakeoverReason::Restarted).await;
            }
            Some(record) if record.is_stale(now, self.core.settings.effective_max_wait()) => {
                self.last_seen = Some(record);
                self.take_control(TakeoverReason::StaleHeartbeat).await;
            }
            Some(record) => self.on_change(record).await,
        }
    }

    async fn on_change(&mut self, record: LeadershipRecord) {
        tracing::debug!(server_id = %record.server_id, date = %record.date, "Leadership record changed");

        let was_ours = self
            .last_seen
            .as_ref()
            .is_some_and(|seen| seen.is_owned_by(&self.server_id));
        let is_ours = record.is_owned_by(&self.server_id);

        if was_ours && !is_ours && self.leading {
            tracing::info!(usurper = %record.server_id, "Another server has taken control");
            self.relinquish_control().await;
        }

        self.takeover_at = None;
        if !is_ours {
            self.takeover_at = Some(deadline_after(self.core.settings.effective_max_wait()));
            if !self.leading {
                self.set_state(LeadershipState::Follower);
            }
        }
        self.last_seen = Some(record);
    }

    async fn take_control(&mut self, reason: TakeoverReason) {
        tracing::info!(server_id = %self.server_id, reason = reason.label(), "Taking control");

        self.takeover_at = None;
        self.ping().await;

        if self.heartbeat.is_none() {
            let period = self.core.settings.heartbeat_interval().max(Duration::from_millis(1));
            let mut interval = tokio::time::interval_at(deadline_after(period), period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.heartbeat = Some(interval);
        }

        if !self.leading {
            self.leading = true;
            self.set_state(LeadershipState::Leader);
            metrics::record_leadership(reason.label(), true);
        }
        self.core.observer.start();
    }

    async fn relinquish_control(&mut self) {
        tracing::info!(server_id = %self.server_id, "Relinquishing control");

        self.heartbeat = None;
        self.leading = false;
        self.set_state(LeadershipState::Follower);
        metrics::record_leadership("relinquished", false);
        self.core.observer.stop().await;
    }

    async fn ping(&self) {
        let record = LeadershipRecord::new(self.server_id.clone(), self.core.clock.now());
        match self.core.store.upsert_leader(&record).await {
            Ok(()) => {
                tracing::debug!(server_id = %self.server_id, date = %record.date, "Heartbeat written");
                metrics::record_heartbeat(true);
            }
            Err(e) => {
                tracing::error!(server_id = %self.server_id, error = %e, "Failed to write heartbeat");
                metrics::record_heartbeat(false);
            }
        }
    }

    fn set_state(&self, state: LeadershipState) {
        self.core.state.send_replace(state);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// `now + duration`, or a deadline decades away when that overflows
fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
