//! Result-set watchers shared by the store backends
//!
//! Each watcher remembers the last result set it reported. After a write the
//! backend re-evaluates every watcher's view and the difference is pushed to
//! the subscriber as removed, added and changed events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{ChangeEvent, Subscription};
use crate::models::{Job, LeadershipRecord, LEADERSHIP_RECORD_ID};

/// A document with a stable identity inside its collection
pub(crate) trait Document: Clone + PartialEq + Send + 'static {
    fn key(&self) -> &str;
}

impl Document for Job {
    fn key(&self) -> &str {
        self.id.as_str()
    }
}

impl Document for LeadershipRecord {
    fn key(&self) -> &str {
        LEADERSHIP_RECORD_ID
    }
}

struct Watcher<T, S> {
    id: u64,
    view: S,
    snapshot: Vec<T>,
    tx: mpsc::UnboundedSender<ChangeEvent<T>>,
}

/// Set of live watchers over one collection
pub(crate) struct WatchRegistry<T, S> {
    watchers: Mutex<Vec<Watcher<T, S>>>,
    next_id: AtomicU64,
}

impl<T: Document, S> WatchRegistry<T, S> {
    pub(crate) fn new() -> Self {
        Self {
            watchers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a watcher whose current result set is `initial`.
    ///
    /// With `emit_initial` the subscriber first receives every document of
    /// `initial` as an added event.
    pub(crate) fn register(&self, view: S, initial: Vec<T>, emit_initial: bool) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if emit_initial {
            for doc in &initial {
                let _ = tx.send(ChangeEvent::Added(doc.clone()));
            }
        }

        let watcher = Watcher {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            view,
            snapshot: initial,
            tx,
        };
        self.lock().push(watcher);

        Subscription::new(rx)
    }

    /// Re-evaluate every watcher and push the differences.
    ///
    /// `evaluate` returns `None` when a view could not be computed; that
    /// watcher keeps its old snapshot and is retried on the next write.
    pub(crate) fn notify(&self, mut evaluate: impl FnMut(&S) -> Option<Vec<T>>) {
        let mut watchers = self.lock();
        watchers.retain(|w| !w.tx.is_closed());

        for watcher in watchers.iter_mut() {
            let Some(next) = evaluate(&watcher.view) else {
                tracing::warn!(watcher = watcher.id, "Failed to evaluate watched view");
                continue;
            };
            for event in diff(&watcher.snapshot, &next) {
                if watcher.tx.send(event).is_err() {
                    break;
                }
            }
            watcher.snapshot = next;
        }

        watchers.retain(|w| !w.tx.is_closed());
    }

    /// Whether no subscriber is listening
    pub(crate) fn is_idle(&self) -> bool {
        let mut watchers = self.lock();
        watchers.retain(|w| !w.tx.is_closed());
        watchers.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Watcher<T, S>>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Events turning `old` into `new`: removals first, then additions and
/// modifications in the order of `new`.
fn diff<T: Document>(old: &[T], new: &[T]) -> Vec<ChangeEvent<T>> {
    let mut events = Vec::new();

    for doc in old {
        if !new.iter().any(|n| n.key() == doc.key()) {
            events.push(ChangeEvent::Removed(doc.clone()));
        }
    }

    for doc in new {
        match old.iter().find(|o| o.key() == doc.key()) {
            None => events.push(ChangeEvent::Added(doc.clone())),
            Some(previous) if previous != doc => events.push(ChangeEvent::Changed(doc.clone())),
            Some(_) => {}
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobId, JobState, NewJob};
    use chrono::{TimeZone, Utc};

    fn job(id: &str) -> Job {
        let at = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        Job::from_new(JobId::from(id), NewJob::pending("x", vec![], at, 0, at))
    }

    #[test]
    fn test_diff_reports_removed_added_changed() {
        let a = job("a");
        let b = job("b");
        let mut b2 = b.clone();
        b2.state = JobState::Success;
        let c = job("c");

        let events = diff(&[a.clone(), b], &[b2.clone(), c.clone()]);
        assert_eq!(
            events,
            vec![
                ChangeEvent::Removed(a),
                ChangeEvent::Changed(b2),
                ChangeEvent::Added(c),
            ]
        );
    }

    #[test]
    fn test_diff_unchanged_is_silent() {
        let a = job("a");
        assert!(diff(&[a.clone()], &[a]).is_empty());
    }

    #[tokio::test]
    async fn test_registry_emits_initial_and_changes() {
        let registry: WatchRegistry<Job, ()> = WatchRegistry::new();
        let a = job("a");
        let mut sub = registry.register((), vec![a.clone()], true);
        assert_eq!(sub.recv().await, Some(ChangeEvent::Added(a.clone())));

        let b = job("b");
        registry.notify(|_| Some(vec![b.clone()]));
        assert_eq!(sub.recv().await, Some(ChangeEvent::Removed(a)));
        assert_eq!(sub.recv().await, Some(ChangeEvent::Added(b)));
    }

    #[tokio::test]
    async fn test_registry_drops_stopped_watchers() {
        let registry: WatchRegistry<Job, ()> = WatchRegistry::new();
        let sub = registry.register((), vec![], false);
        assert!(!registry.is_idle());

        sub.stop();
        assert!(registry.is_idle());
    }
}
