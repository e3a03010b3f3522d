//! In-process store
//!
//! Clones share the same documents, so several scheduler instances inside one
//! process can contend for leadership over a single `MemoryStore`.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use super::watch::WatchRegistry;
use super::{
    FindOptions, JobQuery, JobStore, JobUpdate, JobView, LeaderStore, StoreError, StoreResult,
    Subscription,
};
use crate::models::{Job, JobId, LeadershipRecord, NewJob};

#[derive(Default)]
struct Documents {
    jobs: Vec<Job>,
    leader: Option<LeadershipRecord>,
}

struct Inner {
    documents: Mutex<Documents>,
    job_watchers: WatchRegistry<Job, JobView>,
    leader_watchers: WatchRegistry<LeadershipRecord, ()>,
}

/// Shared in-memory job and leadership store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                documents: Mutex::new(Documents::default()),
                job_watchers: WatchRegistry::new(),
                leader_watchers: WatchRegistry::new(),
            }),
        }
    }

    /// Snapshot of every stored job in creation order
    pub fn snapshot(&self) -> StoreResult<Vec<Job>> {
        Ok(self.lock()?.jobs.clone())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Documents>> {
        self.inner
            .documents
            .lock()
            .map_err(|_| StoreError::LockPoisoned("memory store documents"))
    }

    // Called with the documents lock held so events follow write order.
    fn notify_jobs(&self, documents: &Documents) {
        self.inner
            .job_watchers
            .notify(|view| Some(view.evaluate(documents.jobs.iter())));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> StoreResult<JobId> {
        let mut documents = self.lock()?;
        let id = JobId::generate();
        documents.jobs.push(Job::from_new(id.clone(), job));
        self.notify_jobs(&documents);
        Ok(id)
    }

    async fn find_one(&self, query: &JobQuery) -> StoreResult<Option<Job>> {
        let documents = self.lock()?;
        Ok(documents.jobs.iter().find(|job| query.matches(job)).cloned())
    }

    async fn find(&self, query: &JobQuery, options: &FindOptions) -> StoreResult<Vec<Job>> {
        let view = JobView {
            query: query.clone(),
            options: *options,
        };
        let documents = self.lock()?;
        Ok(view.evaluate(documents.jobs.iter()))
    }

    async fn count(&self, query: &JobQuery) -> StoreResult<u64> {
        let documents = self.lock()?;
        Ok(documents.jobs.iter().filter(|job| query.matches(job)).count() as u64)
    }

    async fn update(&self, query: &JobQuery, update: &JobUpdate) -> StoreResult<u64> {
        let mut documents = self.lock()?;
        let mut matched = 0;
        for job in documents.jobs.iter_mut().filter(|job| query.matches(job)) {
            update.apply(job);
            matched += 1;
        }
        if matched > 0 {
            self.notify_jobs(&documents);
        }
        Ok(matched)
    }

    async fn remove(&self, query: &JobQuery) -> StoreResult<u64> {
        let mut documents = self.lock()?;
        let before = documents.jobs.len();
        documents.jobs.retain(|job| !query.matches(job));
        let removed = (before - documents.jobs.len()) as u64;
        if removed > 0 {
            self.notify_jobs(&documents);
        }
        Ok(removed)
    }

    async fn watch(&self, query: JobQuery, options: FindOptions) -> StoreResult<Subscription<Job>> {
        let view = JobView { query, options };
        let documents = self.lock()?;
        let initial = view.evaluate(documents.jobs.iter());
        Ok(self.inner.job_watchers.register(view, initial, true))
    }
}

#[async_trait]
impl LeaderStore for MemoryStore {
    async fn read_leader(&self) -> StoreResult<Option<LeadershipRecord>> {
        Ok(self.lock()?.leader.clone())
    }

    async fn upsert_leader(&self, record: &LeadershipRecord) -> StoreResult<()> {
        let mut documents = self.lock()?;
        documents.leader = Some(record.clone());
        self.inner
            .leader_watchers
            .notify(|_| Some(vec![record.clone()]));
        Ok(())
    }

    async fn purge_foreign_leaders(&self) -> StoreResult<u64> {
        // Only the fixed record id can be stored here.
        Ok(0)
    }

    async fn watch_leader(&self) -> StoreResult<Subscription<LeadershipRecord>> {
        let documents = self.lock()?;
        let current = documents.leader.iter().cloned().collect();
        Ok(self.inner.leader_watchers.register((), current, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobState;
    use crate::store::{ChangeEvent, JobSort};
    use chrono::{TimeDelta, TimeZone, Utc};
    use serde_json::json;

    fn new_job(name: &str, due_offset: i64) -> NewJob {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        NewJob::pending(name, vec![json!(name)], base + TimeDelta::seconds(due_offset), 0, base)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryStore::new();
        let id = store.insert(new_job("a", 0)).await.unwrap();

        let found = store.find_one(&JobQuery::by_id(&id)).await.unwrap().unwrap();
        assert_eq!(found.name, "a");
        assert_eq!(found.state, JobState::Pending);
        assert_eq!(store.count(&JobQuery::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_only_matching() {
        let store = MemoryStore::new();
        let a = store.insert(new_job("a", 0)).await.unwrap();
        store.insert(new_job("b", 0)).await.unwrap();

        let matched = store
            .update(&JobQuery::by_id(&a), &JobUpdate::state(JobState::Success))
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert_eq!(
            store.count(&JobQuery::pending()).await.unwrap(),
            1,
            "only the targeted job leaves pending"
        );
    }

    #[tokio::test]
    async fn test_clones_share_documents() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.insert(new_job("a", 0)).await.unwrap();
        assert_eq!(other.count(&JobQuery::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_watch_earliest_pending() {
        let store = MemoryStore::new();
        store.insert(new_job("late", 60)).await.unwrap();

        let mut sub = store
            .watch(JobQuery::pending(), FindOptions::sorted(JobSort::Due).limit(1))
            .await
            .unwrap();
        let first = sub.recv().await.unwrap();
        assert!(matches!(first, ChangeEvent::Added(ref j) if j.name == "late"));

        store.insert(new_job("early", 10)).await.unwrap();
        let removed = sub.recv().await.unwrap();
        let added = sub.recv().await.unwrap();
        assert!(matches!(removed, ChangeEvent::Removed(ref j) if j.name == "late"));
        assert!(matches!(added, ChangeEvent::Added(ref j) if j.name == "early"));
    }

    #[tokio::test]
    async fn test_watch_leader_skips_current_record() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        store.upsert_leader(&LeadershipRecord::new("a", at)).await.unwrap();

        let mut sub = store.watch_leader().await.unwrap();
        assert!(sub.try_recv().is_none());

        let next = LeadershipRecord::new("b", at + TimeDelta::seconds(1));
        store.upsert_leader(&next).await.unwrap();
        assert_eq!(sub.recv().await, Some(ChangeEvent::Changed(next)));
    }
}
