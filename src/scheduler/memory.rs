//! In-process match queue with the same claim semantics as the PostgreSQL store.
//!
//! Used by tests and local dry runs. Claims take the oldest claimable
//! record under a single mutex; leases expire on the monotonic clock.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;

use super::queue::MatchQueue;
use super::record::{ClaimedMatch, MatchOutcome, MatchStatus, Program};

/// Snapshot of one in-memory record.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: i64,
    pub red: Program,
    pub blue: Program,
    pub status: MatchStatus,
    pub replay: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_token: Option<Uuid>,
    pub attempts: i32,
}

/// A commit accepted by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    pub id: i64,
    pub outcome: MatchOutcome,
    pub replay_url: Option<String>,
    pub at: Instant,
}

#[derive(Debug)]
struct Entry {
    record: MemoryRecord,
    lease_expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    records: BTreeMap<i64, Entry>,
    commits: Vec<CommitEntry>,
    claim_attempts: Vec<Instant>,
    transient_failures: u32,
}

/// Mutex-guarded [`MatchQueue`].
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    lease_timeout: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(900))
    }
}

impl InMemoryQueue {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
            lease_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a queued record and returns its id.
    pub fn enqueue(&self, red: Program, blue: Program) -> i64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(
            id,
            Entry {
                record: MemoryRecord {
                    id,
                    red,
                    blue,
                    status: MatchStatus::Queued,
                    replay: None,
                    claimed_by: None,
                    claim_token: None,
                    attempts: 0,
                },
                lease_expires_at: None,
            },
        );
        id
    }

    /// Makes the next `count` claims fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// Forces the lease on `id` to be expired.
    pub fn expire_lease(&self, id: i64) {
        if let Some(entry) = self.lock().records.get_mut(&id) {
            if entry.record.status == MatchStatus::Running {
                entry.lease_expires_at = Some(Instant::now());
            }
        }
    }

    pub fn record(&self, id: i64) -> Option<MemoryRecord> {
        self.lock().records.get(&id).map(|e| e.record.clone())
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.lock().records.values().map(|e| e.record.clone()).collect()
    }

    /// Accepted commits in the order they happened.
    pub fn commits(&self) -> Vec<CommitEntry> {
        self.lock().commits.clone()
    }

    /// Times at which `claim_next` was called, successful or not.
    pub fn claim_attempts(&self) -> Vec<Instant> {
        self.lock().claim_attempts.clone()
    }

    fn held_entry<'a>(
        state: &'a mut State,
        claim: &ClaimedMatch,
    ) -> Result<&'a mut Entry, QueueError> {
        match state.records.get_mut(&claim.id) {
            Some(entry) => {
                if entry.record.status == MatchStatus::Running
                    && entry.record.claim_token == Some(claim.claim_token)
                {
                    Ok(entry)
                } else {
                    Err(QueueError::RecordNotFound { id: claim.id })
                }
            }
            None => Err(QueueError::RecordNotFound { id: claim.id }),
        }
    }
}

#[async_trait]
impl MatchQueue for InMemoryQueue {
    async fn claim_next(&self, worker_id: &str) -> Result<ClaimedMatch, QueueError> {
        let mut state = self.lock();
        let now = Instant::now();
        state.claim_attempts.push(now);

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(QueueError::Transient(sqlx::Error::PoolTimedOut));
        }

        let candidate = state.records.values_mut().find(|e| match e.record.status {
            MatchStatus::Queued => true,
            MatchStatus::Running => e.lease_expires_at.is_some_and(|t| t <= now),
            _ => false,
        });

        let entry = candidate.ok_or(QueueError::Empty)?;
        let reclaimed = entry.record.status == MatchStatus::Running;
        let claim_token = Uuid::new_v4();

        entry.record.status = MatchStatus::Running;
        entry.record.claimed_by = Some(worker_id.to_string());
        entry.record.claim_token = Some(claim_token);
        entry.record.attempts += 1;
        entry.lease_expires_at = Some(now + self.lease_timeout);

        Ok(ClaimedMatch {
            id: entry.record.id,
            red: entry.record.red.clone(),
            blue: entry.record.blue.clone(),
            claim_token,
            attempt: entry.record.attempts,
            reclaimed,
        })
    }

    async fn commit_result(
        &self,
        claim: &ClaimedMatch,
        outcome: MatchOutcome,
        replay_url: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let entry = Self::held_entry(&mut state, claim)?;

        entry.record.status = outcome.status();
        entry.record.replay = replay_url.map(str::to_string);
        entry.lease_expires_at = None;

        state.commits.push(CommitEntry {
            id: claim.id,
            outcome,
            replay_url: replay_url.map(str::to_string),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn heartbeat(&self, claim: &ClaimedMatch) -> Result<(), QueueError> {
        let mut state = self.lock();
        let lease_timeout = self.lease_timeout;
        let entry = Self::held_entry(&mut state, claim)?;
        entry.lease_expires_at = Some(Instant::now() + lease_timeout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn programs() -> (Program, Program) {
        (Program::new(1, "red"), Program::new(2, "blue"))
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let queue = InMemoryQueue::default();
        let (red, blue) = programs();
        let a = queue.enqueue(red.clone(), blue.clone());
        let b = queue.enqueue(red, blue);

        let first = queue.claim_next("w0").await.expect("claim a");
        let second = queue.claim_next("w1").await.expect("claim b");

        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert!(matches!(queue.claim_next("w2").await, Err(QueueError::Empty)));
    }

    #[tokio::test]
    async fn test_commit_is_final() {
        let queue = InMemoryQueue::default();
        let (red, blue) = programs();
        let id = queue.enqueue(red, blue);

        let claim = queue.claim_next("w0").await.expect("claim");
        queue
            .commit_result(&claim, MatchOutcome::BlueWon, Some("https://r/1.json"))
            .await
            .expect("commit");

        let again = queue.commit_result(&claim, MatchOutcome::RedWon, None).await;
        assert!(matches!(again, Err(QueueError::RecordNotFound { id: rid }) if rid == id));

        let record = queue.record(id).expect("record");
        assert_eq!(record.status, MatchStatus::BlueWon);
        assert_eq!(record.replay.as_deref(), Some("https://r/1.json"));
        assert!(matches!(queue.claim_next("w1").await, Err(QueueError::Empty)));
        assert!(matches!(
            queue.heartbeat(&claim).await,
            Err(QueueError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_and_fenced() {
        let queue = InMemoryQueue::default();
        let (red, blue) = programs();
        let id = queue.enqueue(red, blue);

        let stale = queue.claim_next("w0").await.expect("claim");
        queue.expire_lease(id);

        let fresh = queue.claim_next("w1").await.expect("reclaim");
        assert_eq!(fresh.id, id);
        assert!(fresh.reclaimed);
        assert_eq!(fresh.attempt, 2);
        assert_ne!(fresh.claim_token, stale.claim_token);

        // The stale holder can no longer commit.
        let result = queue.commit_result(&stale, MatchOutcome::RedWon, None).await;
        assert!(matches!(result, Err(QueueError::RecordNotFound { .. })));

        queue
            .commit_result(&fresh, MatchOutcome::Error, None)
            .await
            .expect("fresh commit");
        assert_eq!(queue.record(id).expect("record").claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_injected_transient_failures() {
        let queue = InMemoryQueue::default();
        queue.inject_transient_failures(2);

        assert!(matches!(
            queue.claim_next("w0").await,
            Err(QueueError::Transient(_))
        ));
        assert!(matches!(
            queue.claim_next("w0").await,
            Err(QueueError::Transient(_))
        ));
        assert!(matches!(queue.claim_next("w0").await, Err(QueueError::Empty)));
        assert_eq!(queue.claim_attempts().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claimers_never_double_claim() {
        let queue = Arc::new(InMemoryQueue::default());
        let (red, blue) = programs();
        let ids: HashSet<i64> = (0..200)
            .map(|_| queue.enqueue(red.clone(), blue.clone()))
            .collect();

        let mut handles = Vec::new();
        for w in 0..16 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let worker_id = format!("w{}", w);
                let mut claimed = Vec::new();
                loop {
                    match queue.claim_next(&worker_id).await {
                        Ok(claim) => claimed.push(claim.id),
                        Err(QueueError::Empty) => break,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.expect("task"));
        }

        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(all.len(), ids.len(), "no record claimed twice");
        assert_eq!(unique, ids, "no record lost");
    }
}
