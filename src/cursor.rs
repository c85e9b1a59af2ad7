//! Cursor manager (spec component F): tracks open aggregation/find cursors
//! keyed by a random non-zero 64-bit id, batches results out via `getMore`,
//! and reaps idle cursors on a timer. Modeled on the teacher's
//! [`crate::session::SessionManager`] — a `Mutex`-guarded map plus a
//! `cleanup_expired_*` sweep — but keyed by cursor id instead of session id.

use bson::Document;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct CursorState {
    pub db: String,
    pub coll: String,
    pub batch: Vec<Document>,
    pub exhausted: bool,
    pub owner_connection_id: u64,
    last_touched: Instant,
}

impl CursorState {
    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }
}

pub struct CursorManager {
    cursors: Mutex<HashMap<i64, CursorState>>,
    idle_timeout: Duration,
}

impl CursorManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Allocates a non-zero 64-bit id with collision retry, stores the
    /// initial batch, and returns the new cursor id. A cursor holding its
    /// entire result in `batch` with `exhausted: true` is legal — the first
    /// `getMore` will drain the rest and then report the cursor closed.
    pub async fn open(&self, db: String, coll: String, docs: Vec<Document>, owner_connection_id: u64) -> i64 {
        let mut cursors = self.cursors.lock().await;
        let id = loop {
            let candidate: i64 = rand::thread_rng().gen_range(1..=i64::MAX);
            if !cursors.contains_key(&candidate) {
                break candidate;
            }
        };
        cursors.insert(
            id,
            CursorState {
                db,
                coll,
                batch: docs,
                exhausted: false,
                owner_connection_id,
                last_touched: Instant::now(),
            },
        );
        id
    }

    /// Takes up to `batch_size` documents from the cursor's buffer. Returns
    /// `None` if the cursor id is unknown *or* is not owned by
    /// `owner_connection_id` — cursors are only reachable via the connection
    /// that created them (spec §3/§8 cursor isolation), so a foreign id is
    /// indistinguishable from an unknown one to the caller. The cursor is
    /// removed once its buffer is drained and marked exhausted.
    pub async fn next_batch(&self, cursor_id: i64, batch_size: usize, owner_connection_id: u64) -> Option<(Vec<Document>, bool)> {
        let mut cursors = self.cursors.lock().await;
        let state = cursors.get_mut(&cursor_id)?;
        if state.owner_connection_id != owner_connection_id {
            return None;
        }
        state.touch();
        let take = batch_size.min(state.batch.len());
        let batch: Vec<Document> = state.batch.drain(..take).collect();
        let exhausted = state.batch.is_empty();
        if exhausted {
            cursors.remove(&cursor_id);
        }
        Some((batch, !exhausted))
    }

    /// Eagerly closes cursors by id, partitioned into killed/not-found per
    /// the `killCursors` command reply shape. A cursor owned by a different
    /// connection is reported `not_found` rather than killed — the issuing
    /// connection has no authority over it (same isolation rule as
    /// `next_batch`).
    pub async fn kill(&self, cursor_ids: &[i64], owner_connection_id: u64) -> (Vec<i64>, Vec<i64>) {
        let mut cursors = self.cursors.lock().await;
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in cursor_ids {
            match cursors.get(id) {
                Some(state) if state.owner_connection_id == owner_connection_id => {
                    cursors.remove(id);
                    killed.push(*id);
                }
                _ => not_found.push(*id),
            }
        }
        (killed, not_found)
    }

    /// Releases every cursor owned by a closed connection.
    pub async fn release_owned_by(&self, connection_id: u64) {
        let mut cursors = self.cursors.lock().await;
        cursors.retain(|_, state| state.owner_connection_id != connection_id);
    }

    /// Removes cursors idle past the configured timeout; returns how many
    /// were reaped.
    pub async fn sweep_idle(&self) -> usize {
        let mut cursors = self.cursors.lock().await;
        let before = cursors.len();
        let timeout = self.idle_timeout;
        cursors.retain(|_, state| state.last_touched.elapsed() <= timeout);
        before - cursors.len()
    }

    pub async fn len(&self) -> usize {
        self.cursors.lock().await.len()
    }
}

/// Spawns the periodic idle-cursor sweep; returns the join handle so callers
/// can abort it on shutdown (currently unused but kept for symmetry with
/// long-running server tasks).
pub fn spawn_reaper(manager: Arc<CursorManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = manager.sweep_idle().await;
            if reaped > 0 {
                tracing::debug!(reaped, "reaped idle cursors");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn open_then_drain_batches() {
        let mgr = CursorManager::new(Duration::from_secs(60));
        let docs = vec![doc! {"a": 1i32}, doc! {"a": 2i32}, doc! {"a": 3i32}];
        let id = mgr.open("db".into(), "c".into(), docs, 1).await;
        let (batch, more) = mgr.next_batch(id, 2, 1).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(more);
        let (batch, more) = mgr.next_batch(id, 2, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!more);
        assert!(mgr.next_batch(id, 2, 1).await.is_none());
    }

    #[tokio::test]
    async fn kill_partitions_found_and_missing() {
        let mgr = CursorManager::new(Duration::from_secs(60));
        let id = mgr.open("db".into(), "c".into(), vec![doc! {"a": 1i32}], 1).await;
        let (killed, not_found) = mgr.kill(&[id, 9999], 1).await;
        assert_eq!(killed, vec![id]);
        assert_eq!(not_found, vec![9999]);
    }

    #[tokio::test]
    async fn next_batch_rejects_foreign_connection() {
        let mgr = CursorManager::new(Duration::from_secs(60));
        let id = mgr.open("db".into(), "c".into(), vec![doc! {"a": 1i32}], 1).await;
        assert!(mgr.next_batch(id, 10, 2).await.is_none());
        let (batch, more) = mgr.next_batch(id, 10, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!more);
    }

    #[tokio::test]
    async fn kill_does_not_remove_foreign_connections_cursor() {
        let mgr = CursorManager::new(Duration::from_secs(60));
        let id = mgr.open("db".into(), "c".into(), vec![doc! {"a": 1i32}], 1).await;
        let (killed, not_found) = mgr.kill(&[id], 2).await;
        assert!(killed.is_empty());
        assert_eq!(not_found, vec![id]);
        // still alive and drainable by its real owner
        assert!(mgr.next_batch(id, 10, 1).await.is_some());
    }

    #[tokio::test]
    async fn release_owned_by_drops_connections_cursors() {
        let mgr = CursorManager::new(Duration::from_secs(60));
        mgr.open("db".into(), "c".into(), vec![doc! {"a": 1i32}], 1).await;
        mgr.open("db".into(), "c".into(), vec![doc! {"a": 2i32}], 2).await;
        mgr.release_owned_by(1).await;
        assert_eq!(mgr.len().await, 1);
    }
}
