//! Per-connection state (spec component C): a monotonic connection id,
//! handshake/auth flags, and the set of cursors this connection owns so they
//! can be released on teardown. Scaled down from the teacher's
//! [`Session`]/`SessionManager` pair — no Postgres transaction plumbing
//! survives, since this backend has no multi-statement transactions to
//! track.

use bson::Document;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// State tracked for the lifetime of one TCP connection.
pub struct ConnectionState {
    pub id: u64,
    pub client_metadata: Option<Document>,
    pub hello_ok: bool,
    pub owned_cursors: HashSet<i64>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            client_metadata: None,
            hello_ok: false,
            owned_cursors: HashSet::new(),
        }
    }

    pub fn track_cursor(&mut self, cursor_id: i64) {
        self.owned_cursors.insert(cursor_id);
    }

    pub fn untrack_cursor(&mut self, cursor_id: i64) {
        self.owned_cursors.remove(&cursor_id);
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_monotonic() {
        let a = ConnectionState::new();
        let b = ConnectionState::new();
        assert!(b.id > a.id);
    }

    #[test]
    fn cursor_tracking_round_trips() {
        let mut conn = ConnectionState::new();
        conn.track_cursor(42);
        assert!(conn.owned_cursors.contains(&42));
        conn.untrack_cursor(42);
        assert!(!conn.owned_cursors.contains(&42));
    }
}
