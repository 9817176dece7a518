//! In-memory conversation history, keyed by session.
//!
//! Every operation is total: an unknown session is treated as an empty
//! history and created on demand. Map shards are locked only for the
//! synchronous duration of a call, never across an `.await`.
//!
//! Eviction deadlines are not cancelled by later activity on the same
//! session. The transport never hands out a session id twice, so a
//! reconnecting client always starts under a fresh id and a stale deadline
//! can only hit a history nobody will read again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use parley_core::ids::SessionId;
use parley_core::messages::{Role, Turn};

use crate::config::StoreConfig;

struct History {
    turns: VecDeque<Turn>,
    bytes: usize,
    last_active: Instant,
}

impl History {
    fn new() -> Self {
        Self {
            turns: VecDeque::new(),
            bytes: 0,
            last_active: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn push(&mut self, turn: Turn) {
        self.bytes += turn.byte_len();
        self.turns.push_back(turn);
        self.touch();
    }

    fn pop_front(&mut self) -> Option<Turn> {
        let turn = self.turns.pop_front()?;
        self.bytes -= turn.byte_len();
        Some(turn)
    }

    /// Drop oldest turns until within limits. The newest turn is always kept.
    fn trim(&mut self, config: &StoreConfig) -> usize {
        let mut dropped = 0;
        while self.turns.len() > 1 && self.over_limit(config) {
            self.pop_front();
            dropped += 1;
        }
        dropped
    }

    fn over_limit(&self, config: &StoreConfig) -> bool {
        config.max_turns.is_some_and(|max| self.turns.len() > max)
            || config.max_bytes.is_some_and(|max| self.bytes > max)
    }
}

/// Owns the mapping from session to ordered turn history.
pub struct ConversationStore {
    histories: DashMap<SessionId, History>,
    evictions: DashMap<SessionId, Instant>,
    gates: DashMap<SessionId, Arc<Mutex<()>>>,
    config: StoreConfig,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl ConversationStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            histories: DashMap::new(),
            evictions: DashMap::new(),
            gates: DashMap::new(),
            config,
        }
    }

    /// Return the session's turn count, creating an empty history if absent.
    pub fn ensure(&self, session_id: &SessionId) -> usize {
        let mut entry = self
            .histories
            .entry(session_id.clone())
            .or_insert_with(History::new);
        entry.touch();
        entry.turns.len()
    }

    /// Append a turn to the end of the session's history, creating it if absent.
    pub fn append(&self, session_id: &SessionId, turn: Turn) {
        let mut entry = self
            .histories
            .entry(session_id.clone())
            .or_insert_with(History::new);
        entry.push(turn);
        let dropped = entry.trim(&self.config);
        if dropped > 0 {
            debug!(session_id = %session_id, dropped, "trimmed oldest turns from history");
        }
    }

    /// Ordered copy of the session's history. Empty for unknown sessions.
    pub fn snapshot(&self, session_id: &SessionId) -> Vec<Turn> {
        self.histories
            .get(session_id)
            .map(|h| h.turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove the newest turn if it was authored by `role`.
    pub fn discard_last(&self, session_id: &SessionId, role: Role) -> bool {
        let Some(mut entry) = self.histories.get_mut(session_id) else {
            return false;
        };
        if entry.turns.back().map(Turn::role) != Some(role) {
            return false;
        }
        if let Some(turn) = entry.turns.pop_back() {
            entry.bytes -= turn.byte_len();
        }
        true
    }

    /// Remove the session's history entirely. Returns whether one existed.
    pub fn clear(&self, session_id: &SessionId) -> bool {
        self.histories.remove(session_id).is_some()
    }

    /// Arrange for the session's history to be dropped once `delay` has passed.
    /// Rescheduling replaces any earlier deadline.
    pub fn schedule_eviction(&self, session_id: &SessionId, delay: Duration) {
        let deadline = Instant::now() + delay;
        self.evictions.insert(session_id.clone(), deadline);
        debug!(session_id = %session_id, delay_secs = delay.as_secs(), "eviction scheduled");
    }

    pub fn eviction_pending(&self, session_id: &SessionId) -> bool {
        self.evictions.contains_key(session_id)
    }

    /// Drop every history whose eviction deadline has passed or that has sat
    /// idle past the configured TTL. Returns the number of histories removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();

        let due: Vec<SessionId> = self
            .evictions
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in due {
            self.evictions.remove(&session_id);
            self.gates
                .remove_if(&session_id, |_, gate| Arc::strong_count(gate) == 1);
            if self.histories.remove(&session_id).is_some() {
                removed += 1;
            }
        }

        if let Some(ttl) = self.config.idle_ttl {
            let before = self.histories.len();
            self.histories
                .retain(|_, h| now.saturating_duration_since(h.last_active) < ttl);
            removed += before.saturating_sub(self.histories.len());
        }

        // Gates nobody holds for sessions with nothing left to guard
        self.gates.retain(|id, gate| {
            Arc::strong_count(gate) > 1
                || self.histories.contains_key(id)
                || self.evictions.contains_key(id)
        });

        removed
    }

    /// Per-session exclusive token. Holding its lock serialises request
    /// cycles for one session; different sessions never share a gate.
    pub fn turn_gate(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .gates
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Number of turns currently held for the session.
    pub fn len(&self, session_id: &SessionId) -> usize {
        self.histories.get(session_id).map_or(0, |h| h.turns.len())
    }

    /// Number of sessions with a live history.
    pub fn session_count(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unbounded() -> ConversationStore {
        ConversationStore::new(StoreConfig::unbounded())
    }

    fn texts(turns: &[Turn]) -> Vec<&str> {
        turns.iter().map(Turn::text).collect()
    }

    #[test]
    fn snapshot_of_unknown_session_is_empty() {
        let store = unbounded();
        assert!(store.snapshot(&SessionId::new()).is_empty());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn ensure_creates_once() {
        let store = unbounded();
        let id = SessionId::new();
        assert_eq!(store.ensure(&id), 0);
        store.append(&id, Turn::user("hi"));
        assert_eq!(store.ensure(&id), 1);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn append_preserves_insertion_order() {
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("one"));
        store.append(&id, Turn::assistant("two"));
        store.append(&id, Turn::user("three"));

        let snap = store.snapshot(&id);
        assert_eq!(texts(&snap), vec!["one", "two", "three"]);
        assert_eq!(snap[1].role(), Role::Assistant);
    }

    #[test]
    fn append_lazily_creates_history() {
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("first"));
        assert_eq!(store.len(&id), 1);
    }

    #[test]
    fn sessions_are_isolated() {
        let store = unbounded();
        let a = SessionId::new();
        let b = SessionId::new();
        store.append(&a, Turn::user("for a"));
        store.append(&b, Turn::user("for b"));
        store.clear(&a);

        assert!(store.snapshot(&a).is_empty());
        assert_eq!(texts(&store.snapshot(&b)), vec!["for b"]);
    }

    #[test]
    fn clear_then_append_starts_fresh() {
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("old"));
        store.append(&id, Turn::assistant("reply"));

        assert!(store.clear(&id));
        assert!(store.snapshot(&id).is_empty());
        assert_eq!(store.session_count(), 0);

        store.append(&id, Turn::user("new"));
        assert_eq!(texts(&store.snapshot(&id)), vec!["new"]);
    }

    #[test]
    fn clear_unknown_session_is_a_no_op() {
        let store = unbounded();
        assert!(!store.clear(&SessionId::new()));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("a"));
        let snap = store.snapshot(&id);
        store.append(&id, Turn::assistant("b"));
        assert_eq!(snap.len(), 1);
        assert_eq!(store.len(&id), 2);
    }

    #[test]
    fn discard_last_only_matches_role() {
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("q"));
        store.append(&id, Turn::assistant("a"));

        assert!(!store.discard_last(&id, Role::User));
        assert_eq!(store.len(&id), 2);

        assert!(store.discard_last(&id, Role::Assistant));
        assert!(store.discard_last(&id, Role::User));
        assert_eq!(store.len(&id), 0);
        assert!(!store.discard_last(&id, Role::User));
        assert!(!store.discard_last(&SessionId::new(), Role::User));
    }

    #[test]
    fn max_turns_drops_oldest_first() {
        let store = ConversationStore::new(StoreConfig {
            max_turns: Some(3),
            ..StoreConfig::unbounded()
        });
        let id = SessionId::new();
        for text in ["1", "2", "3", "4", "5"] {
            store.append(&id, Turn::user(text));
        }
        assert_eq!(texts(&store.snapshot(&id)), vec!["3", "4", "5"]);
    }

    #[test]
    fn max_bytes_drops_oldest_but_keeps_newest() {
        let store = ConversationStore::new(StoreConfig {
            max_bytes: Some(10),
            ..StoreConfig::unbounded()
        });
        let id = SessionId::new();
        store.append(&id, Turn::user("aaaa"));
        store.append(&id, Turn::assistant("bbbb"));
        assert_eq!(store.len(&id), 2);

        store.append(&id, Turn::user("cccc"));
        assert_eq!(texts(&store.snapshot(&id)), vec!["bbbb", "cccc"]);

        // A single oversized turn is still kept.
        store.append(&id, Turn::assistant("x".repeat(50)));
        assert_eq!(store.len(&id), 1);
    }

    #[tokio::test]
    async fn eviction_fires_after_grace_period() {
        tokio::time::pause();
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("remember me"));

        store.schedule_eviction(&id, Duration::from_secs(3600));
        assert!(store.eviction_pending(&id));

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(store.evict_expired(), 0);
        assert_eq!(store.len(&id), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.evict_expired(), 1);
        assert!(store.snapshot(&id).is_empty());
        assert!(!store.eviction_pending(&id));
    }

    #[tokio::test]
    async fn activity_does_not_cancel_pending_eviction() {
        tokio::time::pause();
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("before"));
        store.schedule_eviction(&id, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(30)).await;
        store.append(&id, Turn::user("after"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.evict_expired(), 1);
        assert!(store.snapshot(&id).is_empty());
    }

    #[tokio::test]
    async fn rescheduling_replaces_deadline() {
        tokio::time::pause();
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("x"));
        store.schedule_eviction(&id, Duration::from_secs(10));
        store.schedule_eviction(&id, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(store.evict_expired(), 0);
        assert_eq!(store.len(&id), 1);
    }

    #[tokio::test]
    async fn eviction_leaves_other_sessions_alone() {
        tokio::time::pause();
        let store = unbounded();
        let gone = SessionId::new();
        let kept = SessionId::new();
        store.append(&gone, Turn::user("bye"));
        store.append(&kept, Turn::user("stay"));
        store.schedule_eviction(&gone, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        store.evict_expired();
        assert_eq!(store.len(&gone), 0);
        assert_eq!(store.len(&kept), 1);
    }

    #[tokio::test]
    async fn idle_histories_expire_without_disconnect() {
        tokio::time::pause();
        let store = ConversationStore::new(StoreConfig {
            idle_ttl: Some(Duration::from_secs(600)),
            ..StoreConfig::unbounded()
        });
        let stale = SessionId::new();
        let fresh = SessionId::new();
        store.append(&stale, Turn::user("old"));

        tokio::time::advance(Duration::from_secs(500)).await;
        store.append(&fresh, Turn::user("new"));

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(&stale), 0);
        assert_eq!(store.len(&fresh), 1);
    }

    #[tokio::test]
    async fn turn_gate_is_shared_per_session() {
        let store = unbounded();
        let a = SessionId::new();
        let b = SessionId::new();

        let gate_a1 = store.turn_gate(&a);
        let gate_a2 = store.turn_gate(&a);
        let gate_b = store.turn_gate(&b);
        assert!(Arc::ptr_eq(&gate_a1, &gate_a2));
        assert!(!Arc::ptr_eq(&gate_a1, &gate_b));

        let _held = gate_a1.lock().await;
        assert!(gate_a2.try_lock().is_err());
        assert!(gate_b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn unused_gates_are_swept() {
        let store = unbounded();
        let id = SessionId::new();
        drop(store.turn_gate(&id));
        assert_eq!(store.gates.len(), 1);

        store.evict_expired();
        assert_eq!(store.gates.len(), 0);
    }

    #[tokio::test]
    async fn held_gate_survives_eviction_deadline() {
        tokio::time::pause();
        let store = unbounded();
        let id = SessionId::new();
        store.append(&id, Turn::user("hi"));
        let gate = store.turn_gate(&id);
        let _held = gate.lock().await;

        store.schedule_eviction(&id, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.evict_expired(), 1);

        assert!(Arc::ptr_eq(&gate, &store.turn_gate(&id)));
        assert!(store.turn_gate(&id).try_lock().is_err());
    }

    #[tokio::test]
    async fn held_gates_survive_sweep() {
        let store = unbounded();
        let id = SessionId::new();
        let gate = store.turn_gate(&id);
        store.evict_expired();
        assert!(Arc::ptr_eq(&gate, &store.turn_gate(&id)));
    }

    #[test]
    fn concurrent_appends_across_sessions() {
        use std::thread;

        let store = Arc::new(unbounded());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let id = SessionId::new();
                    for i in 0..100 {
                        store.append(&id, Turn::user(i.to_string()));
                    }
                    let snap = store.snapshot(&id);
                    (id, snap)
                })
            })
            .collect();

        for h in handles {
            let (id, snap) = h.join().unwrap();
            assert_eq!(snap.len(), 100);
            assert_eq!(snap[99].text(), "99");
            assert_eq!(store.len(&id), 100);
        }
        assert_eq!(store.session_count(), 8);
    }
}
