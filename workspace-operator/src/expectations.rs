use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long a declared expectation stays binding before it is written off as
/// a dropped event.
pub const EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

/// Ring capacity for remembered observation UIDs per workspace.
const OBSERVED_RING_CAPACITY: usize = 128;

/// Bridges the gap between an issued NodeClaim mutation and the watcher event
/// that confirms it. The controller declares intent immediately before
/// mutating; each first sighting of a UID pays one expectation down. While a
/// key is unsatisfied no further mutations may be issued for it, which is
/// what prevents a second reconcile from double-creating.
pub struct Expectations {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    ttl: Duration,
}

struct Entry {
    creations: AtomicI64,
    deletions: AtomicI64,
    created_at: Instant,
    /// UIDs already counted, so a re-delivered event cannot decrement twice.
    /// Prefixed `c:`/`d:` since the same UID is seen for create and delete.
    observed: Mutex<VecDeque<String>>,
}

impl Entry {
    fn new(creations: i64, deletions: i64, observed: VecDeque<String>) -> Self {
        Entry {
            creations: AtomicI64::new(creations),
            deletions: AtomicI64::new(deletions),
            created_at: Instant::now(),
            observed: Mutex::new(observed),
        }
    }
}

/// Expectations key for a workspace.
pub fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl Default for Expectations {
    fn default() -> Self {
        Expectations::new(EXPECTATIONS_TTL)
    }
}

impl Expectations {
    pub fn new(ttl: Duration) -> Self {
        Expectations {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Declare that `n` creations are about to be issued for `key`. Resets
    /// the entry's age; the observed-UID ring carries over so stale events
    /// stay idempotent across declarations.
    pub fn expect_creations(&self, key: &str, n: i64) {
        self.set(key, n, 0);
    }

    /// Declare that `n` deletions are about to be issued for `key`.
    pub fn expect_deletions(&self, key: &str, n: i64) {
        self.set(key, 0, n);
    }

    fn set(&self, key: &str, creations: i64, deletions: i64) {
        let mut entries = self.entries.lock().unwrap();
        let observed = entries
            .remove(key)
            .map(|old| std::mem::take(&mut *old.observed.lock().unwrap()))
            .unwrap_or_default();
        entries.insert(key.to_string(), Arc::new(Entry::new(creations, deletions, observed)));
    }

    /// Walk back `n` creation expectations after a failed create call. The
    /// watcher will never deliver an event for a mutation that was not
    /// accepted, so the counter has to be released by hand.
    pub fn lower_creations(&self, key: &str, n: i64) {
        if let Some(entry) = self.get(key) {
            entry.creations.fetch_sub(n, Ordering::SeqCst);
        }
    }

    pub fn lower_deletions(&self, key: &str, n: i64) {
        if let Some(entry) = self.get(key) {
            entry.deletions.fetch_sub(n, Ordering::SeqCst);
        }
    }

    /// Record a watched creation. Decrements at most once per UID.
    pub fn creation_observed(&self, key: &str, uid: &str) {
        self.observe(key, uid, true);
    }

    /// Record a watched deletion. Decrements at most once per UID.
    pub fn deletion_observed(&self, key: &str, uid: &str) {
        self.observe(key, uid, false);
    }

    fn observe(&self, key: &str, uid: &str, creation: bool) {
        let Some(entry) = self.get(key) else {
            return;
        };
        let tagged = if creation {
            format!("c:{uid}")
        } else {
            format!("d:{uid}")
        };
        let mut observed = entry.observed.lock().unwrap();
        if observed.contains(&tagged) {
            return;
        }
        if observed.len() >= OBSERVED_RING_CAPACITY {
            observed.pop_front();
        }
        observed.push_back(tagged);
        if creation {
            entry.creations.fetch_sub(1, Ordering::SeqCst);
        } else {
            entry.deletions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True when all declared mutations have been observed, when nothing was
    /// ever declared, or when the entry has outlived the TTL (the safety
    /// valve for dropped events).
    pub fn satisfied(&self, key: &str) -> bool {
        let Some(entry) = self.get(key) else {
            return true;
        };
        if entry.created_at.elapsed() > self.ttl {
            return true;
        }
        entry.creations.load(Ordering::SeqCst) <= 0 && entry.deletions.load(Ordering::SeqCst) <= 0
    }

    /// Outstanding `(creations, deletions)` for the key, if any are declared.
    pub fn pending(&self, key: &str) -> Option<(i64, i64)> {
        let entry = self.get(key)?;
        if entry.created_at.elapsed() > self.ttl {
            return None;
        }
        let creations = entry.creations.load(Ordering::SeqCst).max(0);
        let deletions = entry.deletions.load(Ordering::SeqCst).max(0);
        if creations == 0 && deletions == 0 {
            None
        } else {
            Some((creations, deletions))
        }
    }

    /// Drop all bookkeeping for a workspace (workspace-not-found path).
    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn get(&self, key: &str) -> Option<Arc<Entry>> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_satisfied() {
        let exp = Expectations::default();
        assert!(exp.satisfied("default/ws"));
    }

    #[test]
    fn creations_block_until_observed() {
        let exp = Expectations::default();
        exp.expect_creations("default/ws", 2);
        assert!(!exp.satisfied("default/ws"));
        exp.creation_observed("default/ws", "uid-1");
        assert!(!exp.satisfied("default/ws"));
        exp.creation_observed("default/ws", "uid-2");
        assert!(exp.satisfied("default/ws"));
    }

    #[test]
    fn redelivered_event_does_not_double_decrement() {
        let exp = Expectations::default();
        exp.expect_creations("default/ws", 2);
        exp.creation_observed("default/ws", "uid-1");
        exp.creation_observed("default/ws", "uid-1");
        exp.creation_observed("default/ws", "uid-1");
        assert!(!exp.satisfied("default/ws"));
    }

    #[test]
    fn same_uid_counts_once_for_create_and_once_for_delete() {
        let exp = Expectations::default();
        exp.expect_creations("default/ws", 1);
        exp.creation_observed("default/ws", "uid-1");
        assert!(exp.satisfied("default/ws"));
        exp.expect_deletions("default/ws", 1);
        exp.deletion_observed("default/ws", "uid-1");
        assert!(exp.satisfied("default/ws"));
    }

    #[test]
    fn failed_mutation_lowers_expectations() {
        let exp = Expectations::default();
        exp.expect_creations("default/ws", 3);
        exp.creation_observed("default/ws", "uid-1");
        exp.lower_creations("default/ws", 2);
        assert!(exp.satisfied("default/ws"));
    }

    #[test]
    fn ttl_is_a_safety_valve_for_dropped_events() {
        let exp = Expectations::new(Duration::ZERO);
        exp.expect_deletions("default/ws", 5);
        assert!(exp.satisfied("default/ws"));
    }

    #[test]
    fn delete_clears_the_entry() {
        let exp = Expectations::default();
        exp.expect_creations("default/ws", 1);
        assert!(!exp.satisfied("default/ws"));
        exp.delete("default/ws");
        assert!(exp.satisfied("default/ws"));
    }

    #[test]
    fn observed_ring_survives_redeclaration() {
        let exp = Expectations::default();
        exp.expect_creations("default/ws", 1);
        exp.creation_observed("default/ws", "uid-1");
        // A later reconcile declares more work; the stale event for uid-1 is
        // re-delivered and must not count against the new expectations.
        exp.expect_creations("default/ws", 1);
        exp.creation_observed("default/ws", "uid-1");
        assert!(!exp.satisfied("default/ws"));
        exp.creation_observed("default/ws", "uid-2");
        assert!(exp.satisfied("default/ws"));
    }
}
