//! Per-watcher accumulators: pending changes and recently applied echoes.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use drivesync_core::{Change, ChangeKey};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Detected-but-not-yet-applied changes, one per key.
///
/// Detection appends while a merge iteration drains; both go through one
/// mutex so neither side sees a half-updated set.
#[derive(Debug)]
pub struct PendingChangeSet<K: ChangeKey> {
    changes: Mutex<HashMap<K, Change<K>>>,
}

impl<K: ChangeKey> Default for PendingChangeSet<K> {
    fn default() -> Self {
        Self {
            changes: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: ChangeKey> PendingChangeSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly observed change, folding it into any pending one.
    pub fn push(&self, change: Change<K>) {
        let mut changes = lock(&self.changes);
        let merged = match changes.remove(&change.key) {
            Some(previous) => previous.merge(change),
            None => change,
        };
        changes.insert(merged.key.clone(), merged);
    }

    /// Put back a change a handler could not apply yet. A change observed in
    /// the meantime is newer and is folded on top.
    pub fn requeue(&self, change: Change<K>) {
        let mut changes = lock(&self.changes);
        let merged = match changes.remove(&change.key) {
            Some(newer) => change.merge(newer),
            None => change,
        };
        changes.insert(merged.key.clone(), merged);
    }

    pub fn take(&self, key: &K) -> Option<Change<K>> {
        lock(&self.changes).remove(key)
    }

    /// Remove and return everything pending.
    pub fn drain(&self) -> Vec<Change<K>> {
        lock(&self.changes).drain().map(|(_, change)| change).collect()
    }

    /// Drop pending changes for `keys`; returns how many were dropped.
    pub fn remove_all(&self, keys: &HashSet<K>) -> usize {
        let mut changes = lock(&self.changes);
        let before = changes.len();
        changes.retain(|key, _| !keys.contains(key));
        before - changes.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.changes).contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<Change<K>> {
        lock(&self.changes).get(key).cloned()
    }

    /// Snapshot of the pending keys, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        lock(&self.changes).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.changes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys this process just wrote on one side, remembered for `window` so the
/// resulting notifications are not mistaken for fresh work.
#[derive(Debug)]
pub struct EchoFilter<K> {
    window: Duration,
    marks: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> EchoFilter<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn suppress(&self, keys: impl IntoIterator<Item = K>) {
        let now = Instant::now();
        let mut marks = lock(&self.marks);
        for key in keys {
            marks.insert(key, now);
        }
    }

    pub fn is_suppressed(&self, key: &K) -> bool {
        self.is_suppressed_at(key, Instant::now())
    }

    pub fn is_suppressed_at(&self, key: &K, now: Instant) -> bool {
        let mut marks = lock(&self.marks);
        let window = self.window;
        marks.retain(|_, marked| now.saturating_duration_since(*marked) < window);
        marks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.marks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivesync_core::ChangeKind;
    use std::path::PathBuf;

    #[test]
    fn push_coalesces_per_key() {
        let pending = PendingChangeSet::<PathBuf>::new();
        pending.push(Change::local("/r/a.txt", ChangeKind::Created));
        pending.push(Change::local("/r/a.txt", ChangeKind::Modified));
        pending.push(Change::local("/r/a.txt", ChangeKind::Modified));
        pending.push(Change::local("/r/b.txt", ChangeKind::Deleted));
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending.get(&PathBuf::from("/r/a.txt")).map(|c| c.kind),
            Some(ChangeKind::Created)
        );
    }

    #[test]
    fn requeue_keeps_newer_observation() {
        let pending = PendingChangeSet::<PathBuf>::new();
        let deferred = Change::local("/r/a.txt", ChangeKind::Created);
        pending.push(Change::local("/r/a.txt", ChangeKind::Deleted));
        pending.requeue(deferred);
        assert_eq!(
            pending.get(&PathBuf::from("/r/a.txt")).map(|c| c.kind),
            Some(ChangeKind::Deleted)
        );
    }

    #[test]
    fn drain_empties_the_set() {
        let pending = PendingChangeSet::<PathBuf>::new();
        pending.push(Change::local("/r/a.txt", ChangeKind::Created));
        pending.push(Change::local("/r/b.txt", ChangeKind::Created));
        assert_eq!(pending.drain().len(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn remove_all_only_drops_listed_keys() {
        let pending = PendingChangeSet::<PathBuf>::new();
        pending.push(Change::local("/r/a.txt", ChangeKind::Created));
        pending.push(Change::local("/r/b.txt", ChangeKind::Created));
        let keys: HashSet<PathBuf> = [PathBuf::from("/r/a.txt"), PathBuf::from("/r/x")]
            .into_iter()
            .collect();
        assert_eq!(pending.remove_all(&keys), 1);
        assert_eq!(pending.keys(), vec![PathBuf::from("/r/b.txt")]);
    }

    #[test]
    fn echo_marks_expire_after_window() {
        let filter = EchoFilter::new(Duration::from_secs(5));
        filter.suppress(["R1".to_string()]);
        let now = Instant::now();
        assert!(filter.is_suppressed_at(&"R1".to_string(), now));
        assert!(!filter.is_suppressed_at(&"R2".to_string(), now));
        assert!(!filter.is_suppressed_at(&"R1".to_string(), now + Duration::from_secs(6)));
        assert!(filter.is_empty());
    }

    #[test]
    fn zero_window_disables_suppression() {
        let filter = EchoFilter::new(Duration::ZERO);
        filter.suppress(["R1".to_string()]);
        assert!(!filter.is_suppressed(&"R1".to_string()));
    }
}
