//! Bookkeeping of creations and deletions the operator issued but has not yet seen in
//! its caches.
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::*;

use crate::kinds::Kind;

/// Expectations older than this are treated as satisfied so a lost watch event cannot
/// wedge the controller forever.
pub const EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Expectee {
    add: i64,
    del: i64,
    timestamp: Instant,
    pending_deletions: HashSet<String>,
}

impl Expectee {
    fn new() -> Self {
        Self {
            add: 0,
            del: 0,
            timestamp: Instant::now(),
            pending_deletions: HashSet::new(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.add <= 0 && self.del <= 0
    }
}

/// Per-kind expectations keyed by controller key
#[derive(Debug)]
pub struct Expectations {
    ttl: Duration,
    inner: Mutex<HashMap<(Kind, String), Expectee>>,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::with_timeout(EXPECTATIONS_TIMEOUT)
    }
}

impl Expectations {
    pub fn with_timeout(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn adjust(&self, kind: Kind, key: &str, add: i64, del: i64) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entry((kind, key.to_string()))
            .or_insert_with(Expectee::new);
        entry.add += add;
        entry.del += del;
        trace!(%kind, key, add = entry.add, del = entry.del, "expectations adjusted");
    }

    pub fn raise_expectations(&self, kind: Kind, key: &str, add: i64, del: i64) {
        self.adjust(kind, key, add, del);
    }

    pub fn lower_expectations(&self, kind: Kind, key: &str, add: i64, del: i64) {
        self.adjust(kind, key, -add, -del);
    }

    pub fn creation_observed(&self, kind: Kind, key: &str) {
        self.lower_expectations(kind, key, 1, 0);
    }

    /// Records that `object_key` is about to be deleted on behalf of `key`
    pub fn add_expected_deletion(&self, kind: Kind, key: &str, object_key: &str) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entry((kind, key.to_string()))
            .or_insert_with(Expectee::new);
        if entry.pending_deletions.insert(object_key.to_string()) {
            entry.del += 1;
        }
    }

    /// Clears a pending deletion. Deletions that were never expected are ignored.
    pub fn deletion_observed(&self, kind: Kind, key: &str, object_key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&(kind, key.to_string())) {
            if entry.pending_deletions.remove(object_key) {
                entry.del -= 1;
            }
        }
    }

    pub fn satisfied(&self, kind: Kind, key: &str) -> bool {
        let inner = self.inner.lock();
        match inner.get(&(kind, key.to_string())) {
            None => true,
            Some(e) if e.fulfilled() => true,
            Some(e) if e.timestamp.elapsed() > self.ttl => {
                debug!(%kind, key, "expectations expired");
                true
            }
            Some(_) => false,
        }
    }

    /// True when no kind has outstanding work for `key`
    pub fn all_satisfied(&self, key: &str) -> bool {
        Kind::ALL.iter().all(|k| self.satisfied(*k, key))
    }

    /// Kinds that still wait on events for `key`, for logging
    pub fn unsatisfied_kinds(&self, key: &str) -> Vec<Kind> {
        Kind::ALL
            .iter()
            .copied()
            .filter(|k| !self.satisfied(*k, key))
            .collect()
    }

    /// Zeroes every counter for `key` and restarts its timeout
    pub fn reset(&self, key: &str) {
        let mut inner = self.inner.lock();
        for ((_, k), e) in inner.iter_mut() {
            if k == key {
                *e = Expectee::new();
            }
        }
    }

    pub fn delete_expectations(&self, key: &str) {
        self.inner.lock().retain(|(_, k), _| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "kubevirt/kubevirt";

    #[test]
    fn creations_must_be_observed() {
        let e = Expectations::default();
        assert!(e.all_satisfied(KEY));
        e.raise_expectations(Kind::Deployment, KEY, 2, 0);
        assert!(!e.all_satisfied(KEY));
        assert_eq!(e.unsatisfied_kinds(KEY), vec![Kind::Deployment]);
        e.creation_observed(Kind::Deployment, KEY);
        assert!(!e.satisfied(Kind::Deployment, KEY));
        e.creation_observed(Kind::Deployment, KEY);
        assert!(e.satisfied(Kind::Deployment, KEY));
    }

    #[test]
    fn deletions_are_tracked_by_object_key() {
        let e = Expectations::default();
        e.add_expected_deletion(Kind::Service, KEY, "kubevirt/virt-api");
        e.add_expected_deletion(Kind::Service, KEY, "kubevirt/virt-api");
        assert!(!e.all_satisfied(KEY));
        e.deletion_observed(Kind::Service, KEY, "kubevirt/other");
        assert!(!e.all_satisfied(KEY));
        e.deletion_observed(Kind::Service, KEY, "kubevirt/virt-api");
        assert!(e.all_satisfied(KEY));
    }

    #[test]
    fn expired_expectations_count_as_satisfied() {
        let e = Expectations::with_timeout(Duration::ZERO);
        e.raise_expectations(Kind::Crd, KEY, 1, 0);
        std::thread::sleep(Duration::from_millis(2));
        assert!(e.all_satisfied(KEY));
    }

    #[test]
    fn reset_and_delete_clear_counters() {
        let e = Expectations::default();
        e.raise_expectations(Kind::Secret, KEY, 1, 1);
        e.reset(KEY);
        assert!(e.all_satisfied(KEY));
        e.raise_expectations(Kind::Secret, KEY, 1, 0);
        e.delete_expectations(KEY);
        assert!(e.all_satisfied(KEY));
    }
}
