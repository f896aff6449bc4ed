//! Failure ledger
//!
//! Tracks which test files need to run next and, within them, which
//! `(class, method)` pairs are currently failing. Shared between the run loop
//! and the result server, so every operation takes the internal lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// class name -> failing methods
pub type ClassFailures = BTreeMap<String, BTreeSet<String>>;

/// A point-in-time copy of the ledger contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub tainted: bool,
    pub failures: BTreeMap<String, ClassFailures>,
}

impl LedgerSnapshot {
    /// Files with no recorded failures: run them whole
    pub fn full(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter(|(_, classes)| classes.is_empty())
            .map(|(file, _)| file.as_str())
            .collect()
    }

    /// Files with recorded failures: run only the failing methods
    pub fn partial(&self) -> Vec<(&str, &ClassFailures)> {
        self.failures
            .iter()
            .filter(|(_, classes)| !classes.is_empty())
            .map(|(file, classes)| (file.as_str(), classes))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    tainted: bool,
    failures: BTreeMap<String, ClassFailures>,
}

#[derive(Debug, Default)]
pub struct FailureLedger {
    state: Mutex<LedgerState>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Each operation leaves the state consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a method as failing. Repeat reports are absorbed.
    pub fn record_failure(&self, file: &str, class_name: &str, method_name: &str) {
        let mut state = self.lock();
        state.tainted = true;
        state
            .failures
            .entry(file.to_string())
            .or_default()
            .entry(class_name.to_string())
            .or_default()
            .insert(method_name.to_string());
    }

    /// Make sure `file` runs next time, without touching known failures.
    pub fn ensure_tracked(&self, file: &str) {
        let mut state = self.lock();
        if !state.failures.contains_key(file) {
            state.failures.insert(file.to_string(), ClassFailures::new());
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.tainted = false;
    }

    pub fn is_all_good(&self) -> bool {
        self.lock().failures.is_empty()
    }

    pub fn is_tainted(&self) -> bool {
        self.lock().tainted
    }

    /// Keys of the ledger: the files selected to run next
    pub fn pending(&self) -> Vec<String> {
        self.lock().failures.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.lock();
        LedgerSnapshot {
            tainted: state.tainted,
            failures: state.failures.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ensure_tracked_is_idempotent() {
        let ledger = FailureLedger::new();
        ledger.ensure_tracked("test/foo_test.rb");
        ledger.ensure_tracked("test/foo_test.rb");

        assert_eq!(ledger.pending(), vec!["test/foo_test.rb"]);
        assert!(ledger.snapshot().failures["test/foo_test.rb"].is_empty());
    }

    #[test]
    fn test_ensure_tracked_keeps_failures() {
        let ledger = FailureLedger::new();
        ledger.record_failure("test/foo_test.rb", "FooTest", "test_a");
        ledger.ensure_tracked("test/foo_test.rb");

        let snap = ledger.snapshot();
        assert_eq!(snap.failures["test/foo_test.rb"]["FooTest"].len(), 1);
    }

    #[test]
    fn test_record_failure_is_set_union() {
        let ledger = FailureLedger::new();
        ledger.record_failure("test/bar_test.rb", "BarTest", "test_x");
        ledger.record_failure("test/bar_test.rb", "BarTest", "test_x");
        ledger.record_failure("test/bar_test.rb", "BarTest", "test_y");

        let snap = ledger.snapshot();
        let methods: Vec<_> = snap.failures["test/bar_test.rb"]["BarTest"].iter().cloned().collect();
        assert_eq!(methods, vec!["test_x", "test_y"]);
        assert!(snap.tainted);
    }

    #[test]
    fn test_all_good_iff_empty() {
        let ledger = FailureLedger::new();
        assert!(ledger.is_all_good());

        ledger.ensure_tracked("test/a_test.rb");
        assert!(!ledger.is_all_good());

        ledger.clear();
        assert!(ledger.is_all_good());

        ledger.record_failure("test/a_test.rb", "ATest", "test_1");
        assert!(!ledger.is_all_good());
        assert!(ledger.is_tainted());

        ledger.clear();
        assert!(ledger.is_all_good());
        assert!(!ledger.is_tainted());
    }

    #[test]
    fn test_snapshot_partitions() {
        let ledger = FailureLedger::new();
        ledger.ensure_tracked("test/foo_test.rb");
        ledger.record_failure("test/bar_test.rb", "BarTest", "test_x");

        let snap = ledger.snapshot();
        assert_eq!(snap.full(), vec!["test/foo_test.rb"]);

        let partial = snap.partial();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].0, "test/bar_test.rb");
    }

    #[test]
    fn test_concurrent_reports() {
        let ledger = Arc::new(FailureLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    for j in 0..50 {
                        ledger.record_failure("test/c_test.rb", "CTest", &format!("test_{}", j % 10));
                        ledger.ensure_tracked(&format!("test/t{}_test.rb", i));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snap = ledger.snapshot();
        assert_eq!(snap.failures["test/c_test.rb"]["CTest"].len(), 10);
        assert_eq!(snap.failures.len(), 9);
    }
}
