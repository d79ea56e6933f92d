//! In-memory record of completed token exchanges, keyed by pool UID.
//!
//! Together with `status.registration` this keeps each exchange to at most
//! one success per pool, even when a status write is lost between passes.

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Registered,
    Deregistered,
}

#[derive(Debug, Default)]
pub struct RegistrationLedger {
    entries: DashMap<String, Exchange>,
}

impl RegistrationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_registered(&self, uid: &str) -> bool {
        self.entries
            .get(uid)
            .is_some_and(|e| *e == Exchange::Registered)
    }

    pub fn mark_registered(&self, uid: &str) {
        self.entries.insert(uid.to_string(), Exchange::Registered);
    }

    #[must_use]
    pub fn is_deregistered(&self, uid: &str) -> bool {
        self.entries
            .get(uid)
            .is_some_and(|e| *e == Exchange::Deregistered)
    }

    pub fn mark_deregistered(&self, uid: &str) {
        self.entries.insert(uid.to_string(), Exchange::Deregistered);
    }

    /// Drop a pool whose finalizer has been released
    pub fn forget(&self, uid: &str) {
        self.entries.remove(uid);
    }

    /// Number of pools tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deregistration_supersedes_registration() {
        let ledger = RegistrationLedger::new();
        assert!(!ledger.is_registered("a"));

        ledger.mark_registered("a");
        assert!(ledger.is_registered("a"));
        assert!(!ledger.is_deregistered("a"));

        ledger.mark_deregistered("a");
        assert!(!ledger.is_registered("a"));
        assert!(ledger.is_deregistered("a"));
    }

    #[test]
    fn forgotten_pools_leave_no_entry() {
        let ledger = RegistrationLedger::new();
        ledger.mark_registered("a");
        ledger.mark_deregistered("b");

        ledger.forget("b");
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.is_deregistered("b"));
        ledger.forget("a");
        assert!(ledger.is_empty());
    }

    #[test]
    fn pools_are_tracked_independently() {
        let ledger = RegistrationLedger::new();
        ledger.mark_registered("a");
        assert!(!ledger.is_registered("b"));
    }
}
