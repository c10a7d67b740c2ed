//! Per-identity cooldown after a pending detection is emitted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `identity → earliest instant a new confirmation may fire`.
///
/// Entries are never swept: a candidate session that began while its
/// identity was blocked is still judged against the entry after it expires,
/// and the ledger is bounded by the number of enrolled identities.
#[derive(Debug, Default)]
pub struct CooldownLedger {
    until: HashMap<String, Instant>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while `at` falls before the identity's cooldown end.
    pub fn is_blocked(&self, identity: &str, at: Instant) -> bool {
        self.until.get(identity).is_some_and(|until| at < *until)
    }

    pub fn start_cooldown(&mut self, identity: &str, now: Instant, duration: Duration) {
        self.until.insert(identity.to_string(), now + duration);
    }

    /// Time left before `identity` may confirm again.
    pub fn remaining(&self, identity: &str, now: Instant) -> Option<Duration> {
        self.until
            .get(identity)
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    pub fn len(&self) -> usize {
        self.until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}
