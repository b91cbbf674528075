//! Tracking of peers with repeated authentication failures.
//!
//! After a configurable number of failures, an address is blocked for a
//! window that doubles with every further attempt, so a brute-forcing
//! peer is throttled harder the longer it keeps trying. A successful
//! authentication clears the record entirely.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::timer::Clock;

#[derive(Debug)]
struct BlacklistEntry {
    marks: u32,
    blocked_until: Instant,
    block_window: Duration,
}

/// Failed-authentication bookkeeping, keyed by peer address.
pub struct Blacklist {
    clock: Rc<dyn Clock>,
    threshold: u32,
    initial_window: Duration,
    entries: HashMap<String, BlacklistEntry>,
}

impl Blacklist {
    /// Creates a blacklist.
    ///
    /// `threshold` failures from one address trigger blocking;
    /// `timeout_secs` is the first block window, doubled on each
    /// subsequent failure.
    #[must_use]
    pub fn new(clock: Rc<dyn Clock>, threshold: u32, timeout_secs: u32) -> Self {
        Self {
            clock,
            threshold: threshold.max(1),
            initial_window: Duration::from_secs(u64::from(timeout_secs)),
            entries: HashMap::new(),
        }
    }

    /// Records one authentication failure for `address`.
    pub fn blackmark(&mut self, address: &str) {
        let now = self.clock.now();
        let initial_window = self.initial_window;
        let entry = self
            .entries
            .entry(address.to_string())
            .or_insert_with(|| BlacklistEntry {
                marks: 0,
                blocked_until: now,
                block_window: initial_window,
            });
        entry.marks += 1;
        if entry.marks >= self.threshold {
            entry.blocked_until = now + entry.block_window;
            log::info!(
                target: "connections",
                "Blacklisting {address} for {}s ({} failures)",
                entry.block_window.as_secs(),
                entry.marks
            );
            // Next failure blocks for twice as long.
            entry.block_window = entry.block_window.saturating_mul(2);
        }
    }

    /// True if connections from `address` should be rejected outright.
    #[must_use]
    pub fn is_blackmarked(&self, address: &str) -> bool {
        match self.entries.get(address) {
            Some(entry) => {
                entry.marks >= self.threshold && self.clock.now() < entry.blocked_until
            }
            None => false,
        }
    }

    /// Forgets all failures recorded for `address`.
    pub fn clear_blackmark(&mut self, address: &str) {
        self.entries.remove(address);
    }
}
