//! One-shot timers and the clock they read.
//!
//! The coordinator owns a handful of timers (frame clock, idle,
//! disconnect, connect) but never blocks: the embedding I/O loop asks for
//! the next deadline, sleeps at most that long, then calls back in so
//! expired timers can be dispatched. Timers are identified by the opaque
//! [`TimerToken`] handed out at registration, so dispatch is an identity
//! comparison against the tokens the owner kept.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Source of the current time.
///
/// Injected into the coordinator so tests (and embedders that simulate
/// time) can drive it deterministically.
pub trait Clock {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Identity of a timer within its [`TimerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(usize);

#[derive(Debug, Default, Clone, Copy)]
struct TimerEntry {
    deadline: Option<Instant>,
    /// Deadline of the most recent firing, kept so `repeat` can hold a
    /// steady cadence.
    fired: Option<Instant>,
}

/// A set of one-shot timers sharing one clock.
pub struct TimerSet {
    clock: Rc<dyn Clock>,
    entries: Vec<TimerEntry>,
}

impl TimerSet {
    /// Creates an empty set reading from `clock`.
    #[must_use]
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    /// Registers a new, stopped timer and returns its identity.
    pub fn register(&mut self) -> TimerToken {
        self.entries.push(TimerEntry::default());
        TimerToken(self.entries.len() - 1)
    }

    /// Arms the timer to fire `ms` milliseconds from now, replacing any
    /// previous deadline.
    pub fn start(&mut self, t: TimerToken, ms: u64) {
        self.entries[t.0].deadline = Some(self.clock.now() + Duration::from_millis(ms));
    }

    /// Disarms the timer.
    pub fn stop(&mut self, t: TimerToken) {
        self.entries[t.0].deadline = None;
    }

    /// True if the timer is armed.
    #[must_use]
    pub fn is_started(&self, t: TimerToken) -> bool {
        self.entries[t.0].deadline.is_some()
    }

    /// Re-arms a just-fired timer `ms` after the deadline it fired at, so
    /// a periodic timer does not drift. Falls back to `now + ms` when the
    /// previous deadline has fallen more than a period behind (or the
    /// timer never fired).
    pub fn repeat(&mut self, t: TimerToken, ms: u64) {
        let now = self.clock.now();
        let period = Duration::from_millis(ms);
        let entry = &mut self.entries[t.0];
        let base = entry.deadline.or(entry.fired);
        entry.deadline = Some(match base {
            Some(previous) if previous + period > now => previous + period,
            _ => now + period,
        });
    }

    /// Milliseconds until the timer fires; 0 when overdue or stopped.
    #[must_use]
    pub fn remaining_ms(&self, t: TimerToken) -> u64 {
        match self.entries[t.0].deadline {
            Some(deadline) => deadline
                .saturating_duration_since(self.clock.now())
                .as_millis() as u64,
            None => 0,
        }
    }

    /// Time until the earliest armed deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter_map(|e| e.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
    }

    /// Disarms and returns every timer whose deadline has passed, in
    /// registration order.
    pub fn take_expired(&mut self) -> Vec<TimerToken> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if matches!(entry.deadline, Some(deadline) if deadline <= now) {
                entry.fired = entry.deadline.take();
                expired.push(TimerToken(i));
            }
        }
        expired
    }
}
