//! # Hybrid Logical Clock
//!
//! Monotonic, thread-safe hybrid timestamps used to totally order receipts
//! despite unsynchronized terminal clocks.
//!
//! ## Why Not Wall Clocks?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POS terminals drift. NTP is not guaranteed on a shop LAN.              │
//! │                                                                         │
//! │  Wall clock only:                                                       │
//! │    10:00:01 receipt A    ← terminal clock jumps back 2s                 │
//! │    09:59:59 receipt B    ← B now sorts BEFORE A. Wrong causal order!    │
//! │                                                                         │
//! │  Hybrid clock:                                                          │
//! │    (10:00:01, 0) receipt A                                              │
//! │    (10:00:01, 1) receipt B  ← wall time regressed, counter ticked       │
//! │                                                                         │
//! │  Once the OFD confirms a receipt it hands back an authoritative         │
//! │  server time, which then dominates ordering.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Rule
//! Compare `server_time` when both sides carry one, otherwise each side
//! contributes `server_time ?? local_time`; ties break on the logical
//! counter.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// =============================================================================
// Timestamp
// =============================================================================

/// A hybrid timestamp: wall seconds + logical counter + optional
/// authoritative server time.
///
/// Assigned to a receipt exactly once at creation and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Local wall-clock seconds since the Unix epoch.
    pub local_time: i64,
    /// Logical counter disambiguating same-second events.
    pub logical_counter: i64,
    /// Authoritative time handed back by the remote operator, if any.
    /// Dominates ordering once present.
    pub server_time: Option<i64>,
}

impl HlcTimestamp {
    /// Creates a timestamp with no server component.
    pub const fn new(local_time: i64, logical_counter: i64) -> Self {
        HlcTimestamp {
            local_time,
            logical_counter,
            server_time: None,
        }
    }

    /// The value this side contributes to ordering: `server_time ?? local_time`.
    #[inline]
    pub fn effective_time(&self) -> i64 {
        self.server_time.unwrap_or(self.local_time)
    }

    /// Returns a copy carrying the authoritative server time.
    ///
    /// The original value is unchanged; a receipt's stored order key is
    /// immutable.
    pub fn with_server_time(&self, server_time: i64) -> Self {
        HlcTimestamp {
            server_time: Some(server_time),
            ..*self
        }
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.effective_time()
            .cmp(&other.effective_time())
            .then_with(|| self.logical_counter.cmp(&other.logical_counter))
            // Keeps the order total when effective times coincide but only
            // one side carries a server component.
            .then_with(|| self.server_time.cmp(&other.server_time))
            .then_with(|| self.local_time.cmp(&other.local_time))
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.server_time {
            Some(st) => write!(f, "{}.{}@{}", self.local_time, self.logical_counter, st),
            None => write!(f, "{}.{}", self.local_time, self.logical_counter),
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Internal mutable state: the last issued (time, counter) pair.
#[derive(Debug, Clone, Copy)]
struct ClockState {
    last_time: i64,
    counter: i64,
}

/// Process-wide hybrid logical clock.
///
/// One clock per process; dependents receive a shared handle rather than
/// reaching for ambient globals. The critical section is a handful of
/// integer comparisons, so a plain `Mutex` is sufficient.
#[derive(Debug)]
pub struct HybridClock {
    state: Mutex<ClockState>,
}

impl HybridClock {
    /// Creates a clock starting at the current wall time.
    pub fn new() -> Self {
        HybridClock {
            state: Mutex::new(ClockState {
                last_time: wall_seconds(),
                counter: 0,
            }),
        }
    }

    /// Generates the next timestamp.
    ///
    /// If the wall clock advanced past the last recorded second, the counter
    /// resets to 0; otherwise (same second, or a clock that jumped backwards)
    /// it increments. Successive calls never return equal values.
    pub fn generate(&self) -> HlcTimestamp {
        let now = wall_seconds();
        let mut state = self.state.lock().expect("clock mutex poisoned");

        if now > state.last_time {
            state.last_time = now;
            state.counter = 0;
        } else {
            state.counter += 1;
        }

        HlcTimestamp::new(state.last_time, state.counter)
    }

    /// Merges a remote-confirmed timestamp into the clock.
    ///
    /// The new local time is `max(last_local_time, remote.local_time, now)`:
    /// - equal to both the prior local time and the remote's time →
    ///   counter becomes `max(local_counter, remote.counter) + 1`
    /// - equal to the remote's time only → counter becomes `remote.counter + 1`
    /// - equal to the prior local time only → counter increments
    /// - advanced past both → counter resets to 0
    ///
    /// The returned value is strictly greater than `remote` and than every
    /// previously generated local value.
    pub fn advance(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let now = wall_seconds();
        let remote_time = remote.effective_time();
        let mut state = self.state.lock().expect("clock mutex poisoned");

        let new_time = state.last_time.max(remote_time).max(now);

        let new_counter = if new_time == state.last_time && new_time == remote_time {
            state.counter.max(remote.logical_counter) + 1
        } else if new_time == remote_time {
            remote.logical_counter + 1
        } else if new_time == state.last_time {
            state.counter + 1
        } else {
            0
        };

        state.last_time = new_time;
        state.counter = new_counter;

        HlcTimestamp::new(new_time, new_counter)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        HybridClock::new()
    }
}

/// Current wall-clock seconds since the Unix epoch.
fn wall_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_generate_monotone_and_unique() {
        let clock = HybridClock::new();

        let mut prev = clock.generate();
        for _ in 0..1000 {
            let next = clock.generate();
            assert!(next > prev, "clock went backwards: {next} <= {prev}");
            prev = next;
        }
    }

    #[test]
    fn test_concurrent_generations_are_unique() {
        let clock = Arc::new(HybridClock::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| clock.generate()).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let unique: BTreeSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "duplicate timestamps generated");
    }

    #[test]
    fn test_advance_exceeds_remote_and_local() {
        let clock = HybridClock::new();
        let local = clock.generate();

        // Remote far in the future (skewed clock)
        let remote = HlcTimestamp::new(local.local_time + 3600, 7);
        let merged = clock.advance(&remote);

        assert!(merged > remote);
        assert!(merged > local);
        assert_eq!(merged.local_time, remote.local_time);
        assert_eq!(merged.logical_counter, 8);

        // And the next generated value stays ahead of the merge
        let after = clock.generate();
        assert!(after > merged);
    }

    #[test]
    fn test_advance_with_stale_remote() {
        let clock = HybridClock::new();
        let local = clock.generate();

        let remote = HlcTimestamp::new(local.local_time - 100, 42);
        let merged = clock.advance(&remote);

        assert!(merged > remote);
        assert!(merged > local);
    }

    #[test]
    fn test_server_time_dominates_ordering() {
        let early = HlcTimestamp::new(100, 5);
        let late = HlcTimestamp::new(200, 0);
        assert!(early < late);

        // Server says the "early" one actually came later
        let confirmed = early.with_server_time(300);
        assert!(confirmed > late);

        // Both confirmed: server times compared directly
        let other = late.with_server_time(250);
        assert!(confirmed > other);
    }

    #[test]
    fn test_with_server_time_copies() {
        let ts = HlcTimestamp::new(100, 1);
        let stamped = ts.with_server_time(500);

        assert_eq!(ts.server_time, None);
        assert_eq!(stamped.server_time, Some(500));
        assert_eq!(stamped.local_time, ts.local_time);
        assert_eq!(stamped.logical_counter, ts.logical_counter);
    }

    #[test]
    fn test_counter_ties_break_order() {
        let a = HlcTimestamp::new(100, 1);
        let b = HlcTimestamp::new(100, 2);
        assert!(a < b);
    }
}
