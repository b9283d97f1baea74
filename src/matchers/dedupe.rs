//! Hit coalescing gate: at most one fire per window, with further hits
//! extending the window through a pending slot.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::entry::LogEntry;

use super::Hits;

// Padding on poll hints to absorb timer inaccuracy.
const HINT_SLOP: Duration = Duration::from_millis(10);

/// Gates a matcher's hits so bursts collapse into one fire per window.
///
/// While a window is active, the newest hit is parked in a pending slot
/// (older pending hits are discarded). When the window elapses the pending
/// hit is promoted, opening a new window. [`Dedupe::poll_fire`] covers
/// callers tracking real wall time, where the window can expire without a
/// new entry arriving to notice it.
pub struct Dedupe {
    window: i64,
    /// End of the active window; zero when idle.
    active: i64,
    pend_hit: Option<Vec<LogEntry>>,
}

impl Dedupe {
    pub fn new(window: i64) -> Self {
        Self {
            window,
            active: 0,
            pend_hit: None,
        }
    }

    /// Offers freshly-scanned hits to the gate.
    ///
    /// Returns the hit to fire now, if any, and a poll hint: when a new
    /// pending hit was parked, the duration until the active window elapses
    /// (plus slop), so the caller knows when to call [`Dedupe::poll_fire`].
    pub fn maybe_fire(
        &mut self,
        clock: i64,
        mut hits: Hits,
    ) -> (Option<Vec<LogEntry>>, Option<Duration>) {
        if hits.is_empty() {
            if self.active > 0 {
                return (self.fire_pending(clock), None);
            }
            return (None, None);
        }

        let mut fire = None;
        if self.active == 0 || clock >= self.active {
            self.active = hits.logs[0].timestamp + self.window;
            fire = hits.pop_front();
        }

        // Anything left parks as pending; only the newest survives.
        let mut hint = None;
        if hits.cnt > 0 {
            if self.pend_hit.is_none() {
                let diff = self.active - unix_now_nanos();
                hint = Some(if diff > 0 {
                    Duration::from_nanos(diff as u64) + HINT_SLOP
                } else {
                    // Already elapsed; poll immediately.
                    Duration::from_nanos(1)
                });
            }
            self.pend_hit = hits.last().map(<[LogEntry]>::to_vec);
        }

        (fire, hint)
    }

    fn fire_pending(&mut self, clock: i64) -> Option<Vec<LogEntry>> {
        if clock < self.active {
            return None;
        }
        match self.pend_hit.take() {
            None => {
                self.active = 0;
                None
            }
            Some(hit) => {
                self.active = hit[0].timestamp + self.window;
                Some(hit)
            }
        }
    }

    /// Wall-clock promotion of a pending hit whose window expired without a
    /// new entry arriving. Only meaningful on live feeds.
    pub fn poll_fire(&mut self) -> Option<Vec<LogEntry>> {
        if self.active == 0 {
            return None;
        }

        let now = unix_now_nanos();
        if now < self.active {
            return None;
        }

        let Some(hit) = self.pend_hit.take() else {
            self.active = 0;
            return None;
        };

        // A pending hit past its own window is stale; drop it.
        if hit[0].timestamp + self.window < now {
            self.active = 0;
            return None;
        }

        self.active = hit[0].timestamp + self.window;
        Some(hit)
    }
}

fn unix_now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
