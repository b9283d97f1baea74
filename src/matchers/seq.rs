//! Positional sequence matcher.
//!
//! A simple state machine where the transition from one position to the next
//! is a successful match on the next term. When the machine reaches its
//! final position the hit fires. State is edge triggered: it only changes on
//! a new entry, so the matcher behaves correctly on historic logs that are
//! not aligned with real time.
//!
//! Ordering is non-strict: two entries with the same timestamp count as
//! sequential, accounting for low-resolution clocks that stamp genuinely
//! ordered events identically.

use tracing::warn;

use crate::entry::LogEntry;
use crate::mask::SlotMask;
use crate::term::Term;

use super::{
    compile_seq_terms, count_expired, mini_gc, shift_left, Hits, Matcher, RuleError, TermSlot,
};

/// Matches N terms at fixed positions with non-decreasing timestamps within
/// a window.
///
/// Overfire is suppressed: once a trailing entry closes a hit, earlier
/// candidates that could also have closed with it are consumed, not
/// re-emitted.
pub struct MatchSeq {
    clock: i64,
    window: i64,
    n_active: usize,
    dupe_mask: SlotMask,
    slots: Vec<TermSlot>,
}

impl MatchSeq {
    pub fn new(window: i64, terms: &[Term]) -> Result<Self, RuleError> {
        let (slots, dupe_mask) = compile_seq_terms(terms)?;
        Ok(Self {
            clock: 0,
            window,
            n_active: 0,
            dupe_mask,
            slots,
        })
    }

    fn maybe_gc(&mut self, clock: i64) {
        // Position 0 anchors the window; nothing can expire before it does.
        let Some(first) = self.slots[0].asserts.first() else {
            return;
        };
        if clock - first.timestamp < self.window {
            return;
        }
        self.garbage_collect(clock);
    }

    /// Drops position-0 asserts older than the window, then restores the
    /// sequence invariants.
    pub fn garbage_collect(&mut self, clock: i64) {
        let deadline = clock - self.window;
        let expired = count_expired(&self.slots[0].asserts, deadline);
        if expired > 0 {
            shift_left(&mut self.slots[0].asserts, expired);
        }
        self.n_active = mini_gc(&mut self.slots, self.dupe_mask, self.n_active);
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        self.n_active
    }
}

impl Matcher for MatchSeq {
    fn scan(&mut self, entry: LogEntry) -> Hits {
        if entry.timestamp < self.clock {
            warn!(
                line = %entry.line,
                stamp = entry.timestamp,
                clock = self.clock,
                "MatchSeq: out of order event"
            );
            return Hits::default();
        }
        self.clock = entry.timestamp;

        self.maybe_gc(entry.timestamp);

        // Candidate entries for positions that are already active.
        for i in 0..self.n_active {
            if (self.slots[i].matcher)(&entry.line) {
                self.slots[i].asserts.push(entry.clone());
            }
        }

        let active = self.n_active;
        if !(self.slots[active].matcher)(&entry.line) {
            return Hits::default();
        }

        // The entry advances the sequence.
        self.n_active += 1;

        if self.n_active < self.slots.len() {
            self.slots[active].asserts.push(entry);
            return Hits::default();
        }

        // Full frame: fire the earliest assert of every position, with this
        // entry closing the sequence.
        let mut hits = Hits {
            cnt: 1,
            logs: Vec::with_capacity(self.slots.len()),
        };
        for i in 0..self.slots.len() - 1 {
            hits.logs.push(self.slots[i].asserts[0].clone());
            shift_left(&mut self.slots[i].asserts, 1);
        }
        hits.logs.push(entry);

        self.n_active = mini_gc(&mut self.slots, self.dupe_mask, self.n_active);
        hits
    }

    // Edge triggered; time alone cannot produce a sequence hit.
    fn eval(&mut self, _clock: i64) -> Hits {
        Hits::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::testutil::{no_fire, stamps};

    fn terms(values: &[&str]) -> Vec<Term> {
        values.iter().map(|v| Term::parse(v)).collect()
    }

    fn seq(window: i64, values: &[&str]) -> MatchSeq {
        MatchSeq::new(window, &terms(values)).unwrap()
    }

    #[test]
    fn simple_two_term_sequence() {
        let mut sm = seq(10, &["alpha", "beta"]);
        no_fire(&sm.scan(LogEntry::new(1, "noop")));
        no_fire(&sm.scan(LogEntry::new(2, "beta")));
        no_fire(&sm.scan(LogEntry::new(3, "alpha")));
        let hits = sm.scan(LogEntry::new(4, "beta"));
        assert_eq!(stamps(&hits), [3, 4]);
    }

    #[test]
    fn overfire_suppressed() {
        // alpha@1..3 then beta@4 must fire only {1,4}.
        let mut sm = seq(10, &["alpha", "beta"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(2, "alpha")));
        no_fire(&sm.scan(LogEntry::new(3, "alpha")));
        let hits = sm.scan(LogEntry::new(4, "beta"));
        assert_eq!(hits.cnt, 1);
        assert_eq!(stamps(&hits), [1, 4]);
    }

    #[test]
    fn overlapping_frames_fire_in_turn() {
        let mut sm = seq(20, &["alpha", "beta", "gamma"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(2, "alpha")));
        no_fire(&sm.scan(LogEntry::new(3, "beta")));
        no_fire(&sm.scan(LogEntry::new(4, "alpha")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(5, "gamma"))), [1, 3, 5]);
        no_fire(&sm.scan(LogEntry::new(6, "beta")));
        no_fire(&sm.scan(LogEntry::new(7, "alpha")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(8, "gamma"))), [2, 6, 8]);
        no_fire(&sm.scan(LogEntry::new(9, "beta")));
        no_fire(&sm.scan(LogEntry::new(10, "noop")));
        no_fire(&sm.scan(LogEntry::new(11, "noop")));
        no_fire(&sm.scan(LogEntry::new(12, "noop")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(13, "gamma"))), [4, 9, 13]);

        // The alpha@7 candidate lingers until it ages past the window.
        sm.garbage_collect(7 + 20);
        assert_eq!(sm.active(), 1);
        sm.garbage_collect(7 + 20 + 1);
        assert_eq!(sm.active(), 0);
    }

    #[test]
    fn window_expires_partial_match() {
        let mut sm = seq(10, &["alpha", "beta"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(1 + 10 + 1, "beta")));
        assert_eq!(sm.active(), 0);
    }

    #[test]
    fn window_keeps_recent_candidate() {
        let mut sm = seq(20, &["alpha", "beta"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(22, "beta")));
        no_fire(&sm.scan(LogEntry::new(23, "alpha")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(24, "beta"))), [23, 24]);

        no_fire(&sm.scan(LogEntry::new(25, "alpha")));
        no_fire(&sm.scan(LogEntry::new(35, "alpha")));
        no_fire(&sm.scan(LogEntry::new(46, "noop")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(47, "beta"))), [35, 47]);
        assert_eq!(sm.active(), 0);
    }

    #[test]
    fn one_line_matches_every_position() {
        // One entry per term, all at the same timestamp.
        let mut sm = seq(10, &["alpha", "beta", "gamma"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha1")));
        no_fire(&sm.scan(LogEntry::new(1, "beta1")));
        let hits = sm.scan(LogEntry::new(1, "gamma1"));
        let lines: Vec<&str> = hits.logs.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, ["alpha1", "beta1", "gamma1"]);
    }

    #[test]
    fn duplicate_term_ladder() {
        // terms = [d, d, d, m], window 10; hits {1,3,4,7} then {3,4,5,8}.
        let mut sm = seq(
            10,
            &[
                "Discarding message",
                "Discarding message",
                "Discarding message",
                "Mnesia overloaded",
            ],
        );
        no_fire(&sm.scan(LogEntry::new(1, "Discarding message")));
        no_fire(&sm.scan(LogEntry::new(2, "Mnesia overloaded")));
        no_fire(&sm.scan(LogEntry::new(3, "Discarding message")));
        no_fire(&sm.scan(LogEntry::new(4, "Discarding message")));
        no_fire(&sm.scan(LogEntry::new(5, "Discarding message")));
        no_fire(&sm.scan(LogEntry::new(6, "Discarding message")));
        assert_eq!(
            stamps(&sm.scan(LogEntry::new(7, "Mnesia overloaded"))),
            [1, 3, 4, 7]
        );
        assert_eq!(
            stamps(&sm.scan(LogEntry::new(8, "Mnesia overloaded"))),
            [3, 4, 5, 8]
        );
        // Same-timestamp entries count as in sequence, so the window must
        // pass the last duplicate before the ladder stops firing.
        no_fire(&sm.scan(LogEntry::new(6 + 10 + 1, "Mnesia overloaded")));
    }

    #[test]
    fn gc_old_candidates_between_fires() {
        let mut sm = seq(50, &["alpha", "beta", "gamma"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(2, "beta")));
        no_fire(&sm.scan(LogEntry::new(3, "beta")));
        no_fire(&sm.scan(LogEntry::new(4, "alpha")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(5, "gamma"))), [1, 2, 5]);
        no_fire(&sm.scan(LogEntry::new(6, "gamma")));
        no_fire(&sm.scan(LogEntry::new(7, "gamma")));
        no_fire(&sm.scan(LogEntry::new(8, "beta")));
        no_fire(&sm.scan(LogEntry::new(9, "beta")));
        no_fire(&sm.scan(LogEntry::new(10, "alpha")));
        no_fire(&sm.scan(LogEntry::new(11, "beta")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(12, "gamma"))), [4, 8, 12]);
        sm.garbage_collect(12 + 50);
        assert_eq!(sm.active(), 0);
    }

    #[test]
    fn out_of_order_entry_ignored() {
        let mut sm = seq(10, &["alpha", "gamma"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(0, "gamma")));
    }

    #[test]
    fn equal_timestamps_satisfy_order() {
        let mut sm = seq(10, &["alpha", "gamma"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        assert_eq!(stamps(&sm.scan(LogEntry::new(1, "gamma"))), [1, 1]);
    }

    #[test]
    fn noop_scan_only_advances_clock() {
        let mut sm = seq(10, &["alpha", "beta"]);
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(2, "nothing to see")));
        assert_eq!(sm.active(), 1);
        assert_eq!(sm.clock, 2);
    }
}
