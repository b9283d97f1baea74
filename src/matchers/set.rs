//! Unordered conjunction matcher: N terms within a window, any order.

use ahash::AHashMap;
use tracing::warn;

use crate::entry::LogEntry;
use crate::mask::SlotMask;
use crate::term::Term;

use super::{
    compile_set_terms, count_expired, frame_match, shift_left, Hits, Matcher, RuleError, TermSlot,
    DISABLE_GC,
};

/// Matches when every term has been observed within the window, regardless
/// of order.
///
/// Duplicate terms in the rule collapse into one slot that needs that many
/// distinct entries before it counts as hot. Framing repeatedly takes the
/// earliest candidate of every slot; when the frame exceeds the window the
/// earliest assert is the bottleneck and is dropped so a later framing can
/// succeed.
pub struct MatchSet {
    clock: i64,
    window: i64,
    gc_mark: i64,
    hot_mask: SlotMask,
    slots: Vec<TermSlot>,
    dupes: AHashMap<usize, usize>,
}

impl MatchSet {
    pub fn new(window: i64, terms: &[Term]) -> Result<Self, RuleError> {
        let (slots, dupes) = compile_set_terms(terms)?;
        Ok(Self {
            clock: 0,
            window,
            gc_mark: DISABLE_GC,
            hot_mask: SlotMask::empty(),
            slots,
            dupes,
        })
    }

    #[inline]
    fn need(&self, slot: usize) -> usize {
        self.dupes.get(&slot).copied().unwrap_or(1)
    }

    fn maybe_gc(&mut self, clock: i64) {
        if clock < self.gc_mark {
            return;
        }
        self.garbage_collect(clock);
    }

    /// Drops asserts older than the window and re-arms the collection mark.
    pub fn garbage_collect(&mut self, clock: i64) {
        let deadline = clock - self.window;
        for i in 0..self.slots.len() {
            let expired = count_expired(&self.slots[i].asserts, deadline);
            if expired > 0 {
                shift_left(&mut self.slots[i].asserts, expired);
            }
            if self.slots[i].asserts.len() < self.need(i) {
                self.hot_mask.clear(i);
            }
        }
        self.rearm_gc_mark();
    }

    fn rearm_gc_mark(&mut self) {
        let mut mark = DISABLE_GC;
        for slot in &self.slots {
            if let Some(first) = slot.asserts.first() {
                mark = mark.min(first.timestamp + self.window);
            }
        }
        self.gc_mark = mark;
    }

    fn fire_frames(&mut self) -> Hits {
        let n_slots = self.slots.len();
        let mut hits = Hits::default();

        while self.hot_mask.first_n(n_slots) {
            let (bottleneck, t_start, t_stop) = frame_match(&self.slots, &self.dupes);

            if t_stop - t_start > self.window {
                // The frame cannot close; the earliest assert is the
                // bottleneck. Drop it and retry.
                let remaining = shift_left(&mut self.slots[bottleneck].asserts, 1);
                if remaining < self.need(bottleneck) {
                    self.hot_mask.clear(bottleneck);
                }
                continue;
            }

            hits.cnt += 1;
            if hits.logs.capacity() == 0 {
                hits.logs.reserve(n_slots);
            }
            for i in 0..n_slots {
                let need = self.need(i);
                hits.logs.extend_from_slice(&self.slots[i].asserts[..need]);
                if shift_left(&mut self.slots[i].asserts, need) < need {
                    self.hot_mask.clear(i);
                }
            }
        }

        self.rearm_gc_mark();
        hits
    }
}

impl Matcher for MatchSet {
    fn scan(&mut self, entry: LogEntry) -> Hits {
        if entry.timestamp < self.clock {
            warn!(
                line = %entry.line,
                stamp = entry.timestamp,
                clock = self.clock,
                "MatchSet: out of order event"
            );
            return Hits::default();
        }
        self.clock = entry.timestamp;

        self.maybe_gc(entry.timestamp);

        // A set must scan every term; it cannot short-circuit like a
        // sequence.
        for i in 0..self.slots.len() {
            if (self.slots[i].matcher)(&entry.line) {
                self.slots[i].asserts.push(entry.clone());
                if self.slots[i].asserts.len() >= self.need(i) {
                    self.hot_mask.set(i);
                }
                self.gc_mark = self.gc_mark.min(entry.timestamp + self.window);
            }
        }

        if !self.hot_mask.first_n(self.slots.len()) {
            return Hits::default();
        }

        self.fire_frames()
    }

    // Edge triggered; time alone cannot produce a set hit.
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

    #[test]
    fn single_term_set() {
        let mut sm = MatchSet::new(10, &terms(&["alpha"])).unwrap();
        let hits = sm.scan(LogEntry::new(1, "alpha"));
        assert_eq!(hits.cnt, 1);
        assert_eq!(stamps(&hits), [1]);
    }

    #[test]
    fn fires_in_slot_order() {
        let mut sm = MatchSet::new(50, &terms(&["alpha", "beta", "gamma"])).unwrap();

        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(2, "gamma")));

        let hits = sm.scan(LogEntry::new(3, "beta"));
        assert_eq!(hits.cnt, 1);
        assert_eq!(stamps(&hits), [1, 3, 2]);

        no_fire(&sm.scan(LogEntry::new(4, "gamma")));
        no_fire(&sm.scan(LogEntry::new(5, "alpha")));
        no_fire(&sm.scan(LogEntry::new(6, "gamma")));

        let hits = sm.scan(LogEntry::new(7, "beta"));
        assert_eq!(hits.cnt, 1);
        assert_eq!(stamps(&hits), [5, 7, 4]);
        assert_eq!(sm.hot_mask.bits(), 0b100);

        no_fire(&sm.scan(LogEntry::new(8, "beta")));
        assert_eq!(sm.hot_mask.bits(), 0b110);
    }

    #[test]
    fn window_bottleneck_drops_earliest() {
        let mut sm = MatchSet::new(5, &terms(&["alpha", "beta", "gamma"])).unwrap();

        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(4, "gamma")));
        // alpha@1 is out of window against beta@7; the frame must not close.
        no_fire(&sm.scan(LogEntry::new(7, "beta")));

        let hits = sm.scan(LogEntry::new(8, "alpha"));
        assert_eq!(hits.cnt, 1);
        assert_eq!(stamps(&hits), [8, 7, 4]);

        no_fire(&sm.scan(LogEntry::new(9, "gamma")));
        assert_eq!(sm.hot_mask.bits(), 0b100);
    }

    #[test]
    fn duplicate_timestamps_frame() {
        let mut sm = MatchSet::new(5, &terms(&["alpha", "beta", "gamma"])).unwrap();
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(1, "gamma")));
        let hits = sm.scan(LogEntry::new(1, "beta"));
        assert_eq!(hits.cnt, 1);
    }

    #[test]
    fn duplicate_term_needs_two_entries() {
        // terms = [alpha, alpha, beta], window 5
        let mut sm = MatchSet::new(5, &terms(&["alpha", "alpha", "beta"])).unwrap();

        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        no_fire(&sm.scan(LogEntry::new(2, "beta")));
        no_fire(&sm.scan(LogEntry::new(7, "alpha")));
        no_fire(&sm.scan(LogEntry::new(8, "alpha")));

        let hits = sm.scan(LogEntry::new(11, "beta"));
        assert_eq!(hits.cnt, 1);
        assert_eq!(stamps(&hits), [7, 8, 11]);

        // A spurious beta leaves only the beta slot hot.
        no_fire(&sm.scan(LogEntry::new(12, "beta")));
        assert_eq!(sm.hot_mask.bits(), 0b10);
    }

    #[test]
    fn out_of_order_entry_ignored() {
        let mut sm = MatchSet::new(10, &terms(&["alpha", "beta"])).unwrap();
        no_fire(&sm.scan(LogEntry::new(5, "alpha")));
        // Regression: dropped without state change.
        no_fire(&sm.scan(LogEntry::new(4, "beta")));
        let hits = sm.scan(LogEntry::new(6, "beta"));
        assert_eq!(stamps(&hits), [5, 6]);
    }

    #[test]
    fn gc_drops_stale_asserts() {
        let mut sm = MatchSet::new(10, &terms(&["alpha", "beta"])).unwrap();
        no_fire(&sm.scan(LogEntry::new(1, "alpha")));
        sm.garbage_collect(20);
        assert!(sm.slots[0].asserts.is_empty());
        assert!(sm.hot_mask.zeros());
        // A fresh pair still matches after collection.
        no_fire(&sm.scan(LogEntry::new(21, "alpha")));
        let hits = sm.scan(LogEntry::new(22, "beta"));
        assert_eq!(stamps(&hits), [21, 22]);
    }

    #[test]
    fn rejects_empty_and_oversized_rules() {
        assert!(matches!(MatchSet::new(10, &[]), Err(RuleError::NoTerms)));
        let many: Vec<Term> = (0..65).map(|i| Term::raw(format!("t{i}"))).collect();
        assert!(matches!(
            MatchSet::new(10, &many),
            Err(RuleError::TooManyTerms { .. })
        ));
    }
}
