//! Positional sequence matcher with reset terms.
//!
//! A completed sequence is only a *candidate* hit: each reset term defines a
//! denial window anchored on the matched tuple, and an occurrence of the
//! reset inside that window denies the hit. A denial window that extends
//! past the current clock leaves the hit pending; it fires (or is denied)
//! once the clock moves strictly past the window, which `eval` can force.

use tracing::warn;

use crate::entry::LogEntry;
use crate::mask::SlotMask;
use crate::term::Term;

use super::{
    calc_gc_window, compile_resets, compile_seq_terms, count_expired, mini_gc, shift_left, Hits,
    Matcher, ResetSlot, ResetSpec, RuleError, TermSlot, DISABLE_GC,
};

enum ResetCheck {
    /// No reset denies and every denial window is closed.
    Clear,
    /// A denial window is still open; the hit stays pending.
    Wait,
    /// Denied; the anchor position whose assert must be dropped.
    Deny(u8),
}

/// [`super::MatchSeq`] semantics plus reset terms.
#[derive(Debug)]
pub struct InverseSeq {
    clock: i64,
    window: i64,
    gc_mark: i64,
    gc_left: i64,
    gc_right: i64,
    n_active: usize,
    dupe_mask: SlotMask,
    slots: Vec<TermSlot>,
    resets: Vec<ResetSlot>,
}

impl InverseSeq {
    pub fn new(window: i64, terms: &[Term], resets: &[ResetSpec]) -> Result<Self, RuleError> {
        let (slots, dupe_mask) = compile_seq_terms(terms)?;
        let resets = compile_resets(resets, terms.len())?;
        let (gc_left, gc_right) = calc_gc_window(window, &resets);
        Ok(Self {
            clock: 0,
            window,
            gc_mark: DISABLE_GC,
            gc_left,
            gc_right,
            n_active: 0,
            dupe_mask,
            slots,
            resets,
        })
    }

    fn lower_gc_mark(&mut self, mark: i64) {
        if mark < self.gc_mark {
            self.gc_mark = mark;
        }
    }

    fn maybe_gc(&mut self, clock: i64) {
        if clock < self.gc_mark {
            return;
        }
        self.garbage_collect(clock);
    }

    /// Drops asserts and reset occurrences that can no longer participate
    /// in any decidable hit.
    pub fn garbage_collect(&mut self, clock: i64) {
        // While fully hot with resets, collection waits for the next
        // evaluation; collecting now could drop an assert the pending
        // decision still frames.
        if self.n_active == self.slots.len() && !self.resets.is_empty() {
            self.gc_mark = DISABLE_GC;
            return;
        }

        let deadline = clock - self.gc_right;
        let expired = count_expired(&self.slots[0].asserts, deadline);
        if expired > 0 {
            shift_left(&mut self.slots[0].asserts, expired);
        }
        self.n_active = mini_gc(&mut self.slots, self.dupe_mask, self.n_active);

        let mut mark = DISABLE_GC;
        if self.n_active > 0 {
            mark = self.slots[0].asserts[0].timestamp + self.gc_right;
        }

        // Reset occurrences are retained for the extra lookback margin.
        let deadline = deadline - self.gc_left;
        let (gc_left, gc_right) = (self.gc_left, self.gc_right);
        for reset in &mut self.resets {
            if reset.stamps.is_empty() {
                continue;
            }
            let expired = reset.stamps.partition_point(|&ts| ts < deadline);
            if expired > 0 {
                reset.stamps.drain(..expired);
            }
            if let Some(&first) = reset.stamps.first() {
                mark = mark.min(first + gc_left + gc_right);
            }
        }

        self.gc_mark = mark;
    }

    fn check_reset(&self, clock: i64) -> ResetCheck {
        let stamps: Vec<i64> = self
            .slots
            .iter()
            .map(|slot| slot.asserts[0].timestamp)
            .collect();

        for reset in &self.resets {
            let (start, stop) = reset.denial_window(&stamps);
            if reset.denies(start, stop) {
                return ResetCheck::Deny(reset.anchor);
            }
            // An open window cannot conclude: a reset at the window's end
            // could still arrive with a duplicate timestamp, so wait until
            // one tick past it.
            if stop >= clock {
                return ResetCheck::Wait;
            }
        }

        ResetCheck::Clear
    }
}

impl Matcher for InverseSeq {
    fn scan(&mut self, entry: LogEntry) -> Hits {
        if entry.timestamp < self.clock {
            warn!(
                line = %entry.line,
                stamp = entry.timestamp,
                clock = self.clock,
                "InverseSeq: out of order event"
            );
            return Hits::default();
        }
        self.clock = entry.timestamp;

        self.maybe_gc(entry.timestamp);

        // Cold-path optimization: with no active positions and no lookback
        // margin, reset occurrences cannot deny anything that starts later,
        // so the entry only matters if it opens the sequence.
        let mut zero_match = false;
        if self.n_active == 0 && self.gc_left == 0 {
            if !(self.slots[0].matcher)(&entry.line) {
                return Hits::default();
            }
            zero_match = true;
        }

        let (gc_left, gc_right) = (self.gc_left, self.gc_right);
        let mut mark = self.gc_mark;
        for reset in &mut self.resets {
            if (reset.matcher)(&entry.line) {
                reset.stamps.push(entry.timestamp);
                mark = mark.min(entry.timestamp + gc_left + gc_right);
            }
        }
        self.gc_mark = mark;

        for i in 0..self.n_active {
            if (self.slots[i].matcher)(&entry.line) {
                self.slots[i].asserts.push(entry.clone());
            }
        }

        if self.n_active < self.slots.len() {
            let active = self.n_active;
            if !zero_match && !(self.slots[active].matcher)(&entry.line) {
                return Hits::default();
            }
            let stamp = entry.timestamp;
            self.slots[active].asserts.push(entry);
            self.n_active += 1;
            self.lower_gc_mark(stamp + self.gc_right);
            if self.n_active < self.slots.len() {
                return Hits::default();
            }
        }

        self.eval(self.clock)
    }

    fn eval(&mut self, clock: i64) -> Hits {
        let n_slots = self.slots.len();
        let mut hits = Hits::default();

        while self.n_active == n_slots {
            let t_start = self.slots[0].asserts[0].timestamp;
            let t_stop = self.slots[n_slots - 1].asserts[0].timestamp;

            let mut drop = None;
            if t_stop - t_start > self.window {
                drop = Some(0);
            } else if !self.resets.is_empty() {
                match self.check_reset(clock) {
                    ResetCheck::Deny(anchor) => drop = Some(usize::from(anchor)),
                    ResetCheck::Wait => return hits,
                    ResetCheck::Clear => {}
                }
            }

            match drop {
                Some(position) => {
                    // Denied: remove the offending anchor assert so the next
                    // framing can succeed.
                    shift_left(&mut self.slots[position].asserts, 1);
                }
                None => {
                    hits.cnt += 1;
                    if hits.logs.capacity() == 0 {
                        hits.logs.reserve(n_slots);
                    }
                    for i in 0..n_slots {
                        hits.logs.push(self.slots[i].asserts[0].clone());
                        shift_left(&mut self.slots[i].asserts, 1);
                    }
                }
            }

            self.n_active = mini_gc(&mut self.slots, self.dupe_mask, self.n_active);
        }

        hits
    }
}
