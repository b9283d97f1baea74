//! Unordered conjunction matcher with reset terms.
//!
//! Extends [`super::MatchSet`] with denial windows. The reset anchor indexes
//! the *sorted* framed tuple, not the term's position in the rule: anchor 0
//! is the earliest matched entry regardless of which term produced it.

use ahash::AHashMap;
use tracing::warn;

use crate::entry::LogEntry;
use crate::mask::SlotMask;
use crate::term::Term;

use super::{
    calc_gc_window, compile_resets, compile_set_terms, count_expired, frame_match, shift_left,
    Hits, Matcher, ResetSlot, ResetSpec, RuleError, TermSlot, DISABLE_GC,
};

/// A position in the framed tuple: the slot it came from and the assert
/// offset within that slot (non-zero only for duplicate terms).
#[derive(Clone, Copy)]
struct Anchor {
    term: usize,
    offset: usize,
}

enum ResetCheck {
    Clear,
    Wait,
    Deny(Anchor),
}

/// [`super::MatchSet`] semantics plus reset terms.
#[derive(Debug)]
pub struct InverseSet {
    clock: i64,
    window: i64,
    gc_mark: i64,
    gc_left: i64,
    gc_right: i64,
    hot_mask: SlotMask,
    slots: Vec<TermSlot>,
    resets: Vec<ResetSlot>,
    dupes: AHashMap<usize, usize>,
}

impl InverseSet {
    pub fn new(window: i64, terms: &[Term], resets: &[ResetSpec]) -> Result<Self, RuleError> {
        let (slots, dupes) = compile_set_terms(terms)?;
        let resets = compile_resets(resets, terms.len())?;
        let (gc_left, gc_right) = calc_gc_window(window, &resets);
        Ok(Self {
            clock: 0,
            window,
            gc_mark: DISABLE_GC,
            gc_left,
            gc_right,
            hot_mask: SlotMask::empty(),
            slots,
            resets,
            dupes,
        })
    }

    #[inline]
    fn need(&self, slot: usize) -> usize {
        self.dupes.get(&slot).copied().unwrap_or(1)
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

    /// Drops asserts and reset occurrences outside the retention margins.
    pub fn garbage_collect(&mut self, clock: i64) {
        // While fully hot with resets, collection waits for the next
        // evaluation; collecting now could drop an assert the pending
        // decision still frames.
        if !self.resets.is_empty() && self.hot_mask.first_n(self.slots.len()) {
            self.gc_mark = DISABLE_GC;
            return;
        }

        let mut mark = DISABLE_GC;
        let deadline = clock - self.gc_right;

        for i in 0..self.slots.len() {
            let expired = count_expired(&self.slots[i].asserts, deadline);
            if expired > 0 && shift_left(&mut self.slots[i].asserts, expired) < self.need(i) {
                self.hot_mask.clear(i);
            }
            if let Some(first) = self.slots[i].asserts.first() {
                mark = mark.min(first.timestamp + self.gc_right);
            }
        }

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
        // The framed tuple, sorted by timestamp; the reset anchor indexes
        // this order rather than the rule's term order.
        let mut anchors = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            for (j, assert) in slot.asserts[..self.need(i)].iter().enumerate() {
                anchors.push((assert.timestamp, Anchor { term: i, offset: j }));
            }
        }
        anchors.sort_by_key(|&(stamp, _)| stamp);
        let stamps: Vec<i64> = anchors.iter().map(|&(stamp, _)| stamp).collect();

        for reset in &self.resets {
            let (start, stop) = reset.denial_window(&stamps);
            if reset.denies(start, stop) {
                return ResetCheck::Deny(anchors[usize::from(reset.anchor)].1);
            }
            // An open window cannot conclude until one tick past its end,
            // covering duplicate-timestamp ties.
            if stop >= clock {
                return ResetCheck::Wait;
            }
        }

        ResetCheck::Clear
    }
}

impl Matcher for InverseSet {
    fn scan(&mut self, entry: LogEntry) -> Hits {
        if entry.timestamp < self.clock {
            warn!(
                line = %entry.line,
                stamp = entry.timestamp,
                clock = self.clock,
                "InverseSet: out of order event"
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
                self.lower_gc_mark(entry.timestamp + self.gc_right);
            }
        }

        if self.hot_mask.zeros() && self.gc_left == 0 {
            // Nothing hot and no lookback margin; reset occurrences cannot
            // matter yet.
            return Hits::default();
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

        if !self.hot_mask.first_n(self.slots.len()) {
            return Hits::default();
        }

        self.eval(entry.timestamp)
    }

    fn eval(&mut self, clock: i64) -> Hits {
        let n_slots = self.slots.len();
        let mut hits = Hits::default();

        while self.hot_mask.first_n(n_slots) {
            let (bottleneck, t_start, t_stop) = frame_match(&self.slots, &self.dupes);

            let mut drop = None;
            if t_stop - t_start > self.window {
                // The window check cannot be left to collection: a long
                // reset margin may retain asserts well past the base window.
                drop = Some(Anchor {
                    term: bottleneck,
                    offset: 0,
                });
            } else if !self.resets.is_empty() {
                match self.check_reset(clock) {
                    ResetCheck::Deny(anchor) => drop = Some(anchor),
                    ResetCheck::Wait => return hits,
                    ResetCheck::Clear => {}
                }
            }

            match drop {
                Some(anchor) => {
                    let need = self.need(anchor.term);
                    let remaining = if need <= 1 {
                        shift_left(&mut self.slots[anchor.term].asserts, 1)
                    } else {
                        // Duplicate slot: remove the framed assert at its
                        // offset, keeping the others.
                        self.slots[anchor.term].asserts.remove(anchor.offset);
                        self.slots[anchor.term].asserts.len()
                    };
                    if remaining < need {
                        self.hot_mask.clear(anchor.term);
                    }
                }
                None => {
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
            }
        }

        hits
    }
}
