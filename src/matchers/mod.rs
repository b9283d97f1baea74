//! Stateful rule matchers over streams of timestamped log entries.
//!
//! # Scope
//! A matcher is compiled once from a rule (window, terms, optional reset
//! terms) and then fed entries in approximately monotonic timestamp order via
//! `scan`. Hits are emitted as soon as they become provable; matchers with
//! reset terms may hold a completed match *pending* until the clock passes
//! the reset's denial window, and can be closed out explicitly with `eval`.
//!
//! # Design themes
//! - Per-term assert lists are strictly non-decreasing in timestamp.
//! - Hot/duplicate bookkeeping is a 64-bit mask; rules cap at 64 terms.
//! - Garbage collection is amortized: a `gc_mark` timestamp says when the
//!   next collection can possibly do work, and scans only collect past it.
//! - Regressing timestamps are logged and dropped, never an error.
//!
//! # Module map
//! - `single`: one-term presence matcher.
//! - `set`: unordered conjunction within a window.
//! - `seq`: positional sequence within a window.
//! - `inverse_set` / `inverse_seq`: set/sequence with reset terms.
//! - `dedupe`: hit coalescing gate for downstream consumers.

pub mod dedupe;
pub mod inverse_seq;
pub mod inverse_set;
pub mod seq;
pub mod set;
pub mod single;

use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::entry::LogEntry;
use crate::mask::{SlotMask, MAX_TERMS};
use crate::term::{Predicate, Term, TermError};

pub use dedupe::Dedupe;
pub use inverse_seq::InverseSeq;
pub use inverse_set::InverseSet;
pub use seq::MatchSeq;
pub use set::MatchSet;
pub use single::MatchSingle;

/// Errors raised while building a matcher from a rule.
#[derive(Debug)]
#[non_exhaustive]
pub enum RuleError {
    /// A rule needs at least one term.
    NoTerms,
    /// More terms than the slot mask can index.
    TooManyTerms { count: usize, max: usize },
    /// A reset anchor referenced a term position outside the rule.
    AnchorOutOfRange { anchor: u8, terms: usize },
    /// A term failed to compile.
    Term(TermError),
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTerms => write!(f, "no terms"),
            Self::TooManyTerms { count, max } => {
                write!(f, "too many terms: {count} (max: {max})")
            }
            Self::AnchorOutOfRange { anchor, terms } => {
                write!(f, "anchor out of range: {anchor} (terms: {terms})")
            }
            Self::Term(err) => write!(f, "fail term compile: {err}"),
        }
    }
}

impl std::error::Error for RuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Term(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TermError> for RuleError {
    fn from(err: TermError) -> Self {
        Self::Term(err)
    }
}

/// Ordered groups of matched entries emitted by a matcher.
///
/// The *k*-th hit occupies `logs[k * arity .. (k + 1) * arity)` where
/// `arity = logs.len() / cnt`.
#[derive(Debug, Default)]
pub struct Hits {
    pub cnt: usize,
    pub logs: Vec<LogEntry>,
}

impl Hits {
    /// Returns `true` when no hit was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    /// Number of entries per hit.
    #[inline]
    pub fn arity(&self) -> usize {
        if self.cnt == 0 {
            0
        } else {
            self.logs.len() / self.cnt
        }
    }

    /// The *i*-th hit, if present.
    pub fn index(&self, i: usize) -> Option<&[LogEntry]> {
        if i >= self.cnt {
            return None;
        }
        let arity = self.arity();
        Some(&self.logs[i * arity..(i + 1) * arity])
    }

    /// The most recent hit.
    pub fn last(&self) -> Option<&[LogEntry]> {
        self.cnt.checked_sub(1).and_then(|i| self.index(i))
    }

    /// Removes and returns the oldest hit.
    pub fn pop_front(&mut self) -> Option<Vec<LogEntry>> {
        if self.cnt == 0 {
            return None;
        }
        let arity = self.arity();
        self.cnt -= 1;
        Some(self.logs.drain(..arity).collect())
    }
}

/// The common matcher contract: feed entries, optionally force closure.
pub trait Matcher {
    /// Consumes one entry and returns any hits that became provable.
    fn scan(&mut self, entry: LogEntry) -> Hits;

    /// Advances the matcher's notion of time without a new entry, closing
    /// out any decisions that were pending on the clock.
    fn eval(&mut self, clock: i64) -> Hits;
}

/// Time range relative to a matched tuple during which an occurrence of the
/// reset term denies the match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetSpec {
    pub term: Term,
    /// Window size in nanoseconds; with `absolute` unset the effective
    /// window is extended by the span of the matched tuple.
    pub window: i64,
    /// Signed offset applied to the anchor timestamp.
    pub slide: i64,
    /// Index into the sorted matched tuple used as the reference point.
    pub anchor: u8,
    /// Fixed-length window rather than span-relative.
    pub absolute: bool,
}

impl ResetSpec {
    pub fn new(term: Term) -> Self {
        Self {
            term,
            window: 0,
            slide: 0,
            anchor: 0,
            absolute: false,
        }
    }

    pub fn window(mut self, window: i64) -> Self {
        self.window = window;
        self
    }

    pub fn slide(mut self, slide: i64) -> Self {
        self.slide = slide;
        self
    }

    pub fn anchor(mut self, anchor: u8) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn absolute(mut self, absolute: bool) -> Self {
        self.absolute = absolute;
        self
    }
}

/// Sentinel `gc_mark` meaning "nothing to collect".
pub(crate) const DISABLE_GC: i64 = i64::MAX;

/// Assert lists at or under this capacity keep their storage when emptied;
/// larger ones release it back to the allocator.
const CAP_THRESHOLD: usize = 4;

/// A compiled term slot: predicate plus its ordered candidate entries.
pub(crate) struct TermSlot {
    pub matcher: Predicate,
    pub asserts: Vec<LogEntry>,
}

impl fmt::Debug for TermSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TermSlot")
            .field("matcher", &"<predicate>")
            .field("asserts", &self.asserts)
            .finish()
    }
}

impl TermSlot {
    pub fn new(matcher: Predicate) -> Self {
        Self {
            matcher,
            asserts: Vec::new(),
        }
    }
}

/// Drops the first `n` asserts, preserving small capacities.
///
/// Returns the remaining length.
pub(crate) fn shift_left(asserts: &mut Vec<LogEntry>, n: usize) -> usize {
    if n >= asserts.len() {
        reset_asserts(asserts);
    } else {
        asserts.drain(..n);
    }
    asserts.len()
}

/// Empties an assert list, releasing large backing storage.
pub(crate) fn reset_asserts(asserts: &mut Vec<LogEntry>) {
    if asserts.capacity() <= CAP_THRESHOLD {
        asserts.clear();
    } else {
        *asserts = Vec::new();
    }
}

/// Number of leading asserts strictly older than `deadline`.
pub(crate) fn count_expired(asserts: &[LogEntry], deadline: i64) -> usize {
    asserts
        .iter()
        .take_while(|a| a.timestamp < deadline)
        .count()
}

/// Compiles a set-rule term list, collapsing duplicate terms into a single
/// slot with a required count.
///
/// Returns the deduplicated slots and a map from slot index to the number of
/// asserts that slot needs before it is hot (only populated for counts > 1).
pub(crate) fn compile_set_terms(
    terms: &[Term],
) -> Result<(Vec<TermSlot>, AHashMap<usize, usize>), RuleError> {
    if terms.is_empty() {
        return Err(RuleError::NoTerms);
    }
    if terms.len() > MAX_TERMS {
        return Err(RuleError::TooManyTerms {
            count: terms.len(),
            max: MAX_TERMS,
        });
    }

    let mut counts: AHashMap<&Term, usize> = AHashMap::with_capacity(terms.len());
    for term in terms {
        *counts.entry(term).or_default() += 1;
    }

    let mut slots = Vec::with_capacity(counts.len());
    let mut dupes = AHashMap::new();
    let mut seen: AHashSet<&Term> = AHashSet::with_capacity(terms.len());
    for term in terms {
        if !seen.insert(term) {
            continue;
        }
        let count = counts[term];
        if count > 1 {
            dupes.insert(slots.len(), count);
        }
        slots.push(TermSlot::new(term.compile()?));
    }

    Ok((slots, dupes))
}

/// Compiles a sequence-rule term list positionally, marking positions whose
/// term occurs more than once in the rule.
pub(crate) fn compile_seq_terms(terms: &[Term]) -> Result<(Vec<TermSlot>, SlotMask), RuleError> {
    if terms.is_empty() {
        return Err(RuleError::NoTerms);
    }
    if terms.len() > MAX_TERMS {
        return Err(RuleError::TooManyTerms {
            count: terms.len(),
            max: MAX_TERMS,
        });
    }

    let mut counts: AHashMap<&Term, usize> = AHashMap::with_capacity(terms.len());
    for term in terms {
        *counts.entry(term).or_default() += 1;
    }

    let mut slots = Vec::with_capacity(terms.len());
    let mut dupe_mask = SlotMask::empty();
    for (i, term) in terms.iter().enumerate() {
        if counts[term] > 1 {
            dupe_mask.set(i);
        }
        slots.push(TermSlot::new(term.compile()?));
    }

    Ok((slots, dupe_mask))
}

/// A compiled reset term: predicate, window geometry, and the timestamps of
/// its observed occurrences.
pub(crate) struct ResetSlot {
    pub matcher: Predicate,
    pub window: i64,
    pub slide: i64,
    pub anchor: u8,
    pub absolute: bool,
    pub stamps: Vec<i64>,
}

impl fmt::Debug for ResetSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetSlot")
            .field("matcher", &"<predicate>")
            .field("window", &self.window)
            .field("slide", &self.slide)
            .field("anchor", &self.anchor)
            .field("absolute", &self.absolute)
            .field("stamps", &self.stamps)
            .finish()
    }
}

impl ResetSlot {
    /// The inclusive `[start, stop]` interval in which an occurrence of this
    /// reset denies the match framed by `stamps` (the tuple's sorted
    /// timestamps).
    pub fn denial_window(&self, stamps: &[i64]) -> (i64, i64) {
        let anchor = stamps[self.anchor as usize] + self.slide;
        let mut width = self.window;
        if !self.absolute {
            width += stamps[stamps.len() - 1] - stamps[0];
        }
        if width < 0 {
            width = 0;
        }
        (anchor, anchor + width)
    }

    /// Whether any observed occurrence falls in the denial window.
    pub fn denies(&self, start: i64, stop: i64) -> bool {
        self.stamps.iter().any(|&ts| ts >= start && ts <= stop)
    }
}

/// Compiles reset specs, validating anchors against the rule's term count
/// (the tuple arity, counting duplicate terms).
pub(crate) fn compile_resets(
    specs: &[ResetSpec],
    n_terms: usize,
) -> Result<Vec<ResetSlot>, RuleError> {
    let mut resets = Vec::with_capacity(specs.len());
    for spec in specs {
        if usize::from(spec.anchor) >= n_terms {
            return Err(RuleError::AnchorOutOfRange {
                anchor: spec.anchor,
                terms: n_terms,
            });
        }
        resets.push(ResetSlot {
            matcher: spec.term.compile()?,
            window: spec.window,
            slide: spec.slide,
            anchor: spec.anchor,
            absolute: spec.absolute,
            stamps: Vec::new(),
        });
    }
    Ok(resets)
}

/// Left and right retention margins implied by the base window and the reset
/// geometry: asserts must be kept `left` nanoseconds before and `right`
/// nanoseconds after an event to keep every denial window decidable.
pub(crate) fn calc_gc_window(window: i64, resets: &[ResetSlot]) -> (i64, i64) {
    let mut left: i64 = 0;
    let mut right = window;
    for reset in resets {
        left = left.min(reset.slide);
        right = right.max(window + reset.window + reset.slide);
    }
    if !resets.is_empty() {
        // One extra tick covers duplicate-timestamp ties at the window end.
        right += 1;
    }
    (-left, right)
}

/// Frames the candidate hit: the min/max timestamp over the first
/// `dupe_count` asserts of every slot, plus the slot holding the minimum.
///
/// Callers guarantee every slot is hot (has at least its required count).
pub(crate) fn frame_match(
    slots: &[TermSlot],
    dupes: &AHashMap<usize, usize>,
) -> (usize, i64, i64) {
    let mut min_slot = 0;
    let mut t_start = i64::MAX;
    let mut t_stop = i64::MIN;

    for (i, slot) in slots.iter().enumerate() {
        let count = dupes.get(&i).copied().unwrap_or(1);
        for assert in &slot.asserts[..count] {
            if assert.timestamp < t_start {
                t_start = assert.timestamp;
                min_slot = i;
            }
            if assert.timestamp > t_stop {
                t_stop = assert.timestamp;
            }
        }
    }

    (min_slot, t_start, t_stop)
}

/// Key for duplicate-entry pruning in sequence matchers.
#[derive(PartialEq, Eq, Hash)]
struct DupeKey {
    line: String,
    stream: String,
    timestamp: i64,
}

impl From<&LogEntry> for DupeKey {
    fn from(entry: &LogEntry) -> Self {
        Self {
            line: entry.line.clone(),
            stream: entry.stream.clone(),
            timestamp: entry.timestamp,
        }
    }
}

/// Restores sequence invariants after removals: every active position must
/// hold an assert that can still be in sequence with position 0.
///
/// Prunes asserts older than position 0's earliest, and for positions in
/// `dupe_mask` also prunes entries identical to one already claimed at an
/// earlier position (garbage collection can otherwise leave the same event
/// satisfying two positions). Returns the new active-position count.
pub(crate) fn mini_gc(slots: &mut [TermSlot], dupe_mask: SlotMask, n_active: usize) -> usize {
    if slots[0].asserts.is_empty() {
        for slot in slots.iter_mut() {
            reset_asserts(&mut slot.asserts);
        }
        return 0;
    }

    let zero_match = slots[0].asserts[0].timestamp;
    let mut claimed: AHashSet<DupeKey> = AHashSet::new();
    if dupe_mask.is_set(0) {
        claimed.insert(DupeKey::from(&slots[0].asserts[0]));
    }

    let mut active = 1;
    let mut force_clear = false;
    for i in 1..n_active {
        if force_clear {
            reset_asserts(&mut slots[i].asserts);
            continue;
        }

        let mut count = 0;
        for assert in &slots[i].asserts {
            if assert.timestamp < zero_match {
                count += 1;
                continue;
            }
            if dupe_mask.is_set(i) && claimed.contains(&DupeKey::from(assert)) {
                count += 1;
                continue;
            }
            break;
        }
        if count > 0 {
            shift_left(&mut slots[i].asserts, count);
        }

        match slots[i].asserts.first() {
            Some(first) => {
                active += 1;
                if dupe_mask.is_set(i) {
                    claimed.insert(DupeKey::from(first));
                }
            }
            None => force_clear = true,
        }
    }

    active
}
