//! Bounded-lookback reordering queue at the input stage.
//!
//! Entries arriving in timestamp order land in an in-order queue; stragglers
//! land in a second queue kept sorted by timestamp. Entries are delivered to
//! the callback from the merged front once they age past the lookback
//! window, so delivery is non-decreasing in timestamp as long as stragglers
//! arrive within the window.
//!
//! The two-queue split keeps the common well-ordered case O(1) per entry;
//! the out-of-order insert walks from the back and is linear only in the
//! straggler depth.
//!
//! An optional memory cap bounds queued bytes. Trimming under pressure
//! delivers the oldest entries even though they are still inside the
//! window, and advances the clock to `delivered.timestamp + window` so a
//! later arrival for the trimmed range is recognized as out of order and
//! dropped rather than delivered behind its successors.

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info};

use crate::entry::LogEntry;

/// Fixed per-node accounting overhead, on top of the payload length.
const NODE_OVERHEAD: usize = 80;

#[inline]
fn node_size(entry: &LogEntry) -> usize {
    NODE_OVERHEAD + entry.line.len()
}

/// Errors raised while building a reorder queue.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReorderError {
    /// The lookback window must be positive.
    InvalidWindow,
}

impl fmt::Display for ReorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWindow => write!(f, "invalid window"),
        }
    }
}

impl std::error::Error for ReorderError {}

/// Reordering queue with a fixed lookback window and optional memory cap.
///
/// The callback returns `true` to request cooperative termination; the
/// queue then drains its state and reports `true` up the call chain.
pub struct Reorder<F: FnMut(LogEntry) -> bool> {
    cb: F,
    window: i64,
    clock: i64,
    m_used: usize,
    m_limit: usize,
    in_list: VecDeque<LogEntry>,
    oo_list: VecDeque<LogEntry>,
}

impl<F: FnMut(LogEntry) -> bool> Reorder<F> {
    /// Creates a queue delivering entries older than `window` nanoseconds
    /// to `cb` in timestamp order.
    pub fn new(window: i64, cb: F) -> Result<Self, ReorderError> {
        if window <= 0 {
            return Err(ReorderError::InvalidWindow);
        }
        Ok(Self {
            cb,
            window,
            clock: 0,
            m_used: 0,
            m_limit: usize::MAX,
            in_list: VecDeque::new(),
            oo_list: VecDeque::new(),
        })
    }

    /// Caps queued bytes; the oldest entries are delivered early to stay
    /// under the limit, shifting the window forward in time.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.m_limit = limit;
        self
    }

    /// Queues an entry, delivering everything that aged out of the window.
    ///
    /// Returns `true` when the callback requested termination.
    pub fn append(&mut self, entry: LogEntry) -> bool {
        let done = self.append_inner(entry);
        if self.m_used > self.m_limit && !done {
            return self.trim();
        }
        done
    }

    /// Moves the clock forward without a new entry, flushing entries that
    /// fall out of the window. Regressions are ignored.
    pub fn advance_clock(&mut self, stamp: i64) -> bool {
        if stamp < self.clock {
            info!(
                clock = self.clock,
                stamp, "Reorder: ignore clock regression"
            );
            return false;
        }
        self.clock = stamp;
        self.flush_aged()
    }

    /// Delivers everything still queued, in timestamp order, and resets.
    pub fn flush(&mut self) -> bool {
        let done = self.advance_clock(i64::MAX);
        self.drain();
        done
    }

    /// Bytes currently accounted against the memory limit.
    pub fn mem_used(&self) -> usize {
        self.m_used
    }

    fn append_inner(&mut self, entry: LogEntry) -> bool {
        if entry.timestamp < self.clock {
            self.queue_out_of_order(entry);
            return false;
        }

        // The normal case: in order.
        self.clock = entry.timestamp;
        self.m_used += node_size(&entry);
        self.in_list.push_back(entry);

        self.flush_aged()
    }

    fn flush_aged(&mut self) -> bool {
        match self.oo_list.front() {
            // No stragglers pending: the fast path.
            None => self.fast_path(),
            Some(head) => {
                let oo_stamp = head.timestamp;
                self.slow_path(oo_stamp)
            }
        }
    }

    fn fast_path(&mut self) -> bool {
        let deadline = self.clock - self.window;
        while self
            .in_list
            .front()
            .is_some_and(|head| head.timestamp <= deadline)
        {
            let Some(entry) = self.in_list.pop_front() else {
                break;
            };
            self.m_used -= node_size(&entry);
            if (self.cb)(entry) {
                self.drain();
                return true;
            }
        }
        false
    }

    fn slow_path(&mut self, mut oo_stamp: i64) -> bool {
        let deadline = self.clock - self.window;

        // Deliver from the merged front: stragglers older than the in-order
        // head go first.
        loop {
            let Some(in_stamp) = self.in_list.front().map(|e| e.timestamp) else {
                break;
            };
            if in_stamp > deadline {
                break;
            }

            while oo_stamp < in_stamp {
                let Some(entry) = self.oo_list.pop_front() else {
                    break;
                };
                self.m_used -= node_size(&entry);
                if (self.cb)(entry) {
                    self.drain();
                    return true;
                }
                oo_stamp = self.oo_list.front().map_or(i64::MAX, |e| e.timestamp);
            }

            let Some(entry) = self.in_list.pop_front() else {
                break;
            };
            self.m_used -= node_size(&entry);
            if (self.cb)(entry) {
                self.drain();
                return true;
            }
        }

        // Stragglers past the window with no in-order entry ahead of them.
        while oo_stamp <= deadline {
            let Some(entry) = self.oo_list.pop_front() else {
                break;
            };
            self.m_used -= node_size(&entry);
            if (self.cb)(entry) {
                self.drain();
                return true;
            }
            oo_stamp = self.oo_list.front().map_or(i64::MAX, |e| e.timestamp);
        }

        false
    }

    // Called past the memory limit: deliver the oldest entries regardless
    // of the window, advancing the clock so the vacated range stays closed.
    fn trim(&mut self) -> bool {
        let mut oo_stamp = self.oo_list.front().map_or(i64::MAX, |e| e.timestamp);

        'outer: while self.m_used > self.m_limit {
            let Some(in_stamp) = self.in_list.front().map(|e| e.timestamp) else {
                break;
            };

            while oo_stamp < in_stamp {
                let Some(entry) = self.oo_list.pop_front() else {
                    break;
                };
                self.m_used -= node_size(&entry);
                self.clock = entry.timestamp + self.window;
                if (self.cb)(entry) {
                    self.drain();
                    return true;
                }
                oo_stamp = self.oo_list.front().map_or(i64::MAX, |e| e.timestamp);
                if self.m_used <= self.m_limit {
                    break 'outer;
                }
            }

            let Some(entry) = self.in_list.pop_front() else {
                break;
            };
            self.m_used -= node_size(&entry);
            self.clock = entry.timestamp + self.window;
            if (self.cb)(entry) {
                self.drain();
                return true;
            }
        }

        // Still over after the in-order queue emptied: the advanced clock
        // has made everything left look out of order. Deliver the oldest
        // stragglers until under the limit.
        while self.m_used > self.m_limit {
            let Some(entry) = self.oo_list.pop_front() else {
                break;
            };
            self.m_used -= node_size(&entry);
            self.clock = entry.timestamp + self.window;
            if (self.cb)(entry) {
                self.drain();
                return true;
            }
        }

        false
    }

    // O(n) from the back to keep the straggler queue sorted; arrivals are
    // typically nearly ordered, so the walk is short.
    fn queue_out_of_order(&mut self, entry: LogEntry) {
        let deadline = self.clock - self.window;
        if entry.timestamp < deadline {
            debug!(
                clock = self.clock,
                stamp = entry.timestamp,
                deadline,
                line = %entry.line,
                "Reorder: ignore out of order entry"
            );
            return;
        }

        let mut idx = self.oo_list.len();
        while idx > 0 && self.oo_list[idx - 1].timestamp > entry.timestamp {
            idx -= 1;
        }
        self.m_used += node_size(&entry);
        self.oo_list.insert(idx, entry);
    }

    fn drain(&mut self) {
        self.in_list.clear();
        self.oo_list.clear();
        self.clock = 0;
        self.m_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Sink = Rc<RefCell<Vec<i64>>>;

    fn sink() -> (Sink, impl FnMut(LogEntry) -> bool) {
        let out: Sink = Rc::new(RefCell::new(Vec::new()));
        let cb_out = Rc::clone(&out);
        (out, move |e: LogEntry| {
            cb_out.borrow_mut().push(e.timestamp);
            false
        })
    }

    fn entry(stamp: i64) -> LogEntry {
        LogEntry::new(stamp, "x")
    }

    #[test]
    fn invalid_window_rejected() {
        assert!(matches!(
            Reorder::new(0, |_| false),
            Err(ReorderError::InvalidWindow)
        ));
        assert!(Reorder::new(-5, |_| false).is_err());
    }

    #[test]
    fn reorders_within_window() {
        let (out, cb) = sink();
        let mut rq = Reorder::new(10, cb).unwrap();

        assert!(!rq.append(entry(1)));
        assert!(!rq.append(entry(3)));
        assert!(!rq.append(entry(2)));
        assert!(out.borrow().is_empty());

        // ts=14 pushes 1..3 out of the window, in order.
        assert!(!rq.append(entry(14)));
        assert_eq!(*out.borrow(), [1, 2, 3]);

        rq.flush();
        assert_eq!(*out.borrow(), [1, 2, 3, 14]);
    }

    #[test]
    fn straggler_past_window_dropped() {
        let (out, cb) = sink();
        let mut rq = Reorder::new(10, cb).unwrap();

        assert!(!rq.append(entry(100)));
        // 89 < 100 - 10: beyond lookback, dropped.
        assert!(!rq.append(entry(89)));
        rq.flush();
        assert_eq!(*out.borrow(), [100]);
    }

    #[test]
    fn straggler_on_window_edge_kept() {
        let (out, cb) = sink();
        let mut rq = Reorder::new(10, cb).unwrap();

        assert!(!rq.append(entry(100)));
        assert!(!rq.append(entry(90)));
        rq.flush();
        assert_eq!(*out.borrow(), [90, 100]);
    }

    #[test]
    fn interleaved_stragglers_merge_in_order() {
        let (out, cb) = sink();
        let mut rq = Reorder::new(10, cb).unwrap();

        for stamp in [5, 9, 7, 6, 12, 8, 25] {
            assert!(!rq.append(entry(stamp)));
        }
        rq.flush();
        assert_eq!(*out.borrow(), [5, 6, 7, 8, 9, 12, 25]);
    }

    #[test]
    fn advance_clock_flushes() {
        let (out, cb) = sink();
        let mut rq = Reorder::new(10, cb).unwrap();

        assert!(!rq.append(entry(1)));
        assert!(!rq.append(entry(2)));
        assert!(out.borrow().is_empty());

        assert!(!rq.advance_clock(13));
        assert_eq!(*out.borrow(), [1, 2]);

        // Regressions are ignored.
        assert!(!rq.advance_clock(5));
        assert_eq!(*out.borrow(), [1, 2]);
    }

    #[test]
    fn callback_done_drains() {
        let delivered: Sink = Rc::new(RefCell::new(Vec::new()));
        let cb_out = Rc::clone(&delivered);
        let mut rq = Reorder::new(10, move |e: LogEntry| {
            cb_out.borrow_mut().push(e.timestamp);
            true
        })
        .unwrap();

        assert!(!rq.append(entry(1)));
        assert!(!rq.append(entry(2)));
        // First delivery returns done; the rest of the queue drains.
        assert!(rq.append(entry(20)));
        assert_eq!(*delivered.borrow(), [1]);
        assert_eq!(rq.mem_used(), 0);
    }

    #[test]
    fn memory_limit_trims_oldest() {
        let (out, cb) = sink();
        // Each "x" entry accounts NODE_OVERHEAD + 1 bytes; cap at three.
        let mut rq = Reorder::new(10, cb)
            .unwrap()
            .with_memory_limit(3 * (NODE_OVERHEAD + 1));

        assert!(!rq.append(entry(1)));
        assert!(!rq.append(entry(2)));
        assert!(!rq.append(entry(3)));
        assert!(out.borrow().is_empty());

        // The fourth entry breaches the cap; the oldest is delivered even
        // though it is well inside the window.
        assert!(!rq.append(entry(4)));
        assert_eq!(*out.borrow(), [1]);

        // The trim advanced the clock to 1 + window, so an arrival behind
        // the shifted lookback is now dropped as out of order.
        assert!(!rq.append(entry(0)));
        rq.flush();
        assert_eq!(*out.borrow(), [1, 2, 3, 4]);
    }

    #[test]
    fn mem_accounting_balances() {
        let (_, cb) = sink();
        let mut rq = Reorder::new(10, cb).unwrap();
        assert!(!rq.append(entry(5)));
        assert!(!rq.append(entry(3)));
        assert_eq!(rq.mem_used(), 2 * (NODE_OVERHEAD + 1));
        rq.flush();
        assert_eq!(rq.mem_used(), 0);
    }
}
