//! Rule matchers over streams of timestamped log records.
//!
//! A caller compiles a *rule* — term predicates with a bounded time window
//! and optional reset (inverse) predicates — into a stateful matcher, then
//! feeds it parsed entries in approximately monotonic timestamp order. The
//! matcher emits *hits* (ordered groups of the matched entries) as they
//! become provable.
//!
//! Data flow, leaves first:
//!
//! 1. A [`format`] parser turns raw line bytes into a [`LogEntry`]; the
//!    [`scan`] module drives a parser over forward or reverse input.
//! 2. An optional [`Reorder`] queue buffers entries within a fixed
//!    lookback window, delivering them downstream in non-decreasing
//!    timestamp order under a memory cap.
//! 3. A [`Matcher`] consumes entries one at a time (`scan(entry) -> hits`)
//!    and can be driven by `eval(clock)` when no new entries arrive but
//!    pending decisions can be closed out.
//! 4. An optional [`Dedupe`] gate coalesces bursts of hits to at most one
//!    per window.
//!
//! Matchers are single-owner state: one task owns and drives an instance;
//! nothing here takes locks or performs I/O.

pub mod entry;
pub mod format;
pub mod mask;
pub mod matchers;
pub mod pool;
pub mod reorder;
pub mod scan;
pub mod term;

pub use entry::LogEntry;
pub use mask::MAX_TERMS;
pub use matchers::{
    Dedupe, Hits, InverseSeq, InverseSet, MatchSeq, MatchSet, MatchSingle, Matcher, ResetSpec,
    RuleError,
};
pub use pool::{BufferPool, MAX_RECORD_SIZE};
pub use reorder::{Reorder, ReorderError};
pub use scan::{scan_forward, scan_reverse, CollectScan, ScanError, ScanOptions};
pub use term::{Term, TermError, TermKind};
