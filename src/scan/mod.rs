//! Forward and reverse line scanners feeding parsed entries to a matcher.
//!
//! # Scope
//! `scan_forward` and `scan_reverse` drive a parse function over raw input
//! and hand entries to a scan callback until it returns `true` (cooperative
//! termination) or the input ends. Parse failures go through a pluggable
//! error policy; the default tolerates them (log and continue). The fold
//! option additionally folds unparsable continuation lines into the
//! preceding entry.
//!
//! Line assembly draws 4 MiB buffers from the shared pool when the record
//! cap is the default, so repeated scans do not churn the allocator.

mod forward;
mod reverse;

use std::fmt;
use std::io::{self, BufRead};

use crate::entry::LogEntry;
use crate::format::FormatError;
use crate::pool::MAX_RECORD_SIZE;

pub use forward::scan_forward;
pub use reverse::scan_reverse;

/// Errors that abort a scan.
#[derive(Debug)]
#[non_exhaustive]
pub enum ScanError {
    /// I/O failure on the underlying reader.
    Io(io::Error),
    /// A line exceeded the configured record cap.
    TooLongLine { limit: usize },
    /// The error policy turned a parse failure into an abort.
    Abort(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::TooLongLine { limit } => write!(f, "line too long (limit: {limit})"),
            Self::Abort(reason) => write!(f, "scan aborted: {reason}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Decides whether a parse failure continues or aborts the scan.
pub type ErrFn<'a> = Box<dyn FnMut(&[u8], &FormatError) -> Result<(), ScanError> + 'a>;

/// Scan configuration.
///
/// The defaults scan everything: full record cap, no timestamp range, no
/// fold, tolerant error policy.
pub struct ScanOptions<'a> {
    pub(crate) max_size: usize,
    pub(crate) start: Option<i64>,
    pub(crate) stop: Option<i64>,
    pub(crate) mark: Option<u64>,
    pub(crate) fold: bool,
    pub(crate) err_fn: Option<ErrFn<'a>>,
}

impl Default for ScanOptions<'_> {
    fn default() -> Self {
        Self {
            max_size: MAX_RECORD_SIZE,
            start: None,
            stop: None,
            mark: None,
            fold: false,
            err_fn: None,
        }
    }
}

impl<'a> ScanOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the payload size. The internal line buffer adds 25% headroom
    /// for format framing, clamped to the pool's record size.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size
            .checked_add(max_size / 4)
            .filter(|&size| size > 0 && size <= MAX_RECORD_SIZE)
            .unwrap_or(MAX_RECORD_SIZE);
        self
    }

    /// Lower timestamp bound: forward scans skip entries older than this,
    /// reverse scans skip entries newer than it.
    pub fn start(mut self, start: i64) -> Self {
        self.start = Some(start);
        self
    }

    /// Upper timestamp bound: a forward scan ends past it, a reverse scan
    /// ends below it.
    pub fn stop(mut self, stop: i64) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Starting byte offset for a reverse scan; unset (or zero) means the
    /// end of the input.
    pub fn mark(mut self, mark: u64) -> Self {
        self.mark = Some(mark);
        self
    }

    /// Folds unparsable continuation lines into the preceding entry
    /// (forward scans only).
    pub fn fold(mut self, fold: bool) -> Self {
        self.fold = fold;
        self
    }

    /// Installs an error policy; parse failures pass through it and any
    /// returned error aborts the scan.
    pub fn err_fn(mut self, err_fn: impl FnMut(&[u8], &FormatError) -> Result<(), ScanError> + 'a) -> Self {
        self.err_fn = Some(Box::new(err_fn));
        self
    }
}

pub(crate) fn report_parse_error(
    err_fn: &mut Option<ErrFn<'_>>,
    line: &[u8],
    err: &FormatError,
) -> Result<(), ScanError> {
    match err_fn {
        Some(policy) => policy(line, err),
        None => {
            // Tolerate badly formed lines.
            tracing::error!(
                error = %err,
                line = %String::from_utf8_lossy(line),
                "fail parse; continue"
            );
            Ok(())
        }
    }
}

pub(crate) enum LineRead {
    Line(usize),
    Eof,
}

/// Reads one newline-terminated line into `buf`, without the terminator.
///
/// The final line of the input may be unterminated. Lines longer than the
/// buffer abort with a too-long error.
pub(crate) fn read_line<R: BufRead>(rdr: &mut R, buf: &mut [u8]) -> Result<LineRead, ScanError> {
    let mut len = 0;
    loop {
        let available = match rdr.fill_buf() {
            Ok(chunk) => chunk,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ScanError::Io(err)),
        };
        if available.is_empty() {
            return Ok(if len == 0 {
                LineRead::Eof
            } else {
                LineRead::Line(len)
            });
        }

        match memchr::memchr(b'\n', available) {
            Some(pos) => {
                if len + pos > buf.len() {
                    return Err(ScanError::TooLongLine { limit: buf.len() });
                }
                buf[len..len + pos].copy_from_slice(&available[..pos]);
                len += pos;
                rdr.consume(pos + 1);
                return Ok(LineRead::Line(len));
            }
            None => {
                let n = available.len();
                if len + n > buf.len() {
                    return Err(ScanError::TooLongLine { limit: buf.len() });
                }
                buf[len..len + n].copy_from_slice(available);
                len += n;
                rdr.consume(n);
            }
        }
    }
}

/// Trims a trailing carriage return.
pub(crate) fn strip_cr(line: &[u8]) -> &[u8] {
    match line {
        [rest @ .., b'\r'] => rest,
        _ => line,
    }
}

// Sizing heuristic for collector pre-allocation.
const AVG_LOG_SIZE: usize = 256;

/// Size-capped sink collecting entries until a byte budget is exceeded.
///
/// The standard scan callback for bounded reads: returns `true` (stop) on
/// the entry that would breach the budget, recording that the read was
/// clipped.
pub struct CollectScan {
    pub size: usize,
    pub max_size: usize,
    pub clipped: bool,
    pub logs: Vec<LogEntry>,
}

impl CollectScan {
    pub fn new(max_size: usize) -> Self {
        Self {
            size: 0,
            max_size,
            clipped: false,
            logs: Vec::with_capacity(max_size / AVG_LOG_SIZE),
        }
    }

    pub fn scan(&mut self, entry: LogEntry) -> bool {
        let size = entry.size();
        if self.size + size > self.max_size {
            self.clipped = true;
            return true;
        }
        self.size += size;
        self.logs.push(entry);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn read_line_handles_terminators() {
        let mut rdr = BufReader::new(&b"one\ntwo\r\nthree"[..]);
        let mut buf = [0u8; 64];

        let LineRead::Line(n) = read_line(&mut rdr, &mut buf).unwrap() else {
            panic!("expected line");
        };
        assert_eq!(&buf[..n], b"one");

        let LineRead::Line(n) = read_line(&mut rdr, &mut buf).unwrap() else {
            panic!("expected line");
        };
        assert_eq!(strip_cr(&buf[..n]), b"two");

        // Unterminated final line still comes through.
        let LineRead::Line(n) = read_line(&mut rdr, &mut buf).unwrap() else {
            panic!("expected line");
        };
        assert_eq!(&buf[..n], b"three");

        assert!(matches!(
            read_line(&mut rdr, &mut buf).unwrap(),
            LineRead::Eof
        ));
    }

    #[test]
    fn read_line_rejects_oversize() {
        let mut rdr = BufReader::new(&b"0123456789abcdef\n"[..]);
        let mut buf = [0u8; 8];
        assert!(matches!(
            read_line(&mut rdr, &mut buf),
            Err(ScanError::TooLongLine { limit: 8 })
        ));
    }

    #[test]
    fn collect_scan_clips_at_budget() {
        let entry = LogEntry::new(1, "payload");
        let budget = entry.size() * 2 + 1;
        let mut sink = CollectScan::new(budget);

        assert!(!sink.scan(entry.clone()));
        assert!(!sink.scan(entry.clone()));
        assert!(sink.scan(entry.clone()));
        assert!(sink.clipped);
        assert_eq!(sink.logs.len(), 2);
    }

    #[test]
    fn max_size_adds_headroom_and_clamps() {
        let opts = ScanOptions::new().max_size(1000);
        assert_eq!(opts.max_size, 1250);
        let opts = ScanOptions::new().max_size(usize::MAX);
        assert_eq!(opts.max_size, MAX_RECORD_SIZE);
        let opts = ScanOptions::new().max_size(0);
        assert_eq!(opts.max_size, MAX_RECORD_SIZE);
    }
}
