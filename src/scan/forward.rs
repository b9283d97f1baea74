//! Forward scanner with fold support.

use std::io::{BufReader, Read};

use crate::entry::LogEntry;
use crate::format::FormatError;
use crate::pool::{self, MAX_RECORD_SIZE};

use super::{
    read_line, report_parse_error, strip_cr, LineRead, ScanError, ScanOptions,
};

const READER_BUF_SIZE: usize = 4 << 10;

/// Scans `rdr` line by line, parsing each with `parse` and feeding entries
/// to `scan` until it returns `true`, the `stop` bound is passed, or the
/// input ends.
pub fn scan_forward<R, P, S>(
    rdr: R,
    mut parse: P,
    mut scan: S,
    mut opts: ScanOptions<'_>,
) -> Result<(), ScanError>
where
    R: Read,
    P: FnMut(&[u8]) -> Result<LogEntry, FormatError>,
    S: FnMut(LogEntry) -> bool,
{
    let mut rdr = BufReader::with_capacity(READER_BUF_SIZE, rdr);
    let start = opts.start.unwrap_or(i64::MIN);
    let stop = opts.stop.unwrap_or(i64::MAX);
    let mut err_fn = opts.err_fn.take();

    // At the default record cap the line buffer comes from the pool.
    let mut pooled;
    let mut heap;
    let buf: &mut [u8] = if opts.max_size >= MAX_RECORD_SIZE {
        pooled = pool::shared().alloc();
        &mut pooled[..]
    } else {
        heap = vec![0u8; opts.max_size];
        &mut heap[..]
    };

    let mut folder = opts.fold.then(Folder::new);

    loop {
        let len = match read_line(&mut rdr, buf)? {
            LineRead::Eof => break,
            LineRead::Line(len) => len,
        };
        let line = strip_cr(&buf[..len]);

        match parse(line) {
            Ok(entry) => {
                if entry.timestamp < start {
                    continue;
                }
                if entry.timestamp > stop {
                    break;
                }
                let done = match &mut folder {
                    Some(folder) => folder.scan_entry(entry, &mut scan),
                    None => scan(entry),
                };
                if done {
                    break;
                }
            }
            Err(err) => {
                if let Some(folder) = &mut folder {
                    folder.fold_err(line, &err);
                }
                report_parse_error(&mut err_fn, line, &err)?;
            }
        }
    }

    if let Some(folder) = &mut folder {
        folder.flush(&mut scan);
    }

    Ok(())
}

/// Fold state: holds the last parsed entry so unparsable continuation
/// lines can be appended to it before it is delivered.
struct Folder {
    pending: Option<LogEntry>,
    acc: String,
}

impl Folder {
    fn new() -> Self {
        Self {
            pending: None,
            acc: String::new(),
        }
    }

    fn scan_entry<S: FnMut(LogEntry) -> bool>(&mut self, entry: LogEntry, scan: &mut S) -> bool {
        // First entry only primes the fold slot.
        let Some(mut pending) = self.pending.take() else {
            self.pending = Some(entry);
            return false;
        };

        if !self.acc.is_empty() {
            pending.line = std::mem::take(&mut self.acc);
        }

        let done = scan(pending);
        if !done {
            self.pending = Some(entry);
        }
        // On termination the current entry is dropped with the scan.
        done
    }

    fn fold_err(&mut self, line: &[u8], err: &FormatError) {
        if !matches!(err, FormatError::MatchTimestamp) {
            return;
        }
        let Some(pending) = &self.pending else {
            return;
        };
        // Only UTF-8-valid bytes fold.
        let Ok(text) = std::str::from_utf8(line) else {
            return;
        };
        if self.acc.is_empty() {
            self.acc.push_str(&pending.line);
        }
        self.acc.push('\n');
        self.acc.push_str(text);
    }

    fn flush<S: FnMut(LogEntry) -> bool>(&mut self, scan: &mut S) -> bool {
        match self.pending.take() {
            Some(mut pending) => {
                if !self.acc.is_empty() {
                    pending.line = std::mem::take(&mut self.acc);
                }
                scan(pending)
            }
            None => false,
        }
    }
}
