//! Reverse scanner: delivers lines latest-first by reading the input
//! backwards in page-aligned chunks.

use std::io::{Read, Seek, SeekFrom};

use memchr::memrchr;

use crate::entry::LogEntry;
use crate::format::FormatError;

use super::{report_parse_error, strip_cr, ScanError, ScanOptions};

const PAGE_SIZE: usize = 4096;
const MIN_CARRY_BUF: usize = 1 << 20;

/// Scans `src` backwards from byte offset `mark` (default: end of input),
/// parsing each line and feeding entries to `scan` in reverse order until
/// it returns `true`, an entry falls below the `stop` bound, or the start
/// of the input is reached.
pub fn scan_reverse<R, P, S>(
    mut src: R,
    mut parse: P,
    mut scan: S,
    mut opts: ScanOptions<'_>,
) -> Result<(), ScanError>
where
    R: Read + Seek,
    P: FnMut(&[u8]) -> Result<LogEntry, FormatError>,
    S: FnMut(LogEntry) -> bool,
{
    let start = opts.start.unwrap_or(i64::MAX);
    let stop = opts.stop.unwrap_or(i64::MIN);
    let mut err_fn = opts.err_fn.take();

    let chunk_size = (opts.max_size / PAGE_SIZE + 1) * PAGE_SIZE;
    // Unemitted bytes may span chunks; bound how far a single line can
    // stretch before the scan gives up.
    let max_carry = MIN_CARRY_BUF.max(chunk_size * 2);

    let mut pos = match opts.mark {
        Some(mark) if mark > 0 => mark,
        _ => src.seek(SeekFrom::End(0)).map_err(ScanError::Io)?,
    };

    let mut handle = |line: &[u8]| -> Result<bool, ScanError> {
        let line = strip_cr(line);
        if line.is_empty() {
            return Ok(false);
        }
        match parse(line) {
            Ok(entry) => {
                if entry.timestamp > start {
                    return Ok(false);
                }
                if entry.timestamp < stop {
                    return Ok(true);
                }
                Ok(scan(entry))
            }
            Err(err) => {
                report_parse_error(&mut err_fn, line, &err)?;
                Ok(false)
            }
        }
    };

    let mut carry: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; chunk_size];

    loop {
        // Emit complete lines from the back of the carry buffer.
        while let Some(nl) = memrchr(b'\n', &carry) {
            let line = carry.split_off(nl + 1);
            carry.truncate(nl);
            if handle(&line)? {
                return Ok(());
            }
        }

        if pos == 0 {
            break;
        }

        let read_len = chunk_size.min(pos as usize);
        let read_at = pos - read_len as u64;
        src.seek(SeekFrom::Start(read_at)).map_err(ScanError::Io)?;
        src.read_exact(&mut chunk[..read_len])
            .map_err(ScanError::Io)?;
        pos = read_at;

        // Prepend the chunk to the unemitted carry.
        let mut joined = Vec::with_capacity(read_len + carry.len());
        joined.extend_from_slice(&chunk[..read_len]);
        joined.append(&mut carry);
        carry = joined;

        if carry.len() > max_carry {
            return Err(ScanError::TooLongLine { limit: max_carry });
        }
    }

    // The first line of the input has no preceding newline.
    if !carry.is_empty() {
        handle(&carry)?;
    }

    Ok(())
}
