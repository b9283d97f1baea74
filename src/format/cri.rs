//! CRI text log format.
//!
//! Expects kubelet's CRI framing:
//!
//! ```text
//! 2016-10-06T00:17:09.669794202Z stdout P log content 1
//! 2016-10-06T00:17:09.669794203Z stderr F log content 2
//! ```

use std::io::Read;

use memchr::memchr;

use crate::entry::LogEntry;

use super::{
    read_prefix_timestamp, rfc3339_nanos, FormatError, FormatFactory, LogFormat,
};

const DELIMITER: u8 = b' ';
const TOKEN_STDOUT: &str = "stdout";
const TOKEN_STDERR: &str = "stderr";

pub struct CriFactory;

impl FormatFactory for CriFactory {
    fn name(&self) -> &'static str {
        "cri"
    }

    fn new_parser(&self) -> Box<dyn LogFormat> {
        Box::new(CriFormat)
    }
}

pub struct CriFormat;

impl LogFormat for CriFormat {
    fn read_timestamp(&mut self, rdr: &mut dyn Read) -> Result<i64, FormatError> {
        read_prefix_timestamp(rdr)
    }

    fn read_entry(&mut self, line: &[u8]) -> Result<LogEntry, FormatError> {
        let idx = memchr(DELIMITER, line).ok_or(FormatError::NoTimestamp)?;
        let timestamp = rfc3339_nanos(&line[..idx])?;

        let rest = &line[idx + 1..];
        let idx = memchr(DELIMITER, rest).ok_or(FormatError::NoStream)?;
        let stream = match &rest[..idx] {
            b"stdout" => TOKEN_STDOUT,
            b"stderr" => TOKEN_STDERR,
            other => {
                return Err(FormatError::UnknownStream(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        };

        // The partial/full tag is skipped; matchers act on the payload.
        let rest = &rest[idx + 1..];
        let idx = memchr(DELIMITER, rest).ok_or(FormatError::NoTag)?;

        Ok(LogEntry {
            line: String::from_utf8_lossy(&rest[idx + 1..]).into_owned(),
            stream: stream.to_owned(),
            timestamp,
            matches: None,
        })
    }
}

pub(crate) fn detect_cri(line: &[u8]) -> Result<(Box<dyn FormatFactory>, i64), FormatError> {
    let entry = CriFormat.read_entry(line)?;
    Ok((Box::new(CriFactory), entry.timestamp))
}
