//! Bare RFC3339-nano format: the first space-delimited token is the
//! timestamp, the remainder is the payload.
//!
//! ```text
//! 2016-10-06T00:17:09.669794202Z log content 1
//! ```

use std::io::Read;

use memchr::memchr;

use crate::entry::LogEntry;

use super::{read_prefix_timestamp, rfc3339_nanos, FormatError, FormatFactory, LogFormat};

pub struct Rfc3339Factory;

impl FormatFactory for Rfc3339Factory {
    fn name(&self) -> &'static str {
        "rfc3339nano"
    }

    fn new_parser(&self) -> Box<dyn LogFormat> {
        Box::new(Rfc3339Format)
    }
}

pub struct Rfc3339Format;

impl LogFormat for Rfc3339Format {
    fn read_timestamp(&mut self, rdr: &mut dyn Read) -> Result<i64, FormatError> {
        read_prefix_timestamp(rdr)
    }

    fn read_entry(&mut self, line: &[u8]) -> Result<LogEntry, FormatError> {
        let idx = memchr(b' ', line).ok_or(FormatError::NoTimestamp)?;
        let timestamp = rfc3339_nanos(&line[..idx])?;
        Ok(LogEntry {
            line: String::from_utf8_lossy(&line[idx + 1..]).into_owned(),
            stream: String::new(),
            timestamp,
            matches: None,
        })
    }
}
