//! Regex timestamp-extraction format.
//!
//! The caller supplies a pattern whose first capture group (or whole match,
//! with no groups) is the timestamp token, and a conversion from that token
//! to nanoseconds: either [`with_time_format`] for chrono layouts or a
//! custom callback.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;

use chrono::{Datelike, Utc};

use crate::entry::LogEntry;
use crate::pool::MAX_RECORD_SIZE;

use super::{parse_layout, FormatError, FormatFactory, LogFormat};

/// Converts a captured timestamp token to nanoseconds since the epoch.
pub type TimeConvert = Arc<dyn Fn(&str) -> Result<i64, FormatError> + Send + Sync>;

/// Layout-based conversion with year inference.
///
/// When the layout carries no year the parse lands in year 0 and produces a
/// negative timestamp; the year is then inferred as the current year, or
/// the previous year when the parsed month runs more than one month ahead
/// of the current month (a December log read in January is last year's).
pub fn with_time_format(layout: &str) -> TimeConvert {
    let layout = layout.to_owned();
    Arc::new(move |text: &str| {
        let naive = parse_layout(&layout, text)?;
        let nanos = naive
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or(FormatError::TimestampRange)?;
        if nanos >= 0 {
            return Ok(nanos);
        }

        let now = Utc::now();
        let mut year = now.year();
        if naive.month() > now.month() + 1 {
            year -= 1;
        }
        let inferred = naive.with_year(year).ok_or(FormatError::MatchTimestamp)?;
        inferred
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or(FormatError::TimestampRange)
    })
}

pub struct RegexFactory {
    pattern: ::regex::Regex,
    convert: TimeConvert,
}

impl RegexFactory {
    pub fn new(pattern: &str, convert: TimeConvert) -> Result<Self, FormatError> {
        let pattern = ::regex::Regex::new(pattern)
            .map_err(|err| FormatError::TimePattern(Box::new(err)))?;
        Ok(Self { pattern, convert })
    }
}

impl FormatFactory for RegexFactory {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn new_parser(&self) -> Box<dyn LogFormat> {
        Box::new(RegexFormat {
            pattern: self.pattern.clone(),
            convert: Arc::clone(&self.convert),
        })
    }
}

struct RegexFormat {
    pattern: ::regex::Regex,
    convert: TimeConvert,
}

impl LogFormat for RegexFormat {
    fn read_timestamp(&mut self, rdr: &mut dyn Read) -> Result<i64, FormatError> {
        let mut line = Vec::new();
        let mut limited = BufReader::new(rdr.take(MAX_RECORD_SIZE as u64));
        limited
            .read_until(b'\n', &mut line)
            .map_err(FormatError::Io)?;
        while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            line.pop();
        }
        self.read_entry(&line).map(|entry| entry.timestamp)
    }

    fn read_entry(&mut self, line: &[u8]) -> Result<LogEntry, FormatError> {
        let text = std::str::from_utf8(line).map_err(|_| FormatError::InvalidUtf8)?;
        let caps = self
            .pattern
            .captures(text)
            .ok_or(FormatError::MatchTimestamp)?;
        let token = caps
            .get(1)
            .or_else(|| caps.get(0))
            .ok_or(FormatError::MatchTimestamp)?;

        Ok(LogEntry {
            timestamp: (self.convert)(token.as_str())?,
            line: text.to_owned(),
            stream: String::new(),
            matches: None,
        })
    }
}
