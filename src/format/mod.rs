//! Log-format parsers and auto-detection.
//!
//! # Scope
//! Each format turns raw line bytes into a [`LogEntry`] (`read_entry`) and
//! can extract just the timestamp of a stream's first record
//! (`read_timestamp`). A [`FormatFactory`] produces per-stream parser
//! instances so formats with per-stream state stay isolated.
//!
//! # Module map
//! - `cri`: CRI text (`<rfc3339nano> <stdout|stderr> <tag> <payload>`).
//! - `json`: Docker-style JSON (`{"log":…,"stream":…,"time":…}`).
//! - `rfc3339`: bare RFC3339-nano prefix lines.
//! - `json_custom`: caller-supplied JSON field path and time layout.
//! - `regex`: caller-supplied pattern whose first capture group is the
//!   timestamp.
//!
//! [`detect`] sniffs the first line of a stream against the self-describing
//! formats (Docker JSON, then CRI).

pub mod cri;
pub mod json;
pub mod json_custom;
pub mod regex;
pub mod rfc3339;

use std::fmt;
use std::io::{self, BufRead, Read};

use chrono::format::{parse as chrono_parse, Parsed, StrftimeItems};
use chrono::{DateTime, NaiveDateTime, TimeDelta};

use crate::entry::LogEntry;
use crate::pool::MAX_RECORD_SIZE;

pub use cri::CriFactory;
pub use json::JsonFactory;
pub use json_custom::JsonCustomFactory;
pub use regex::{with_time_format, RegexFactory, TimeConvert};
pub use rfc3339::Rfc3339Factory;

/// Buffer size for detection and timestamp sniffing.
pub(crate) const DEF_BUFFER_SIZE: usize = 4 << 10;

/// Bytes of stream prefix inspected when reading a leading timestamp.
pub(crate) const TS_BUF_SIZE: usize = 64;

/// Errors raised while parsing log input.
///
/// These surface through the scanner's error policy; the default policy is
/// tolerant (log and continue).
#[derive(Debug)]
#[non_exhaustive]
pub enum FormatError {
    /// No format recognized the input; carries each format's failure.
    Detect(Vec<FormatError>),
    /// No timestamp delimiter in the line.
    NoTimestamp,
    /// A timestamp token was found but did not parse.
    ParseTimestamp(chrono::ParseError),
    /// The timestamp does not fit in nanoseconds since the epoch.
    TimestampRange,
    /// A token that must be text was not valid UTF-8.
    InvalidUtf8,
    /// No stream delimiter in the line.
    NoStream,
    /// Stream token other than stdout/stderr.
    UnknownStream(String),
    /// No tag delimiter in the line.
    NoTag,
    /// JSON line failed to deserialize.
    JsonUnmarshal(serde_json::Error),
    /// The configured time field is missing or not a string.
    JsonTimeField(String),
    /// The line did not match the configured timestamp pattern or layout.
    MatchTimestamp,
    /// Invalid timestamp-extraction pattern.
    TimePattern(Box<::regex::Error>),
    /// I/O failure while reading input.
    Io(io::Error),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detect(errors) => {
                write!(f, "fail to detect log format")?;
                for err in errors {
                    write!(f, "; {err}")?;
                }
                Ok(())
            }
            Self::NoTimestamp => write!(f, "no timestamp delimiter"),
            Self::ParseTimestamp(err) => write!(f, "fail parse timestamp: {err}"),
            Self::TimestampRange => write!(f, "timestamp out of nanosecond range"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8"),
            Self::NoStream => write!(f, "no stream delimiter"),
            Self::UnknownStream(stream) => write!(f, "unknown stream type: {stream}"),
            Self::NoTag => write!(f, "no tag delimiter"),
            Self::JsonUnmarshal(err) => write!(f, "fail JSON unmarshal: {err}"),
            Self::JsonTimeField(path) => write!(f, "fail to extract time field: {path}"),
            Self::MatchTimestamp => write!(f, "fail match timestamp"),
            Self::TimePattern(err) => write!(f, "invalid timestamp pattern: {err}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for FormatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ParseTimestamp(err) => Some(err),
            Self::JsonUnmarshal(err) => Some(err),
            Self::TimePattern(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// A log format parser.
pub trait LogFormat {
    /// Parses only the timestamp from the first record of a stream.
    fn read_timestamp(&mut self, rdr: &mut dyn Read) -> Result<i64, FormatError>;

    /// Parses a single line (without its terminator) into an entry.
    fn read_entry(&mut self, line: &[u8]) -> Result<LogEntry, FormatError>;
}

/// Produces parser instances for one format.
pub trait FormatFactory {
    fn name(&self) -> &'static str;
    fn new_parser(&self) -> Box<dyn LogFormat>;
}

/// Sniffs the format of a stream from its first line.
///
/// Tries the self-describing formats in order (Docker JSON, CRI) and
/// returns the winning factory together with the first record's timestamp.
pub fn detect<R: BufRead>(rdr: &mut R) -> Result<(Box<dyn FormatFactory>, i64), FormatError> {
    let mut line = Vec::with_capacity(DEF_BUFFER_SIZE);
    rdr.take(MAX_RECORD_SIZE as u64)
        .read_until(b'\n', &mut line)
        .map_err(FormatError::Io)?;
    while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        line.pop();
    }

    let mut errors = Vec::new();
    match json::detect_json(&line) {
        Ok(found) => return Ok(found),
        Err(err) => errors.push(err),
    }
    match cri::detect_cri(&line) {
        Ok(found) => return Ok(found),
        Err(err) => errors.push(err),
    }

    Err(FormatError::Detect(errors))
}

/// Parses an RFC3339-nano token into nanoseconds since the epoch.
pub(crate) fn rfc3339_nanos(token: &[u8]) -> Result<i64, FormatError> {
    let text = std::str::from_utf8(token).map_err(|_| FormatError::InvalidUtf8)?;
    let stamp = DateTime::parse_from_rfc3339(text).map_err(FormatError::ParseTimestamp)?;
    stamp.timestamp_nanos_opt().ok_or(FormatError::TimestampRange)
}

/// Finds the leading timestamp token (up to the first space) in a stream
/// prefix and parses it as RFC3339-nano.
pub(crate) fn read_prefix_timestamp(rdr: &mut dyn Read) -> Result<i64, FormatError> {
    let mut buf = [0u8; TS_BUF_SIZE];
    let mut len = 0;
    while len < buf.len() {
        match rdr.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FormatError::Io(err)),
        }
    }

    let offset = memchr::memchr(b' ', &buf[..len]).ok_or(FormatError::NoTimestamp)?;
    rfc3339_nanos(&buf[..offset])
}

/// Parses `text` against a chrono strftime layout, defaulting omitted date
/// and time fields the way lenient log layouts expect (year 0, January 1,
/// midnight), and normalizing any offset to UTC.
///
/// A year-less layout therefore lands in year 0; callers that want year
/// inference check for the resulting negative timestamp.
pub(crate) fn parse_layout(layout: &str, text: &str) -> Result<NaiveDateTime, FormatError> {
    let mut parsed = Parsed::new();
    chrono_parse(&mut parsed, text, StrftimeItems::new(layout))
        .map_err(|_| FormatError::MatchTimestamp)?;

    if parsed.timestamp.is_none() {
        if parsed.year.is_none() {
            parsed.set_year(0).map_err(|_| FormatError::MatchTimestamp)?;
        }
        if parsed.month.is_none() {
            parsed.set_month(1).map_err(|_| FormatError::MatchTimestamp)?;
        }
        if parsed.day.is_none() {
            parsed.set_day(1).map_err(|_| FormatError::MatchTimestamp)?;
        }
        if parsed.hour_div_12.is_none() || parsed.hour_mod_12.is_none() {
            parsed.set_hour(0).map_err(|_| FormatError::MatchTimestamp)?;
        }
        if parsed.minute.is_none() {
            parsed.set_minute(0).map_err(|_| FormatError::MatchTimestamp)?;
        }
    }

    let offset = parsed.offset.unwrap_or(0);
    let naive = parsed
        .to_naive_datetime_with_offset(offset)
        .map_err(|_| FormatError::MatchTimestamp)?;
    Ok(naive - TimeDelta::seconds(i64::from(offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn detect_docker_json() {
        let mut input = Cursor::new(
            br#"{"log":"content 1","stream":"stdout","time":"2016-10-20T18:39:20.57606443Z"}
{"log":"content 2","stream":"stderr","time":"2016-10-20T18:39:21.57606443Z"}
"#
            .to_vec(),
        );
        let (factory, stamp) = detect(&mut input).unwrap();
        assert_eq!(factory.name(), "json");
        assert_eq!(stamp, 1_476_988_760_576_064_430);
    }

    #[test]
    fn detect_cri_text() {
        let mut input =
            Cursor::new(b"2016-10-06T00:17:09.669794202Z stdout P log content 1\n".to_vec());
        let (factory, stamp) = detect(&mut input).unwrap();
        assert_eq!(factory.name(), "cri");
        assert_eq!(stamp, 1_475_713_029_669_794_202);
    }

    #[test]
    fn detect_unknown_collects_failures() {
        let mut input = Cursor::new(b"free form log line\n".to_vec());
        match detect(&mut input) {
            Err(FormatError::Detect(errors)) => assert_eq!(errors.len(), 2),
            Err(other) => panic!("expected detect failure, got {other:?}"),
            Ok((factory, _)) => panic!("expected detect failure, got Ok({})", factory.name()),
        }
    }

    #[test]
    fn rfc3339_token_parses_nanos() {
        let stamp = rfc3339_nanos(b"2016-10-06T00:17:09.669794202Z").unwrap();
        assert_eq!(stamp, 1_475_713_029_669_794_202);
        assert!(rfc3339_nanos(b"not a time").is_err());
    }

    #[test]
    fn layout_defaults_missing_fields() {
        // Syslog-style layout with no year: lands in year 0.
        let ndt = parse_layout("%b %d %H:%M:%S", "Jan 02 15:04:05").unwrap();
        use chrono::{Datelike, Timelike};
        assert_eq!(ndt.year(), 0);
        assert_eq!(ndt.month(), 1);
        assert_eq!(ndt.day(), 2);
        assert_eq!(ndt.hour(), 15);
    }

    #[test]
    fn layout_with_offset_normalizes_to_utc() {
        let ndt = parse_layout("%Y-%m-%d %H:%M:%S %z", "2024-03-01 12:00:00 +0200").unwrap();
        use chrono::Timelike;
        assert_eq!(ndt.hour(), 10);
    }
}
