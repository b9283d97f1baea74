//! Docker-style JSON log format.
//!
//! Expects one object per line:
//!
//! ```text
//! {"log":"content 1","stream":"stdout","time":"2016-10-20T18:39:20.57606443Z"}
//! ```

use std::io::Read;

use serde::Deserialize;

use crate::entry::LogEntry;

use super::{rfc3339_nanos, FormatError, FormatFactory, LogFormat};

#[derive(Deserialize)]
struct JsonLine {
    #[serde(default)]
    log: String,
    #[serde(default)]
    stream: String,
    time: String,
}

#[derive(Deserialize)]
struct TimeOnly {
    time: String,
}

pub struct JsonFactory;

impl FormatFactory for JsonFactory {
    fn name(&self) -> &'static str {
        "json"
    }

    fn new_parser(&self) -> Box<dyn LogFormat> {
        Box::new(JsonFormat)
    }
}

pub struct JsonFormat;

impl LogFormat for JsonFormat {
    fn read_timestamp(&mut self, rdr: &mut dyn Read) -> Result<i64, FormatError> {
        let mut de = serde_json::Deserializer::from_reader(rdr);
        let line = TimeOnly::deserialize(&mut de).map_err(FormatError::JsonUnmarshal)?;
        rfc3339_nanos(line.time.as_bytes())
    }

    fn read_entry(&mut self, line: &[u8]) -> Result<LogEntry, FormatError> {
        let parsed: JsonLine =
            serde_json::from_slice(line).map_err(FormatError::JsonUnmarshal)?;
        Ok(LogEntry {
            timestamp: rfc3339_nanos(parsed.time.as_bytes())?,
            line: parsed.log,
            stream: parsed.stream,
            matches: None,
        })
    }
}

pub(crate) fn detect_json(line: &[u8]) -> Result<(Box<dyn FormatFactory>, i64), FormatError> {
    let entry = JsonFormat.read_entry(line)?;
    Ok((Box::new(JsonFactory), entry.timestamp))
}
