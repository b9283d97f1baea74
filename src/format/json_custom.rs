//! JSON format with a caller-supplied time field.
//!
//! The caller names a dotted object path (`a.b.c`) holding the timestamp
//! string and a chrono strftime layout to parse it with. The whole raw line
//! becomes the entry payload, so matchers can still test any field.

use std::io::Read;

use serde_json::Value;

use crate::entry::LogEntry;

use super::{parse_layout, FormatError, FormatFactory, LogFormat};

#[derive(Clone)]
pub struct JsonCustomFactory {
    path: Vec<String>,
    layout: String,
}

impl JsonCustomFactory {
    /// `path` is a dotted object path to the time field; `layout` is the
    /// chrono strftime layout the field's string value parses with.
    pub fn new(path: &str, layout: &str) -> Result<Self, FormatError> {
        let segments: Vec<String> = path.split('.').map(str::to_owned).collect();
        if path.is_empty() || segments.iter().any(String::is_empty) {
            return Err(FormatError::JsonTimeField(path.to_owned()));
        }
        Ok(Self {
            path: segments,
            layout: layout.to_owned(),
        })
    }

    fn dotted(&self) -> String {
        self.path.join(".")
    }

    fn time_value<'v>(&self, value: &'v Value) -> Result<&'v str, FormatError> {
        let mut cursor = value;
        for segment in &self.path {
            cursor = cursor
                .get(segment)
                .ok_or_else(|| FormatError::JsonTimeField(self.dotted()))?;
        }
        cursor
            .as_str()
            .ok_or_else(|| FormatError::JsonTimeField(self.dotted()))
    }

    fn parse_time(&self, text: &str) -> Result<i64, FormatError> {
        let naive = parse_layout(&self.layout, text)?;
        naive
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or(FormatError::TimestampRange)
    }
}

impl FormatFactory for JsonCustomFactory {
    fn name(&self) -> &'static str {
        "json_custom"
    }

    fn new_parser(&self) -> Box<dyn LogFormat> {
        Box::new(JsonCustomFormat {
            factory: self.clone(),
        })
    }
}

struct JsonCustomFormat {
    factory: JsonCustomFactory,
}

impl LogFormat for JsonCustomFormat {
    fn read_timestamp(&mut self, rdr: &mut dyn Read) -> Result<i64, FormatError> {
        let mut de = serde_json::Deserializer::from_reader(rdr);
        let value = <Value as serde::Deserialize>::deserialize(&mut de)
            .map_err(FormatError::JsonUnmarshal)?;
        let text = self.factory.time_value(&value)?;
        self.factory.parse_time(text)
    }

    fn read_entry(&mut self, line: &[u8]) -> Result<LogEntry, FormatError> {
        let value: Value =
            serde_json::from_slice(line).map_err(FormatError::JsonUnmarshal)?;
        let text = self.factory.time_value(&value)?;
        let timestamp = self.factory.parse_time(text)?;

        Ok(LogEntry {
            line: String::from_utf8_lossy(line).into_owned(),
            stream: String::new(),
            timestamp,
            matches: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(path: &str, layout: &str) -> Box<dyn LogFormat> {
        JsonCustomFactory::new(path, layout).unwrap().new_parser()
    }

    #[test]
    fn extracts_nested_time_field() {
        let mut fmt = parser("meta.ts", "%Y-%m-%dT%H:%M:%S%.f%z");
        let entry = fmt
            .read_entry(br#"{"meta":{"ts":"2024-03-01T12:00:00.5+00:00"},"msg":"boom"}"#)
            .unwrap();
        // The raw line is preserved as the payload.
        assert!(entry.line.contains("\"msg\":\"boom\""));
        assert_eq!(
            entry.timestamp,
            1_709_294_400_500_000_000
        );
    }

    #[test]
    fn missing_field_reports_path() {
        let mut fmt = parser("meta.ts", "%Y-%m-%d");
        match fmt.read_entry(br#"{"meta":{"other":1}}"#) {
            Err(FormatError::JsonTimeField(path)) => assert_eq!(path, "meta.ts"),
            other => panic!("expected time-field error, got {other:?}"),
        }
    }

    #[test]
    fn non_string_field_rejected() {
        let mut fmt = parser("ts", "%Y-%m-%d");
        assert!(matches!(
            fmt.read_entry(br#"{"ts":12345}"#),
            Err(FormatError::JsonTimeField(_))
        ));
    }

    #[test]
    fn layout_mismatch_is_match_timestamp() {
        let mut fmt = parser("ts", "%Y-%m-%dT%H:%M:%S");
        assert!(matches!(
            fmt.read_entry(br#"{"ts":"01/02/2024"}"#),
            Err(FormatError::MatchTimestamp)
        ));
    }

    #[test]
    fn corrupt_json_rejected() {
        let mut fmt = parser("ts", "%Y-%m-%d");
        assert!(matches!(
            fmt.read_entry(br#"{"ts": "#),
            Err(FormatError::JsonUnmarshal(_))
        ));
    }

    #[test]
    fn empty_path_rejected() {
        assert!(JsonCustomFactory::new("", "%Y").is_err());
        assert!(JsonCustomFactory::new("a..b", "%Y").is_err());
    }
}
