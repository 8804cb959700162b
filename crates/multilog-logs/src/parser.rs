use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use multilog_types::{LogEntry, LogLevel, StreamTarget};

/// Common field names, matched case-insensitively
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "time", "ts", "@timestamp", "datetime"];
const LEVEL_FIELDS: &[&str] = &["level", "lvl", "severity", "log.level", "loglevel", "log_level"];
const MESSAGE_FIELDS: &[&str] = &["message", "msg", "log", "text", "body"];

/// Log parser for extracting structure from raw log lines
pub struct LogParser;

impl LogParser {
    /// Parse a raw line read from `target` at `read_at`.
    ///
    /// A leading Kubernetes timestamp is stripped and used as the entry time.
    /// JSON objects contribute level, message and (when there is no prefix)
    /// timestamp. Anything else becomes a raw entry stamped with `read_at`.
    pub fn parse(raw: &str, target: &StreamTarget, read_at: DateTime<Utc>) -> LogEntry {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let (prefix_ts, content) = Self::extract_k8s_timestamp(raw);

        let mut entry = LogEntry::raw(target.clone(), prefix_ts.unwrap_or(read_at), content);

        if let Some(fields) = Self::try_parse_json(content) {
            entry.level = Self::extract_level_from_json(&fields);
            if prefix_ts.is_none() {
                if let Some(ts) = Self::extract_timestamp_from_json(&fields) {
                    entry.timestamp = ts;
                }
            }
            if let Some(Value::String(message)) = field(&fields, MESSAGE_FIELDS) {
                entry.message = message.clone();
            }
            entry.fields = Some(fields);
        } else {
            entry.level = Self::extract_level_from_text(content);
        }

        entry
    }

    /// Extract Kubernetes timestamp from the beginning of a log line
    fn extract_k8s_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // K8s timestamp format: 2024-01-15T10:30:00.123456789Z (30 chars)
        // Sometimes shorter: 2024-01-15T10:30:00Z (20 chars)
        if raw.len() >= 20 {
            let search_end = Self::floor_char_boundary(raw, 35.min(raw.len()));
            if let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) {
                let ts_str = &raw[..=z_pos];
                if let Ok(ts) = DateTime::parse_from_rfc3339(ts_str) {
                    let remaining = raw[z_pos + 1..].trim_start();
                    return (Some(ts.with_timezone(&Utc)), remaining);
                }
            }
        }
        (None, raw)
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }

    fn try_parse_json(content: &str) -> Option<Map<String, Value>> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str(trimmed).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn extract_timestamp_from_json(fields: &Map<String, Value>) -> Option<DateTime<Utc>> {
        match field(fields, TIMESTAMP_FIELDS)? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            Value::Number(n) => {
                let secs = n.as_f64()?;
                // Millisecond epochs are common; seconds epochs are far smaller
                let millis = if secs > 1e12 { secs } else { secs * 1000.0 };
                Utc.timestamp_millis_opt(millis as i64).single()
            }
            _ => None,
        }
    }

    /// Extract log level from JSON fields
    fn extract_level_from_json(fields: &Map<String, Value>) -> LogLevel {
        match field(fields, LEVEL_FIELDS) {
            Some(Value::String(s)) => LogLevel::parse(s),
            // Some loggers use numeric levels
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0..=10) => LogLevel::Trace,
                Some(11..=20) => LogLevel::Debug,
                Some(21..=30) => LogLevel::Info,
                Some(31..=40) => LogLevel::Warn,
                Some(41..=50) => LogLevel::Error,
                Some(_) => LogLevel::Fatal,
                None => LogLevel::Unknown,
            },
            _ => LogLevel::Unknown,
        }
    }

    /// Extract log level from plain text patterns
    fn extract_level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        const DECORATED: &[(&str, LogLevel)] = &[
            ("[FATAL]", LogLevel::Fatal),
            ("[PANIC]", LogLevel::Fatal),
            ("[CRITICAL]", LogLevel::Fatal),
            ("[ERROR]", LogLevel::Error),
            ("[ERR]", LogLevel::Error),
            ("[WARN]", LogLevel::Warn),
            ("[WARNING]", LogLevel::Warn),
            ("[INFO]", LogLevel::Info),
            ("[DEBUG]", LogLevel::Debug),
            ("[TRACE]", LogLevel::Trace),
            ("FATAL:", LogLevel::Fatal),
            ("PANIC:", LogLevel::Fatal),
            ("ERROR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warn),
            ("WARN:", LogLevel::Warn),
            ("INFO:", LogLevel::Info),
            ("DEBUG:", LogLevel::Debug),
            ("TRACE:", LogLevel::Trace),
            (" FATAL ", LogLevel::Fatal),
            (" ERROR ", LogLevel::Error),
            (" WARN ", LogLevel::Warn),
            (" INFO ", LogLevel::Info),
            (" DEBUG ", LogLevel::Debug),
        ];

        for (pattern, level) in DECORATED {
            if upper.contains(pattern) {
                return *level;
            }
        }

        // Level as the first word
        let first = upper.split_whitespace().next().unwrap_or_default();
        match first.trim_matches(|c: char| !c.is_ascii_alphabetic()) {
            "FATAL" | "PANIC" => LogLevel::Fatal,
            "ERROR" | "ERR" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Unknown,
        }
    }
}

/// First present field among `names`, ignoring key case
fn field<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        fields
            .get(*name)
            .or_else(|| {
                fields
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
    })
}
