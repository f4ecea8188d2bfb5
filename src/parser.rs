use crate::record::{LogFormat, LogRecord, Severity};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty log line")]
    Empty,
    #[error("unreadable log line: {control} of {total} characters are control characters")]
    Unreadable { control: usize, total: usize },
    #[error("log line is not valid UTF-8")]
    InvalidEncoding,
}

/// Which line encodings the parser should try.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    #[default]
    Auto,
    JsonLines,
    PlainText,
}

impl ParseMode {
    pub fn strategies(self) -> &'static [Strategy] {
        match self {
            ParseMode::Auto => &[Strategy::Syslog, Strategy::Json, Strategy::FreeText],
            ParseMode::JsonLines => &[Strategy::Json, Strategy::FreeText],
            ParseMode::PlainText => &[Strategy::Syslog, Strategy::FreeText],
        }
    }
}

impl std::str::FromStr for ParseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(ParseMode::Auto),
            "json" | "jsonl" | "json_lines" => Ok(ParseMode::JsonLines),
            "plain" | "text" | "plain_text" => Ok(ParseMode::PlainText),
            other => Err(format!("unknown parse mode: {other}")),
        }
    }
}

/// Closed set of line encodings, tried in order until one accepts the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Syslog,
    Json,
    FreeText,
}

impl Strategy {
    fn apply(self, line: &str, received_at: DateTime<Utc>) -> Option<Fragments> {
        match self {
            Strategy::Syslog => parse_syslog(line, received_at),
            Strategy::Json => parse_json(line),
            Strategy::FreeText => Some(parse_free_text(line)),
        }
    }
}

#[derive(Debug, Default)]
struct Fragments {
    timestamp: Option<DateTime<Utc>>,
    severity: Option<Severity>,
    source: Option<String>,
    message: String,
    fields: BTreeMap<String, String>,
}

pub fn parse(raw: &str, source_hint: Option<&str>) -> Result<LogRecord, ParseError> {
    parse_with(raw, source_hint, ParseMode::Auto, Utc::now())
}

/// Deterministic variant: the caller supplies the ingestion time.
pub fn parse_with(
    raw: &str,
    source_hint: Option<&str>,
    mode: ParseMode,
    received_at: DateTime<Utc>,
) -> Result<LogRecord, ParseError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    check_readable(line)?;

    let mut format = LogFormat::FreeText;
    let mut frags = None;
    for strategy in mode.strategies() {
        if let Some(f) = strategy.apply(line, received_at) {
            format = match strategy {
                Strategy::Syslog => LogFormat::Syslog,
                Strategy::Json => LogFormat::Json,
                Strategy::FreeText => LogFormat::FreeText,
            };
            frags = Some(f);
            break;
        }
    }
    let frags = frags.unwrap_or_else(|| parse_free_text(line));

    let message = if frags.message.trim().is_empty() {
        line.trim().to_string()
    } else {
        frags.message
    };
    let source = source_hint
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or(frags.source)
        .unwrap_or_else(|| "unknown".to_string());

    Ok(LogRecord {
        received_at,
        timestamp: frags.timestamp.unwrap_or(received_at),
        source,
        severity: frags.severity.unwrap_or(Severity::Info),
        format,
        message,
        raw: line.to_string(),
        fields: frags.fields,
    })
}

/// Parses undecoded input. Mostly-garbage bytes are rejected; a few invalid
/// sequences are replaced and the line is parsed best-effort.
pub fn parse_bytes(
    raw: &[u8],
    source_hint: Option<&str>,
    mode: ParseMode,
    received_at: DateTime<Utc>,
) -> Result<LogRecord, ParseError> {
    match std::str::from_utf8(raw) {
        Ok(s) => parse_with(s, source_hint, mode, received_at),
        Err(_) => {
            let lossy = String::from_utf8_lossy(raw);
            let total = lossy.chars().count();
            let replaced = lossy.chars().filter(|c| *c == char::REPLACEMENT_CHARACTER).count();
            if replaced * 2 > total {
                return Err(ParseError::InvalidEncoding);
            }
            parse_with(&lossy, source_hint, mode, received_at)
        }
    }
}

fn check_readable(line: &str) -> Result<(), ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let total = line.chars().count();
    let control = line
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
        .count();
    if control * 2 > total {
        return Err(ParseError::Unreadable { control, total });
    }
    Ok(())
}

// ---------------------------------------------------------------- syslog

static RE_RFC3164: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^(?:<([0-9]{1,3})>)?(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)\s+([0-9]{1,2})\s+([0-9]{2}:[0-9]{2}:[0-9]{2})\s+(\S+)\s+([^\s:\[]+)(?:\[([0-9]+)\])?:\s*(.*)$").unwrap()
});

static RE_RFC5424: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^<([0-9]{1,3})>1\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(-|(?:\[[^\]]*\])+)\s?(.*)$").unwrap()
});

fn parse_syslog(line: &str, received_at: DateTime<Utc>) -> Option<Fragments> {
    if let Some(c) = RE_RFC5424.captures(line) {
        let pri: Option<u8> = c.get(1).and_then(|m| m.as_str().parse().ok());
        let mut fields = BTreeMap::new();
        let mut put = |key: &str, idx: usize| {
            if let Some(v) = c.get(idx).map(|m| m.as_str()).filter(|v| *v != "-") {
                fields.insert(key.to_string(), v.to_string());
            }
        };
        put("host", 3);
        put("app", 4);
        put("pid", 5);
        put("msgid", 6);
        if let Some(sd) = c.get(7).map(|m| m.as_str()).filter(|v| *v != "-") {
            extract_key_values(sd, &mut fields);
        }
        let timestamp = c
            .get(2)
            .and_then(|m| DateTime::parse_from_rfc3339(m.as_str()).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let (level, body) = strip_level(c.get(8).map_or("", |m| m.as_str()));
        let source = fields.get("app").cloned();
        return Some(Fragments {
            timestamp,
            severity: pri.map(Severity::from_syslog_priority).or(level),
            source,
            message: body.to_string(),
            fields,
        });
    }

    let c = RE_RFC3164.captures(line)?;
    let pri: Option<u8> = c.get(1).and_then(|m| m.as_str().parse().ok());
    let timestamp = syslog_timestamp(&c[2], &c[3], &c[4], received_at.year());
    let mut fields = BTreeMap::new();
    fields.insert("host".to_string(), c[5].to_string());
    fields.insert("app".to_string(), c[6].to_string());
    if let Some(pid) = c.get(7) {
        fields.insert("pid".to_string(), pid.as_str().to_string());
    }
    let (level, body) = strip_level(c.get(8).map_or("", |m| m.as_str()));
    extract_key_values(body, &mut fields);
    Some(Fragments {
        timestamp,
        severity: pri.map(Severity::from_syslog_priority).or(level),
        source: Some(c[6].to_string()),
        message: body.to_string(),
        fields,
    })
}

fn syslog_timestamp(month: &str, day: &str, time: &str, year: i32) -> Option<DateTime<Utc>> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let month = MONTHS.iter().position(|m| *m == month)? as u32 + 1;
    let day: u32 = day.parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

// ---------------------------------------------------------------- json

const TIME_KEYS: [&str; 7] = ["timestamp", "time", "ts", "@timestamp", "datetime", "date", "t"];
const LEVEL_KEYS: [&str; 6] = ["level", "severity", "lvl", "log.level", "loglevel", "levelname"];
const MESSAGE_KEYS: [&str; 5] = ["msg", "message", "log", "event", "text"];
const SOURCE_KEYS: [&str; 8] = [
    "service",
    "app",
    "application",
    "source",
    "logger",
    "component",
    "kubernetes.labels.app",
    "kubernetes.container_name",
];

fn parse_json(line: &str) -> Option<Fragments> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let v = match serde_json::from_str::<Value>(trimmed) {
        Ok(v @ Value::Object(_)) => v,
        _ => return None,
    };
    let mut fields = BTreeMap::new();
    flatten_json("", &v, &mut fields);

    let mut time_key = None;
    let mut timestamp = None;
    for key in TIME_KEYS {
        if let Some(t) = fields.get(key).and_then(|val| parse_ts_candidate(val)) {
            time_key = Some(key);
            timestamp = Some(t);
            break;
        }
    }
    if timestamp.is_none() {
        timestamp = fields.values().find_map(|val| parse_ts_candidate(val));
    }

    let level_key = LEVEL_KEYS.iter().copied().find(|k| fields.contains_key(*k));
    let severity = level_key.and_then(|k| fields.get(k)).and_then(|val| {
        Severity::from_token(val).or_else(|| val.parse::<i64>().ok().and_then(Severity::from_numeric_level))
    });

    let message = match MESSAGE_KEYS.iter().find_map(|k| fields.get(*k)) {
        Some(m) => m.clone(),
        None => fields
            .iter()
            .filter(|(k, _)| Some(k.as_str()) != time_key && Some(k.as_str()) != level_key)
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" "),
    };
    let source = SOURCE_KEYS.iter().find_map(|k| fields.get(*k)).cloned();

    Some(Fragments { timestamp, severity, source, message, fields })
}

fn flatten_json(prefix: &str, v: &Value, out: &mut BTreeMap<String, String>) {
    let join = |k: &str| if prefix.is_empty() { k.to_string() } else { format!("{prefix}.{k}") };
    match v {
        Value::Object(map) => {
            for (k, v) in map.iter() {
                flatten_json(&join(k), v, out);
            }
        }
        Value::Array(arr) => {
            for (idx, item) in arr.iter().enumerate() {
                flatten_json(&join(&idx.to_string()), item, out);
            }
        }
        Value::Null => {
            out.insert(prefix.to_string(), "null".to_string());
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
    }
}

// ---------------------------------------------------------------- free text

static RE_LEADING_TS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?([0-9]{4}-[0-9]{2}-[0-9]{2}[T ][0-9]{2}:[0-9]{2}:[0-9]{2}(?:[.,][0-9]{1,9})?(?:Z|[+-][0-9]{2}(?::?[0-9]{2})?)?)\]?\s*").unwrap()
});

static RE_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\[?(trace|debug|info|notice|warn|warning|error|err|severe|fatal|crit|critical|panic)\]?:?(?:\s+|$)").unwrap()
});

static RE_KV: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b([A-Za-z_][\w.\-]*)=("(?:[^"\\]|\\.)*"|'[^']*'|[^\s,;]+)"#).unwrap()
});

fn parse_free_text(line: &str) -> Fragments {
    let mut rest = line.trim();
    let mut timestamp = None;
    if let Some(c) = RE_LEADING_TS.captures(rest) {
        timestamp = parse_ts_string(&c[1].replace(',', "."));
        if timestamp.is_some() {
            rest = &rest[c.get(0).map_or(0, |m| m.end())..];
        }
    }
    if timestamp.is_none() {
        timestamp = detect_timestamp_in_text(rest);
    }
    let (mut severity, body) = strip_level(rest);

    let mut fields = BTreeMap::new();
    extract_key_values(body, &mut fields);
    if severity.is_none() {
        severity = ["level", "severity", "lvl"]
            .iter()
            .find_map(|k| fields.get(*k))
            .and_then(|v| Severity::from_token(v));
    }
    Fragments { timestamp, severity, source: None, message: body.to_string(), fields }
}

fn strip_level(s: &str) -> (Option<Severity>, &str) {
    let s = s.trim_start();
    match RE_LEVEL.captures(s) {
        Some(c) => {
            let end = c.get(0).map_or(0, |m| m.end());
            (Severity::from_token(&c[1]), &s[end..])
        }
        None => (None, s),
    }
}

fn extract_key_values(s: &str, out: &mut BTreeMap<String, String>) {
    for c in RE_KV.captures_iter(s) {
        let value = c[2].trim_matches(|ch| ch == '"' || ch == '\'');
        out.entry(c[1].to_string()).or_insert_with(|| value.to_string());
    }
}

// ---------------------------------------------------------------- timestamps

fn parse_ts_candidate(s: &str) -> Option<DateTime<Utc>> {
    parse_ts_string(s).or_else(|| parse_ts_number_string(s))
}

fn parse_ts_string(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let zoned = [
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
    ];
    for f in zoned {
        if let Ok(dt) = DateTime::parse_from_str(s, f) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let naive = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];
    for f in naive {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, f) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    None
}

fn parse_ts_number_string(s: &str) -> Option<DateTime<Utc>> {
    if !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: i64 = s.parse().ok()?;
    match s.len() {
        10 => DateTime::<Utc>::from_timestamp(n, 0),
        13 => DateTime::<Utc>::from_timestamp(n / 1000, ((n % 1000) * 1_000_000) as u32),
        16 => DateTime::<Utc>::from_timestamp(n / 1_000_000, ((n % 1_000_000) * 1_000) as u32),
        _ => None,
    }
}

static RE_ISO_ANY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9]{4}-[0-9]{2}-[0-9]{2}[T ][0-9]{2}:[0-9]{2}:[0-9]{2}(?:\.[0-9]{1,9})?(?:Z|[+-](?:[0-9]{2}(?::?[0-9]{2})?))?").unwrap()
});

/// Finds an ISO-8601 timestamp anywhere in the text.
pub fn detect_timestamp_in_text(s: &str) -> Option<DateTime<Utc>> {
    let m = RE_ISO_ANY.find(s)?;
    let text = m.as_str();
    parse_ts_string(text).or_else(|| {
        // +0800 style offsets
        let cut = text.len().checked_sub(5)?;
        let (head, tail) = (text.get(..cut)?, text.get(cut..)?);
        let (sign, rest) = (tail.get(..3)?, tail.get(3..)?);
        if sign.starts_with('+') || sign.starts_with('-') {
            parse_ts_string(&format!("{head}{sign}:{rest}"))
        } else {
            None
        }
    })
}
