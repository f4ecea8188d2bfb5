use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// ERROR and FATAL.
    pub fn is_escalated(&self) -> bool {
        *self >= Severity::Error
    }

    /// Maps a level word as it appears in logs (`warning`, `ERR`, `crit`, ...).
    pub fn from_token(token: &str) -> Option<Severity> {
        let t = token.trim().to_ascii_uppercase();
        let sev = match t.as_str() {
            "TRACE" | "DEBUG" | "DBG" | "VERBOSE" => Severity::Debug,
            "INFO" | "INFORMATION" | "NOTICE" => Severity::Info,
            "WARN" | "WARNING" => Severity::Warn,
            "ERROR" | "ERR" | "SEVERE" => Severity::Error,
            "FATAL" | "CRIT" | "CRITICAL" | "PANIC" | "EMERG" | "EMERGENCY" | "ALERT" => {
                Severity::Fatal
            }
            _ => return None,
        };
        Some(sev)
    }

    /// pino/bunyan numeric levels: 10 trace .. 60 fatal.
    pub fn from_numeric_level(level: i64) -> Option<Severity> {
        let sev = match level {
            0..=29 => Severity::Debug,
            30..=39 => Severity::Info,
            40..=49 => Severity::Warn,
            50..=59 => Severity::Error,
            60..=99 => Severity::Fatal,
            _ => return None,
        };
        Some(sev)
    }

    /// Severity part (low three bits) of a syslog PRI value.
    pub fn from_syslog_priority(pri: u8) -> Severity {
        match pri % 8 {
            0..=2 => Severity::Fatal,
            3 => Severity::Error,
            4 => Severity::Warn,
            5 | 6 => Severity::Info,
            _ => Severity::Debug,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::from_token(s).ok_or_else(|| format!("unknown severity: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogFormat {
    Syslog,
    Json,
    FreeText,
}

/// A normalized log line. Built once by the parser and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub received_at: DateTime<Utc>,
    /// Event time parsed from the line, else `received_at`.
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub severity: Severity,
    pub format: LogFormat,
    /// Message body with timestamp/level/prefix stripped; input to templating.
    pub message: String,
    pub raw: String,
    pub fields: BTreeMap<String, String>,
}
