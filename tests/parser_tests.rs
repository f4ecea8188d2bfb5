use chrono::{Datelike, TimeZone, Utc};
use logcraft::parser::{parse, parse_bytes, parse_with, ParseError, ParseMode};
use logcraft::record::{LogFormat, Severity};

fn received() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[test]
fn parses_rfc3164_syslog() {
    let line = "<34>Oct 11 22:14:15 mymachine su[230]: 'su root' failed for lonvick on /dev/pts/8";
    let rec = parse_with(line, None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.format, LogFormat::Syslog);
    assert_eq!(rec.severity, Severity::Fatal);
    assert_eq!(rec.source, "su");
    assert_eq!(rec.fields.get("host").map(String::as_str), Some("mymachine"));
    assert_eq!(rec.fields.get("pid").map(String::as_str), Some("230"));
    assert_eq!(rec.timestamp.year(), 2024);
    assert_eq!(rec.message, "'su root' failed for lonvick on /dev/pts/8");
}

#[test]
fn parses_rfc5424_syslog() {
    let line = r#"<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog - ID47 [exampleSDID@32473 iut="3" eventSource="Application"] An application event log entry"#;
    let rec = parse_with(line, None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.format, LogFormat::Syslog);
    assert_eq!(rec.severity, Severity::Info);
    assert_eq!(rec.source, "evntslog");
    assert_eq!(rec.timestamp, Utc.with_ymd_and_hms(2003, 10, 11, 22, 14, 15).unwrap() + chrono::Duration::milliseconds(3));
    assert_eq!(rec.fields.get("iut").map(String::as_str), Some("3"));
    assert_eq!(rec.message, "An application event log entry");
}

#[test]
fn parses_json_with_numeric_level_and_epoch_millis() {
    let line = r#"{"ts":1700000000123,"level":50,"msg":"upstream failed","service":"api","req":{"id":"abc"}}"#;
    let rec = parse_with(line, None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.format, LogFormat::Json);
    assert_eq!(rec.severity, Severity::Error);
    assert_eq!(rec.source, "api");
    assert_eq!(rec.message, "upstream failed");
    assert_eq!(rec.timestamp.timestamp_millis(), 1_700_000_000_123);
    assert_eq!(rec.fields.get("req.id").map(String::as_str), Some("abc"));
}

#[test]
fn json_without_message_gets_synthetic_body() {
    let line = r#"{"time":"2024-01-01T00:00:00Z","level":"warn","user":"bob","action":"login"}"#;
    let rec = parse_with(line, None, ParseMode::JsonLines, received()).unwrap();
    assert_eq!(rec.severity, Severity::Warn);
    assert_eq!(rec.message, "action=login user=bob");
    assert_eq!(rec.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
}

#[test]
fn parses_free_text_with_level_and_fields() {
    let line = "2024-01-01 12:00:00,123 [ERROR] payment failed order=42 amount=9.99";
    let rec = parse_with(line, None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.format, LogFormat::FreeText);
    assert_eq!(rec.severity, Severity::Error);
    assert_eq!(rec.message, "payment failed order=42 amount=9.99");
    assert_eq!(rec.fields.get("order").map(String::as_str), Some("42"));
    assert_eq!(rec.timestamp.timestamp_subsec_millis(), 123);
}

#[test]
fn best_effort_defaults() {
    let rec = parse_with("something happened", None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.severity, Severity::Info);
    assert_eq!(rec.timestamp, received());
    assert_eq!(rec.source, "unknown");
}

#[test]
fn source_hint_wins_over_parsed_source() {
    let line = r#"{"msg":"hello","service":"api"}"#;
    let rec = parse_with(line, Some("edge-proxy"), ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.source, "edge-proxy");
}

#[test]
fn plain_text_mode_does_not_decode_json() {
    let line = r#"{"msg":"hello","level":"error"}"#;
    let rec = parse_with(line, None, ParseMode::PlainText, received()).unwrap();
    assert_eq!(rec.format, LogFormat::FreeText);
}

#[test]
fn malformed_json_falls_back_to_free_text() {
    let rec = parse(r#"{"msg": "unterminated"#, None).unwrap();
    assert_eq!(rec.format, LogFormat::FreeText);
}

#[test]
fn rejects_empty_and_unreadable_input() {
    assert_eq!(parse("   ", None).unwrap_err(), ParseError::Empty);
    let garbage = "\u{1}\u{2}\u{3}\u{4}ab";
    assert!(matches!(parse(garbage, None), Err(ParseError::Unreadable { .. })));
    let bytes = [0xff, 0xfe, 0xfd, 0xfc, b'a'];
    assert_eq!(
        parse_bytes(&bytes, None, ParseMode::Auto, received()).unwrap_err(),
        ParseError::InvalidEncoding
    );
}

#[test]
fn parse_is_deterministic_for_fixed_received_time() {
    let line = "WARN disk usage at 91% on /var";
    let a = parse_with(line, Some("node-1"), ParseMode::Auto, received()).unwrap();
    let b = parse_with(line, Some("node-1"), ParseMode::Auto, received()).unwrap();
    assert_eq!(a.message, b.message);
    assert_eq!(a.timestamp, b.timestamp);
    assert_eq!(a.severity, Severity::Warn);
}

#[test]
fn non_ascii_digits_do_not_form_timestamps() {
    let line = "job done at 2024-01-01T00:00:00.\u{0661}\u{0661}\u{0661} ok";
    let rec = parse_with(line, None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.format, LogFormat::FreeText);
    assert_eq!(rec.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

    let arabic = "batch \u{0662}\u{0660}\u{0662}\u{0664}-\u{0660}\u{0661}-\u{0660}\u{0661} finished";
    let rec = parse_with(arabic, None, ParseMode::Auto, received()).unwrap();
    assert_eq!(rec.timestamp, received());
}
