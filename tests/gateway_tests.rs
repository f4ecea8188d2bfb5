use chrono::{Duration, TimeZone, Utc};
use logcraft::ai::{CompletionClient, CompletionError, DisabledClient};
use logcraft::anomaly::{AnomalyDetector, AnomalyKind};
use logcraft::config::Config;
use logcraft::gateway::{Gateway, Health, Pipeline, PipelineError};
use logcraft::parser::ParseError;
use logcraft::patterns::PatternIndex;
use logcraft::query::{EventFilter, TimeRange};
use logcraft::record::Severity;
use logcraft::summarize::Narrative;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.ingest.workers = 2;
    cfg.summarizer.coalesce_window_ms = 50;
    cfg.summarizer.timeout_ms = 200;
    cfg.summarizer.retry_backoff_ms = 5;
    cfg.summarizer.poll_interval_ms = 5;
    cfg
}

fn gateway_with(cfg: Config, client: Arc<dyn CompletionClient>) -> Gateway {
    let pipeline = Pipeline::from_config(&cfg).unwrap();
    Gateway::with_parts(cfg, pipeline, client).unwrap()
}

fn stamped(secs: i64, rest: &str) -> String {
    let at = Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap() + Duration::seconds(secs);
    format!("{} {}", at.format("%Y-%m-%dT%H:%M:%SZ"), rest)
}

struct Echo;

impl CompletionClient for Echo {
    fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, CompletionError> {
        Ok("Orders database is timing out.".into())
    }
}

#[test]
fn same_shape_errors_share_a_template_and_warn_does_not_escalate() {
    let gw = gateway_with(test_config(), Arc::new(DisabledClient));
    let a = gw.ingest(&stamped(0, "ERROR db timeout id=41"), Some("orders")).unwrap();
    let b = gw.ingest(&stamped(1, "ERROR db timeout id=42"), Some("orders")).unwrap();
    assert_eq!(a.template_id, b.template_id);
    assert_eq!(gw.template(a.template_id).unwrap().count, 2);
    assert_eq!(a.event.as_ref().map(|e| e.kind), Some(AnomalyKind::NewTemplate));
    assert!(b.event.is_none());

    let c = gw.ingest(&stamped(2, "WARN db timeout id=43"), Some("orders")).unwrap();
    assert!(c.event.is_none());
    let escalations = EventFilter { kind: Some(AnomalyKind::SeverityEscalation), ..EventFilter::default() };
    assert!(gw.query_events(TimeRange::all(), &escalations).is_empty());
}

#[test]
fn rejected_lines_are_reported_not_fatal() {
    let gw = gateway_with(test_config(), Arc::new(DisabledClient));
    assert_eq!(gw.ingest("   ", None).unwrap_err(), ParseError::Empty);
    let lines: Vec<String> = vec!["INFO boot ok".into(), "".into(), "INFO boot ok".into()];
    let report = gw.ingest_batch(&lines, Some("init"));
    assert_eq!(report.accepted, 2);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].line, 1);
    assert_eq!(gw.stats().parse_errors, 2);
    assert_eq!(gw.health(), Health::Ok);
}

#[test]
fn batch_events_keep_input_order_and_resolve_templates() {
    let mut cfg = test_config();
    cfg.index.max_templates = 4;
    let gw = gateway_with(cfg, Arc::new(DisabledClient));
    let words = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf"];
    let lines: Vec<String> = words.iter().enumerate().map(|(i, w)| stamped(i as i64, &format!("INFO job {w} done"))).collect();
    let report = gw.ingest_batch(&lines, None);
    assert_eq!(report.events.len(), words.len());
    let ids: Vec<u64> = report.events.iter().map(|e| e.template_id.0).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert_eq!(gw.stats().evictions, 3);
    // the most recent templates are still live
    for ev in &report.events[3..] {
        assert!(gw.template(ev.template_id).is_some());
    }
    assert!(gw.template(report.events[0].template_id).is_none());
}

#[test]
fn summaries_cover_all_events_and_raise_alerts() {
    let gw = gateway_with(test_config(), Arc::new(Echo));
    let alerts = gw.subscribe();
    let lines: Vec<String> = (0..5).map(|i| stamped(i, &format!("ERROR service{} unreachable", ["a", "b", "c", "d", "e"][i as usize]))).collect();
    let report = gw.ingest_batch(&lines, Some("edge"));
    assert_eq!(report.events.len(), 5);
    gw.flush();

    let summaries = gw.query_summaries(TimeRange::all());
    assert!(!summaries.is_empty());
    let covered: Vec<_> = summaries.iter().flat_map(|s| s.event_ids.clone()).collect();
    let distinct: BTreeSet<_> = covered.iter().copied().collect();
    assert_eq!(covered.len(), 5);
    assert_eq!(distinct.len(), 5);
    assert!(summaries.iter().all(|s| s.narrative == Narrative::Ai && s.severity == Severity::Error));

    let pushed = alerts.recv_timeout(StdDuration::from_secs(2)).unwrap();
    assert_eq!(pushed.seq, 1);
    assert_eq!(gw.poll_alerts(0).len(), summaries.len());
    assert!(gw.poll_alerts(summaries.len() as u64).is_empty());
}

#[test]
fn fallback_summary_when_provider_missing() {
    let gw = gateway_with(test_config(), Arc::new(DisabledClient));
    gw.ingest(&stamped(0, "FATAL disk controller reset"), None).unwrap();
    gw.flush();
    let summaries = gw.query_summaries(TimeRange::all());
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].narrative, Narrative::Fallback);
    assert!(summaries[0].text.starts_with("1 anomalies detected for templates: T1"));
    assert!(summaries[0].text.contains("disk controller reset"));
    assert_eq!(gw.stats().fallback_summaries, 1);
}

#[test]
fn events_query_is_time_ordered() {
    let gw = gateway_with(test_config(), Arc::new(DisabledClient));
    gw.ingest(&stamped(30, "INFO third shape"), None).unwrap();
    gw.ingest(&stamped(10, "INFO first shape"), None).unwrap();
    gw.ingest(&stamped(20, "INFO second shape"), None).unwrap();
    let events = gw.query_events(TimeRange::all(), &EventFilter::default());
    let times: Vec<_> = events.iter().map(|e| e.detected_at).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    assert_eq!(events.len(), 3);
}

#[test]
fn templates_listing_is_limited_and_by_count() {
    let gw = gateway_with(test_config(), Arc::new(DisabledClient));
    for i in 0..3 {
        gw.ingest(&format!("INFO heartbeat seq={i}"), None).unwrap();
    }
    gw.ingest("INFO rare thing", None).unwrap();
    let top = gw.templates(Some(1));
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].count, 3);
    assert_eq!(gw.templates(None).len(), 2);
}

#[test]
fn snapshot_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config();
    cfg.index.snapshot_path = Some(dir.path().join("templates.json"));

    let first = Gateway::new(cfg.clone()).unwrap();
    let id = first.ingest("INFO cache warmed in 120ms", None).unwrap().template_id;
    first.shutdown().unwrap();
    first.shutdown().unwrap();
    drop(first);

    let second = Gateway::new(cfg).unwrap();
    let ack = second.ingest("INFO cache warmed in 90ms", None).unwrap();
    assert_eq!(ack.template_id, id);
    assert!(!ack.created);
    assert_eq!(second.template(id).unwrap().count, 2);
}

#[test]
fn failed_snapshot_write_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let mut cfg = test_config();
    cfg.index.snapshot_path = Some(blocker.join("templates.json"));

    let pipeline = Pipeline::new(PatternIndex::with_capacity(16), AnomalyDetector::new(cfg.detector.clone()));
    let gw = Gateway::with_parts(cfg, pipeline, Arc::new(DisabledClient)).unwrap();
    gw.ingest("INFO something", None).unwrap();
    assert!(matches!(gw.shutdown(), Err(PipelineError::Fatal { .. })));
    assert!(matches!(gw.health(), Health::Unrecoverable { .. }));
    assert!(matches!(gw.shutdown(), Err(PipelineError::Fatal { .. })));
}

#[test]
fn corrupt_snapshot_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("templates.json");
    std::fs::write(&path, "[[[").unwrap();
    let mut cfg = test_config();
    cfg.index.snapshot_path = Some(path);
    assert!(matches!(Gateway::new(cfg), Err(PipelineError::Storage(_))));
}

#[test]
fn out_of_range_coalesce_window_refuses_to_start() {
    let mut cfg = test_config();
    cfg.summarizer.coalesce_window_ms = u64::MAX;
    assert!(matches!(Gateway::new(cfg), Err(PipelineError::Config(_))));
}
