use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use logcraft::ai::{CompletionClient, CompletionError};
use logcraft::anomaly::{AnomalyEvent, AnomalyKind, EventId};
use logcraft::config::SummarizerConfig;
use logcraft::patterns::TemplateId;
use logcraft::queue::EventQueue;
use logcraft::record::Severity;
use logcraft::summarize::{
    Coordinator, MemorySink, Narrative, NoContext, Summarizer, SummaryContext, TemplateContext,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Replays scripted outcomes, one per call; the last one repeats.
struct Scripted {
    outcomes: Vec<(Duration, Result<String, CompletionError>)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(outcomes: Vec<(Duration, Result<String, CompletionError>)>) -> Arc<Self> {
        Arc::new(Self { outcomes, calls: AtomicUsize::new(0), prompts: Mutex::new(Vec::new()) })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompletionClient for Scripted {
    fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, CompletionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let (delay, result) = self.outcomes[n.min(self.outcomes.len() - 1)].clone();
        thread::sleep(delay);
        result
    }
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

fn event(id: u64, template: u64, offset_ms: i64, severity: Severity) -> AnomalyEvent {
    AnomalyEvent {
        id: EventId(id),
        template_id: TemplateId(template),
        detected_at: base() + ChronoDuration::milliseconds(offset_ms),
        kind: if id % 2 == 0 { AnomalyKind::RateSpike } else { AnomalyKind::NewTemplate },
        magnitude: 4.5,
        record_count: 12,
        severity,
        source: "api".into(),
    }
}

fn fast_cfg() -> SummarizerConfig {
    SummarizerConfig {
        coalesce_window_ms: 50,
        timeout_ms: 100,
        retry_backoff_ms: 10,
        poll_interval_ms: 5,
        ..SummarizerConfig::default()
    }
}

fn context() -> SummaryContext {
    SummaryContext {
        templates: vec![
            TemplateContext { id: TemplateId(1), pattern: Some("db timeout id=<*>".into()), count: 40 },
            TemplateContext { id: TemplateId(2), pattern: None, count: 0 },
        ],
        recent_lines: vec![],
    }
}

#[test]
fn timeouts_fall_back_to_templated_narrative() {
    let client = Scripted::new(vec![(Duration::from_millis(400), Ok("too late".into()))]);
    let s = Summarizer::new(client.clone(), fast_cfg());
    let events = vec![event(1, 1, 0, Severity::Error), event(2, 2, 10, Severity::Warn)];
    let summary = s.summarize(&events, &context());

    assert_eq!(summary.narrative, Narrative::Fallback);
    assert!(summary.text.starts_with("2 anomalies detected for templates: T1, T2"));
    assert!(summary.text.contains("db timeout id=<*>"));
    assert!(summary.text.contains("<evicted>"));
    assert_eq!(summary.severity, Severity::Error);
    assert_eq!(client.calls(), 2);
    assert_eq!(s.fallbacks(), 1);
}

#[test]
fn retries_once_then_uses_model_text() {
    let client = Scripted::new(vec![
        (Duration::ZERO, Err(CompletionError::Transport("connection reset".into()))),
        (Duration::ZERO, Ok("Database timeouts on the orders service.".into())),
    ]);
    let s = Summarizer::new(client.clone(), fast_cfg());
    let summary = s.summarize(&[event(1, 1, 0, Severity::Error)], &context());
    assert_eq!(summary.narrative, Narrative::Ai);
    assert_eq!(summary.text, "Database timeouts on the orders service.");
    assert_eq!(client.calls(), 2);
}

#[test]
fn empty_model_output_counts_as_failure() {
    let client = Scripted::new(vec![(Duration::ZERO, Ok("   ".into()))]);
    let s = Summarizer::new(client.clone(), fast_cfg());
    let summary = s.summarize(&[event(1, 1, 0, Severity::Info)], &context());
    assert_eq!(summary.narrative, Narrative::Fallback);
    assert_eq!(client.calls(), 2);
}

#[test]
fn duplicate_event_ids_are_merged() {
    let client = Scripted::new(vec![(Duration::ZERO, Ok("ok".into()))]);
    let s = Summarizer::new(client.clone(), fast_cfg());
    let e = event(7, 1, 0, Severity::Error);
    let summary = s.summarize(&[e.clone(), e.clone(), event(8, 1, 5, Severity::Error)], &context());
    assert_eq!(summary.event_ids, vec![EventId(7), EventId(8)]);
    assert_eq!(summary.template_ids, vec![TemplateId(1)]);
    let prompts = client.prompts.lock().unwrap();
    assert_eq!(prompts[0].matches("T1 db timeout").count(), 1);
}

#[test]
fn coordinator_summarizes_every_event_exactly_once() {
    let client = Scripted::new(vec![(Duration::ZERO, Ok("incident".into()))]);
    let queue = Arc::new(EventQueue::new(64));
    let sink = Arc::new(MemorySink::default());
    let coord = Coordinator::spawn(
        Summarizer::new(client, fast_cfg()),
        Arc::clone(&queue),
        Arc::new(NoContext),
        sink.clone(),
    )
    .unwrap();

    // three detection windows, 50ms apart
    let mut pushed = BTreeSet::new();
    for id in 1..=9u64 {
        let offset = (id as i64 - 1) / 3 * 100;
        queue.push(event(id, id % 2 + 1, offset, Severity::Error));
        pushed.insert(EventId(id));
    }
    coord.flush();
    coord.shutdown();

    let summaries = sink.summaries();
    let seen: Vec<EventId> = summaries.iter().flat_map(|s| s.event_ids.clone()).collect();
    let distinct: BTreeSet<EventId> = seen.iter().copied().collect();
    assert_eq!(seen.len(), distinct.len());
    assert_eq!(distinct, pushed);
    assert!(summaries.len() >= 3);
}

#[test]
fn late_event_supersedes_in_flight_call() {
    let client = Scripted::new(vec![
        (Duration::from_millis(400), Ok("stale".into())),
        (Duration::ZERO, Ok("fresh".into())),
    ]);
    let cfg = SummarizerConfig { timeout_ms: 2_000, ..fast_cfg() };
    let queue = Arc::new(EventQueue::new(64));
    let sink = Arc::new(MemorySink::default());
    let coord = Coordinator::spawn(
        Summarizer::new(client.clone(), cfg),
        Arc::clone(&queue),
        Arc::new(NoContext),
        sink.clone(),
    )
    .unwrap();

    queue.push(event(1, 1, 0, Severity::Error));
    // the batch closes by wall clock after 50ms and the slow call starts
    thread::sleep(Duration::from_millis(200));
    queue.push(event(2, 1, 10, Severity::Fatal));
    coord.flush();
    coord.shutdown();

    let summaries = sink.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].event_ids, vec![EventId(1), EventId(2)]);
    assert_eq!(summaries[0].text, "fresh");
    assert_eq!(summaries[0].severity, Severity::Fatal);
    assert_eq!(coord.superseded(), 1);
}
