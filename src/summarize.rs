use crate::ai::{self, CompletionClient, PendingCompletion};
use crate::anomaly::{AnomalyEvent, AnomalyKind, EventId};
use crate::config::{SummarizerConfig, MAX_WINDOW_SECS};
use crate::patterns::TemplateId;
use crate::queue::EventQueue;
use crate::record::Severity;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SummaryId(pub u64);

impl fmt::Display for SummaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Narrative {
    Ai,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub id: SummaryId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub event_ids: Vec<EventId>,
    pub template_ids: Vec<TemplateId>,
    pub text: String,
    pub severity: Severity,
    pub narrative: Narrative,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateContext {
    pub id: TemplateId,
    /// `None` once the template has been evicted.
    pub pattern: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextLine {
    pub at: DateTime<Utc>,
    pub template_id: TemplateId,
    pub text: String,
}

/// What the summarizer may show the model besides the events themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryContext {
    pub templates: Vec<TemplateContext>,
    /// Oldest first.
    pub recent_lines: Vec<ContextLine>,
}

impl SummaryContext {
    fn pattern_of(&self, id: TemplateId) -> Option<&str> {
        self.templates.iter().find(|t| t.id == id).and_then(|t| t.pattern.as_deref())
    }
}

pub trait ContextSource: Send + Sync {
    fn context_for(&self, templates: &[TemplateId]) -> SummaryContext;
}

pub trait SummarySink: Send + Sync {
    fn publish(&self, summary: IncidentSummary);
}

/// Per-template rollup of a batch, in first-seen order.
struct TemplateDigest {
    id: TemplateId,
    events: usize,
    kinds: BTreeSet<&'static str>,
    peak: f64,
    severity: Severity,
}

fn digest(events: &[AnomalyEvent]) -> Vec<TemplateDigest> {
    let mut out: Vec<TemplateDigest> = Vec::new();
    for ev in events {
        match out.iter_mut().find(|d| d.id == ev.template_id) {
            Some(d) => {
                d.events += 1;
                d.kinds.insert(ev.kind.as_str());
                d.peak = d.peak.max(ev.magnitude);
                d.severity = d.severity.max(ev.severity);
            }
            None => out.push(TemplateDigest {
                id: ev.template_id,
                events: 1,
                kinds: BTreeSet::from([ev.kind.as_str()]),
                peak: ev.magnitude,
                severity: ev.severity,
            }),
        }
    }
    out
}

/// Merges events sharing an id, keeping the first occurrence.
pub fn dedup_events(events: &[AnomalyEvent]) -> Vec<AnomalyEvent> {
    events.iter().unique_by(|e| e.id).cloned().collect()
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}

/// Renders the prompt for a batch, dropping the oldest context lines first
/// and hard-truncating if the fixed part alone is over budget.
pub fn build_prompt(events: &[AnomalyEvent], context: &SummaryContext, max_chars: usize) -> String {
    let mut head = String::from(
        "You are an on-call assistant. Summarize the incident described by these log anomalies \
         in a short paragraph: what is failing, since when, and the likely impact.\n\nAnomalies by template:\n",
    );
    for d in digest(events) {
        let pattern = context.pattern_of(d.id).unwrap_or("<evicted>");
        head.push_str(&format!(
            "- {} {}: {} event(s), kinds {}, peak magnitude {:.2}, max severity {}\n",
            d.id,
            pattern,
            d.events,
            d.kinds.iter().join("/"),
            d.peak,
            d.severity
        ));
    }

    if head.chars().count() >= max_chars {
        truncate_chars(&mut head, max_chars);
        return head;
    }

    let header = "\nRecent log lines:\n";
    let mut budget = max_chars - head.chars().count();
    let mut kept = Vec::new();
    if budget > header.len() && !context.recent_lines.is_empty() {
        budget -= header.len();
        for line in context.recent_lines.iter().rev() {
            let rendered = format!("{} {}\n", line.at.to_rfc3339(), line.text);
            let cost = rendered.chars().count();
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(rendered);
        }
    }
    if !kept.is_empty() {
        head.push_str(header);
        for line in kept.into_iter().rev() {
            head.push_str(&line);
        }
    }
    head
}

/// Templated narrative used whenever the model cannot be reached.
pub fn fallback_text(events: &[AnomalyEvent], context: &SummaryContext) -> String {
    let digests = digest(events);
    let mut text = format!(
        "{} anomalies detected for templates: {}",
        events.len(),
        digests.iter().map(|d| d.id.to_string()).join(", ")
    );
    for d in &digests {
        let pattern = context.pattern_of(d.id).unwrap_or("<evicted>");
        text.push_str(&format!(
            "\n- {} \"{}\": {} event(s) [{}], peak magnitude {:.2}, severity {}",
            d.id,
            pattern,
            d.events,
            d.kinds.iter().join(", "),
            d.peak,
            d.severity
        ));
    }
    text
}

/// Turns event batches into incident summaries via the completion client.
pub struct Summarizer {
    client: Arc<dyn CompletionClient>,
    cfg: SummarizerConfig,
    next_id: AtomicU64,
    ai_summaries: AtomicU64,
    fallbacks: AtomicU64,
}

impl Summarizer {
    pub fn new(client: Arc<dyn CompletionClient>, cfg: SummarizerConfig) -> Self {
        Self {
            client,
            cfg,
            next_id: AtomicU64::new(1),
            ai_summaries: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.cfg
    }

    /// Blocking: one call, one retry after the backoff, then the fallback.
    pub fn summarize(&self, events: &[AnomalyEvent], context: &SummaryContext) -> IncidentSummary {
        let start = events.iter().map(|e| e.detected_at).min().unwrap_or_else(Utc::now);
        let end = events.iter().map(|e| e.detected_at).max().unwrap_or(start);
        let mut call = Call::start(self, events.to_vec(), context.clone(), (start, end));
        loop {
            if let Some(summary) = call.step(self, self.cfg.poll_interval()) {
                return summary;
            }
        }
    }

    fn finish(
        &self,
        events: &[AnomalyEvent],
        window: (DateTime<Utc>, DateTime<Utc>),
        text: String,
        narrative: Narrative,
    ) -> IncidentSummary {
        match narrative {
            Narrative::Ai => self.ai_summaries.fetch_add(1, Ordering::Relaxed),
            Narrative::Fallback => self.fallbacks.fetch_add(1, Ordering::Relaxed),
        };
        IncidentSummary {
            id: SummaryId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            window_start: window.0,
            window_end: window.1,
            event_ids: events.iter().map(|e| e.id).collect(),
            template_ids: events.iter().map(|e| e.template_id).unique().collect(),
            text,
            severity: events.iter().map(|e| e.severity).max().unwrap_or(Severity::Info),
            narrative,
            created_at: Utc::now(),
        }
    }

    pub fn ai_summaries(&self) -> u64 {
        self.ai_summaries.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

/// One in-progress summary: at most two attempts, then the fallback.
struct Call {
    events: Vec<AnomalyEvent>,
    context: SummaryContext,
    window: (DateTime<Utc>, DateTime<Utc>),
    prompt: String,
    attempts: u32,
    pending: Option<PendingCompletion>,
    retry_at: Option<Instant>,
}

impl Call {
    fn start(
        s: &Summarizer,
        events: Vec<AnomalyEvent>,
        context: SummaryContext,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Self {
        let events = dedup_events(&events);
        let prompt = build_prompt(&events, &context, s.cfg.max_prompt_chars);
        let mut call = Call { events, context, window, prompt, attempts: 0, pending: None, retry_at: None };
        call.issue(s);
        call
    }

    fn issue(&mut self, s: &Summarizer) {
        self.attempts += 1;
        self.retry_at = None;
        debug!(attempt = self.attempts, client = s.client.name(), events = self.events.len(), "issuing summary request");
        self.pending = Some(PendingCompletion::spawn(
            Arc::clone(&s.client),
            self.prompt.clone(),
            s.cfg.max_tokens,
            s.cfg.timeout(),
        ));
    }

    fn step(&mut self, s: &Summarizer, slice: Duration) -> Option<IncidentSummary> {
        if let Some(at) = self.retry_at {
            let now = Instant::now();
            if now < at {
                thread::sleep(slice.min(at - now));
                return None;
            }
            self.issue(s);
        }
        let pending = self.pending.as_ref()?;
        match pending.poll(slice)? {
            Ok(text) => Some(s.finish(&self.events, self.window, text, Narrative::Ai)),
            Err(err) if self.attempts < 2 => {
                warn!(error = %err, "summary request failed, retrying once");
                self.pending = None;
                self.retry_at = Some(ai::deadline_after(s.cfg.retry_backoff()));
                None
            }
            Err(err) => {
                warn!(error = %err, events = self.events.len(), "summary request failed, using fallback narrative");
                let text = fallback_text(&self.events, &self.context);
                Some(s.finish(&self.events, self.window, text, Narrative::Fallback))
            }
        }
    }
}

/// A closed group of events sharing a coalescing window.
#[derive(Debug, Clone)]
pub struct Batch {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub events: Vec<AnomalyEvent>,
    supersessions: u32,
}

impl Batch {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.window_start && t < self.window_end
    }

    fn template_ids(&self) -> Vec<TemplateId> {
        self.events.iter().map(|e| e.template_id).unique().collect()
    }
}

/// Groups events by detection time into `[first, first + window)`.
///
/// The open batch closes when an event outside its window arrives, when
/// the same span of wall-clock time has passed since it opened, or on flush.
pub struct Coalescer {
    window: chrono::Duration,
    wall: Duration,
    open: Option<(Batch, Instant)>,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        let max_ms = MAX_WINDOW_SECS * 1000;
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(max_ms).clamp(1, max_ms);
        Self { window: chrono::Duration::milliseconds(window_ms), wall: window, open: None }
    }

    /// Adds `event`; returns the previous batch if the event closed it.
    pub fn offer(&mut self, event: AnomalyEvent) -> Option<Batch> {
        if let Some((batch, _)) = self.open.as_mut() {
            if batch.contains(event.detected_at) {
                batch.events.push(event);
                return None;
            }
        }
        let start = event.detected_at;
        let batch = Batch {
            window_start: start,
            window_end: start.checked_add_signed(self.window).unwrap_or(DateTime::<Utc>::MAX_UTC),
            events: vec![event],
            supersessions: 0,
        };
        self.open.replace((batch, Instant::now())).map(|(b, _)| b)
    }

    pub fn due(&mut self, now: Instant) -> Option<Batch> {
        let expired = self.open.as_ref().is_some_and(|(_, opened)| now.duration_since(*opened) >= self.wall);
        if expired {
            self.flush()
        } else {
            None
        }
    }

    pub fn flush(&mut self) -> Option<Batch> {
        self.open.take().map(|(b, _)| b)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_none()
    }
}

#[derive(Default)]
struct FlushState {
    requested: u64,
    completed: u64,
}

struct Control {
    state: Mutex<FlushState>,
    done: Condvar,
    superseded: AtomicU64,
    batches: AtomicU64,
}

/// Owns the summarization worker thread.
pub struct Coordinator {
    queue: Arc<EventQueue>,
    summarizer: Arc<Summarizer>,
    control: Arc<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn spawn(
        summarizer: Summarizer,
        queue: Arc<EventQueue>,
        context: Arc<dyn ContextSource>,
        sink: Arc<dyn SummarySink>,
    ) -> io::Result<Self> {
        let summarizer = Arc::new(summarizer);
        let control = Arc::new(Control {
            state: Mutex::new(FlushState::default()),
            done: Condvar::new(),
            superseded: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        });
        let worker = Worker {
            coalescer: Coalescer::new(summarizer.cfg.coalesce_window()),
            summarizer: Arc::clone(&summarizer),
            queue: Arc::clone(&queue),
            control: Arc::clone(&control),
            context,
            sink,
            ready: VecDeque::new(),
            inflight: None,
        };
        let handle = thread::Builder::new()
            .name("logcraft-summarizer".into())
            .spawn(move || worker.run())?;
        Ok(Self { queue, summarizer, control, handle: Mutex::new(Some(handle)) })
    }

    /// Closes the open batch and waits until every queued event is summarized.
    pub fn flush(&self) {
        let mut st = self.control.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.requested += 1;
        let target = st.requested;
        drop(st);
        self.queue.wake();
        let mut st = self.control.state.lock().unwrap_or_else(PoisonError::into_inner);
        while st.completed < target {
            if !self.is_running() {
                warn!("summarization worker is not running; flush abandoned");
                return;
            }
            st = self
                .control
                .done
                .wait_timeout(st, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Closes the queue, lets the worker finish everything queued and joins it.
    pub fn shutdown(&self) {
        self.queue.close();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("summarization worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn superseded(&self) -> u64 {
        self.control.superseded.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.control.batches.load(Ordering::Relaxed)
    }

    pub fn summarizer(&self) -> &Summarizer {
        &self.summarizer
    }
}

struct InFlight {
    batch: Batch,
    call: Call,
}

struct Worker {
    summarizer: Arc<Summarizer>,
    queue: Arc<EventQueue>,
    control: Arc<Control>,
    context: Arc<dyn ContextSource>,
    sink: Arc<dyn SummarySink>,
    coalescer: Coalescer,
    ready: VecDeque<Batch>,
    inflight: Option<InFlight>,
}

impl Worker {
    fn run(mut self) {
        info!("summarization worker started");
        let slice = self.summarizer.cfg.poll_interval();
        loop {
            let requested = self.control.state.lock().unwrap_or_else(PoisonError::into_inner).requested;
            let closing = self.queue.is_closed();
            let flushing = closing || requested > self.completed();

            let wait = if self.inflight.is_some() || flushing { Duration::ZERO } else { slice };
            if let Some(ev) = self.queue.pop_timeout(wait) {
                self.accept(ev);
            }
            if flushing {
                for ev in self.queue.drain() {
                    self.accept(ev);
                }
                if let Some(b) = self.coalescer.flush() {
                    self.ready.push_back(b);
                }
            } else if let Some(b) = self.coalescer.due(Instant::now()) {
                self.ready.push_back(b);
            }

            if self.inflight.is_none() {
                if let Some(batch) = self.ready.pop_front() {
                    self.begin(batch);
                }
            }
            if let Some(inflight) = self.inflight.as_mut() {
                if let Some(summary) = inflight.call.step(&self.summarizer, slice) {
                    debug!(summary = %summary.id, events = summary.event_ids.len(), "summary ready");
                    self.inflight = None;
                    self.sink.publish(summary);
                }
            }

            let idle = self.inflight.is_none()
                && self.ready.is_empty()
                && self.coalescer.is_empty()
                && self.queue.is_empty();
            if flushing && idle {
                self.complete(requested);
                if closing {
                    break;
                }
            }
        }
        info!(batches = self.control.batches.load(Ordering::Relaxed), "summarization worker stopped");
    }

    fn completed(&self) -> u64 {
        self.control.state.lock().unwrap_or_else(PoisonError::into_inner).completed
    }

    fn complete(&self, requested: u64) {
        let mut st = self.control.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.completed = st.completed.max(requested);
        self.control.done.notify_all();
    }

    fn accept(&mut self, ev: AnomalyEvent) {
        let max = self.summarizer.cfg.max_supersede;
        let supersede = self
            .inflight
            .as_ref()
            .is_some_and(|f| f.batch.contains(ev.detected_at) && f.batch.supersessions < max);
        if supersede {
            if let Some(InFlight { mut batch, call }) = self.inflight.take() {
                // dropping the call abandons its pending completion
                drop(call);
                batch.events.push(ev);
                batch.supersessions += 1;
                let total = self.control.superseded.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    window_start = %batch.window_start,
                    events = batch.events.len(),
                    superseded_total = total,
                    "in-flight summary superseded by late event"
                );
                self.begin(batch);
            }
            return;
        }
        if let Some(closed) = self.coalescer.offer(ev) {
            self.ready.push_back(closed);
        }
    }

    fn begin(&mut self, batch: Batch) {
        if batch.supersessions == 0 {
            self.control.batches.fetch_add(1, Ordering::Relaxed);
        }
        let context = self.context.context_for(&batch.template_ids());
        let call = Call::start(
            &self.summarizer,
            batch.events.clone(),
            context,
            (batch.window_start, batch.window_end),
        );
        self.inflight = Some(InFlight { batch, call });
    }
}

/// Collects published summaries in memory.
#[derive(Default)]
pub struct MemorySink {
    summaries: Mutex<Vec<IncidentSummary>>,
}

impl MemorySink {
    pub fn summaries(&self) -> Vec<IncidentSummary> {
        self.summaries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SummarySink for MemorySink {
    fn publish(&self, summary: IncidentSummary) {
        self.summaries.lock().unwrap_or_else(PoisonError::into_inner).push(summary);
    }
}

/// Context source with no index behind it: patterns unknown, no lines.
pub struct NoContext;

impl ContextSource for NoContext {
    fn context_for(&self, templates: &[TemplateId]) -> SummaryContext {
        SummaryContext {
            templates: templates
                .iter()
                .map(|id| TemplateContext { id: *id, pattern: None, count: 0 })
                .collect(),
            recent_lines: Vec::new(),
        }
    }
}

/// Event counts by kind, used in reports.
pub fn kind_counts(events: &[AnomalyEvent]) -> BTreeMap<AnomalyKind, usize> {
    events.iter().map(|e| e.kind).counts().into_iter().collect()
}
