use crate::ai::{self, CompletionClient};
use crate::alerts::{Alert, AlertHub};
use crate::anomaly::{AnomalyDetector, AnomalyEvent};
use crate::config::{Config, ConfigError};
use crate::parser::{self, ParseError};
use crate::patterns::{Assignment, PatternIndex, StorageError, Template, TemplateId};
use crate::query::{EventFilter, EventStore, RecentLines, SummaryStore, TimeRange};
use crate::queue::EventQueue;
use crate::record::{LogRecord, Severity};
use crate::summarize::{
    ContextSource, Coordinator, IncidentSummary, Summarizer, SummaryContext, SummarySink, TemplateContext,
};
use chrono::{Duration, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is unrecoverable: {reason}")]
    Fatal { reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to start worker: {0}")]
    Worker(#[from] std::io::Error),
    #[error("failed to build parser pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    Ok,
    Unrecoverable { reason: String },
}

/// Template index and detector, updated together by a single writer.
pub struct Pipeline {
    pub index: PatternIndex,
    pub detector: AnomalyDetector,
}

/// Outcome of pushing one record through the pipeline.
#[derive(Debug, Clone)]
pub struct Processed {
    pub assignment: Assignment,
    pub event: Option<AnomalyEvent>,
}

impl Pipeline {
    pub fn new(index: PatternIndex, detector: AnomalyDetector) -> Self {
        Self { index, detector }
    }

    /// Builds a pipeline from config, restoring the template snapshot if one is configured.
    pub fn from_config(cfg: &Config) -> Result<Self, StorageError> {
        let capacity = NonZeroUsize::new(cfg.index.max_templates).unwrap_or(NonZeroUsize::MIN);
        let index = match &cfg.index.snapshot_path {
            Some(path) => {
                let index = PatternIndex::load(path, capacity)?;
                info!(path = %path.display(), templates = index.len(), "restored template snapshot");
                index
            }
            None => PatternIndex::new(capacity),
        };
        Ok(Self::new(index, AnomalyDetector::new(cfg.detector.clone())))
    }

    pub fn process(&mut self, record: &LogRecord) -> Processed {
        let assignment = self.index.assign(record);
        if let Some(evicted) = &assignment.evicted {
            self.detector.forget(evicted.id);
        }
        let stats = self.detector.observe(assignment.id, record, assignment.created);
        let event = self.detector.evaluate(assignment.id, &stats);
        Processed { assignment, event }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub template_id: TemplateId,
    pub created: bool,
    pub severity: Severity,
    pub event: Option<AnomalyEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedLine {
    /// Zero-based position in the submitted batch.
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedLine>,
    pub events: Vec<AnomalyEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub records: u64,
    pub parse_errors: u64,
    pub templates: usize,
    pub evictions: u64,
    pub events: u64,
    pub events_dropped: u64,
    pub queued: usize,
    pub summaries: usize,
    pub ai_summaries: u64,
    pub fallback_summaries: u64,
    pub superseded: u64,
    pub alerts: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    pipeline: Mutex<Pipeline>,
    recent: Mutex<RecentLines>,
    events: Mutex<EventStore>,
    summaries: Mutex<SummaryStore>,
    alerts: AlertHub,
    health: Mutex<Health>,
    records: AtomicU64,
    parse_errors: AtomicU64,
    emitted: AtomicU64,
}

impl ContextSource for Shared {
    fn context_for(&self, templates: &[TemplateId]) -> SummaryContext {
        let templates: Vec<TemplateContext> = {
            let pipeline = lock(&self.pipeline);
            templates
                .iter()
                .map(|&id| {
                    let t = pipeline.index.get(id);
                    TemplateContext { id, pattern: t.map(|t| t.pattern.clone()), count: t.map_or(0, |t| t.count) }
                })
                .collect()
        };
        let ids: Vec<TemplateId> = templates.iter().map(|t| t.id).collect();
        let recent_lines = lock(&self.recent).for_templates(&ids);
        SummaryContext { templates, recent_lines }
    }
}

impl SummarySink for Shared {
    fn publish(&self, summary: IncidentSummary) {
        self.alerts.raise(&summary);
        lock(&self.summaries).insert(summary);
    }
}

/// Ingest, query and alert operations over one pipeline instance.
///
/// Ingestion never waits on summarization: detected events go to a bounded
/// queue drained by the coordinator thread.
pub struct Gateway {
    cfg: Config,
    shared: Arc<Shared>,
    queue: Arc<EventQueue>,
    coordinator: Coordinator,
    pool: rayon::ThreadPool,
    stopped: AtomicBool,
}

impl Gateway {
    /// Builds the pipeline and completion client described by `cfg`.
    pub fn new(cfg: Config) -> Result<Self, PipelineError> {
        cfg.validate()?;
        let pipeline = Pipeline::from_config(&cfg)?;
        let client = ai::client_from_config(cfg.provider.as_ref(), cfg.summarizer.timeout());
        Self::with_parts(cfg, pipeline, client)
    }

    pub fn with_parts(
        cfg: Config,
        pipeline: Pipeline,
        client: Arc<dyn CompletionClient>,
    ) -> Result<Self, PipelineError> {
        let ingest = &cfg.ingest;
        let shared = Arc::new(Shared {
            pipeline: Mutex::new(pipeline),
            recent: Mutex::new(RecentLines::new(
                Duration::seconds(ingest.record_retention_secs),
                ingest.max_context_lines,
            )),
            events: Mutex::new(EventStore::new(Duration::seconds(ingest.event_retention_secs))),
            summaries: Mutex::new(SummaryStore::new(ingest.max_summaries)),
            alerts: AlertHub::new(cfg.alerts.clone()),
            health: Mutex::new(Health::Ok),
            records: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ingest.worker_threads())
            .thread_name(|i| format!("logcraft-parse-{i}"))
            .build()?;
        let queue = Arc::new(EventQueue::new(ingest.queue_capacity));
        let coordinator = Coordinator::spawn(
            Summarizer::new(client, cfg.summarizer.clone()),
            Arc::clone(&queue),
            Arc::clone(&shared) as Arc<dyn ContextSource>,
            Arc::clone(&shared) as Arc<dyn SummarySink>,
        )?;
        info!(workers = pool.current_num_threads(), queue_capacity = ingest.queue_capacity, "gateway started");
        Ok(Self { cfg, shared, queue, coordinator, pool, stopped: AtomicBool::new(false) })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn ingest(&self, raw: &str, source: Option<&str>) -> Result<Ack, ParseError> {
        match parser::parse_with(raw, source, self.cfg.ingest.mode, Utc::now()) {
            Ok(record) => Ok(self.ingest_record(&record)),
            Err(err) => {
                self.shared.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "rejected line");
                Err(err)
            }
        }
    }

    /// Runs an already parsed record through the pipeline.
    pub fn ingest_record(&self, record: &LogRecord) -> Ack {
        let processed = lock(&self.shared.pipeline).process(record);
        self.after_process(record, &processed);
        Ack {
            template_id: processed.assignment.id,
            created: processed.assignment.created,
            severity: record.severity,
            event: processed.event,
        }
    }

    /// Parses `lines` in parallel, then applies them in order.
    pub fn ingest_batch(&self, lines: &[String], source: Option<&str>) -> BatchReport {
        let mode = self.cfg.ingest.mode;
        let received_at = Utc::now();
        let parsed: Vec<Result<LogRecord, ParseError>> = self.pool.install(|| {
            lines
                .par_iter()
                .map(|line| parser::parse_with(line, source, mode, received_at))
                .collect()
        });

        let mut report = BatchReport::default();
        let mut records = Vec::with_capacity(parsed.len());
        for (i, result) in parsed.into_iter().enumerate() {
            match result {
                Ok(record) => records.push(record),
                Err(err) => {
                    self.shared.parse_errors.fetch_add(1, Ordering::Relaxed);
                    report.rejected.push(RejectedLine { line: i, error: err.to_string() });
                }
            }
        }

        let processed: Vec<Processed> = {
            let mut pipeline = lock(&self.shared.pipeline);
            records.iter().map(|r| pipeline.process(r)).collect()
        };
        for (record, p) in records.iter().zip(&processed) {
            self.after_process(record, p);
        }
        report.accepted = records.len();
        report.events = processed.into_iter().filter_map(|p| p.event).collect();
        debug!(accepted = report.accepted, rejected = report.rejected.len(), events = report.events.len(), "batch ingested");
        report
    }

    fn after_process(&self, record: &LogRecord, processed: &Processed) {
        self.shared.records.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.recent).push(processed.assignment.id, record);
        if let Some(event) = &processed.event {
            self.shared.emitted.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, kind = %event.kind, template = %event.template_id, "anomaly detected");
            lock(&self.shared.events).insert(event.clone());
            self.queue.push(event.clone());
        }
    }

    /// Events detected in `range`, oldest first.
    pub fn query_events(&self, range: TimeRange, filter: &EventFilter) -> Vec<AnomalyEvent> {
        lock(&self.shared.events).query(range, filter)
    }

    /// Summaries whose window starts in `range`, oldest first.
    pub fn query_summaries(&self, range: TimeRange) -> Vec<IncidentSummary> {
        lock(&self.shared.summaries).query(range)
    }

    /// Live templates, most frequent first.
    pub fn templates(&self, limit: Option<usize>) -> Vec<Template> {
        let pipeline = lock(&self.shared.pipeline);
        let all = pipeline.index.templates();
        all.into_iter().take(limit.unwrap_or(usize::MAX)).cloned().collect()
    }

    pub fn template(&self, id: TemplateId) -> Option<Template> {
        lock(&self.shared.pipeline).index.get(id).cloned()
    }

    pub fn subscribe(&self) -> Receiver<Alert> {
        self.shared.alerts.subscribe()
    }

    pub fn poll_alerts(&self, after: u64) -> Vec<Alert> {
        self.shared.alerts.poll(after)
    }

    pub fn health(&self) -> Health {
        let health = lock(&self.shared.health).clone();
        if health == Health::Ok && !self.stopped.load(Ordering::Acquire) && !self.coordinator.is_running() {
            return Health::Unrecoverable { reason: "summarization worker stopped".into() };
        }
        health
    }

    pub fn stats(&self) -> GatewayStats {
        let (templates, evictions) = {
            let pipeline = lock(&self.shared.pipeline);
            (pipeline.index.len(), pipeline.index.evictions())
        };
        let summarizer = self.coordinator.summarizer();
        GatewayStats {
            records: self.shared.records.load(Ordering::Relaxed),
            parse_errors: self.shared.parse_errors.load(Ordering::Relaxed),
            templates,
            evictions,
            events: self.shared.emitted.load(Ordering::Relaxed),
            events_dropped: self.queue.dropped(),
            queued: self.queue.len(),
            summaries: lock(&self.shared.summaries).len(),
            ai_summaries: summarizer.ai_summaries(),
            fallback_summaries: summarizer.fallbacks(),
            superseded: self.coordinator.superseded(),
            alerts: self.shared.alerts.last_seq(),
        }
    }

    /// Summarizes everything queued so far, closing the open batch early.
    pub fn flush(&self) {
        self.coordinator.flush();
    }

    /// Drains the summarization queue, stops the worker and persists the
    /// template snapshot. Safe to call more than once.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return match self.health() {
                Health::Ok => Ok(()),
                Health::Unrecoverable { reason } => Err(PipelineError::Fatal { reason }),
            };
        }
        self.coordinator.shutdown();
        if let Some(path) = &self.cfg.index.snapshot_path {
            self.persist(path)?;
        }
        info!(records = self.shared.records.load(Ordering::Relaxed), "gateway stopped");
        Ok(())
    }

    fn persist(&self, path: &Path) -> Result<(), PipelineError> {
        let saved = lock(&self.shared.pipeline).index.save(path);
        if let Err(err) = saved {
            let reason = err.to_string();
            error!(error = %reason, "failed to persist template snapshot");
            *lock(&self.shared.health) = Health::Unrecoverable { reason: reason.clone() };
            return Err(PipelineError::Fatal { reason });
        }
        info!(path = %path.display(), "template snapshot saved");
        Ok(())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        // errors are already logged and reflected in health
        let _ = self.shutdown();
    }
}
