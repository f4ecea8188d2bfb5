use crate::anomaly::{AnomalyEvent, AnomalyKind, EventId};
use crate::patterns::TemplateId;
use crate::record::{LogRecord, Severity};
use crate::summarize::{ContextLine, IncidentSummary, SummaryId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self { start: DateTime::<Utc>::MIN_UTC, end: DateTime::<Utc>::MAX_UTC }
    }

    /// Open-ended bounds default to the widest range.
    pub fn from_bounds(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        let all = Self::all();
        Self { start: start.unwrap_or(all.start), end: end.unwrap_or(all.end) }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub kind: Option<AnomalyKind>,
    pub template: Option<TemplateId>,
    pub min_magnitude: Option<f64>,
    pub min_severity: Option<Severity>,
}

impl EventFilter {
    pub fn matches(&self, ev: &AnomalyEvent) -> bool {
        self.kind.map_or(true, |k| ev.kind == k)
            && self.template.map_or(true, |t| ev.template_id == t)
            && self.min_magnitude.map_or(true, |m| ev.magnitude >= m)
            && self.min_severity.map_or(true, |s| ev.severity >= s)
    }
}

/// Anomaly events ordered by detection time, pruned past `retention`.
pub struct EventStore {
    events: BTreeMap<(DateTime<Utc>, EventId), AnomalyEvent>,
    retention: Duration,
}

impl EventStore {
    pub fn new(retention: Duration) -> Self {
        Self { events: BTreeMap::new(), retention }
    }

    pub fn insert(&mut self, event: AnomalyEvent) {
        self.events.insert((event.detected_at, event.id), event);
        if let Some((&(latest, _), _)) = self.events.last_key_value() {
            let cutoff = latest - self.retention;
            while let Some((&(at, _), _)) = self.events.first_key_value() {
                if at >= cutoff {
                    break;
                }
                self.events.pop_first();
            }
        }
    }

    pub fn query(&self, range: TimeRange, filter: &EventFilter) -> Vec<AnomalyEvent> {
        if range.is_empty() {
            return Vec::new();
        }
        self.events
            .range((range.start, EventId(0))..)
            .take_while(|((at, _), _)| *at < range.end)
            .map(|(_, ev)| ev)
            .filter(|ev| filter.matches(ev))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Incident summaries ordered by window start, capped at `max` entries.
pub struct SummaryStore {
    summaries: BTreeMap<(DateTime<Utc>, SummaryId), IncidentSummary>,
    max: usize,
}

impl SummaryStore {
    pub fn new(max: usize) -> Self {
        Self { summaries: BTreeMap::new(), max: max.max(1) }
    }

    pub fn insert(&mut self, summary: IncidentSummary) {
        self.summaries.insert((summary.window_start, summary.id), summary);
        while self.summaries.len() > self.max {
            self.summaries.pop_first();
        }
    }

    /// Summaries whose window starts inside `range`.
    pub fn query(&self, range: TimeRange) -> Vec<IncidentSummary> {
        if range.is_empty() {
            return Vec::new();
        }
        self.summaries
            .range((range.start, SummaryId(0))..)
            .take_while(|((at, _), _)| *at < range.end)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

/// Bounded buffer of recent raw lines kept as summarization context.
pub struct RecentLines {
    lines: VecDeque<ContextLine>,
    retention: Duration,
    max_lines: usize,
}

impl RecentLines {
    pub fn new(retention: Duration, max_lines: usize) -> Self {
        Self { lines: VecDeque::new(), retention, max_lines }
    }

    pub fn push(&mut self, template_id: TemplateId, record: &LogRecord) {
        if self.max_lines == 0 {
            return;
        }
        self.lines.push_back(ContextLine {
            at: record.timestamp,
            template_id,
            text: record.raw.clone(),
        });
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        let cutoff = record.timestamp - self.retention;
        while self.lines.front().is_some_and(|l| l.at < cutoff) {
            self.lines.pop_front();
        }
    }

    /// Lines for `templates`, oldest first.
    pub fn for_templates(&self, templates: &[TemplateId]) -> Vec<ContextLine> {
        self.lines
            .iter()
            .filter(|l| templates.contains(&l.template_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
