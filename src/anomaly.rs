use crate::config::DetectorConfig;
use crate::patterns::TemplateId;
use crate::record::{LogRecord, Severity};
use crate::temporal::{buckets_in, SlidingWindow};
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    RateSpike,
    NewTemplate,
    SeverityEscalation,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::RateSpike => "RATE_SPIKE",
            AnomalyKind::NewTemplate => "NEW_TEMPLATE",
            AnomalyKind::SeverityEscalation => "SEVERITY_ESCALATION",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "RATE_SPIKE" => Ok(AnomalyKind::RateSpike),
            "NEW_TEMPLATE" => Ok(AnomalyKind::NewTemplate),
            "SEVERITY_ESCALATION" => Ok(AnomalyKind::SeverityEscalation),
            other => Err(format!("unknown anomaly kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: EventId,
    /// Lookup key only; the template may be evicted later.
    pub template_id: TemplateId,
    pub detected_at: DateTime<Utc>,
    pub kind: AnomalyKind,
    pub magnitude: f64,
    pub record_count: u64,
    /// Severity of the record that tripped the detector.
    pub severity: Severity,
    pub source: String,
}

/// Per-template window figures as of one observed record.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub at: DateTime<Utc>,
    pub short_count: u64,
    /// Average occurrences per short window over the baseline horizon;
    /// `None` until the template has history older than the short window.
    pub baseline_rate: Option<f64>,
    pub created: bool,
    pub severity: Severity,
    pub dominant_prior: Option<Severity>,
    pub escalated: bool,
    pub source: String,
}

struct TemplateState {
    window: SlidingWindow,
    first_bucket: i64,
    new_reported: bool,
    severity_counts: [u64; 5],
    last_emitted: [Option<i64>; 3],
}

impl TemplateState {
    fn dominant(&self) -> Option<Severity> {
        Severity::ALL
            .iter()
            .copied()
            .filter(|s| self.severity_counts[s.rank() as usize] > 0)
            .max_by_key(|s| self.severity_counts[s.rank() as usize])
    }

    fn quiet_history(&self) -> bool {
        let low: u64 = self.severity_counts[..=Severity::Warn.rank() as usize].iter().sum();
        let high: u64 = self.severity_counts[Severity::Error.rank() as usize..].iter().sum();
        low > high
    }
}

/// Ratio of the short-window count to the baseline rate. The baseline is
/// floored so a silent history cannot divide by zero; the score never
/// decreases as `short_count` grows.
pub fn spike_score(short_count: u64, baseline_rate: f64, floor: f64) -> f64 {
    short_count as f64 / baseline_rate.max(floor).max(f64::EPSILON)
}

/// Sliding-window anomaly detector, one state entry per template.
pub struct AnomalyDetector {
    cfg: DetectorConfig,
    short_buckets: i64,
    horizon_buckets: i64,
    state: AHashMap<TemplateId, TemplateState>,
    next_event: u64,
}

impl AnomalyDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        let short_buckets = buckets_in(cfg.short_window(), cfg.bucket_secs);
        let horizon_buckets = buckets_in(cfg.baseline_window(), cfg.bucket_secs).max(short_buckets);
        Self { cfg, short_buckets, horizon_buckets, state: AHashMap::new(), next_event: 1 }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    /// Records one occurrence and returns the window figures for it.
    pub fn observe(&mut self, id: TemplateId, record: &LogRecord, created: bool) -> WindowStats {
        let bucket = Duration::seconds(self.cfg.bucket_secs);
        let horizon = self.cfg.baseline_window();
        let st = self.state.entry(id).or_insert_with(|| {
            let window = SlidingWindow::new(bucket, horizon);
            let first_bucket = window.bucket_of(record.timestamp);
            TemplateState {
                window,
                first_bucket,
                new_reported: false,
                severity_counts: [0; 5],
                last_emitted: [None; 3],
            }
        });

        let dominant_prior = st.dominant();
        let escalated = record.severity.is_escalated() && st.quiet_history();
        st.severity_counts[record.severity.rank() as usize] += 1;
        st.window.record(record.timestamp);

        let b = st.window.bucket_of(record.timestamp);
        st.first_bucket = st.first_bucket.min(b);
        let short_count = st.window.count_trailing(b, self.short_buckets);
        let short_start = b - self.short_buckets + 1;
        let history_start = st.first_bucket.max(b - self.horizon_buckets + 1);
        let span = short_start - history_start;
        let baseline_rate = (span > 0).then(|| {
            let count = st.window.count_between(history_start, short_start);
            count as f64 * self.short_buckets as f64 / span as f64
        });

        WindowStats {
            at: record.timestamp,
            short_count,
            baseline_rate,
            created,
            severity: record.severity,
            dominant_prior,
            escalated,
            source: record.source.clone(),
        }
    }

    /// Scores one observation. At most one event per call; new templates
    /// win over escalations, which win over rate spikes.
    pub fn evaluate(&mut self, id: TemplateId, stats: &WindowStats) -> Option<AnomalyEvent> {
        let short_buckets = self.short_buckets;
        let st = self.state.get_mut(&id)?;
        let b = st.window.bucket_of(stats.at);
        let armed = |st: &TemplateState, kind: AnomalyKind| {
            st.last_emitted[kind.slot()].map_or(true, |last| b - last >= short_buckets)
        };

        let hit = if stats.created && !st.new_reported {
            st.new_reported = true;
            Some((AnomalyKind::NewTemplate, 1.0))
        } else if stats.escalated && armed(&*st, AnomalyKind::SeverityEscalation) {
            let from = stats.dominant_prior.unwrap_or(Severity::Info);
            let gap = stats.severity.rank().saturating_sub(from.rank()).max(1);
            Some((AnomalyKind::SeverityEscalation, f64::from(gap)))
        } else {
            stats.baseline_rate.and_then(|baseline| {
                let score = spike_score(stats.short_count, baseline, self.cfg.min_baseline_rate);
                let spiking = score > self.cfg.spike_multiplier
                    && stats.short_count >= self.cfg.min_spike_count
                    && armed(&*st, AnomalyKind::RateSpike);
                spiking.then_some((AnomalyKind::RateSpike, score))
            })
        };

        let (kind, magnitude) = hit?;
        st.last_emitted[kind.slot()] = Some(b);
        let event = AnomalyEvent {
            id: EventId(self.next_event),
            template_id: id,
            detected_at: stats.at,
            kind,
            magnitude,
            record_count: stats.short_count,
            severity: stats.severity,
            source: stats.source.clone(),
        };
        self.next_event += 1;
        Some(event)
    }

    /// Drops window state for an evicted template.
    pub fn forget(&mut self, id: TemplateId) {
        self.state.remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.state.len()
    }
}
