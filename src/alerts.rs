use crate::config::AlertConfig;
use crate::patterns::TemplateId;
use crate::record::Severity;
use crate::summarize::{IncidentSummary, SummaryId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub seq: u64,
    pub raised_at: DateTime<Utc>,
    pub summary_id: SummaryId,
    pub severity: Severity,
    pub headline: String,
    pub template_ids: Vec<TemplateId>,
}

struct HubState {
    next_seq: u64,
    history: VecDeque<Alert>,
    subscribers: Vec<Sender<Alert>>,
}

/// Raises alerts for severe summaries and delivers them by push
/// (channel subscribers) and by poll (sequence cursor over a bounded history).
pub struct AlertHub {
    cfg: AlertConfig,
    state: Mutex<HubState>,
}

fn headline(summary: &IncidentSummary) -> String {
    let first = summary.text.lines().next().unwrap_or_default().trim();
    let mut out: String = first.chars().take(160).collect();
    if out.len() < first.len() {
        out.push_str("...");
    }
    out
}

impl AlertHub {
    pub fn new(cfg: AlertConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(HubState { next_seq: 1, history: VecDeque::new(), subscribers: Vec::new() }),
        }
    }

    /// Returns the alert if `summary` met the severity threshold.
    pub fn raise(&self, summary: &IncidentSummary) -> Option<Alert> {
        if summary.severity < self.cfg.min_severity {
            debug!(summary = %summary.id, severity = %summary.severity, "summary below alert threshold");
            return None;
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let alert = Alert {
            seq: st.next_seq,
            raised_at: Utc::now(),
            summary_id: summary.id,
            severity: summary.severity,
            headline: headline(summary),
            template_ids: summary.template_ids.clone(),
        };
        st.next_seq += 1;
        st.history.push_back(alert.clone());
        while st.history.len() > self.cfg.history.max(1) {
            st.history.pop_front();
        }
        st.subscribers.retain(|tx| tx.send(alert.clone()).is_ok());
        info!(seq = alert.seq, summary = %alert.summary_id, severity = %alert.severity, "alert raised");
        Some(alert)
    }

    /// Push delivery: every alert raised after this call.
    pub fn subscribe(&self) -> Receiver<Alert> {
        let (tx, rx) = mpsc::channel();
        self.state.lock().unwrap_or_else(PoisonError::into_inner).subscribers.push(tx);
        rx
    }

    /// Poll delivery: retained alerts with `seq > after`, oldest first.
    pub fn poll(&self, after: u64) -> Vec<Alert> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.history.iter().filter(|a| a.seq > after).cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).next_seq - 1
    }
}
