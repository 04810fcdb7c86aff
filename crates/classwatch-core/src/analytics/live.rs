//! Rolling live metrics.
//!
//! Updated in O(1) per event so every ingest can broadcast a fresh
//! snapshot without rescanning the session's event log.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::event::DetectionEvent;
use crate::session::EventCounters;

/// Metrics pushed by the analysis engine alongside (or instead of) events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerMetrics {
    #[serde(default, alias = "current_student_count", alias = "person_count")]
    pub student_count: u32,
    /// Mean attention score on a 0-100 scale.
    #[serde(default, alias = "average_attention")]
    pub avg_attention: Option<f64>,
    #[serde(default, alias = "phone_count")]
    pub phone_usage: Option<u32>,
    #[serde(default, alias = "distraction_count")]
    pub distractions: Option<u32>,
}

/// The snapshot carried by every `live_metrics` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetrics {
    pub total_events: u64,
    pub attention_count: u64,
    pub attention_high_count: u64,
    pub phone_count: u64,
    pub posture_count: u64,
    pub presence_count: u64,
    pub identity_count: u64,
    pub distraction_count: u64,
    pub distinct_subjects: usize,
    pub attention_ratio: Option<f64>,
    pub student_count: u32,
    pub peak_students: u32,
    pub average_attention: Option<f64>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

/// Incremental aggregate for one running session.
#[derive(Debug, Clone, Default)]
pub struct LiveAggregator {
    counters: EventCounters,
    subjects: HashSet<String>,
    student_count: Option<u32>,
    peak_students: u32,
    average_attention: Option<f64>,
}

impl LiveAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted log, e.g. after a restart.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a DetectionEvent>) -> Self {
        let mut aggregator = Self::new();
        for event in events {
            aggregator.record(event);
        }
        aggregator
    }

    /// Carry over a peak already persisted on the session record.
    pub fn with_peak(mut self, peak_students: u32) -> Self {
        self.peak_students = self.peak_students.max(peak_students);
        self
    }

    pub fn record(&mut self, event: &DetectionEvent) {
        self.counters.record(event.kind);
        if let Some(key) = event.subject_key() {
            self.subjects.insert(key);
        }
    }

    pub fn apply_producer(&mut self, metrics: &ProducerMetrics) {
        self.student_count = Some(metrics.student_count);
        self.peak_students = self.peak_students.max(metrics.student_count);
        if metrics.avg_attention.is_some() {
            self.average_attention = metrics.avg_attention;
        }
    }

    pub fn counters(&self) -> EventCounters {
        self.counters
    }

    pub fn peak_students(&self) -> u32 {
        self.peak_students
    }

    pub fn distinct_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn snapshot(&self) -> LiveMetrics {
        let c = &self.counters;
        LiveMetrics {
            total_events: c.total,
            attention_count: c.attention,
            attention_high_count: c.attention_high,
            phone_count: c.phone,
            posture_count: c.posture,
            presence_count: c.presence,
            identity_count: c.identity,
            distraction_count: c.distraction,
            distinct_subjects: self.subjects.len(),
            attention_ratio: c.attention_ratio(),
            student_count: self
                .student_count
                .unwrap_or(self.subjects.len() as u32),
            peak_students: self.peak_students,
            average_attention: self.average_attention,
            degraded: false,
            degraded_reason: None,
        }
    }

    /// Locally synthesized snapshot for when the engine could not be reached.
    pub fn degraded_snapshot(&self, reason: impl Into<String>) -> LiveMetrics {
        LiveMetrics {
            degraded: true,
            degraded_reason: Some(reason.into()),
            ..self.snapshot()
        }
    }
}
