//! Final session analytics.
//!
//! Timeline, per-subject and per-category views computed from the full
//! event log. All functions here are pure over the event slice, so callers
//! may cache their output by (session, event count).

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::event::{DetectionEvent, EventCategory};
use crate::session::{EventCounters, Session, ratio};

/// Default timeline bucket width (60s).
pub const DEFAULT_TIMELINE_INTERVAL_MS: i64 = 60_000;

/// Widest bucket a caller may ask for (one day).
pub const MAX_TIMELINE_INTERVAL_MS: i64 = 86_400_000;

/// Upper bound on buckets per timeline. Wider spans get wider buckets.
pub const MAX_TIMELINE_BUCKETS: i64 = 100_000;

// ============================================================================
// TIMELINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineBucket {
    pub index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: u64,
    pub attention_events: u64,
    pub high_attention_events: u64,
    /// `None` when the bucket has no attention-category events.
    pub attention_ratio: Option<f64>,
    pub distraction_count: u64,
}

/// Bucket width actually used for a span of `span_ms`: the requested width
/// clamped to [1, MAX_TIMELINE_INTERVAL_MS], then widened until the span
/// fits in MAX_TIMELINE_BUCKETS buckets.
pub fn effective_interval_ms(span_ms: i64, interval_ms: i64) -> i64 {
    let width = interval_ms.clamp(1, MAX_TIMELINE_INTERVAL_MS);
    let span_ms = span_ms.max(0);
    if span_ms / width < MAX_TIMELINE_BUCKETS {
        width
    } else {
        span_ms / (MAX_TIMELINE_BUCKETS - 1) + 1
    }
}

/// Partition events into contiguous fixed-width buckets spanning the first
/// to the last event timestamp. Empty buckets inside the span are kept.
pub fn timeline(events: &[DetectionEvent], interval_ms: i64) -> Vec<TimelineBucket> {
    let (Some(first), Some(last)) = (
        events.iter().map(|e| e.timestamp).min(),
        events.iter().map(|e| e.timestamp).max(),
    ) else {
        return Vec::new();
    };

    let span_ms = (last - first).num_milliseconds();
    let width = effective_interval_ms(span_ms, interval_ms);
    let bucket_count = span_ms / width + 1;
    let mut buckets: Vec<TimelineBucket> = (0..bucket_count)
        .map_while(|index| {
            let start = TimeDelta::try_milliseconds(width.checked_mul(index)?)
                .and_then(|offset| first.checked_add_signed(offset))?;
            let end = TimeDelta::try_milliseconds(width).and_then(|w| start.checked_add_signed(w))?;
            Some(TimelineBucket {
                index: index as usize,
                start,
                end,
                total: 0,
                attention_events: 0,
                high_attention_events: 0,
                attention_ratio: None,
                distraction_count: 0,
            })
        })
        .collect();

    for event in events {
        let index = ((event.timestamp - first).num_milliseconds() / width) as usize;
        let Some(bucket) = buckets.get_mut(index) else {
            continue;
        };
        bucket.total += 1;
        if event.category() == EventCategory::Attention {
            bucket.attention_events += 1;
        }
        if event.kind.is_high_attention() {
            bucket.high_attention_events += 1;
        }
        if event.kind.is_distraction() {
            bucket.distraction_count += 1;
        }
    }

    for bucket in &mut buckets {
        bucket.attention_ratio = ratio(bucket.high_attention_events, bucket.attention_events);
    }
    buckets
}

// ============================================================================
// CATEGORY BREAKDOWN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    pub category: EventCategory,
    pub count: u64,
    pub average_confidence: f64,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

/// One row per category present in the log, in taxonomy order.
pub fn category_breakdown(events: &[DetectionEvent]) -> Vec<CategoryBreakdown> {
    let mut rows: BTreeMap<EventCategory, (u64, f64, DateTime<Utc>, DateTime<Utc>)> =
        BTreeMap::new();

    for event in events {
        let entry = rows
            .entry(event.category())
            .or_insert((0, 0.0, event.timestamp, event.timestamp));
        entry.0 += 1;
        entry.1 += event.confidence;
        entry.2 = entry.2.min(event.timestamp);
        entry.3 = entry.3.max(event.timestamp);
    }

    rows.into_iter()
        .map(|(category, (count, confidence_sum, first_at, last_at))| CategoryBreakdown {
            category,
            count,
            average_confidence: confidence_sum / count as f64,
            first_at,
            last_at,
        })
        .collect()
}

// ============================================================================
// SUBJECT METRICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMetric {
    pub subject_key: String,
    pub track_id: Option<i64>,
    pub student_id: Option<String>,
    pub name: Option<String>,
    pub event_count: u64,
    pub attention_events: u64,
    pub attention_ratio: Option<f64>,
    pub phone_count: u64,
    pub posture_count: u64,
    pub distraction_count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub presence_seconds: f64,
    /// Mean attention score reported by the engine, when it reported one.
    pub average_attention: Option<f64>,
}

impl SubjectMetric {
    fn empty(subject_key: String) -> Self {
        Self {
            subject_key,
            track_id: None,
            student_id: None,
            name: None,
            event_count: 0,
            attention_events: 0,
            attention_ratio: None,
            phone_count: 0,
            posture_count: 0,
            distraction_count: 0,
            first_seen: None,
            last_seen: None,
            presence_seconds: 0.0,
            average_attention: None,
        }
    }
}

/// Group events by subject key. Class-level events without a subject are skipped.
pub fn subject_metrics(events: &[DetectionEvent]) -> Vec<SubjectMetric> {
    let mut groups: BTreeMap<String, (SubjectMetric, EventCounters)> = BTreeMap::new();

    for event in events {
        let Some(key) = event.subject_key() else {
            continue;
        };
        let (metric, counters) = groups
            .entry(key.clone())
            .or_insert_with(|| (SubjectMetric::empty(key), EventCounters::default()));

        counters.record(event.kind);
        metric.track_id = metric.track_id.or(event.subject.track_id);
        if metric.student_id.is_none() {
            metric.student_id = event.subject.student_id.clone();
        }
        if metric.name.is_none() {
            metric.name = event.subject.display_name();
        }
        metric.first_seen = Some(
            metric
                .first_seen
                .map_or(event.timestamp, |t| t.min(event.timestamp)),
        );
        metric.last_seen = Some(
            metric
                .last_seen
                .map_or(event.timestamp, |t| t.max(event.timestamp)),
        );
    }

    groups
        .into_values()
        .map(|(mut metric, counters)| {
            metric.event_count = counters.total;
            metric.attention_events = counters.attention;
            metric.attention_ratio = counters.attention_ratio();
            metric.phone_count = counters.phone;
            metric.posture_count = counters.posture;
            metric.distraction_count = counters.distraction;
            metric.presence_seconds = presence_seconds(metric.first_seen, metric.last_seen);
            metric
        })
        .collect()
}

fn presence_seconds(first: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) -> f64 {
    match (first, last) {
        (Some(first), Some(last)) => ((last - first).num_milliseconds().max(0) as f64) / 1000.0,
        _ => 0.0,
    }
}

// ============================================================================
// EXTERNAL ANALYTICS
// ============================================================================

/// Analytics returned by the engine when a session is stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalAnalytics {
    pub attention: Option<ExternalAttention>,
    pub peak_student_count: Option<u32>,
    pub average_student_count: Option<f64>,
    pub student_metrics: Vec<ExternalSubjectMetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalAttention {
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalSubjectMetric {
    pub track_id: Option<i64>,
    pub student_id: Option<String>,
    pub name: Option<String>,
    pub average_attention: Option<f64>,
    pub distraction_count: Option<u64>,
    pub phone_usage_count: Option<u64>,
    #[serde(deserialize_with = "lenient_datetime")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient_datetime")]
    pub last_seen: Option<DateTime<Utc>>,
    pub total_time_present: Option<f64>,
}

impl ExternalSubjectMetric {
    fn key(&self) -> Option<String> {
        crate::event::SubjectRef {
            track_id: self.track_id,
            student_id: self.student_id.clone(),
            student_name: None,
        }
        .key()
    }
}

/// Accepts RFC 3339 as well as the engine's zone-less ISO timestamps (read as UTC).
fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}

// ============================================================================
// FINAL REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_events: u64,
    pub attention_ratio: Option<f64>,
    pub phone_count: u64,
    pub posture_count: u64,
    pub distraction_count: u64,
    pub distinct_subjects: usize,
    pub duration_seconds: i64,
    pub peak_students: u32,
    pub average_attention: Option<f64>,
    pub average_student_count: Option<f64>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    pub session_id: String,
    pub generated_at: DateTime<Utc>,
    pub interval_ms: i64,
    pub summary: ReportSummary,
    pub timeline: Vec<TimelineBucket>,
    pub subjects: Vec<SubjectMetric>,
    pub categories: Vec<CategoryBreakdown>,
    pub engine_merged: bool,
}

impl FinalReport {
    /// Compute the full report from the session's event log.
    pub fn build(
        session: &Session,
        events: &[DetectionEvent],
        interval_ms: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut counters = EventCounters::default();
        for event in events {
            counters.record(event.kind);
        }
        let subjects = subject_metrics(events);
        let presence_peak = subjects.len() as u32;

        let summary = ReportSummary {
            total_events: counters.total,
            attention_ratio: counters.attention_ratio(),
            phone_count: counters.phone,
            posture_count: counters.posture,
            distraction_count: counters.distraction,
            distinct_subjects: subjects.len(),
            duration_seconds: session.duration_seconds,
            peak_students: session.peak_students.max(presence_peak),
            average_attention: None,
            average_student_count: None,
            first_event_at: events.iter().map(|e| e.timestamp).min(),
            last_event_at: events.iter().map(|e| e.timestamp).max(),
        };

        let span_ms = match (summary.first_event_at, summary.last_event_at) {
            (Some(first), Some(last)) => (last - first).num_milliseconds(),
            _ => 0,
        };

        Self {
            session_id: session.id.clone(),
            generated_at: now,
            interval_ms: effective_interval_ms(span_ms, interval_ms),
            summary,
            timeline: timeline(events, interval_ms),
            subjects,
            categories: category_breakdown(events),
            engine_merged: false,
        }
    }

    /// Overlay engine analytics. Non-null external values win field by field;
    /// locally computed values only fill the gaps.
    pub fn merge_external(&mut self, external: &ExternalAnalytics) {
        let summary = &mut self.summary;
        if let Some(average) = external.attention.as_ref().and_then(|a| a.average) {
            summary.average_attention = Some(average);
        }
        if let Some(peak) = external.peak_student_count {
            summary.peak_students = peak;
        }
        if let Some(average) = external.average_student_count {
            summary.average_student_count = Some(average);
        }

        for ext in &external.student_metrics {
            let Some(key) = ext.key() else {
                continue;
            };
            let index = match self.subjects.iter().position(|s| s.subject_key == key) {
                Some(index) => index,
                None => {
                    self.subjects.push(SubjectMetric::empty(key));
                    self.subjects.len() - 1
                }
            };
            let local = &mut self.subjects[index];

            local.track_id = ext.track_id.or(local.track_id);
            if ext.student_id.is_some() {
                local.student_id = ext.student_id.clone();
            }
            if ext.name.is_some() {
                local.name = ext.name.clone();
            }
            if ext.average_attention.is_some() {
                local.average_attention = ext.average_attention;
            }
            if let Some(count) = ext.phone_usage_count {
                local.phone_count = count;
            }
            if let Some(count) = ext.distraction_count {
                local.distraction_count = count;
            }
            if ext.first_seen.is_some() {
                local.first_seen = ext.first_seen;
            }
            if ext.last_seen.is_some() {
                local.last_seen = ext.last_seen;
            }
            match ext.total_time_present {
                Some(seconds) => local.presence_seconds = seconds.max(0.0),
                None => {
                    local.presence_seconds = presence_seconds(local.first_seen, local.last_seen)
                }
            }
        }

        self.summary.distinct_subjects = self.subjects.len();
        self.engine_merged = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, NewEvent, SubjectRef};
    use crate::session::NewSession;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ev(kind: EventKind, track: Option<i64>, secs: i64, confidence: f64) -> DetectionEvent {
        NewEvent::new(kind, confidence)
            .with_subject(track.map(SubjectRef::track).unwrap_or_default())
            .at(t(secs))
            .into_event("s1", t(0))
    }

    #[test]
    fn test_timeline_buckets_are_contiguous_and_complete() {
        let events = vec![
            ev(EventKind::AttentionHigh, Some(1), 0, 0.9),
            ev(EventKind::PhoneDetected, Some(1), 30, 0.8),
            ev(EventKind::AttentionLow, Some(2), 61, 0.7),
            ev(EventKind::PosturePoor, Some(2), 250, 0.6),
        ];
        let buckets = timeline(&events, 60_000);

        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets.iter().map(|b| b.total).sum::<u64>(), events.len() as u64);
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(buckets[0].start, t(0));
        assert_eq!(buckets[0].attention_ratio, Some(1.0));
        assert_eq!(buckets[0].distraction_count, 1);
        assert_eq!(buckets[1].attention_ratio, Some(0.0));
        assert_eq!(buckets[2].total, 0);
        assert_eq!(buckets[2].attention_ratio, None);
        assert_eq!(buckets[4].total, 1);
        assert_eq!(buckets[4].attention_ratio, None);
    }

    #[test]
    fn test_timeline_empty_and_single_event() {
        assert!(timeline(&[], 60_000).is_empty());
        let buckets = timeline(&[ev(EventKind::PhoneDetected, None, 5, 0.9)], 60_000);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total, 1);
    }

    #[test]
    fn test_timeline_huge_interval_is_clamped() {
        let events = vec![
            ev(EventKind::AttentionHigh, Some(1), 0, 0.9),
            ev(EventKind::AttentionLow, Some(1), 1, 0.9),
        ];
        let buckets = timeline(&events, i64::MAX);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total, 2);
        assert_eq!(
            (buckets[0].end - buckets[0].start).num_milliseconds(),
            MAX_TIMELINE_INTERVAL_MS
        );
    }

    #[test]
    fn test_timeline_wide_span_is_bounded() {
        let at = |ts: DateTime<Utc>| {
            NewEvent::new(EventKind::PhoneDetected, 0.9)
                .at(ts)
                .into_event("s1", ts)
        };
        let events = vec![
            at(Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()),
            at(Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()),
        ];

        for interval_ms in [1, DEFAULT_TIMELINE_INTERVAL_MS] {
            let buckets = timeline(&events, interval_ms);
            assert!(buckets.len() as i64 <= MAX_TIMELINE_BUCKETS);
            assert_eq!(buckets.iter().map(|b| b.total).sum::<u64>(), 2);
            assert_eq!(buckets.last().unwrap().total, 1);
            for pair in buckets.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn test_effective_interval() {
        assert_eq!(effective_interval_ms(10_000, 0), 1);
        assert_eq!(effective_interval_ms(10_000, 60_000), 60_000);
        assert_eq!(effective_interval_ms(10_000, i64::MAX), MAX_TIMELINE_INTERVAL_MS);
        let span = MAX_TIMELINE_BUCKETS * 1_000;
        assert!(span / effective_interval_ms(span, 1) < MAX_TIMELINE_BUCKETS);
    }

    #[test]
    fn test_category_breakdown() {
        let events = vec![
            ev(EventKind::PhoneDetected, Some(1), 10, 0.9),
            ev(EventKind::PhoneDetected, Some(2), 40, 0.7),
            ev(EventKind::AttentionHigh, Some(1), 20, 1.0),
        ];
        let rows = category_breakdown(&events);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category, EventCategory::Attention);
        let phone = &rows[1];
        assert_eq!(phone.category, EventCategory::Phone);
        assert_eq!(phone.count, 2);
        assert!((phone.average_confidence - 0.8).abs() < 1e-9);
        assert_eq!(phone.first_at, t(10));
        assert_eq!(phone.last_at, t(40));
    }

    #[test]
    fn test_subject_metrics() {
        let events = vec![
            ev(EventKind::AttentionHigh, Some(1), 0, 0.9),
            ev(EventKind::PhoneDetected, Some(1), 45, 0.9),
            ev(EventKind::PosturePoor, Some(2), 10, 0.9),
            ev(EventKind::AttentionDrop, None, 20, 0.9),
        ];
        let subjects = subject_metrics(&events);
        assert_eq!(subjects.len(), 2);

        let one = &subjects[0];
        assert_eq!(one.subject_key, "track_1");
        assert_eq!(one.attention_ratio, Some(1.0));
        assert_eq!(one.phone_count, 1);
        assert_eq!(one.presence_seconds, 45.0);

        let two = &subjects[1];
        assert_eq!(two.posture_count, 1);
        assert_eq!(two.attention_ratio, None);
        assert_eq!(two.presence_seconds, 0.0);
    }

    #[test]
    fn test_final_report_attention_ratio() {
        let mut events = Vec::new();
        for i in 0..3 {
            events.push(ev(EventKind::AttentionHigh, Some(1), i, 0.9));
        }
        events.push(ev(EventKind::AttentionLow, Some(1), 5, 0.9));
        events.push(ev(EventKind::PhoneDetected, Some(2), 6, 0.9));
        events.push(ev(EventKind::PhoneDetected, Some(2), 7, 0.9));

        let session = NewSession::default().into_session("owner", t(0));
        let report = FinalReport::build(&session, &events, DEFAULT_TIMELINE_INTERVAL_MS, t(100));
        assert_eq!(report.summary.attention_ratio, Some(0.75));
        assert_eq!(report.summary.phone_count, 2);
        assert_eq!(report.summary.total_events, 6);
        assert!(!report.engine_merged);
    }

    #[test]
    fn test_merge_prefers_external_values() {
        let events = vec![
            ev(EventKind::PhoneDetected, Some(1), 0, 0.9),
            ev(EventKind::AttentionHigh, Some(1), 30, 0.9),
        ];
        let session = NewSession::default().into_session("owner", t(0));
        let mut report = FinalReport::build(&session, &events, 60_000, t(60));

        let external: ExternalAnalytics = serde_json::from_value(serde_json::json!({
            "attention": { "average": 0.66, "min": 0.2, "max": 0.9 },
            "peakStudentCount": 12,
            "studentMetrics": [
                { "trackId": 1, "name": "Ada", "phoneUsageCount": 4,
                  "firstSeen": "2023-11-14T22:13:20.000001", "totalTimePresent": null },
                { "trackId": 9, "averageAttention": 0.4, "totalTimePresent": 12.5 }
            ]
        }))
        .unwrap();
        report.merge_external(&external);

        assert!(report.engine_merged);
        assert_eq!(report.summary.average_attention, Some(0.66));
        assert_eq!(report.summary.peak_students, 12);
        assert_eq!(report.subjects.len(), 2);

        let one = &report.subjects[0];
        assert_eq!(one.name.as_deref(), Some("Ada"));
        assert_eq!(one.phone_count, 4);
        // Local ratio survives: the engine sent nothing for it.
        assert_eq!(one.attention_ratio, Some(1.0));
        assert_eq!(one.last_seen, Some(t(30)));

        let nine = &report.subjects[1];
        assert_eq!(nine.subject_key, "track_9");
        assert_eq!(nine.presence_seconds, 12.5);
        assert_eq!(nine.average_attention, Some(0.4));
    }
}
