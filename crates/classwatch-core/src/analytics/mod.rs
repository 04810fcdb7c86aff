//! Session Analytics
//!
//! - Live: rolling counters and ratios updated per event
//! - Report: timeline, per-subject and per-category views over the full log,
//!   merged with whatever the analysis engine computed itself

mod live;
mod report;

pub use live::{LiveAggregator, LiveMetrics, ProducerMetrics};
pub use report::{
    CategoryBreakdown, DEFAULT_TIMELINE_INTERVAL_MS, ExternalAnalytics, ExternalAttention,
    ExternalSubjectMetric, FinalReport, MAX_TIMELINE_BUCKETS, MAX_TIMELINE_INTERVAL_MS,
    ReportSummary, SubjectMetric, TimelineBucket, category_breakdown, effective_interval_ms,
    subject_metrics, timeline,
};
