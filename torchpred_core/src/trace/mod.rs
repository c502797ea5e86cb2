//! Execution trace reconstruction
//!
//! The native profiler reports events with timestamps relative to the start of
//! profiling, in microseconds. [`Trace::parse`] anchors them to the absolute
//! profiler epoch; [`TracePublisher`] reduces the nested events to a minimal
//! covering set of spans.

pub mod publish;
pub mod span;

pub use publish::{covering_order, TracePublisher, ROOT_SPAN_NAME};
pub use span::{now_ns, ActiveSpan, LogSink, MemorySink, NullSink, Span, SpanSink, TagValue, TraceLevel, Tracer};

use crate::error::TraceError;
use chrono::TimeZone;
use serde::Deserialize;

/// One record of the profiler output
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTraceEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "ph")]
    pub phase: String,
    /// Microseconds since profiling started
    #[serde(default, rename = "ts")]
    pub timestamp_us: f64,
    #[serde(default, rename = "dur")]
    pub duration_us: f64,
    #[serde(default, rename = "pid")]
    pub process_id: String,
    #[serde(default, rename = "tid")]
    pub thread_id: i64,
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub allocated_memory: Option<i64>,
    #[serde(default)]
    pub peak_memory: Option<i64>,
}

/// Profiler event anchored to absolute time
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub name: String,
    pub phase: String,
    pub process_id: String,
    pub thread_id: i64,
    /// Absolute start, nanoseconds since the Unix epoch
    pub start: i64,
    /// Absolute end, nanoseconds since the Unix epoch
    pub end: i64,
    /// Position in the profiler output; only breaks ordering ties
    pub seq: usize,
    pub shape: Option<String>,
    pub allocated_memory: Option<i64>,
    pub peak_memory: Option<i64>,
}

impl TraceEvent {
    pub fn id(&self) -> String {
        format!("{}/{}", self.name, self.thread_id)
    }

    pub fn duration_ns(&self) -> i64 {
        self.end - self.start
    }

    /// Whether this event lies within `[start, end]`
    pub fn is_within(&self, start: i64, end: i64) -> bool {
        self.start >= start && self.end <= end
    }
}

/// Events of one profiled run
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Profiler epoch in nanoseconds
    pub start_ns: i64,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// Parse the profiler's JSON event array. Either every event converts or
    /// the whole trace is rejected.
    pub fn parse(data: &str, start_ns: i64) -> Result<Self, TraceError> {
        let raw: Vec<RawTraceEvent> = serde_json::from_str(data)?;
        Self::from_raw(raw, start_ns)
    }

    pub fn from_raw(raw: Vec<RawTraceEvent>, start_ns: i64) -> Result<Self, TraceError> {
        if start_ns <= 0 {
            log::warn!("profiler epoch {} is not positive; span collapsing assumes positive timestamps", start_ns);
        }

        let events = raw
            .into_iter()
            .enumerate()
            .map(|(seq, event)| anchor(seq, event, start_ns))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { start_ns, events })
    }

    pub fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.timestamp_nanos(self.start_ns)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Order events so that covering spans come before what they cover
    pub fn sort(&mut self) {
        self.events.sort_by(covering_order);
    }
}

fn anchor(seq: usize, event: RawTraceEvent, start_ns: i64) -> Result<TraceEvent, TraceError> {
    let invalid = |reason: &str| TraceError::InvalidEvent {
        index: seq,
        name: event.name.clone(),
        reason: reason.to_string(),
    };
    if !event.timestamp_us.is_finite() || !event.duration_us.is_finite() {
        return Err(invalid("non-finite timestamp or duration"));
    }
    if event.duration_us < 0.0 {
        return Err(invalid("negative duration"));
    }

    let start = start_ns.saturating_add((event.timestamp_us * 1000.0) as i64);
    let end = start.saturating_add((event.duration_us * 1000.0) as i64);

    Ok(TraceEvent {
        name: event.name,
        phase: event.phase,
        process_id: event.process_id,
        thread_id: event.thread_id,
        start,
        end,
        seq,
        shape: event.shape,
        allocated_memory: event.allocated_memory,
        peak_memory: event.peak_memory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_anchored_to_epoch() {
        let trace = Trace::parse(r#"[{"ts": 0, "dur": 10}, {"ts": 2, "dur": 3}]"#, 1_000_000).unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!((trace.events[0].start, trace.events[0].end), (1_000_000, 1_010_000));
        assert_eq!((trace.events[1].start, trace.events[1].end), (1_002_000, 1_005_000));
        assert_eq!(trace.events[0].seq, 0);
        assert_eq!(trace.events[1].seq, 1);
    }

    #[test]
    fn test_profiler_record_fields() {
        let data = r#"[{
            "name": "aten::conv2d",
            "ph": "X",
            "ts": 12.500,
            "dur": 0.250,
            "tid": 7,
            "pid": "CPU Functions",
            "shape": "[[1, 3, 224, 224]]",
            "allocated_memory": 4096,
            "peak_memory": 8192,
            "layer_sequence_index": 0,
            "args": {}
        }]"#;
        let trace = Trace::parse(data, 5_000_000_000).unwrap();
        let event = &trace.events[0];
        assert_eq!(event.name, "aten::conv2d");
        assert_eq!(event.phase, "X");
        assert_eq!(event.process_id, "CPU Functions");
        assert_eq!(event.thread_id, 7);
        assert_eq!(event.start, 5_000_012_500);
        assert_eq!(event.duration_ns(), 250);
        assert_eq!(event.shape.as_deref(), Some("[[1, 3, 224, 224]]"));
        assert_eq!(event.allocated_memory, Some(4096));
        assert_eq!(event.peak_memory, Some(8192));
        assert_eq!(event.id(), "aten::conv2d/7");
    }

    #[test]
    fn test_malformed_profile_fails_atomically() {
        assert!(matches!(Trace::parse("[{\"ts\": 1}, {\"ts\": \"soon\"}]", 1), Err(TraceError::Malformed(_))));
        assert!(matches!(Trace::parse("{\"traceEvents\": []}", 1), Err(TraceError::Malformed(_))));

        let err = Trace::parse(r#"[{"name": "ok", "dur": 1}, {"name": "bad", "dur": -1}]"#, 1).unwrap_err();
        assert!(matches!(err, TraceError::InvalidEvent { index: 1, .. }));
    }

    #[test]
    fn test_empty_profile() {
        let trace = Trace::parse("[]", 1_000).unwrap();
        assert!(trace.is_empty());
        assert_eq!(trace.start_time().timestamp_nanos_opt(), Some(1_000));
    }
}
