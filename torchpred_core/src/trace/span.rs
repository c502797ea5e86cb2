//! Spans and the sinks that receive them

use chrono::TimeZone;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How deep the timeline goes. Spans above the configured level are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    #[default]
    NoTrace,
    Application,
    Model,
    Framework,
    Library,
    Hardware,
    SystemLibrary,
    Full,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTrace => "no_trace",
            Self::Application => "application",
            Self::Model => "model",
            Self::Framework => "framework",
            Self::Library => "library",
            Self::Hardware => "hardware",
            Self::SystemLibrary => "system_library",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TraceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "no_trace" | "none" => Ok(Self::NoTrace),
            "application" => Ok(Self::Application),
            "model" => Ok(Self::Model),
            "framework" => Ok(Self::Framework),
            "library" => Ok(Self::Library),
            "hardware" => Ok(Self::Hardware),
            "system_library" => Ok(Self::SystemLibrary),
            "full" => Ok(Self::Full),
            _ => Err(format!("unknown trace level: {}", s)),
        }
    }
}

/// Tag attached to a span
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Str(String),
    Int(i64),
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Str(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Str(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<usize> for TagValue {
    fn from(v: usize) -> Self {
        TagValue::Int(v as i64)
    }
}

/// A finished, named interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub id: u64,
    pub parent: Option<u64>,
    pub name: String,
    pub level: TraceLevel,
    /// Nanoseconds since the Unix epoch
    pub start_ns: i64,
    pub finish_ns: i64,
    pub tags: BTreeMap<String, TagValue>,
}

impl Span {
    pub fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.timestamp_nanos(self.start_ns)
    }

    pub fn finish_time(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.timestamp_nanos(self.finish_ns)
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }
}

/// Destination of finished spans
pub trait SpanSink: Send + Sync {
    fn record(&self, span: Span);
}

/// Keeps every span in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    spans: Mutex<Vec<Span>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    /// Spans with the given parent, in recording order
    pub fn children_of(&self, parent: u64) -> Vec<Span> {
        self.spans.lock().iter().filter(|s| s.parent == Some(parent)).cloned().collect()
    }

    pub fn take(&self) -> Vec<Span> {
        std::mem::take(&mut *self.spans.lock())
    }
}

impl SpanSink for MemorySink {
    fn record(&self, span: Span) {
        self.spans.lock().push(span);
    }
}

/// Writes each span to the `log` facade as one JSON line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SpanSink for LogSink {
    fn record(&self, span: Span) {
        match serde_json::to_string(&span) {
            Ok(line) => log::info!(target: "torchpred::span", "{}", line),
            Err(e) => log::warn!("failed to serialize span {}: {}", span.name, e),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SpanSink for NullSink {
    fn record(&self, _span: Span) {}
}

/// Creates spans at or below its level and hands them to a sink
#[derive(Clone)]
pub struct Tracer {
    sink: Arc<dyn SpanSink>,
    level: TraceLevel,
    next_id: Arc<AtomicU64>,
}

impl Tracer {
    pub fn new(sink: Arc<dyn SpanSink>, level: TraceLevel) -> Self {
        Self {
            sink,
            level,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Tracer that records nothing
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink), TraceLevel::NoTrace)
    }

    pub fn level(&self) -> TraceLevel {
        self.level
    }

    pub fn enabled(&self, level: TraceLevel) -> bool {
        level != TraceLevel::NoTrace && level <= self.level
    }

    /// Start a span now; `None` when `level` is not traced
    pub fn start_span(&self, level: TraceLevel, name: &str, parent: Option<u64>) -> Option<ActiveSpan> {
        self.start_span_at(level, name, parent, now_ns())
    }

    pub fn start_span_at(
        &self,
        level: TraceLevel,
        name: &str,
        parent: Option<u64>,
        start_ns: i64,
    ) -> Option<ActiveSpan> {
        if !self.enabled(level) {
            return None;
        }
        Some(ActiveSpan {
            sink: Arc::clone(&self.sink),
            span: Some(Span {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                parent,
                name: name.to_string(),
                level,
                start_ns,
                finish_ns: start_ns,
                tags: BTreeMap::new(),
            }),
        })
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").field("level", &self.level).finish()
    }
}

/// Span in flight; recorded when finished (or dropped)
pub struct ActiveSpan {
    sink: Arc<dyn SpanSink>,
    span: Option<Span>,
}

impl ActiveSpan {
    pub fn id(&self) -> u64 {
        self.span.as_ref().map(|s| s.id).unwrap_or_default()
    }

    pub fn set_tag(&mut self, key: &str, value: impl Into<TagValue>) {
        if let Some(span) = self.span.as_mut() {
            span.tags.insert(key.to_string(), value.into());
        }
    }

    pub fn finish(self) {
        self.finish_at(now_ns());
    }

    pub fn finish_at(mut self, finish_ns: i64) {
        self.record(finish_ns);
    }

    fn record(&mut self, finish_ns: i64) {
        if let Some(mut span) = self.span.take() {
            span.finish_ns = finish_ns;
            self.sink.record(span);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.record(now_ns());
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering_and_parse() {
        assert!(TraceLevel::Model < TraceLevel::Framework);
        assert_eq!("framework".parse::<TraceLevel>().unwrap(), TraceLevel::Framework);
        assert_eq!("SYSTEM-LIBRARY".parse::<TraceLevel>().unwrap(), TraceLevel::SystemLibrary);
        assert!("verbose".parse::<TraceLevel>().is_err());
    }

    #[test]
    fn test_spans_above_level_are_dropped() {
        let sink = Arc::new(MemorySink::new());
        let tracer = Tracer::new(sink.clone(), TraceLevel::Model);

        assert!(tracer.start_span(TraceLevel::Framework, "layer", None).is_none());
        let mut span = tracer.start_span_at(TraceLevel::Model, "c_predict", None, 10).unwrap();
        span.set_tag("evaluation_trace_level", "model");
        span.finish_at(25);

        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "c_predict");
        assert_eq!((spans[0].start_ns, spans[0].finish_ns), (10, 25));
        assert_eq!(spans[0].tag("evaluation_trace_level"), Some(&TagValue::from("model")));
    }

    #[test]
    fn test_no_trace_records_nothing() {
        let sink = Arc::new(MemorySink::new());
        let tracer = Tracer::new(sink.clone(), TraceLevel::NoTrace);
        assert!(tracer.start_span(TraceLevel::Application, "app", None).is_none());
        assert!(tracer.start_span(TraceLevel::NoTrace, "none", None).is_none());
    }

    #[test]
    fn test_dropped_span_is_recorded_once() {
        let sink = Arc::new(MemorySink::new());
        let tracer = Tracer::new(sink.clone(), TraceLevel::Full);
        {
            let _span = tracer.start_span(TraceLevel::Model, "scoped", None);
        }
        tracer.start_span(TraceLevel::Model, "finished", None).unwrap().finish();
        let names: Vec<_> = sink.take().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["scoped", "finished"]);
    }
}
