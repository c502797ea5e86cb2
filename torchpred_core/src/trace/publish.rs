//! Collapse of nested profiler events into a minimal covering set of spans

use super::span::{TraceLevel, Tracer};
use super::{Trace, TraceEvent};
use std::cmp::Ordering;

/// Top-level module invocation recorded by the profiler; never published
pub const ROOT_SPAN_NAME: &str = "forward";

const UNSET: i64 = -1;

/// Start ascending, then end descending, then profiler position descending.
///
/// Under this order an enclosing event always precedes the events it encloses.
pub fn covering_order(a: &TraceEvent, b: &TraceEvent) -> Ordering {
    a.start
        .cmp(&b.start)
        .then_with(|| b.end.cmp(&a.end))
        .then_with(|| b.seq.cmp(&a.seq))
}

/// Turns a parsed trace into child spans of a prediction span
#[derive(Debug, Clone)]
pub struct TracePublisher {
    root_span: String,
    level: TraceLevel,
    annotate: bool,
}

impl Default for TracePublisher {
    fn default() -> Self {
        Self {
            root_span: ROOT_SPAN_NAME.to_string(),
            level: TraceLevel::Framework,
            annotate: true,
        }
    }
}

impl TracePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_span(mut self, name: impl Into<String>) -> Self {
        self.root_span = name.into();
        self
    }

    pub fn with_level(mut self, level: TraceLevel) -> Self {
        self.level = level;
        self
    }

    /// Attach shape and memory annotations when the profiler provides them
    pub fn with_annotations(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    pub fn root_span(&self) -> &str {
        &self.root_span
    }

    /// Sort the trace and return the events that survive collapsing, in
    /// emission order.
    ///
    /// An event is dropped when it is the root span or lies within the
    /// interval of the last emitted event.
    pub fn collapse<'t>(&self, trace: &'t mut Trace) -> Vec<&'t TraceEvent> {
        trace.sort();

        let (mut start, mut end) = (UNSET, UNSET);
        let mut emitted = Vec::new();
        for event in &trace.events {
            if event.name == self.root_span {
                continue;
            }
            if event.is_within(start, end) {
                continue;
            }
            start = event.start;
            end = event.end;
            emitted.push(event);
        }
        emitted
    }

    /// Emit the collapsed events as spans under `parent`.
    ///
    /// Returns how many events survived collapsing. Spans are only recorded
    /// when the tracer accepts this publisher's level.
    pub fn publish(&self, trace: &mut Trace, tracer: &Tracer, parent: Option<u64>) -> usize {
        let total = trace.len();
        let emitted = self.collapse(trace);

        for (index, event) in emitted.iter().enumerate() {
            let Some(mut span) = tracer.start_span_at(self.level, &event.name, parent, event.start) else {
                log::debug!("trace level {} excludes {} profiled layers", tracer.level(), emitted.len());
                return emitted.len();
            };
            span.set_tag("phase", event.phase.as_str());
            span.set_tag("process_id", event.process_id.as_str());
            span.set_tag("thread_id", event.thread_id);
            span.set_tag("layer_sequence_index", index);
            if self.annotate {
                if let Some(shape) = &event.shape {
                    span.set_tag("shape", shape.as_str());
                }
                if let Some(bytes) = event.allocated_memory {
                    span.set_tag("allocated_memory", bytes);
                }
                if let Some(bytes) = event.peak_memory {
                    span.set_tag("peak_memory", bytes);
                }
            }
            span.finish_at(event.end);
        }

        log::debug!("published {} of {} profiled events", emitted.len(), total);
        emitted.len()
    }
}
