//! Trace reconstruction benchmarks
//!
//! Measures parsing a profiler dump and collapsing it into spans for traces of
//! increasing size, with layers nested three deep.
//!
//! Run with: cargo bench --bench trace_publish

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use torchpred_core::{NullSink, Trace, TraceLevel, TracePublisher, Tracer};

/// Number of top-level layers per trace
const LAYER_COUNTS: &[usize] = &[16, 128, 1024];

const EPOCH_NS: i64 = 1_700_000_000_000_000_000;

/// Profiler dump with a root event, then per layer a module, an op and a kernel
fn create_profile(layers: usize) -> String {
    let mut events = vec![serde_json::json!({
        "name": "forward", "ph": "X", "ts": 0.0, "dur": layers as f64 * 10.0, "pid": "CPU Functions", "tid": 1
    })];
    for i in 0..layers {
        let ts = i as f64 * 10.0;
        events.push(serde_json::json!({"name": format!("layer{}", i), "ph": "X", "ts": ts, "dur": 9.0, "tid": 1}));
        events.push(serde_json::json!({"name": "aten::linear", "ph": "X", "ts": ts + 1.0, "dur": 6.0, "tid": 1}));
        events.push(serde_json::json!({"name": "aten::addmm", "ph": "X", "ts": ts + 2.0, "dur": 3.0, "tid": 1}));
    }
    serde_json::Value::Array(events).to_string()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace_parse");
    group.measurement_time(Duration::from_secs(5));

    for &layers in LAYER_COUNTS {
        let profile = create_profile(layers);
        group.bench_with_input(BenchmarkId::new("parse", layers), &profile, |b, profile| {
            b.iter(|| Trace::parse(black_box(profile), EPOCH_NS).unwrap());
        });
    }

    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace_publish");
    group.measurement_time(Duration::from_secs(5));

    let tracer = Tracer::new(Arc::new(NullSink), TraceLevel::Framework);
    let publisher = TracePublisher::new();

    for &layers in LAYER_COUNTS {
        let trace = Trace::parse(&create_profile(layers), EPOCH_NS).unwrap();
        group.bench_with_input(BenchmarkId::new("collapse_and_emit", layers), &trace, |b, trace| {
            b.iter(|| {
                let mut trace = trace.clone();
                black_box(publisher.publish(&mut trace, &tracer, Some(1)))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse, bench_publish);
criterion_main!(benches);
