//! # torchpred core
//!
//! Lifecycle management, tensor marshaling and trace reconstruction around a
//! native PyTorch inference engine.
//!
//! - **Predictor**: owns the native handle; create, predict, read output, close
//! - **Tensor**: dense n-dimensional arrays crossing the native boundary
//! - **IValue**: decoding and freeing of tensor/tuple result trees
//! - **Trace**: profiler events collapsed into a minimal covering set of spans
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use torchpred_core::{LogSink, Predictor, PredictorConfig, SimRuntime, Tensor, TraceLevel};
//!
//! # fn main() -> torchpred_core::PredictorResult<()> {
//! let config = PredictorConfig::new("model.json").with_trace_level(TraceLevel::Framework);
//! let mut predictor = Predictor::new(Arc::new(SimRuntime::new()), config, Arc::new(LogSink))?;
//!
//! let input: Tensor = ndarray::arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into();
//! predictor.predict(&[input])?;
//! let outputs = predictor.read_output()?;
//! println!("{} outputs", outputs.len());
//! predictor.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ivalue;
pub mod native;
pub mod predictor;
pub mod profile;
pub mod tensor;
pub mod trace;

pub use config::{Device, PredictorConfig};
pub use error::{
    ConfigError, MarshalError, NativeCallError, PredictorError, PredictorResult, ResultError, TraceError,
};
pub use ivalue::OwnedIValue;
pub use predictor::{Predictor, SharedPredictor};
pub use tensor::{checked_flattened_length, flattened_length, DType, Element, Tensor};
pub use trace::{
    LogSink, MemorySink, NullSink, Span, SpanSink, TagValue, Trace, TraceEvent, TraceLevel, TracePublisher, Tracer,
    ROOT_SPAN_NAME,
};

// Engines
#[cfg(feature = "libtorch")]
pub use native::LibTorch;
pub use native::{NativeApi, SimRuntime};
