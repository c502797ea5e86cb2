//! # torchpred
//!
//! Run serialized PyTorch models through a native predictor, move tensors
//! across the boundary and reconstruct a per-layer execution timeline from
//! the native profiler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use torchpred::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = PredictorConfig::from_file("predictor.toml")?.apply_env_overrides()?;
//!     let sink = Arc::new(MemorySink::new());
//!     let mut predictor = Predictor::new(Arc::new(SimRuntime::new()), config, sink.clone())?;
//!
//!     predictor.predict(&[arr2(&[[0.1f32, 0.2], [0.3, 0.4]]).into()])?;
//!     for tensor in predictor.read_output()? {
//!         println!("{} {:?}", tensor.dtype(), tensor.shape());
//!     }
//!     for span in sink.spans() {
//!         println!("{} {}ns", span.name, span.finish_ns - span.start_ns);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **`libtorch`**: link the native libtorch bridge and expose `LibTorch`
//! - Without it, [`SimRuntime`] stands in for the engine

// Re-export core components
pub use torchpred_core::{self, *};

// Re-export the array crate tensors are built from
pub use ndarray;

/// The torchpred prelude - everything you need to get started
pub mod prelude {
    // Predictor lifecycle
    pub use torchpred_core::config::{Device, PredictorConfig};
    pub use torchpred_core::predictor::{Predictor, SharedPredictor};

    // Tensors
    pub use torchpred_core::tensor::{DType, Tensor};
    pub use ndarray::{arr1, arr2, arr3, ArrayD, IxDyn};

    // Engines
    #[cfg(feature = "libtorch")]
    pub use torchpred_core::native::LibTorch;
    pub use torchpred_core::native::{NativeApi, SimRuntime};

    // Tracing
    pub use torchpred_core::trace::{LogSink, MemorySink, NullSink, Span, SpanSink, TraceLevel};

    // Error types
    pub use torchpred_core::error::{PredictorError, PredictorResult};
    pub type Result<T> = PredictorResult<T>;

    // Common std types
    pub use std::sync::Arc;

    pub use parking_lot::Mutex;
    pub use serde::{Deserialize, Serialize};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get torchpred version
pub fn version() -> &'static str {
    VERSION
}
