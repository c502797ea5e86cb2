//! Predictor lifecycle
//!
//! A [`Predictor`] owns one native predictor handle from `new` until `close`
//! (or drop). Every native call is followed by a last-error check, inputs are
//! released right after the run, and a profiled run is turned into framework
//! spans before `predict` returns.

use crate::config::{Device, PredictorConfig};
use crate::error::{ConfigError, MarshalError, NativeCallError, PredictorError, PredictorResult, ResultError};
use crate::ivalue::OwnedIValue;
use crate::native::{self, NativeApi, PredictorHandle, TensorHandle};
use crate::profile;
use crate::tensor::{self, EncodedTensor, Tensor};
use crate::trace::{ActiveSpan, SpanSink, Trace, TraceLevel, TracePublisher, Tracer};
use parking_lot::Mutex;
use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Predictor shared across threads; the mutex serializes every call
pub type SharedPredictor = Arc<Mutex<Predictor>>;

pub struct Predictor {
    api: Arc<dyn NativeApi>,
    handle: Option<NonNull<c_void>>,
    config: PredictorConfig,
    tracer: Tracer,
    publisher: TracePublisher,
}

// SAFETY: the handle is only passed to the engine through `&mut self`.
unsafe impl Send for Predictor {}

impl Predictor {
    /// Load a model.
    ///
    /// Fails without allocating anything when the model file is missing or a
    /// GPU is requested on a machine without CUDA.
    pub fn new(api: Arc<dyn NativeApi>, config: PredictorConfig, sink: Arc<dyn SpanSink>) -> PredictorResult<Self> {
        if !config.model_path.exists() {
            return Err(ConfigError::ModelNotFound(config.model_path.clone()).into());
        }
        if config.device == Device::Gpu && !api.cuda_available() {
            return Err(ConfigError::UnknownDevice(config.device.to_string()).into());
        }
        let path = config
            .model_path
            .to_str()
            .ok_or_else(|| ConfigError::InvalidModelPath(config.model_path.display().to_string()))?;
        let cpath = CString::new(path).map_err(|_| ConfigError::InvalidModelPath(path.to_string()))?;

        let tracer = Tracer::new(sink, config.trace_level);
        let span = tracer.start_span(TraceLevel::Model, "c_new", None);

        let raw = api.new_predictor(&cpath, config.device.to_native(), config.profiling_enabled());
        let status = native::check(api.as_ref(), "new_predictor");
        let handle = NonNull::new(raw);
        if let Err(e) = status {
            if let Some(handle) = handle {
                unsafe { api.delete_predictor(handle.as_ptr()) };
                let _ = native::check(api.as_ref(), "delete_predictor");
            }
            return Err(e.into());
        }
        let handle = handle.ok_or_else(|| NativeCallError::new("new_predictor", "engine returned a null predictor"))?;

        if let Some(span) = span {
            span.finish();
        }
        log::info!(
            "loaded {} on {} via {} engine (trace level {})",
            path,
            config.device,
            api.name(),
            config.trace_level
        );

        let publisher = TracePublisher::new().with_root_span(config.root_span.clone());
        Ok(Self {
            api,
            handle: Some(handle),
            config,
            tracer,
            publisher,
        })
    }

    /// Run the model on `inputs`.
    ///
    /// Inputs are validated before anything reaches the engine. When the trace
    /// level includes framework layers the profile of this run is published
    /// as children of the `c_predict` span.
    pub fn predict(&mut self, inputs: &[Tensor]) -> PredictorResult<()> {
        let handle = self.live_handle()?;
        if inputs.is_empty() {
            return Err(MarshalError::EmptyInput.into());
        }
        if let Some(index) = inputs.iter().position(|t| !t.is_dense()) {
            return Err(MarshalError::NotDense { index }.into());
        }

        let mut span = self.tracer.start_span(TraceLevel::Model, "c_predict", None);
        if let Some(span) = span.as_mut() {
            span.set_tag("evaluation_trace_level", self.config.trace_level.as_str());
        }
        let parent = span.as_ref().map(ActiveSpan::id);

        let api = self.api.as_ref();
        let device = self.config.device.to_native();
        let encoded = inputs
            .iter()
            .map(|t| tensor::encode(api, t, device))
            .collect::<PredictorResult<Vec<_>>>()?;
        let handles: Vec<TensorHandle> = encoded.iter().map(EncodedTensor::handle).collect();

        unsafe { api.predictor_run(handle, handles.as_ptr(), handles.len() as c_int) };
        let status = native::check(api, "predictor_run");
        drop(encoded);

        let profiling = self.config.profiling_enabled();
        if let Err(e) = status {
            if profiling {
                unsafe { profile::discard_profile(api, handle) };
            }
            return Err(e.into());
        }

        if profiling {
            let raw = unsafe { profile::read_profile(api, handle) }?;
            let mut trace = Trace::parse(&raw.json, raw.start_ns)?;
            let published = self.publisher.publish(&mut trace, &self.tracer, parent);
            log::debug!("profiled run produced {} layers", published);
        }

        if let Some(span) = span {
            span.finish();
        }
        Ok(())
    }

    /// Decode the output of the last run into host tensors.
    ///
    /// The output slot is consumed; reading twice fails with no outputs.
    pub fn read_output(&mut self) -> PredictorResult<Vec<Tensor>> {
        let handle = self.live_handle()?;
        let _span = self.tracer.start_span(TraceLevel::Model, "c_read_predicted_output", None);
        let api = self.api.as_ref();

        let count = unsafe { api.predictor_num_outputs(handle) };
        native::check(api, "predictor_num_outputs")?;
        if count <= 0 {
            return Err(ResultError::NoOutputs.into());
        }

        let output = unsafe { OwnedIValue::new(api, api.predictor_output(handle)) };
        native::check(api, "predictor_output")?;
        if output.is_untyped() {
            return Err(ResultError::EmptyPrediction.into());
        }

        let tensors = output.decode()?;
        log::debug!("read {} output tensors", tensors.len());
        Ok(tensors)
    }

    /// Release the native predictor. Calling it again does nothing.
    pub fn close(&mut self) -> PredictorResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        unsafe { self.api.delete_predictor(handle.as_ptr()) };
        native::check(self.api.as_ref(), "delete_predictor")?;
        log::debug!("closed predictor for {}", self.config.model_path.display());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.config.device
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.config.trace_level
    }

    pub fn into_shared(self) -> SharedPredictor {
        Arc::new(Mutex::new(self))
    }

    fn live_handle(&self) -> Result<PredictorHandle, PredictorError> {
        self.handle.map(NonNull::as_ptr).ok_or(PredictorError::Closed)
    }
}

impl Drop for Predictor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to release predictor: {}", e);
        }
    }
}

impl fmt::Debug for Predictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predictor")
            .field("engine", &self.api.name())
            .field("model_path", &self.config.model_path)
            .field("device", &self.config.device)
            .field("trace_level", &self.config.trace_level)
            .field("closed", &self.is_closed())
            .finish()
    }
}
