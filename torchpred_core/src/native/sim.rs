//! In-process simulated engine
//!
//! `SimRuntime` implements the native contract without libtorch. A "model" is
//! a JSON file describing how inputs are echoed into the output tree and which
//! profile the profiler hands back. Every allocation crossing the boundary is
//! registered, so releases through the wrong path, double releases and leaks
//! show up in [`SimStats`] instead of corrupting memory.

use super::{
    DeviceKind, NativeApi, NativeDType, PredictorHandle, RawIValue, RawIValueTuple, TensorHandle,
    IVALUE_TENSOR, IVALUE_TUPLE,
};
use crate::trace::now_ns;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

/// Tensor owned by the simulated engine
#[derive(Debug, Clone, PartialEq)]
pub struct SimTensor {
    pub dtype: NativeDType,
    pub shape: Vec<i64>,
    pub bytes: Vec<u8>,
}

/// Output tree before it is handed across the boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SimValue {
    Tensor(SimTensor),
    Tuple(Vec<SimValue>),
    Unknown,
}

/// How a simulated model arranges its inputs into an output tree.
///
/// In JSON a number echoes that input, an array builds a tuple and `null`
/// yields an untyped value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputLayout {
    Input(usize),
    Tuple(Vec<OutputLayout>),
    Unknown,
}

/// Contents of a simulated model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimModel {
    #[serde(default = "default_outputs")]
    pub outputs: OutputLayout,
    /// Profile served after a profiled run; absent means the profiler yields nothing
    #[serde(default)]
    pub profile: Option<serde_json::Value>,
    /// Fixed profiler epoch in nanoseconds; wall clock when absent
    #[serde(default)]
    pub profile_start_ns: Option<i64>,
    /// Error message raised by every run
    #[serde(default)]
    pub fail_run: Option<String>,
}

fn default_outputs() -> OutputLayout {
    OutputLayout::Input(0)
}

impl Default for SimModel {
    fn default() -> Self {
        Self {
            outputs: default_outputs(),
            profile: None,
            profile_start_ns: None,
            fail_run: None,
        }
    }
}

impl SimModel {
    /// Write the model description to disk
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

/// Allocation and call counters of a [`SimRuntime`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub predictors_created: u64,
    pub predictors_destroyed: u64,
    pub runs: u64,
    pub tensors_created: u64,
    pub tensors_released: u64,
    pub tuples_allocated: u64,
    pub tuples_freed: u64,
    pub tuple_values_freed: u64,
    pub profiles_read: u64,
    pub profiles_freed: u64,
    /// Releases of unknown, already released or wrongly typed allocations
    pub invalid_frees: u64,
}

impl SimStats {
    pub fn live_tensors(&self) -> u64 {
        self.tensors_created - self.tensors_released
    }

    pub fn live_tuples(&self) -> u64 {
        self.tuples_allocated - self.tuples_freed
    }

    pub fn live_predictors(&self) -> u64 {
        self.predictors_created - self.predictors_destroyed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    Predictor,
    Tensor,
    Tuple,
    TupleValues(usize),
    Profile,
}

struct SimPredictor {
    model: SimModel,
    profiling: bool,
    output: Option<SimValue>,
    profiler_running: bool,
    start_ns: i64,
}

#[derive(Default)]
struct SimState {
    last_error: Option<String>,
    live: HashMap<usize, Allocation>,
    stats: SimStats,
}

/// Simulated inference engine
pub struct SimRuntime {
    cuda: bool,
    state: Mutex<SimState>,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRuntime {
    pub fn new() -> Self {
        Self {
            cuda: false,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Pretend a CUDA device is present
    pub fn with_cuda(mut self, available: bool) -> Self {
        self.cuda = available;
        self
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// Number of allocations not yet released
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Copy of a live tensor, `None` if the handle is not a live tensor
    pub fn tensor(&self, handle: TensorHandle) -> Option<SimTensor> {
        if !self.is_live(handle as usize, Allocation::Tensor) {
            return None;
        }
        Some(unsafe { &*(handle as *const SimTensor) }.clone())
    }

    pub fn alloc_tensor(&self, tensor: SimTensor) -> TensorHandle {
        let handle = Box::into_raw(Box::new(tensor)) as TensorHandle;
        let mut state = self.state.lock();
        state.live.insert(handle as usize, Allocation::Tensor);
        state.stats.tensors_created += 1;
        handle
    }

    /// Hand a value tree across the boundary the way the bridge lays it out
    pub fn alloc_value(&self, value: SimValue) -> RawIValue {
        match value {
            SimValue::Tensor(t) => RawIValue {
                itype: IVALUE_TENSOR,
                data_ptr: self.alloc_tensor(t),
            },
            SimValue::Tuple(children) => {
                let values: Vec<RawIValue> = children.into_iter().map(|c| self.alloc_value(c)).collect();
                let length = values.len();
                let values_ptr = if length == 0 {
                    std::ptr::null_mut()
                } else {
                    Box::into_raw(values.into_boxed_slice()) as *mut RawIValue
                };
                let tuple = Box::into_raw(Box::new(RawIValueTuple {
                    values: values_ptr,
                    length: length as i64,
                }));

                let mut state = self.state.lock();
                if !values_ptr.is_null() {
                    state.live.insert(values_ptr as usize, Allocation::TupleValues(length));
                }
                state.live.insert(tuple as usize, Allocation::Tuple);
                state.stats.tuples_allocated += 1;

                RawIValue {
                    itype: IVALUE_TUPLE,
                    data_ptr: tuple as *mut c_void,
                }
            }
            SimValue::Unknown => RawIValue::unknown(),
        }
    }

    fn set_error(&self, message: impl Into<String>) {
        self.state.lock().last_error = Some(message.into());
    }

    fn is_live(&self, addr: usize, kind: Allocation) -> bool {
        self.state.lock().live.get(&addr) == Some(&kind)
    }

    /// Unregister an allocation; false (and counted) when it is not live as `kind`
    fn release(&self, addr: usize, kind: Allocation) -> bool {
        let mut state = self.state.lock();
        if state.live.get(&addr) == Some(&kind) {
            state.live.remove(&addr);
            true
        } else {
            state.stats.invalid_frees += 1;
            false
        }
    }

    fn predictor<'a>(&self, pred: PredictorHandle) -> Option<&'a mut SimPredictor> {
        if !self.is_live(pred as usize, Allocation::Predictor) {
            self.set_error("invalid predictor handle");
            return None;
        }
        Some(unsafe { &mut *(pred as *mut SimPredictor) })
    }

    fn live_tensor<'a>(&self, tensor: TensorHandle) -> Option<&'a SimTensor> {
        if !self.is_live(tensor as usize, Allocation::Tensor) {
            self.set_error("invalid tensor handle");
            return None;
        }
        Some(unsafe { &*(tensor as *const SimTensor) })
    }

    fn load_model(path: &str) -> Result<SimModel, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("failed to load model {}: {}", path, e))?;
        if text.trim().is_empty() {
            return Ok(SimModel::default());
        }
        serde_json::from_str(&text).map_err(|e| format!("failed to parse model {}: {}", path, e))
    }

    fn arrange(layout: &OutputLayout, inputs: &[SimTensor]) -> Result<SimValue, String> {
        match layout {
            OutputLayout::Input(i) => inputs
                .get(*i)
                .cloned()
                .map(SimValue::Tensor)
                .ok_or_else(|| format!("output refers to input {} but only {} were given", i, inputs.len())),
            OutputLayout::Tuple(items) => items
                .iter()
                .map(|item| Self::arrange(item, inputs))
                .collect::<Result<Vec<_>, _>>()
                .map(SimValue::Tuple),
            OutputLayout::Unknown => Ok(SimValue::Unknown),
        }
    }
}

impl NativeApi for SimRuntime {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn cuda_available(&self) -> bool {
        self.cuda
    }

    fn take_error(&self) -> Option<String> {
        self.state.lock().last_error.take()
    }

    fn new_predictor(&self, model_file: &CStr, device: DeviceKind, profiling_enabled: bool) -> PredictorHandle {
        let path = match model_file.to_str() {
            Ok(path) => path,
            Err(_) => {
                self.set_error("model path is not valid UTF-8");
                return std::ptr::null_mut();
            }
        };
        if device == DeviceKind::Cuda && !self.cuda {
            self.set_error("CUDA device requested but not available");
            return std::ptr::null_mut();
        }
        let model = match Self::load_model(path) {
            Ok(model) => model,
            Err(e) => {
                self.set_error(e);
                return std::ptr::null_mut();
            }
        };

        let pred = Box::into_raw(Box::new(SimPredictor {
            model,
            profiling: profiling_enabled,
            output: None,
            profiler_running: false,
            start_ns: 0,
        })) as PredictorHandle;

        let mut state = self.state.lock();
        state.live.insert(pred as usize, Allocation::Predictor);
        state.stats.predictors_created += 1;
        pred
    }

    unsafe fn predictor_run(&self, pred: PredictorHandle, inputs: *const TensorHandle, len: c_int) {
        let Some(predictor) = self.predictor(pred) else {
            return;
        };
        self.state.lock().stats.runs += 1;

        let handles: &[TensorHandle] = if len <= 0 || inputs.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(inputs, len as usize)
        };
        let mut tensors = Vec::with_capacity(handles.len());
        for &h in handles {
            match self.live_tensor(h) {
                Some(t) => tensors.push(t.clone()),
                None => return,
            }
        }

        if predictor.profiling {
            predictor.profiler_running = true;
            predictor.start_ns = predictor.model.profile_start_ns.unwrap_or_else(now_ns);
        }

        predictor.output = None;
        if let Some(message) = &predictor.model.fail_run {
            self.set_error(message.clone());
            return;
        }
        match Self::arrange(&predictor.model.outputs, &tensors) {
            Ok(value) => predictor.output = Some(value),
            Err(e) => self.set_error(e),
        }
    }

    unsafe fn predictor_num_outputs(&self, pred: PredictorHandle) -> c_int {
        let Some(predictor) = self.predictor(pred) else {
            return 0;
        };
        match &predictor.output {
            None => 0,
            Some(SimValue::Tensor(_)) => 1,
            Some(SimValue::Tuple(items)) => items.len() as c_int,
            // Present but untyped
            Some(SimValue::Unknown) => 1,
        }
    }

    unsafe fn predictor_output(&self, pred: PredictorHandle) -> RawIValue {
        let Some(predictor) = self.predictor(pred) else {
            return RawIValue::unknown();
        };
        match predictor.output.take() {
            Some(value) => self.alloc_value(value),
            None => RawIValue::unknown(),
        }
    }

    unsafe fn delete_predictor(&self, pred: PredictorHandle) {
        if self.release(pred as usize, Allocation::Predictor) {
            drop(Box::from_raw(pred as *mut SimPredictor));
            self.state.lock().stats.predictors_destroyed += 1;
        }
    }

    unsafe fn profiling_read(&self, pred: PredictorHandle) -> *mut c_char {
        let Some(predictor) = self.predictor(pred) else {
            return std::ptr::null_mut();
        };
        if !predictor.profiling || !predictor.profiler_running {
            self.set_error("profiler is not running");
            return std::ptr::null_mut();
        }
        predictor.profiler_running = false;
        self.state.lock().stats.profiles_read += 1;

        let Some(profile) = &predictor.model.profile else {
            return std::ptr::null_mut();
        };
        let text = match profile {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        match CString::new(text) {
            Ok(cstr) => {
                let buffer = cstr.into_raw();
                self.state.lock().live.insert(buffer as usize, Allocation::Profile);
                buffer
            }
            Err(_) => {
                self.set_error("profile contains an interior NUL byte");
                std::ptr::null_mut()
            }
        }
    }

    unsafe fn profiling_start_time(&self, pred: PredictorHandle) -> i64 {
        self.predictor(pred).map(|p| p.start_ns).unwrap_or(0)
    }

    unsafe fn free_profile(&self, buffer: *mut c_char) {
        if self.release(buffer as usize, Allocation::Profile) {
            drop(CString::from_raw(buffer));
            self.state.lock().stats.profiles_freed += 1;
        }
    }

    unsafe fn new_tensor(
        &self,
        data: *const c_void,
        shape: *const i64,
        ndim: c_int,
        dtype: NativeDType,
        _device: DeviceKind,
    ) -> TensorHandle {
        let dims: Vec<i64> = match ndim {
            0 => Vec::new(),
            n if n < 0 || shape.is_null() => {
                self.set_error(format!("invalid tensor rank {}", n));
                return std::ptr::null_mut();
            }
            n => std::slice::from_raw_parts(shape, n as usize).to_vec(),
        };
        if dims.iter().any(|&d| d < 0) {
            self.set_error(format!("invalid tensor shape {:?}", dims));
            return std::ptr::null_mut();
        }
        let Some(size) = dtype.element_size() else {
            self.set_error(format!("unsupported tensor type {}", dtype));
            return std::ptr::null_mut();
        };

        let nbytes = dims
            .iter()
            .try_fold(size, |acc, &d| usize::try_from(d).ok().and_then(|d| acc.checked_mul(d)));
        let Some(nbytes) = nbytes else {
            self.set_error(format!("tensor shape {:?} overflows", dims));
            return std::ptr::null_mut();
        };
        let bytes = if nbytes == 0 {
            Vec::new()
        } else if data.is_null() {
            self.set_error("tensor data is null");
            return std::ptr::null_mut();
        } else {
            std::slice::from_raw_parts(data as *const u8, nbytes).to_vec()
        };

        self.alloc_tensor(SimTensor {
            dtype,
            shape: dims,
            bytes,
        })
    }

    unsafe fn tensor_data(&self, tensor: TensorHandle) -> *const c_void {
        match self.live_tensor(tensor) {
            Some(t) => t.bytes.as_ptr() as *const c_void,
            None => std::ptr::null(),
        }
    }

    unsafe fn tensor_shape(&self, tensor: TensorHandle, ndim: *mut i64) -> *const i64 {
        match self.live_tensor(tensor) {
            Some(t) => {
                *ndim = t.shape.len() as i64;
                t.shape.as_ptr()
            }
            None => {
                *ndim = 0;
                std::ptr::null()
            }
        }
    }

    unsafe fn tensor_dtype(&self, tensor: TensorHandle) -> NativeDType {
        self.live_tensor(tensor).map(|t| t.dtype).unwrap_or(NativeDType::Unknown)
    }

    unsafe fn delete_tensor(&self, tensor: TensorHandle) {
        if self.release(tensor as usize, Allocation::Tensor) {
            drop(Box::from_raw(tensor as *mut SimTensor));
            self.state.lock().stats.tensors_released += 1;
        }
    }

    unsafe fn free_tuple_values(&self, values: *mut RawIValue, len: usize) {
        if values.is_null() {
            // Empty tuples carry no child array
            let mut state = self.state.lock();
            if len == 0 {
                state.stats.tuple_values_freed += 1;
            } else {
                state.stats.invalid_frees += 1;
            }
            return;
        }
        if self.release(values as usize, Allocation::TupleValues(len)) {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(values, len)));
            self.state.lock().stats.tuple_values_freed += 1;
        }
    }

    unsafe fn free_tuple(&self, tuple: *mut RawIValueTuple) {
        if self.release(tuple as usize, Allocation::Tuple) {
            drop(Box::from_raw(tuple));
            self.state.lock().stats.tuples_freed += 1;
        }
    }
}
