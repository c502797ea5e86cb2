//! Native engine boundary
//!
//! The inference engine is consumed only through the opaque-handle contract
//! described by [`NativeApi`]. Two engines implement it:
//! - [`LibTorch`]: `extern "C"` bindings to the libtorch bridge (feature `libtorch`)
//! - [`SimRuntime`]: an in-process engine that audits every allocation
//!
//! Raw types here are `#[repr(C)]` and match the bridge header layout.

use crate::error::NativeCallError;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;

#[cfg(feature = "libtorch")]
mod libtorch;
pub mod sim;

#[cfg(feature = "libtorch")]
pub use libtorch::LibTorch;
pub use sim::{OutputLayout, SimModel, SimRuntime, SimStats, SimTensor, SimValue};

/// Opaque handle to a native predictor
pub type PredictorHandle = *mut c_void;

/// Opaque handle to a native tensor
pub type TensorHandle = *mut c_void;

/// Element type tags understood by the native engine
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeDType {
    Unknown = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Half = 6,
    Float = 7,
    Double = 8,
}

impl NativeDType {
    /// Convert a raw tag coming back across the boundary
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            1 => Self::Byte,
            2 => Self::Char,
            3 => Self::Short,
            4 => Self::Int,
            5 => Self::Long,
            6 => Self::Half,
            7 => Self::Float,
            8 => Self::Double,
            _ => Self::Unknown,
        }
    }

    /// Size of one element in bytes, `None` for `Unknown`
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Self::Byte | Self::Char => Some(1),
            Self::Short | Self::Half => Some(2),
            Self::Int | Self::Float => Some(4),
            Self::Long | Self::Double => Some(8),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for NativeDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Byte => write!(f, "byte"),
            Self::Char => write!(f, "char"),
            Self::Short => write!(f, "short"),
            Self::Int => write!(f, "int"),
            Self::Long => write!(f, "long"),
            Self::Half => write!(f, "half"),
            Self::Float => write!(f, "float"),
            Self::Double => write!(f, "double"),
        }
    }
}

/// Device the native predictor executes on
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu = 0,
    Cuda = 1,
}

/// Tag of a [`RawIValue`]
pub const IVALUE_UNKNOWN: c_int = 0;
pub const IVALUE_TENSOR: c_int = 1;
pub const IVALUE_TUPLE: c_int = 2;

/// Polymorphic result value as laid out by the bridge.
///
/// `data_ptr` is a [`TensorHandle`] for tensors and a `*mut RawIValueTuple`
/// for tuples.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawIValue {
    pub itype: c_int,
    pub data_ptr: *mut c_void,
}

impl RawIValue {
    /// The untyped value returned when the engine has nothing to give
    pub fn unknown() -> Self {
        Self {
            itype: IVALUE_UNKNOWN,
            data_ptr: std::ptr::null_mut(),
        }
    }
}

impl Default for RawIValue {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Tuple scaffolding: a separately allocated array of children
#[repr(C)]
#[derive(Debug)]
pub struct RawIValueTuple {
    pub values: *mut RawIValue,
    pub length: i64,
}

/// Opaque create/run/read/destroy contract of the inference engine.
///
/// Every call may leave a message in the engine's last-error slot; callers
/// drain it with [`NativeApi::take_error`] right after the call.
///
/// # Safety
///
/// The `unsafe` methods take raw handles. Callers must pass handles that were
/// produced by the same engine instance and have not been released yet.
pub trait NativeApi: Send + Sync {
    /// Short engine name used in logs
    fn name(&self) -> &'static str;

    /// Whether a CUDA device can be targeted
    fn cuda_available(&self) -> bool;

    /// Take and clear the last error recorded by the engine
    fn take_error(&self) -> Option<String>;

    fn new_predictor(
        &self,
        model_file: &CStr,
        device: DeviceKind,
        profiling_enabled: bool,
    ) -> PredictorHandle;

    unsafe fn predictor_run(&self, pred: PredictorHandle, inputs: *const TensorHandle, len: c_int);

    unsafe fn predictor_num_outputs(&self, pred: PredictorHandle) -> c_int;

    unsafe fn predictor_output(&self, pred: PredictorHandle) -> RawIValue;

    unsafe fn delete_predictor(&self, pred: PredictorHandle);

    /// Drain the profiler; the returned buffer must go back through [`NativeApi::free_profile`]
    unsafe fn profiling_read(&self, pred: PredictorHandle) -> *mut c_char;

    unsafe fn profiling_start_time(&self, pred: PredictorHandle) -> i64;

    unsafe fn free_profile(&self, buffer: *mut c_char);

    unsafe fn new_tensor(
        &self,
        data: *const c_void,
        shape: *const i64,
        ndim: c_int,
        dtype: NativeDType,
        device: DeviceKind,
    ) -> TensorHandle;

    unsafe fn tensor_data(&self, tensor: TensorHandle) -> *const c_void;

    unsafe fn tensor_shape(&self, tensor: TensorHandle, ndim: *mut i64) -> *const i64;

    unsafe fn tensor_dtype(&self, tensor: TensorHandle) -> NativeDType;

    unsafe fn delete_tensor(&self, tensor: TensorHandle);

    /// Release the child array of a tuple (not the children themselves)
    unsafe fn free_tuple_values(&self, values: *mut RawIValue, len: usize);

    /// Release the tuple node itself
    unsafe fn free_tuple(&self, tuple: *mut RawIValueTuple);
}

/// Convert the engine's last-error slot into a `Result`.
///
/// Called immediately after every native call.
pub fn check(api: &dyn NativeApi, call: &'static str) -> Result<(), NativeCallError> {
    match api.take_error() {
        Some(message) => {
            log::debug!("{} call {} failed: {}", api.name(), call, message);
            Err(NativeCallError::new(call, message))
        }
        None => Ok(()),
    }
}
