// Bindings to the C bridge over libtorch (libtorchpred_bridge).
//
// The bridge catches every C++ exception and parks its message in a global
// error slot; `take_error` reads and resets that slot.

use super::{DeviceKind, NativeApi, NativeDType, PredictorHandle, RawIValue, RawIValueTuple, TensorHandle};
use std::ffi::{c_char, c_int, c_void, CStr};

#[link(name = "torchpred_bridge")]
extern "C" {
    fn Torch_NewPredictor(model_file: *const c_char, device: DeviceKind, profiling_enabled: bool) -> PredictorHandle;
    fn Torch_PredictorRun(pred: PredictorHandle, inputs: *const TensorHandle, len: c_int);
    fn Torch_PredictorNumOutputs(pred: PredictorHandle) -> c_int;
    fn Torch_PredictorGetOutput(pred: PredictorHandle) -> RawIValue;
    fn Torch_PredictorDelete(pred: PredictorHandle);

    fn Torch_ProfilingRead(pred: PredictorHandle) -> *mut c_char;
    fn Torch_ProfilingGetStartTime(pred: PredictorHandle) -> i64;

    fn Torch_NewTensor(
        data: *const c_void,
        shape: *const i64,
        ndim: c_int,
        dtype: c_int,
        device: DeviceKind,
    ) -> TensorHandle;
    fn Torch_TensorValue(tensor: TensorHandle) -> *const c_void;
    fn Torch_TensorShape(tensor: TensorHandle, ndim: *mut i64) -> *const i64;
    fn Torch_TensorType(tensor: TensorHandle) -> c_int;
    fn Torch_DeleteTensor(tensor: TensorHandle);

    fn Torch_HasError() -> bool;
    fn Torch_GetErrorString() -> *const c_char;
    fn Torch_ResetError();

    fn Torch_IsCudaAvailable() -> bool;
}

/// Engine backed by libtorch through the C bridge
#[derive(Debug, Default, Clone, Copy)]
pub struct LibTorch;

impl LibTorch {
    pub fn new() -> Self {
        Self
    }
}

impl NativeApi for LibTorch {
    fn name(&self) -> &'static str {
        "libtorch"
    }

    fn cuda_available(&self) -> bool {
        unsafe { Torch_IsCudaAvailable() }
    }

    fn take_error(&self) -> Option<String> {
        unsafe {
            if !Torch_HasError() {
                return None;
            }
            let msg = Torch_GetErrorString();
            let message = if msg.is_null() {
                "unknown native error".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            };
            Torch_ResetError();
            Some(message)
        }
    }

    fn new_predictor(&self, model_file: &CStr, device: DeviceKind, profiling_enabled: bool) -> PredictorHandle {
        unsafe { Torch_NewPredictor(model_file.as_ptr(), device, profiling_enabled) }
    }

    unsafe fn predictor_run(&self, pred: PredictorHandle, inputs: *const TensorHandle, len: c_int) {
        Torch_PredictorRun(pred, inputs, len)
    }

    unsafe fn predictor_num_outputs(&self, pred: PredictorHandle) -> c_int {
        Torch_PredictorNumOutputs(pred)
    }

    unsafe fn predictor_output(&self, pred: PredictorHandle) -> RawIValue {
        Torch_PredictorGetOutput(pred)
    }

    unsafe fn delete_predictor(&self, pred: PredictorHandle) {
        Torch_PredictorDelete(pred)
    }

    unsafe fn profiling_read(&self, pred: PredictorHandle) -> *mut c_char {
        Torch_ProfilingRead(pred)
    }

    unsafe fn profiling_start_time(&self, pred: PredictorHandle) -> i64 {
        Torch_ProfilingGetStartTime(pred)
    }

    // The bridge hands out strdup'd buffers
    unsafe fn free_profile(&self, buffer: *mut c_char) {
        libc::free(buffer as *mut c_void)
    }

    unsafe fn new_tensor(
        &self,
        data: *const c_void,
        shape: *const i64,
        ndim: c_int,
        dtype: NativeDType,
        device: DeviceKind,
    ) -> TensorHandle {
        Torch_NewTensor(data, shape, ndim, dtype as c_int, device)
    }

    unsafe fn tensor_data(&self, tensor: TensorHandle) -> *const c_void {
        Torch_TensorValue(tensor)
    }

    unsafe fn tensor_shape(&self, tensor: TensorHandle, ndim: *mut i64) -> *const i64 {
        Torch_TensorShape(tensor, ndim)
    }

    unsafe fn tensor_dtype(&self, tensor: TensorHandle) -> NativeDType {
        NativeDType::from_raw(Torch_TensorType(tensor))
    }

    unsafe fn delete_tensor(&self, tensor: TensorHandle) {
        Torch_DeleteTensor(tensor)
    }

    // Tuple scaffolding is malloc'd by the bridge
    unsafe fn free_tuple_values(&self, values: *mut RawIValue, _len: usize) {
        libc::free(values as *mut c_void)
    }

    unsafe fn free_tuple(&self, tuple: *mut RawIValueTuple) {
        libc::free(tuple as *mut c_void)
    }
}
