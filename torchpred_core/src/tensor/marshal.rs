//! Conversion between host tensors and native tensor descriptors

use super::{DType, Tensor};
use crate::error::{MarshalError, NativeCallError, PredictorResult};
use crate::native::{self, DeviceKind, NativeApi, NativeDType, TensorHandle};
use std::ffi::{c_int, c_void};
use std::marker::PhantomData;

/// Number of elements described by a shape. A scalar (empty shape) holds one.
pub fn flattened_length(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// [`flattened_length`] that returns `None` instead of overflowing
pub fn checked_flattened_length(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Bytes needed by `shape` elements of `elem_size` bytes, `None` on overflow
pub(crate) fn checked_byte_length(shape: &[usize], elem_size: usize) -> Option<usize> {
    checked_flattened_length(shape).and_then(|len| len.checked_mul(elem_size))
}

/// Native tensor descriptor borrowing a host buffer for one native call.
///
/// Released through the engine when dropped, never by the engine itself.
pub struct EncodedTensor<'a> {
    api: &'a dyn NativeApi,
    handle: TensorHandle,
    _buffer: PhantomData<&'a [u8]>,
}

impl EncodedTensor<'_> {
    pub fn handle(&self) -> TensorHandle {
        self.handle
    }
}

impl Drop for EncodedTensor<'_> {
    fn drop(&mut self) {
        unsafe { self.api.delete_tensor(self.handle) };
        if let Err(e) = native::check(self.api, "delete_tensor") {
            log::warn!("failed to release input tensor: {}", e);
        }
    }
}

/// Encode a dense host tensor
pub fn encode<'a>(
    api: &'a dyn NativeApi,
    tensor: &'a Tensor,
    device: DeviceKind,
) -> PredictorResult<EncodedTensor<'a>> {
    let bytes = tensor.as_bytes().ok_or(MarshalError::NotDense { index: 0 })?;
    encode_raw(api, tensor.shape(), bytes, tensor.dtype().to_native(), device)
}

/// Encode a flat byte buffer tagged with a native element type
pub fn encode_raw<'a>(
    api: &'a dyn NativeApi,
    shape: &[usize],
    bytes: &'a [u8],
    dtype: NativeDType,
    device: DeviceKind,
) -> PredictorResult<EncodedTensor<'a>> {
    let host = DType::from_native(dtype).ok_or_else(|| MarshalError::UnsupportedDType(dtype.to_string()))?;

    let expected = checked_byte_length(shape, host.size())
        .ok_or_else(|| MarshalError::InvalidShape(shape.iter().map(|&d| d as i64).collect()))?;
    if bytes.len() != expected {
        return Err(MarshalError::LengthMismatch {
            shape: shape.to_vec(),
            dtype: host.to_string(),
            expected,
            actual: bytes.len(),
        }
        .into());
    }

    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let handle = unsafe {
        api.new_tensor(
            bytes.as_ptr() as *const c_void,
            dims.as_ptr(),
            dims.len() as c_int,
            dtype,
            device,
        )
    };

    let encoded = (!handle.is_null()).then_some(EncodedTensor {
        api,
        handle,
        _buffer: PhantomData,
    });
    // On failure the guard (if any) releases the half-built tensor
    native::check(api, "new_tensor")?;
    encoded.ok_or_else(|| NativeCallError::new("new_tensor", "engine returned a null tensor").into())
}

/// Copy a native tensor into a freshly owned host tensor.
///
/// The descriptor stays owned by the caller.
///
/// # Safety
///
/// `handle` must be a live tensor produced by `api`.
///
/// # Panics
///
/// Panics if the engine reports an element type with no host mapping: the
/// type table is out of sync with the engine.
pub unsafe fn decode(api: &dyn NativeApi, handle: TensorHandle) -> PredictorResult<Tensor> {
    let dtype = api.tensor_dtype(handle);
    native::check(api, "tensor_type")?;
    let host = match DType::from_native(dtype) {
        Some(host) => host,
        None => panic!("invalid data type {}: type table out of sync with the native engine", dtype),
    };

    let mut ndim: i64 = 0;
    let shape_ptr = api.tensor_shape(handle, &mut ndim);
    native::check(api, "tensor_shape")?;
    let dims: &[i64] = match ndim {
        0 => &[],
        n if n < 0 || shape_ptr.is_null() => return Err(MarshalError::InvalidShape(vec![n]).into()),
        n => std::slice::from_raw_parts(shape_ptr, n as usize),
    };
    let shape = dims
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| MarshalError::InvalidShape(dims.to_vec()))?;

    let nbytes = checked_byte_length(&shape, host.size()).ok_or_else(|| MarshalError::InvalidShape(dims.to_vec()))?;
    let data = api.tensor_data(handle);
    native::check(api, "tensor_value")?;
    let bytes: &[u8] = if nbytes == 0 {
        &[]
    } else if data.is_null() {
        return Err(MarshalError::NullData(nbytes / host.size()).into());
    } else {
        std::slice::from_raw_parts(data as *const u8, nbytes)
    };

    Ok(Tensor::from_bytes(host, &shape, bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PredictorError;
    use crate::native::SimRuntime;
    use ndarray::{Array, ArrayD, IxDyn};

    fn sample(dtype: DType) -> Tensor {
        let shape = IxDyn(&[2, 3, 4]);
        match dtype {
            DType::Uint8 => Array::from_shape_fn(shape, |i| (i[2] * 60 + i[0]) as u8).into(),
            DType::Int8 => Array::from_shape_fn(shape, |i| i[1] as i8 - 100).into(),
            DType::Int16 => Array::from_shape_fn(shape, |i| -(i[2] as i16) * 1000).into(),
            DType::Int32 => Array::from_shape_fn(shape, |i| i32::MIN + i[0] as i32).into(),
            DType::Int64 => Array::from_shape_fn(shape, |i| i64::MAX - i[1] as i64).into(),
            DType::Float32 => Array::from_shape_fn(shape, |i| i[2] as f32 / 3.0).into(),
            DType::Float64 => Array::from_shape_fn(shape, |i| f64::EPSILON * i[0] as f64 - 1e300).into(),
        }
    }

    #[test]
    fn test_flattened_length() {
        assert_eq!(flattened_length(&[]), 1);
        assert_eq!(flattened_length(&[2, 3, 4]), 24);
        assert_eq!(flattened_length(&[5, 0, 2]), 0);
        assert_eq!(checked_flattened_length(&[2, 3, 4]), Some(24));
        assert_eq!(checked_flattened_length(&[usize::MAX, 2]), None);
        assert_eq!(checked_flattened_length(&[usize::MAX, 0]), Some(0));
    }

    #[test]
    fn test_decode_overflowing_shape_is_invalid() {
        let sim = SimRuntime::new();
        let handle = sim.alloc_tensor(crate::native::SimTensor {
            dtype: NativeDType::Float,
            shape: vec![1 << 40, 1 << 40],
            bytes: Vec::new(),
        });
        let err = unsafe { decode(&sim, handle) }.unwrap_err();
        assert!(matches!(err, PredictorError::Marshal(MarshalError::InvalidShape(ref dims)) if dims == &[1 << 40, 1 << 40]));

        unsafe { sim.delete_tensor(handle) };
        assert_eq!(sim.stats().invalid_frees, 0);
    }

    #[test]
    fn test_encode_raw_overflowing_shape_is_invalid() {
        let sim = SimRuntime::new();
        let err = encode_raw(&sim, &[usize::MAX, 2], &[], NativeDType::Byte, DeviceKind::Cpu).err().unwrap();
        assert!(matches!(err, PredictorError::Marshal(MarshalError::InvalidShape(_))));
        assert_eq!(sim.stats().tensors_created, 0);
    }

    #[test]
    fn test_encode_decode_every_dtype() {
        let sim = SimRuntime::new();
        for dtype in DType::ALL {
            let original = sample(dtype);
            let encoded = encode(&sim, &original, DeviceKind::Cpu).unwrap();
            let decoded = unsafe { decode(&sim, encoded.handle()) }.unwrap();
            assert_eq!(decoded.dtype(), dtype);
            assert_eq!(decoded.shape(), &[2, 3, 4]);
            assert_eq!(decoded.as_bytes(), original.as_bytes(), "{} bits differ", dtype);

            // And back again from the decoded copy
            let reencoded = encode(&sim, &decoded, DeviceKind::Cpu).unwrap();
            let sim_tensor = sim.tensor(reencoded.handle()).unwrap();
            assert_eq!(sim_tensor.dtype, dtype.to_native());
            assert_eq!(sim_tensor.shape, vec![2, 3, 4]);
            assert_eq!(sim_tensor.bytes.as_slice(), original.as_bytes().unwrap());
        }
        assert_eq!(sim.stats().live_tensors(), 0);
    }

    #[test]
    fn test_decode_scalar() {
        let sim = SimRuntime::new();
        let scalar: Tensor = ArrayD::from_elem(IxDyn(&[]), 2.5f32).into();
        let encoded = encode(&sim, &scalar, DeviceKind::Cpu).unwrap();
        let decoded = unsafe { decode(&sim, encoded.handle()) }.unwrap();
        assert_eq!(decoded.num_elements(), 1);
        assert_eq!(decoded, scalar);
    }

    #[test]
    fn test_encode_raw_rejects_unmapped_dtype() {
        let sim = SimRuntime::new();
        let bytes = [0u8; 8];
        let err = encode_raw(&sim, &[4], &bytes, NativeDType::Half, DeviceKind::Cpu).err().unwrap();
        assert!(matches!(err, PredictorError::Marshal(MarshalError::UnsupportedDType(_))));
        assert_eq!(sim.stats().tensors_created, 0);
    }

    #[test]
    fn test_encode_raw_checks_length() {
        let sim = SimRuntime::new();
        let bytes = [0u8; 7];
        let err = encode_raw(&sim, &[2], &bytes, NativeDType::Int, DeviceKind::Cpu).err().unwrap();
        assert!(matches!(err, PredictorError::Marshal(MarshalError::LengthMismatch { expected: 8, .. })));
    }

    #[test]
    fn test_encoded_tensor_released_on_drop() {
        let sim = SimRuntime::new();
        let t: Tensor = ndarray::arr1(&[1i32, 2, 3]).into();
        {
            let _encoded = encode(&sim, &t, DeviceKind::Cpu).unwrap();
            assert_eq!(sim.stats().live_tensors(), 1);
        }
        let stats = sim.stats();
        assert_eq!(stats.tensors_created, 1);
        assert_eq!(stats.tensors_released, 1);
        assert_eq!(stats.invalid_frees, 0);
    }

    #[test]
    #[should_panic(expected = "invalid data type")]
    fn test_decode_unmapped_dtype_panics() {
        let sim = SimRuntime::new();
        let handle = sim.alloc_tensor(crate::native::SimTensor {
            dtype: NativeDType::Half,
            shape: vec![1],
            bytes: vec![0, 0],
        });
        let _ = unsafe { decode(&sim, handle) };
    }
}
