//! Dense host tensors
//!
//! A [`Tensor`] is an `ndarray` array of one of the element types the native
//! engine can exchange. Conversion to and from native descriptors lives in
//! [`marshal`].

pub mod marshal;

use crate::error::MarshalError;
use crate::native::NativeDType;
use ndarray::{Array, ArrayD, Dimension, IxDyn};
use std::fmt;

pub use marshal::{checked_flattened_length, decode, encode, encode_raw, flattened_length, EncodedTensor};

/// Host element types with a native mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Uint8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    pub const ALL: [DType; 7] = [
        DType::Uint8,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::Float32,
        DType::Float64,
    ];

    /// Native tag for this element type
    pub fn to_native(self) -> NativeDType {
        match self {
            DType::Uint8 => NativeDType::Byte,
            DType::Int8 => NativeDType::Char,
            DType::Int16 => NativeDType::Short,
            DType::Int32 => NativeDType::Int,
            DType::Int64 => NativeDType::Long,
            DType::Float32 => NativeDType::Float,
            DType::Float64 => NativeDType::Double,
        }
    }

    /// Host element type for a native tag, `None` when the host has no mapping
    pub fn from_native(dtype: NativeDType) -> Option<Self> {
        match dtype {
            NativeDType::Byte => Some(DType::Uint8),
            NativeDType::Char => Some(DType::Int8),
            NativeDType::Short => Some(DType::Int16),
            NativeDType::Int => Some(DType::Int32),
            NativeDType::Long => Some(DType::Int64),
            NativeDType::Float => Some(DType::Float32),
            NativeDType::Double => Some(DType::Float64),
            NativeDType::Half | NativeDType::Unknown => None,
        }
    }

    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DType::Uint8 | DType::Int8 => 1,
            DType::Int16 => 2,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Uint8 => write!(f, "uint8"),
            DType::Int8 => write!(f, "int8"),
            DType::Int16 => write!(f, "int16"),
            DType::Int32 => write!(f, "int32"),
            DType::Int64 => write!(f, "int64"),
            DType::Float32 => write!(f, "float32"),
            DType::Float64 => write!(f, "float64"),
        }
    }
}

/// Dense multi-dimensional array exchanged with the native engine
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Uint8(ArrayD<u8>),
    Int8(ArrayD<i8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

macro_rules! with_array {
    ($tensor:expr, $arr:ident => $body:expr) => {
        match $tensor {
            Tensor::Uint8($arr) => $body,
            Tensor::Int8($arr) => $body,
            Tensor::Int16($arr) => $body,
            Tensor::Int32($arr) => $body,
            Tensor::Int64($arr) => $body,
            Tensor::Float32($arr) => $body,
            Tensor::Float64($arr) => $body,
        }
    };
}

impl Tensor {
    pub fn dtype(&self) -> DType {
        match self {
            Tensor::Uint8(_) => DType::Uint8,
            Tensor::Int8(_) => DType::Int8,
            Tensor::Int16(_) => DType::Int16,
            Tensor::Int32(_) => DType::Int32,
            Tensor::Int64(_) => DType::Int64,
            Tensor::Float32(_) => DType::Float32,
            Tensor::Float64(_) => DType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn num_elements(&self) -> usize {
        with_array!(self, a => a.len())
    }

    /// Whether the backing buffer is contiguous in row-major order
    pub fn is_dense(&self) -> bool {
        with_array!(self, a => a.is_standard_layout())
    }

    /// Backing buffer as bytes, `None` for non-dense arrays
    pub fn as_bytes(&self) -> Option<&[u8]> {
        with_array!(self, a => a.as_slice().map(|s| bytemuck::cast_slice(s)))
    }

    /// Build a tensor by copying a flat byte buffer
    pub fn from_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> Result<Self, MarshalError> {
        let expected = marshal::checked_byte_length(shape, dtype.size())
            .ok_or_else(|| MarshalError::InvalidShape(shape.iter().map(|&d| d as i64).collect()))?;
        if bytes.len() != expected {
            return Err(MarshalError::LengthMismatch {
                shape: shape.to_vec(),
                dtype: dtype.to_string(),
                expected,
                actual: bytes.len(),
            });
        }

        fn build<T: Element>(shape: &[usize], bytes: &[u8]) -> Result<Tensor, MarshalError> {
            // pod_collect_to_vec copies, so unaligned native buffers are fine
            let data: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
            ArrayD::from_shape_vec(IxDyn(shape), data)
                .map(T::into_tensor)
                .map_err(|_| MarshalError::InvalidShape(shape.iter().map(|&d| d as i64).collect()))
        }

        match dtype {
            DType::Uint8 => build::<u8>(shape, bytes),
            DType::Int8 => build::<i8>(shape, bytes),
            DType::Int16 => build::<i16>(shape, bytes),
            DType::Int32 => build::<i32>(shape, bytes),
            DType::Int64 => build::<i64>(shape, bytes),
            DType::Float32 => build::<f32>(shape, bytes),
            DType::Float64 => build::<f64>(shape, bytes),
        }
    }

    /// Borrow the typed array if the element type matches
    pub fn array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::from_tensor(self)
    }

    /// Copy into a row-major layout, making any strided view dense
    pub fn to_dense(&self) -> Tensor {
        with_array!(self, a => a.as_standard_layout().into_owned().into())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Element types that can back a [`Tensor`]
pub trait Element: bytemuck::Pod + fmt::Debug + Send + Sync + 'static + sealed::Sealed {
    const DTYPE: DType;

    fn into_tensor(array: ArrayD<Self>) -> Tensor;

    fn from_tensor(tensor: &Tensor) -> Option<&ArrayD<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn into_tensor(array: ArrayD<Self>) -> Tensor {
                Tensor::$variant(array)
            }

            fn from_tensor(tensor: &Tensor) -> Option<&ArrayD<Self>> {
                match tensor {
                    Tensor::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(u8, Uint8);
impl_element!(i8, Int8);
impl_element!(i16, Int16);
impl_element!(i32, Int32);
impl_element!(i64, Int64);
impl_element!(f32, Float32);
impl_element!(f64, Float64);

impl<T: Element, D: Dimension> From<Array<T, D>> for Tensor {
    fn from(array: Array<T, D>) -> Self {
        T::into_tensor(array.into_dyn())
    }
}
