//! Typed numeric arrays.
//!
//! A [`TypedArray`] is the native form of a bulk numeric column. Its
//! element type is one of the eight dtypes the wire format knows about.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Element type of a typed array, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
}

impl DType {
    /// Width of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "uint8" => Ok(Self::Uint8),
            "int8" => Ok(Self::Int8),
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "uint32" => Ok(Self::Uint32),
            "int32" => Ok(Self::Int32),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            other => Err(Error::InvalidDType(other.to_string())),
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte order of a binary payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running platform.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// Reverse the bytes of every `width`-byte element of `bytes` in place.
///
/// Widths of 1 are a no-op. Trailing bytes that do not form a whole
/// element are left untouched.
pub fn swap_in_place(bytes: &mut [u8], width: usize) {
    if width < 2 {
        return;
    }
    for chunk in bytes.chunks_exact_mut(width) {
        chunk.reverse();
    }
}

/// A flat, homogeneously typed numeric array.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Uint16(Vec<u16>),
    Int16(Vec<i16>),
    Uint32(Vec<u32>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

macro_rules! each_variant {
    ($value:expr, $v:ident => $body:expr) => {
        match $value {
            TypedArray::Uint8($v) => $body,
            TypedArray::Int8($v) => $body,
            TypedArray::Uint16($v) => $body,
            TypedArray::Int16($v) => $body,
            TypedArray::Uint32($v) => $body,
            TypedArray::Int32($v) => $body,
            TypedArray::Float32($v) => $body,
            TypedArray::Float64($v) => $body,
        }
    };
}

impl TypedArray {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Uint8(_) => DType::Uint8,
            Self::Int8(_) => DType::Int8,
            Self::Uint16(_) => DType::Uint16,
            Self::Int16(_) => DType::Int16,
            Self::Uint32(_) => DType::Uint32,
            Self::Int32(_) => DType::Int32,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty array of the given dtype.
    pub fn empty(dtype: DType) -> Self {
        Self::from_f64(dtype, &[])
    }

    /// Build an array of `dtype` from floating point values, casting each.
    pub fn from_f64(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::Uint8 => Self::Uint8(values.iter().map(|&x| x as u8).collect()),
            DType::Int8 => Self::Int8(values.iter().map(|&x| x as i8).collect()),
            DType::Uint16 => Self::Uint16(values.iter().map(|&x| x as u16).collect()),
            DType::Int16 => Self::Int16(values.iter().map(|&x| x as i16).collect()),
            DType::Uint32 => Self::Uint32(values.iter().map(|&x| x as u32).collect()),
            DType::Int32 => Self::Int32(values.iter().map(|&x| x as i32).collect()),
            DType::Float32 => Self::Float32(values.iter().map(|&x| x as f32).collect()),
            DType::Float64 => Self::Float64(values.to_vec()),
        }
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        each_variant!(self, v => v.get(index).map(|&x| x as f64))
    }

    /// Overwrite one element, casting `value` to the element type.
    /// Returns `false` when `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: f64) -> bool {
        match self {
            Self::Uint8(v) => v.get_mut(index).map(|x| *x = value as u8).is_some(),
            Self::Int8(v) => v.get_mut(index).map(|x| *x = value as i8).is_some(),
            Self::Uint16(v) => v.get_mut(index).map(|x| *x = value as u16).is_some(),
            Self::Int16(v) => v.get_mut(index).map(|x| *x = value as i16).is_some(),
            Self::Uint32(v) => v.get_mut(index).map(|x| *x = value as u32).is_some(),
            Self::Int32(v) => v.get_mut(index).map(|x| *x = value as i32).is_some(),
            Self::Float32(v) => v.get_mut(index).map(|x| *x = value as f32).is_some(),
            Self::Float64(v) => v.get_mut(index).map(|x| *x = value).is_some(),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        each_variant!(self, v => v.iter().map(|&x| x as f64).collect())
    }

    /// Append values, casting them to the element type.
    pub fn extend_from_f64(&mut self, values: &[f64]) {
        match self {
            Self::Uint8(v) => v.extend(values.iter().map(|&x| x as u8)),
            Self::Int8(v) => v.extend(values.iter().map(|&x| x as i8)),
            Self::Uint16(v) => v.extend(values.iter().map(|&x| x as u16)),
            Self::Int16(v) => v.extend(values.iter().map(|&x| x as i16)),
            Self::Uint32(v) => v.extend(values.iter().map(|&x| x as u32)),
            Self::Int32(v) => v.extend(values.iter().map(|&x| x as i32)),
            Self::Float32(v) => v.extend(values.iter().map(|&x| x as f32)),
            Self::Float64(v) => v.extend_from_slice(values),
        }
    }

    /// Drop the first `n` elements (or all of them if `n >= len`).
    pub fn drain_front(&mut self, n: usize) {
        each_variant!(self, v => {
            let n = n.min(v.len());
            v.drain(..n);
        })
    }

    /// Raw element bytes in platform byte order.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        each_variant!(self, v => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec())
    }

    /// Reinterpret platform-order bytes as an array of `dtype`.
    ///
    /// `bytes` need not be aligned for the element type.
    pub fn from_ne_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.item_size() != 0 {
            return Err(Error::InvalidPayload(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(match dtype {
            DType::Uint8 => Self::Uint8(bytes.to_vec()),
            DType::Int8 => Self::Int8(bytemuck::pod_collect_to_vec(bytes)),
            DType::Uint16 => Self::Uint16(bytemuck::pod_collect_to_vec(bytes)),
            DType::Int16 => Self::Int16(bytemuck::pod_collect_to_vec(bytes)),
            DType::Uint32 => Self::Uint32(bytemuck::pod_collect_to_vec(bytes)),
            DType::Int32 => Self::Int32(bytemuck::pod_collect_to_vec(bytes)),
            DType::Float32 => Self::Float32(bytemuck::pod_collect_to_vec(bytes)),
            DType::Float64 => Self::Float64(bytemuck::pod_collect_to_vec(bytes)),
        })
    }

    /// Element bytes in the requested byte order.
    pub fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        let mut bytes = self.to_ne_bytes();
        if order != ByteOrder::native() {
            swap_in_place(&mut bytes, self.dtype().item_size());
        }
        bytes
    }

    /// Decode bytes written in `order`, swapping to platform order first.
    pub fn from_bytes(dtype: DType, mut bytes: Vec<u8>, order: ByteOrder) -> Result<Self> {
        if order != ByteOrder::native() {
            swap_in_place(&mut bytes, dtype.item_size());
        }
        Self::from_ne_bytes(dtype, &bytes)
    }
}

macro_rules! impl_from_vec {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for TypedArray {
                fn from(v: Vec<$ty>) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_vec! {
    u8 => Uint8,
    i8 => Int8,
    u16 => Uint16,
    i16 => Int16,
    u32 => Uint32,
    i32 => Int32,
    f32 => Float32,
    f64 => Float64,
}
