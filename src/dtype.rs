//! Element type tags and the scalar types bound to them.

use std::fmt;

use bytemuck::Pod;
use num_traits::NumCast;

use crate::{NArrayError, Result};

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
        }
    }

    /// Whether the type holds integers.
    pub fn is_integer(self) -> bool {
        !matches!(self, DType::Float32 | DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Int8 => "Int8",
            DType::Int16 => "Int16",
            DType::Int32 => "Int32",
            DType::Int64 => "Int64",
            DType::UInt8 => "UInt8",
            DType::UInt16 => "UInt16",
            DType::UInt32 => "UInt32",
            DType::UInt64 => "UInt64",
            DType::Float32 => "Float32",
            DType::Float64 => "Float64",
        };
        f.write_str(name)
    }
}

/// A Rust scalar type that can be stored in an array.
pub trait Element: Pod + NumCast + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The tag this type is stored under.
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($t:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$tag;
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// Bind `$t` to the Rust type stored under `$dtype` and evaluate `$body`.
macro_rules! with_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::DType::Int8 => {
                type $t = i8;
                $body
            }
            $crate::DType::Int16 => {
                type $t = i16;
                $body
            }
            $crate::DType::Int32 => {
                type $t = i32;
                $body
            }
            $crate::DType::Int64 => {
                type $t = i64;
                $body
            }
            $crate::DType::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::DType::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::DType::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::DType::UInt64 => {
                type $t = u64;
                $body
            }
            $crate::DType::Float32 => {
                type $t = f32;
                $body
            }
            $crate::DType::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}
pub(crate) use with_dtype;

/// Read one element stored at `offset` in `bytes`.
#[inline]
pub(crate) fn read_element<T: Element>(bytes: &[u8], offset: usize) -> T {
    bytemuck::pod_read_unaligned(&bytes[offset..offset + std::mem::size_of::<T>()])
}

/// Write one element at `offset` in `bytes`.
#[inline]
pub(crate) fn write_element<T: Element>(bytes: &mut [u8], offset: usize, value: T) {
    bytes[offset..offset + std::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
}

/// Convert a scalar between element types, failing when the value does not fit.
pub(crate) fn convert<S: Element, D: Element>(value: S) -> Result<D> {
    num_traits::cast::<S, D>(value).ok_or_else(|| {
        NArrayError::TypeError(format!(
            "fail cast from {} to {}: {:?} is not representable",
            S::DTYPE,
            D::DTYPE,
            value
        ))
    })
}

/// Convert an `f64` initial value into the byte representation of `dtype`.
pub(crate) fn encode_f64(dtype: DType, value: f64) -> Result<Vec<u8>> {
    with_dtype!(dtype, T => {
        let v: T = convert::<f64, T>(value)?;
        Ok(bytemuck::bytes_of(&v).to_vec())
    })
}
