use bytemuck::Pod;
use derive_more::Display;
use half::f16;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DType {
    #[display("i8")]
    Int8,
    #[display("i16")]
    Int16,
    #[display("i32")]
    Int32,
    #[display("i64")]
    Int64,
    #[display("u8")]
    Uint8,
    #[display("u16")]
    Uint16,
    #[display("u32")]
    Uint32,
    #[display("u64")]
    Uint64,
    #[display("f16")]
    Float16,
    #[display("f32")]
    Float32,
    #[display("f64")]
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size(self) -> u64 {
        match self {
            DType::Int8 | DType::Uint8 => 1,
            DType::Int16 | DType::Uint16 | DType::Float16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 => 8,
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Rust types that can be stored as tensor elements.
pub trait Scalar: Sized + Pod + Send + Sync + sealed::Sealed {
    const DTYPE: DType;
}

macro_rules! impl_scalar {
    ($ty:ty, $dtype:ident) => {
        impl sealed::Sealed for $ty {}

        impl Scalar for $ty {
            const DTYPE: DType = DType::$dtype;
        }
    };
}

impl_scalar!(i8, Int8);
impl_scalar!(i16, Int16);
impl_scalar!(i32, Int32);
impl_scalar!(i64, Int64);
impl_scalar!(u8, Uint8);
impl_scalar!(u16, Uint16);
impl_scalar!(u32, Uint32);
impl_scalar!(u64, Uint64);
impl_scalar!(f16, Float16);
impl_scalar!(f32, Float32);
impl_scalar!(f64, Float64);
