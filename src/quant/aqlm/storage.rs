//! Code storage widths and the packed-code arithmetic contract
//!
//! AQLM codes are unsigned indices in `[0, 2^nbits)` but are stored in the
//! smallest *signed* integer type that holds `nbits` bits. A 16-bit codebook
//! index of 40000 therefore lives in an `i16` as -25536. Unpacking is modular
//! reduction in a wide (i128) domain:
//!
//! ```text
//! code = stored mod 2^nbits      (Euclidean, always non-negative)
//! ```
//!
//! The domain is wide enough that neither the sign extension of the storage
//! type nor `nbits == 64` can overflow.

use crate::error::{Error, Result};
use numr::dtype::DType;
use std::fmt;

/// Largest supported bits per codebook index.
pub const MAX_CODE_BITS: u32 = 64;

/// Signed integer width used to store packed codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeStorage {
    I8,
    I16,
    I32,
    I64,
}

impl CodeStorage {
    /// Smallest storage width that holds `nbits`-bit codes.
    ///
    /// # Errors
    ///
    /// `Error::Config` when `nbits` is 0 or exceeds [`MAX_CODE_BITS`].
    pub fn for_bits(nbits: u32) -> Result<Self> {
        match nbits {
            1..=8 => Ok(Self::I8),
            9..=16 => Ok(Self::I16),
            17..=32 => Ok(Self::I32),
            33..=64 => Ok(Self::I64),
            _ => Err(Error::Config {
                reason: format!("no dtype available for {nbits}-bit codebooks"),
            }),
        }
    }

    /// Storage width in bits
    pub fn bits(self) -> u32 {
        match self {
            Self::I8 => 8,
            Self::I16 => 16,
            Self::I32 => 32,
            Self::I64 => 64,
        }
    }

    /// numr dtype of the codes tensor
    pub fn dtype(self) -> DType {
        match self {
            Self::I8 => DType::I8,
            Self::I16 => DType::I16,
            Self::I32 => DType::I32,
            Self::I64 => DType::I64,
        }
    }

    /// Storage width matching an existing codes tensor dtype.
    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::I8 => Ok(Self::I8),
            DType::I16 => Ok(Self::I16),
            DType::I32 => Ok(Self::I32),
            DType::I64 => Ok(Self::I64),
            other => Err(Error::InvalidArgument {
                arg: "codes",
                reason: format!("codes must be a signed integer tensor, got {other:?}"),
            }),
        }
    }
}

impl fmt::Display for CodeStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

/// Unpack a stored code into its unsigned `nbits`-bit value.
#[inline(always)]
pub fn unpack_code(stored: i64, nbits: u32) -> u64 {
    debug_assert!((1..=MAX_CODE_BITS).contains(&nbits));
    (stored as i128).rem_euclid(1i128 << nbits) as u64
}

/// Pack an unsigned `nbits`-bit code into the given storage width.
///
/// The returned value is the storage-typed integer widened to i64, i.e. what
/// reading the packed element back as a signed integer yields.
pub fn pack_code(value: u64, storage: CodeStorage) -> i64 {
    match storage {
        CodeStorage::I8 => value as u8 as i8 as i64,
        CodeStorage::I16 => value as u16 as i16 as i64,
        CodeStorage::I32 => value as u32 as i32 as i64,
        CodeStorage::I64 => value as i64,
    }
}

/// Host integer types that can hold packed codes.
pub trait PackedCode: Copy + Send + Sync {
    /// Widen to i64 with sign extension
    fn widen(self) -> i64;

    /// Unsigned code value for `nbits`-bit codebooks
    #[inline(always)]
    fn code(self, nbits: u32) -> usize {
        unpack_code(self.widen(), nbits) as usize
    }
}

macro_rules! impl_packed_code {
    ($($t:ty),*) => {
        $(
            impl PackedCode for $t {
                #[inline(always)]
                fn widen(self) -> i64 {
                    self as i64
                }
            }
        )*
    };
}

impl_packed_code!(i8, i16, i32, i64);
