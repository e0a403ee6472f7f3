//! # aqlm
//!
//! **AQLM decode-and-multiply engine built on numr.**
//!
//! AQLM (Additive Quantization of Language Models) stores a weight matrix as
//! small integer codes into a set of learned vector codebooks. This crate
//! reconstructs dense weights from that representation and multiplies
//! activations against them.
//!
//! ## Design
//!
//! - **Extension traits**: [`AqlmOps`] (unpack, decode, dequantize-then-multiply)
//!   and [`AqlmGemmOps`] (fused kernel) implemented on numr's clients
//! - **impl_generic**: decode composed from numr primitives, same on all backends
//! - **Custom kernels**: fused CPU kernel that decodes one weight row at a time
//! - **Path selection**: [`AqlmLinearMethod`] picks the fused kernel for small
//!   batches and the partitioned dequantize path otherwise
//!
//! ```text
//! codes (i8/i16/i32/i64) ──unpack──► codes mod 2^nbits
//!                                   │
//!      codebooks [C, K, og, ig] ────┴──decode──► W [out, in] ──matmul──► y
//! ```

pub mod error;
pub mod ops;
pub mod quant;

// Re-export primary traits and types
pub use error::{Error, Result};
pub use ops::{AqlmOps, var_aqlm_dequantize};
pub use quant::aqlm::{
    AqlmConfig, AqlmLinearMethod, AqlmPath, AqlmWeights, CodeStorage, FUSED_GEMV_MAX_BATCH,
    WeightAttrs, select_path,
};
pub use quant::traits::AqlmGemmOps;

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
