//! CPU quantized kernels

mod aqlm_gemm;
pub mod kernels;
