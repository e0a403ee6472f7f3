pub mod aqlm_gemm;

pub use aqlm_gemm::AqlmGemmOps;
