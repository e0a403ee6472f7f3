pub mod aqlm_gemm;
