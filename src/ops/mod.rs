pub mod cpu;
pub mod impl_generic;
pub mod traits;

pub use impl_generic::quantization::aqlm::var_aqlm_dequantize;
pub use traits::AqlmOps;
