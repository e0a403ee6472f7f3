pub mod quantization;

pub use quantization::AqlmOps;
