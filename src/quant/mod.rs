pub mod aqlm;
pub mod cpu;
pub mod traits;

pub use aqlm::{AqlmConfig, AqlmLinearMethod, AqlmPath, AqlmWeights};
pub use traits::AqlmGemmOps;
