//! AQLM (Additive Quantization of Language Models)
//!
//! Each weight group of `out_group_size × in_group_size` elements is encoded
//! as `num_codebooks` integer codes; the group is reconstructed as the sum of
//! the selected codebook atoms times a per-output-group scale.

pub mod config;
pub mod linear;
pub mod path;
pub mod storage;
pub mod weights;

pub use config::AqlmConfig;
pub use linear::AqlmLinearMethod;
pub use path::{AqlmPath, FUSED_GEMV_MAX_BATCH, select_path};
pub use storage::CodeStorage;
pub use weights::{AqlmWeights, WeightAttrs};
