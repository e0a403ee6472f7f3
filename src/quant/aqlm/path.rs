//! Execution-path selection for AQLM linear layers

use std::fmt;

/// Largest flattened batch served by the fused kernel.
///
/// Below this the multiply is bandwidth bound and decoding on the fly wins;
/// above it a dense GEMM against the decoded weight is faster.
pub const FUSED_GEMV_MAX_BATCH: usize = 32;

/// How an AQLM linear layer computes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AqlmPath {
    /// Fused unpack + decode + multiply kernel
    FusedGemv,
    /// Per-partition dequantize, then dense matmul
    DequantGemm,
}

impl fmt::Display for AqlmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FusedGemv => write!(f, "fused_gemv"),
            Self::DequantGemm => write!(f, "dequant_gemm"),
        }
    }
}

/// Choose the execution path for an input of shape `[..., in_features]`.
///
/// The fused kernel is used when the product of the leading dims is at most
/// [`FUSED_GEMV_MAX_BATCH`], or when the weight carries no partition
/// metadata (the dequantize path needs it to locate each codebook block).
pub fn select_path(input_shape: &[usize], partition_sizes: Option<&[usize]>) -> AqlmPath {
    let batch: usize = input_shape[..input_shape.len().saturating_sub(1)]
        .iter()
        .product();
    let path = if batch <= FUSED_GEMV_MAX_BATCH || partition_sizes.is_none() {
        AqlmPath::FusedGemv
    } else {
        AqlmPath::DequantGemm
    };
    log::debug!("aqlm path: batch={batch} partitioned={} -> {path}", partition_sizes.is_some());
    path
}
