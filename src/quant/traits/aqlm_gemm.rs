//! Fused AQLM GEMM trait

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Fused AQLM matmul: unpack + decode + multiply in one pass.
///
/// Optimized for small batches where the multiply is memory-bandwidth bound:
/// codes are read once and each decoded weight group is applied to every
/// activation row immediately, so the dense weight is never materialized.
///
/// # Contract
///
/// - `input` shape: `[..., in_features]`
/// - `codes` shape: `[num_out_groups, num_in_groups, num_codebooks]`
/// - `codebooks` shape: `[num_codebooks * P, codebook_size, out_group_size, in_group_size]`
///   where `P = partition_sizes.len()`, or 1 when `partition_sizes` is `None`
/// - `scales` shape: `[num_out_groups, 1, 1, 1]`
/// - `bias` shape: `[out_features]`
/// - Output shape: `[..., out_features]`
///
/// The result must match `AqlmOps::aqlm_partitioned_gemm` within float
/// rounding tolerance.
pub trait AqlmGemmOps<R: Runtime> {
    fn aqlm_gemm(
        &self,
        input: &Tensor<R>,
        codes: &Tensor<R>,
        codebooks: &Tensor<R>,
        scales: &Tensor<R>,
        partition_sizes: Option<&[usize]>,
        bias: Option<&Tensor<R>>,
    ) -> Result<Tensor<R>>;
}
