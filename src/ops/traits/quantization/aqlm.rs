//! AQLM decode-and-multiply operations

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Reference AQLM operations: unpack, decode and dequantize-then-multiply.
///
/// AQLM approximates each `[out_group_size, in_group_size]` weight block as a
/// scaled sum of one atom from each of `num_codebooks` learned codebooks:
///
/// ```text
/// W[g, j] = scale[g] * Σ_c codebooks[c, codes[g, j, c]]
/// ```
///
/// # Layout contract
///
/// - `codes`: `[num_out_groups, num_in_groups, num_codebooks]` signed integer
///   storage (I8/I16/I32/I64), optionally with leading batch dims
/// - `codebooks`: `[num_codebooks, codebook_size, out_group_size, in_group_size]` F32
/// - `scales`: `[num_out_groups, 1, 1, 1]` F32
/// - Decoded weight: `[out_features, in_features]` with
///   `out_features = num_out_groups * out_group_size`,
///   `in_features = num_in_groups * in_group_size`
pub trait AqlmOps<R: Runtime> {
    /// Unpack stored codes to unsigned values in `[0, 2^nbits)`.
    ///
    /// Output has the same shape as `codes` and dtype I64.
    fn aqlm_unpack_codes(&self, codes: &Tensor<R>, nbits: u32) -> Result<Tensor<R>>;

    /// Reconstruct the dense weight from *unpacked* codes.
    ///
    /// - `codes`: `[*, num_out_groups, num_in_groups, num_codebooks]` I64, values in `[0, codebook_size)`
    /// - `scales`: broadcastable to `[*, num_out_groups, num_in_groups, out_group_size, in_group_size]`
    /// - Output: `[*, out_features, in_features]`
    fn aqlm_dequantize(
        &self,
        codes: &Tensor<R>,
        codebooks: &Tensor<R>,
        scales: Option<&Tensor<R>>,
    ) -> Result<Tensor<R>>;

    /// Unpack, decode, then `input @ W^T + bias`.
    ///
    /// - `input`: `[..., in_features]`
    /// - `bias`: optional `[out_features]`
    /// - Output: `[..., out_features]`
    ///
    /// The code bit width is `log2(codebook_size)`.
    fn aqlm_dequantize_gemm(
        &self,
        input: &Tensor<R>,
        codes: &Tensor<R>,
        codebooks: &Tensor<R>,
        scales: &Tensor<R>,
        bias: Option<&Tensor<R>>,
    ) -> Result<Tensor<R>>;

    /// Dequantize-then-multiply over a weight fused from several output partitions.
    ///
    /// Partition `p` owns output rows `[offset_p, offset_p + partition_sizes[p])`
    /// of `codes`/`scales`/`bias` and codebooks
    /// `[p * n, (p + 1) * n)` where `n = codebooks.shape[0] / partition_sizes.len()`.
    ///
    /// # Errors
    ///
    /// `Error::InvariantViolation` (before any work) unless
    /// `sum(partition_sizes) == scales.shape[0] == codes.shape[0]`.
    fn aqlm_partitioned_gemm(
        &self,
        input: &Tensor<R>,
        codes: &Tensor<R>,
        codebooks: &Tensor<R>,
        scales: &Tensor<R>,
        partition_sizes: &[usize],
        bias: Option<&Tensor<R>>,
    ) -> Result<Tensor<R>>;
}
