//! Fused AQLM GEMM CPU kernel
//!
//! Computes activation [M, K] × decoded weight [N, K]^T → output [M, N]
//! without materializing the weight. Each output feature's weight row is
//! decoded once into a thread-local buffer (sum of the selected codebook
//! atoms, times the group scale) and immediately dotted with every
//! activation row.
//!
//! Parallel over output features with rayon. Results are accumulated in a
//! feature-major [N, M] buffer so every task writes a disjoint chunk, then
//! transposed into the row-major output.

use rayon::prelude::*;

use crate::quant::aqlm::storage::PackedCode;

/// Problem dimensions for [`aqlm_gemm_f32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AqlmGemmDims {
    /// Activation rows
    pub m: usize,
    pub num_out_groups: usize,
    pub num_in_groups: usize,
    /// Codebooks per partition
    pub num_codebooks: usize,
    pub codebook_size: usize,
    pub out_group_size: usize,
    pub in_group_size: usize,
    pub nbits: u32,
}

impl AqlmGemmDims {
    pub fn in_features(&self) -> usize {
        self.num_in_groups * self.in_group_size
    }

    pub fn out_features(&self) -> usize {
        self.num_out_groups * self.out_group_size
    }
}

fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}

/// Codebook block offset for every output group.
///
/// `partition_groups[p]` output groups use codebooks
/// `[p * num_codebooks, (p + 1) * num_codebooks)`.
pub fn group_codebook_base(partition_groups: &[usize], num_codebooks: usize) -> Vec<usize> {
    partition_groups
        .iter()
        .enumerate()
        .flat_map(|(p, &groups)| std::iter::repeat_n(p * num_codebooks, groups))
        .collect()
}

/// Decode one weight row (output feature `g * og + r`) into `row`.
#[allow(clippy::too_many_arguments)]
#[inline]
fn decode_row<T: PackedCode>(
    codes: &[T],
    codebooks: &[f32],
    scale: f32,
    g: usize,
    r: usize,
    codebook_base: usize,
    row: &mut [f32],
    dims: &AqlmGemmDims,
) {
    let (c_n, k_n, og, ig) = (
        dims.num_codebooks,
        dims.codebook_size,
        dims.out_group_size,
        dims.in_group_size,
    );
    row.fill(0.0);
    for j in 0..dims.num_in_groups {
        let dst = &mut row[j * ig..][..ig];
        let group_codes = &codes[(g * dims.num_in_groups + j) * c_n..][..c_n];
        for (c, &packed) in group_codes.iter().enumerate() {
            let code = packed.code(dims.nbits);
            let atom = &codebooks[(((codebook_base + c) * k_n + code) * og + r) * ig..][..ig];
            for (d, &a) in dst.iter_mut().zip(atom) {
                *d += a;
            }
        }
    }
    for v in row.iter_mut() {
        *v *= scale;
    }
}

/// Fused AQLM matmul: input [M, K] × decode(codes)^T → output [M, N]
///
/// `codes`: [G_out, G_in, C] packed (signed storage), row-major
/// `codebooks`: [P * C, codebook_size, og, ig]
/// `scales`: [G_out]
/// `codebook_base`: per output group, first codebook of its partition
/// `bias`: optional [N]
///
/// Codes must already be checked to lie in `[0, codebook_size)` after unpacking;
/// `nbits` equals `log2(codebook_size)` so this holds by construction.
#[allow(clippy::too_many_arguments)]
pub fn aqlm_gemm_f32<T: PackedCode>(
    input: &[f32],
    codes: &[T],
    codebooks: &[f32],
    scales: &[f32],
    codebook_base: &[usize],
    bias: Option<&[f32]>,
    output: &mut [f32],
    dims: &AqlmGemmDims,
) {
    let m = dims.m;
    let k = dims.in_features();
    let n = dims.out_features();
    let og = dims.out_group_size;
    debug_assert_eq!(input.len(), m * k);
    debug_assert_eq!(codes.len(), dims.num_out_groups * dims.num_in_groups * dims.num_codebooks);
    debug_assert_eq!(scales.len(), dims.num_out_groups);
    debug_assert_eq!(codebook_base.len(), dims.num_out_groups);
    debug_assert_eq!(output.len(), m * n);

    if m == 0 || n == 0 {
        return;
    }

    // [N, M]: one chunk of M values per output feature
    let mut out_t = vec![0.0f32; n * m];
    out_t
        .par_chunks_mut(m)
        .enumerate()
        .for_each_init(
            || vec![0.0f32; k],
            |row, (f, col)| {
                let (g, r) = (f / og, f % og);
                decode_row(codes, codebooks, scales[g], g, r, codebook_base[g], row, dims);
                let b = bias.map_or(0.0, |b| b[f]);
                for (i, out) in col.iter_mut().enumerate() {
                    *out = dot_f32(&input[i * k..][..k], row) + b;
                }
            },
        );

    for (f, col) in out_t.chunks_exact(m).enumerate() {
        for (i, &v) in col.iter().enumerate() {
            output[i * n + f] = v;
        }
    }
}
