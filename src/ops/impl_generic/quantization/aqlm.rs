//! Generic AQLM implementations
//!
//! Same algorithm for all backends.
//! Composes numr primitives: cast, index_select, sum, mul, transpose, matmul, narrow, cat.
//!
//! Decode is a sum-pooled embedding lookup. Codebooks are flattened into one
//! table `[num_codebooks * codebook_size, out_group_size * in_group_size]`, so
//! codebook `c` owns rows `[c * K, (c + 1) * K)` and the row for a code is
//! `code + c * K`. Pooling the `num_codebooks` rows selected for a group gives
//! the group's flattened block. Blocks are stored group-major
//! (`[G_out, G_in, og, ig]`), so the in-group-block and out-group-local axes are
//! swapped before flattening to the row-major `[G_out * og, G_in * ig]` weight.

use crate::error::{Error, Result};
use crate::quant::aqlm::storage::{CodeStorage, MAX_CODE_BITS, unpack_code};
use numr::autograd::{Var, var_matmul, var_mul, var_permute, var_reshape};
use numr::dtype::DType;
use numr::ops::{
    BinaryOps, IndexingOps, MatmulOps, ReduceOps, ShapeOps, TensorOps, TypeConversionOps,
};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Shape bookkeeping shared by the decode variants.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DecodeShape {
    lead: Vec<usize>,
    num_out_groups: usize,
    num_in_groups: usize,
    num_codebooks: usize,
    codebook_size: usize,
    out_group_size: usize,
    in_group_size: usize,
}

impl DecodeShape {
    fn new(codes_shape: &[usize], codebooks_shape: &[usize]) -> Result<Self> {
        if codes_shape.len() < 3 {
            return Err(Error::InvalidArgument {
                arg: "codes",
                reason: format!(
                    "expected [*, num_out_groups, num_in_groups, num_codebooks], got {:?}",
                    codes_shape
                ),
            });
        }
        if codebooks_shape.len() != 4 {
            return Err(Error::InvalidArgument {
                arg: "codebooks",
                reason: format!(
                    "expected 4D [num_codebooks, codebook_size, out_group_size, in_group_size], got {:?}",
                    codebooks_shape
                ),
            });
        }
        let rank = codes_shape.len();
        let shape = Self {
            lead: codes_shape[..rank - 3].to_vec(),
            num_out_groups: codes_shape[rank - 3],
            num_in_groups: codes_shape[rank - 2],
            num_codebooks: codebooks_shape[0],
            codebook_size: codebooks_shape[1],
            out_group_size: codebooks_shape[2],
            in_group_size: codebooks_shape[3],
        };
        if codes_shape[rank - 1] != shape.num_codebooks {
            return Err(Error::InvalidArgument {
                arg: "codes",
                reason: format!(
                    "codes carry {} codebook indices per group but {} codebooks were given",
                    codes_shape[rank - 1],
                    shape.num_codebooks
                ),
            });
        }
        Ok(shape)
    }

    /// Number of (batch, out-group, in-group) positions
    fn rows(&self) -> usize {
        self.lead.iter().product::<usize>() * self.num_out_groups * self.num_in_groups
    }

    fn group_elems(&self) -> usize {
        self.out_group_size * self.in_group_size
    }

    /// `[*, G_out, G_in, og, ig]`
    fn grouped_shape(&self) -> Vec<usize> {
        let mut s = self.lead.clone();
        s.extend_from_slice(&[
            self.num_out_groups,
            self.num_in_groups,
            self.out_group_size,
            self.in_group_size,
        ]);
        s
    }

    /// `[*, out_features, in_features]`
    fn dense_shape(&self) -> Vec<usize> {
        let mut s = self.lead.clone();
        s.push(self.num_out_groups * self.out_group_size);
        s.push(self.num_in_groups * self.in_group_size);
        s
    }
}

/// Flat table rows for every (position, codebook) pair, in codes order.
///
/// Host-bound: reads the codes back with `to_vec`, which synchronizes device
/// runtimes once per call.
fn codebook_rows<R: Runtime<DType = DType>>(codes: &Tensor<R>, shape: &DecodeShape) -> Result<Vec<i64>> {
    if codes.dtype() != DType::I64 {
        return Err(Error::InvalidArgument {
            arg: "codes",
            reason: format!(
                "expected unpacked I64 codes (see aqlm_unpack_codes), got {:?}",
                codes.dtype()
            ),
        });
    }
    let k = shape.codebook_size as i64;
    let c = shape.num_codebooks;
    codes
        .contiguous()
        .to_vec::<i64>()
        .into_iter()
        .enumerate()
        .map(|(i, code)| {
            if !(0..k).contains(&code) {
                return Err(Error::InvalidArgument {
                    arg: "codes",
                    reason: format!("code {code} at flat index {i} outside [0, {k})"),
                });
            }
            Ok(code + (i % c) as i64 * k)
        })
        .collect()
}

/// Unpack stored codes to unsigned values: `stored mod 2^nbits`, as I64.
///
/// Host-bound: the modular reduction runs on a host copy of the codes (i128
/// arithmetic numr integer ops do not provide) and the result is uploaded
/// back to `codes.device()`.
pub fn aqlm_unpack_codes_impl<R, C>(client: &C, codes: &Tensor<R>, nbits: u32) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TypeConversionOps<R>,
{
    if nbits == 0 || nbits > MAX_CODE_BITS {
        return Err(Error::Config {
            reason: format!("no dtype available for {nbits}-bit codebooks"),
        });
    }
    let storage = CodeStorage::from_dtype(codes.dtype())?;
    if nbits > storage.bits() {
        return Err(Error::InvalidArgument {
            arg: "codes",
            reason: format!("{nbits}-bit codes cannot be stored in {storage}"),
        });
    }

    let wide = if codes.dtype() == DType::I64 {
        codes.contiguous()
    } else {
        client.cast(codes, DType::I64).map_err(Error::Numr)?
    };
    let unpacked: Vec<i64> = wide
        .contiguous()
        .to_vec::<i64>()
        .into_iter()
        .map(|v| unpack_code(v, nbits) as i64)
        .collect();

    Ok(Tensor::<R>::from_slice(
        &unpacked,
        codes.shape(),
        codes.device(),
    ))
}

/// Decode dense weights from unpacked codes.
///
/// - `codes`: `[*, G_out, G_in, C]` I64
/// - `codebooks`: `[C, K, og, ig]`
/// - `scales`: optional, broadcastable to `[*, G_out, G_in, og, ig]`
/// - Returns `[*, G_out * og, G_in * ig]`
pub fn aqlm_dequantize_impl<R, C>(
    client: &C,
    codes: &Tensor<R>,
    codebooks: &Tensor<R>,
    scales: Option<&Tensor<R>>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + IndexingOps<R> + ReduceOps<R> + BinaryOps<R>,
{
    let shape = DecodeShape::new(codes.shape(), codebooks.shape())?;
    let rows = codebook_rows(codes, &shape)?;
    let d = shape.group_elems();

    let idx = Tensor::<R>::from_slice(&rows, &[rows.len()], codes.device());
    let table = codebooks
        .contiguous()
        .reshape(&[shape.num_codebooks * shape.codebook_size, d])?;

    // [rows * C, og * ig] → [rows, C, og * ig] → sum over C
    let atoms = client.index_select(&table, 0, &idx).map_err(Error::Numr)?;
    let atoms = atoms.reshape(&[shape.rows(), shape.num_codebooks, d])?;
    let pooled = client.sum(&atoms, &[1], false).map_err(Error::Numr)?;

    let mut grouped = pooled.reshape(&shape.grouped_shape())?;
    if let Some(s) = scales {
        grouped = client.mul(&grouped, s).map_err(Error::Numr)?;
    }

    // [*, G_out, G_in, og, ig] → [*, G_out, og, G_in, ig] → [*, out, in]
    let dense = grouped
        .transpose(-3, -2)?
        .contiguous()
        .reshape(&shape.dense_shape())?;
    Ok(dense)
}

/// Differentiable decode: gradients flow to `codebooks` and `scales`.
///
/// Same computation as [`aqlm_dequantize_impl`] built from autograd ops.
/// The lookup is a matmul of a constant selection matrix `[positions, C * K]`
/// (one 1.0 per codebook per position) with the flattened table
/// `[C * K, og * ig]`, so an atom chosen by several positions accumulates
/// the gradient of every use. Code selection itself carries no gradient.
///
/// The selection matrix holds `positions * C * K` F32 values.
pub fn var_aqlm_dequantize<R, C>(
    client: &C,
    codes: &Tensor<R>,
    codebooks: &Var<R>,
    scales: Option<&Var<R>>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + MatmulOps<R> + BinaryOps<R> + TensorOps<R>,
    R::Client: MatmulOps<R> + BinaryOps<R> + TensorOps<R>,
{
    let shape = DecodeShape::new(codes.shape(), codebooks.shape())?;
    if codebooks.tensor().dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: codebooks.tensor().dtype(),
        });
    }
    let rows = codebook_rows(codes, &shape)?;
    let d = shape.group_elems();
    let positions = shape.rows();
    let width = shape.num_codebooks * shape.codebook_size;

    let mut selection = vec![0.0f32; positions * width];
    for (i, &row) in rows.iter().enumerate() {
        selection[(i / shape.num_codebooks) * width + row as usize] = 1.0;
    }
    let selection = Var::new(
        Tensor::<R>::from_slice(&selection, &[positions, width], codes.device()),
        false,
    );

    // [positions, C * K] @ [C * K, og * ig]: sums the C selected atoms
    let table = var_reshape(codebooks, &[width, d]).map_err(Error::Numr)?;
    let pooled = var_matmul(&selection, &table, client).map_err(Error::Numr)?;

    let mut grouped = var_reshape(&pooled, &shape.grouped_shape()).map_err(Error::Numr)?;
    if let Some(s) = scales {
        grouped = var_mul(&grouped, s, client).map_err(Error::Numr)?;
    }

    let rank = shape.lead.len() + 4;
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 3, rank - 2);
    let swapped = var_permute(&grouped, &perm).map_err(Error::Numr)?;
    var_reshape(&swapped, &shape.dense_shape()).map_err(Error::Numr)
}

/// `input @ weight^T + bias` over `[..., in_features]` inputs.
fn linear_impl<R, C>(
    client: &C,
    input: &Tensor<R>,
    weight: &Tensor<R>,
    bias: Option<&Tensor<R>>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + MatmulOps<R> + BinaryOps<R>,
{
    let in_shape = input.shape();
    let in_features = in_shape[in_shape.len() - 1];
    let w_shape = weight.shape();
    if w_shape.len() != 2 || w_shape[1] != in_features {
        return Err(Error::InvalidArgument {
            arg: "input",
            reason: format!(
                "input features {} do not match decoded weight {:?}",
                in_features, w_shape
            ),
        });
    }
    let out_features = w_shape[0];
    let m: usize = in_shape[..in_shape.len() - 1].iter().product();

    let input_2d = input.contiguous().reshape(&[m, in_features])?;
    let weight_t = weight.transpose(-2, -1)?.contiguous();
    let mut out = client.matmul(&input_2d, &weight_t).map_err(Error::Numr)?;
    if let Some(b) = bias {
        out = client.add(&out, b).map_err(Error::Numr)?;
    }

    let mut out_shape = in_shape[..in_shape.len() - 1].to_vec();
    out_shape.push(out_features);
    Ok(out.reshape(&out_shape)?)
}

fn validate_activation<R>(input: &Tensor<R>, codebooks: &Tensor<R>) -> Result<()>
where
    R: Runtime<DType = DType>,
{
    if input.shape().is_empty() {
        return Err(Error::InvalidArgument {
            arg: "input",
            reason: "expected [..., in_features], got a scalar".into(),
        });
    }
    if input.dtype() != codebooks.dtype() {
        return Err(Error::DTypeMismatch {
            expected: codebooks.dtype(),
            got: input.dtype(),
        });
    }
    Ok(())
}

/// Unpack, decode and multiply one (unpartitioned) quantized weight.
///
/// - `input`: `[..., in_features]`
/// - `codes`: `[G_out, G_in, C]` packed storage
/// - `codebooks`: `[C, K, og, ig]`, K a power of two
/// - `scales`: `[G_out, 1, 1, 1]`
/// - `bias`: optional `[G_out * og]`
pub fn aqlm_dequantize_gemm_impl<R, C>(
    client: &C,
    input: &Tensor<R>,
    codes: &Tensor<R>,
    codebooks: &Tensor<R>,
    scales: &Tensor<R>,
    bias: Option<&Tensor<R>>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R>
        + TypeConversionOps<R>
        + IndexingOps<R>
        + ReduceOps<R>
        + BinaryOps<R>
        + MatmulOps<R>,
{
    validate_activation(input, codebooks)?;
    if codes.shape().len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "codes",
            reason: format!(
                "expected 3D [num_out_groups, num_in_groups, num_codebooks], got {:?}",
                codes.shape()
            ),
        });
    }
    let codebook_size = codebooks.shape().get(1).copied().unwrap_or(0);
    if !codebook_size.is_power_of_two() {
        return Err(Error::InvalidArgument {
            arg: "codebooks",
            reason: format!("codebook size {codebook_size} is not a power of two"),
        });
    }
    let nbits = codebook_size.trailing_zeros();

    let unpacked = aqlm_unpack_codes_impl(client, codes, nbits)?;
    let weight = aqlm_dequantize_impl(client, &unpacked, codebooks, Some(scales))?;
    linear_impl(client, input, &weight, bias)
}

/// Check the partition invariants; returns codebooks per partition.
fn validate_partitions<R: Runtime>(
    codes: &Tensor<R>,
    codebooks: &Tensor<R>,
    scales: &Tensor<R>,
    partition_sizes: &[usize],
    bias: Option<&Tensor<R>>,
) -> Result<usize> {
    if partition_sizes.is_empty() {
        return Err(Error::InvariantViolation {
            reason: "output_partition_sizes must not be empty".into(),
        });
    }
    let num_partitions = partition_sizes.len();
    let total_codebooks = codebooks.shape().first().copied().unwrap_or(0);
    if total_codebooks == 0 || total_codebooks % num_partitions != 0 {
        return Err(Error::InvariantViolation {
            reason: format!(
                "{} codebooks cannot be split evenly across {} partitions",
                total_codebooks, num_partitions
            ),
        });
    }

    let codes_rows = codes.shape().first().copied().unwrap_or(0);
    let scales_rows = scales.shape().first().copied().unwrap_or(0);
    if scales_rows != codes_rows {
        return Err(Error::InvariantViolation {
            reason: format!(
                "scales.shape[0]={} != codes.shape[0]={}",
                scales_rows, codes_rows
            ),
        });
    }
    let total: usize = partition_sizes.iter().sum();
    if total != scales_rows {
        return Err(Error::InvariantViolation {
            reason: format!(
                "sum(output_partition_sizes)={} != scales.shape[0]={} (partitions {:?})",
                total, scales_rows, partition_sizes
            ),
        });
    }
    if let Some(b) = bias {
        if b.shape() != [total] {
            return Err(Error::InvalidArgument {
                arg: "bias",
                reason: format!("expected [{}], got {:?}", total, b.shape()),
            });
        }
    }

    Ok(total_codebooks / num_partitions)
}

/// Per-partition dequantize-then-multiply for weights fused across output partitions.
///
/// Each partition (e.g. Q, K and V of a fused QKV projection) has its own
/// codebook block and is decoded and multiplied on its own, so the combined
/// dense weight is never materialized. The partition outputs occupy disjoint
/// column ranges of the result, in partition order.
pub fn aqlm_partitioned_gemm_impl<R, C>(
    client: &C,
    input: &Tensor<R>,
    codes: &Tensor<R>,
    codebooks: &Tensor<R>,
    scales: &Tensor<R>,
    partition_sizes: &[usize],
    bias: Option<&Tensor<R>>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R>
        + TypeConversionOps<R>
        + IndexingOps<R>
        + ReduceOps<R>
        + BinaryOps<R>
        + MatmulOps<R>
        + ShapeOps<R>,
{
    let num_codebooks = validate_partitions(codes, codebooks, scales, partition_sizes, bias)?;
    validate_activation(input, codebooks)?;

    let lead = &input.shape()[..input.shape().len() - 1];
    let mut shards = Vec::with_capacity(partition_sizes.len());
    let mut output_offset = 0;
    let mut codebooks_offset = 0;

    for &output_size in partition_sizes {
        let shard_bias = bias
            .map(|b| b.narrow(0, output_offset, output_size))
            .transpose()?;
        let shard = aqlm_dequantize_gemm_impl(
            client,
            input,
            &codes.narrow(0, output_offset, output_size)?,
            &codebooks.narrow(0, codebooks_offset, num_codebooks)?,
            &scales.narrow(0, output_offset, output_size)?,
            shard_bias.as_ref(),
        )?;

        let out_shape = shard.shape();
        let (out_cols, out_lead) = out_shape.split_last().unwrap_or((&0, &[][..]));
        if out_lead != lead || *out_cols != output_size {
            return Err(Error::InvariantViolation {
                reason: format!(
                    "partition at offset {} produced {:?}, expected {:?} + [{}]",
                    output_offset, out_shape, lead, output_size
                ),
            });
        }

        shards.push(shard);
        output_offset += output_size;
        codebooks_offset += num_codebooks;
    }

    let refs: Vec<&Tensor<R>> = shards.iter().collect();
    client.cat(&refs, -1).map_err(Error::Numr)
}
