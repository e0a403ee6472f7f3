//! CPU implementation of AqlmGemmOps

use crate::error::{Error, Result};
use crate::quant::aqlm::storage::CodeStorage;
use crate::quant::traits::AqlmGemmOps;
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

use super::kernels::aqlm_gemm::{AqlmGemmDims, aqlm_gemm_f32, group_codebook_base};

/// Validate input is F32 and extract (M, K) from shape.
fn validate_input(input: &Tensor<CpuRuntime>) -> Result<(usize, usize)> {
    if input.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: input.dtype(),
        });
    }
    let shape = input.shape();
    if shape.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "input",
            reason: "expected [..., in_features], got a scalar".into(),
        });
    }
    let k = shape[shape.len() - 1];
    let m: usize = shape[..shape.len() - 1].iter().product();
    Ok((m, k))
}

/// Build output shape: replace last dim with n.
fn output_shape(input_shape: &[usize], n: usize) -> Vec<usize> {
    let mut s = input_shape[..input_shape.len() - 1].to_vec();
    s.push(n);
    s
}

fn f32_data(t: &Tensor<CpuRuntime>, arg: &'static str) -> Result<Vec<f32>> {
    if t.dtype() != DType::F32 {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("must be F32, got {:?}", t.dtype()),
        });
    }
    Ok(t.contiguous().to_vec::<f32>())
}

impl AqlmGemmOps<CpuRuntime> for CpuClient {
    fn aqlm_gemm(
        &self,
        input: &Tensor<CpuRuntime>,
        codes: &Tensor<CpuRuntime>,
        codebooks: &Tensor<CpuRuntime>,
        scales: &Tensor<CpuRuntime>,
        partition_sizes: Option<&[usize]>,
        bias: Option<&Tensor<CpuRuntime>>,
    ) -> Result<Tensor<CpuRuntime>> {
        let (m, k) = validate_input(input)?;
        let storage = CodeStorage::from_dtype(codes.dtype())?;

        let c_shape = codes.shape();
        if c_shape.len() != 3 {
            return Err(Error::InvalidArgument {
                arg: "codes",
                reason: format!(
                    "expected [num_out_groups, num_in_groups, num_codebooks], got {:?}",
                    c_shape
                ),
            });
        }
        let cb_shape = codebooks.shape();
        if cb_shape.len() != 4 {
            return Err(Error::InvalidArgument {
                arg: "codebooks",
                reason: format!("expected 4D, got {:?}", cb_shape),
            });
        }
        let (num_out_groups, num_in_groups) = (c_shape[0], c_shape[1]);

        let partitions = partition_sizes.map_or_else(|| vec![num_out_groups], |p| p.to_vec());
        let total: usize = partitions.iter().sum();
        if partitions.is_empty() || cb_shape[0] % partitions.len() != 0 {
            return Err(Error::InvariantViolation {
                reason: format!(
                    "{} codebooks cannot be split across partitions {:?}",
                    cb_shape[0], partitions
                ),
            });
        }
        if total != num_out_groups || scales.shape().first() != Some(&num_out_groups) {
            return Err(Error::InvariantViolation {
                reason: format!(
                    "sum(output_partition_sizes)={} scales.shape={:?} codes.shape={:?}",
                    total,
                    scales.shape(),
                    c_shape
                ),
            });
        }

        let num_codebooks = cb_shape[0] / partitions.len();
        if c_shape[2] != num_codebooks {
            return Err(Error::InvalidArgument {
                arg: "codes",
                reason: format!(
                    "{} codes per group but {} codebooks per partition",
                    c_shape[2], num_codebooks
                ),
            });
        }
        let codebook_size = cb_shape[1];
        if !codebook_size.is_power_of_two() {
            return Err(Error::InvalidArgument {
                arg: "codebooks",
                reason: format!("codebook size {codebook_size} is not a power of two"),
            });
        }
        let nbits = codebook_size.trailing_zeros();
        if nbits == 0 || nbits > storage.bits() {
            return Err(Error::InvalidArgument {
                arg: "codes",
                reason: format!("{nbits}-bit codes cannot be stored in {storage}"),
            });
        }

        let dims = AqlmGemmDims {
            m,
            num_out_groups,
            num_in_groups,
            num_codebooks,
            codebook_size,
            out_group_size: cb_shape[2],
            in_group_size: cb_shape[3],
            nbits,
        };
        if dims.in_features() != k {
            return Err(Error::InvalidArgument {
                arg: "input",
                reason: format!(
                    "input features {} != num_in_groups {} * in_group_size {}",
                    k, num_in_groups, dims.in_group_size
                ),
            });
        }
        let n = dims.out_features();

        let inp = f32_data(input, "input")?;
        let cb = f32_data(codebooks, "codebooks")?;
        let sc = f32_data(scales, "scales")?;
        let bias = bias.map(|b| f32_data(b, "bias")).transpose()?;
        if let Some(b) = &bias {
            if b.len() != n {
                return Err(Error::InvalidArgument {
                    arg: "bias",
                    reason: format!("expected {} elements, got {}", n, b.len()),
                });
            }
        }
        let base = group_codebook_base(&partitions, num_codebooks);

        let mut out = vec![0.0f32; m * n];
        let codes = codes.contiguous();
        match storage {
            CodeStorage::I8 => {
                let c = codes.to_vec::<i8>();
                aqlm_gemm_f32(&inp, &c, &cb, &sc, &base, bias.as_deref(), &mut out, &dims)
            }
            CodeStorage::I16 => {
                let c = codes.to_vec::<i16>();
                aqlm_gemm_f32(&inp, &c, &cb, &sc, &base, bias.as_deref(), &mut out, &dims)
            }
            CodeStorage::I32 => {
                let c = codes.to_vec::<i32>();
                aqlm_gemm_f32(&inp, &c, &cb, &sc, &base, bias.as_deref(), &mut out, &dims)
            }
            CodeStorage::I64 => {
                let c = codes.to_vec::<i64>();
                aqlm_gemm_f32(&inp, &c, &cb, &sc, &base, bias.as_deref(), &mut out, &dims)
            }
        }

        log::trace!("aqlm_gemm m={m} k={k} n={n} partitions={partitions:?}");
        Ok(Tensor::<CpuRuntime>::from_slice(
            &out,
            &output_shape(input.shape(), n),
            input.device(),
        ))
    }
}
