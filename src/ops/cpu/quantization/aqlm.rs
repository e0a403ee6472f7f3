//! CPU implementation of AqlmOps, delegating to impl_generic

use crate::error::Result;
use crate::ops::impl_generic::quantization::aqlm::{
    aqlm_dequantize_gemm_impl, aqlm_dequantize_impl, aqlm_partitioned_gemm_impl,
    aqlm_unpack_codes_impl,
};
use crate::ops::traits::AqlmOps;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

impl AqlmOps<CpuRuntime> for CpuClient {
    fn aqlm_unpack_codes(
        &self,
        codes: &Tensor<CpuRuntime>,
        nbits: u32,
    ) -> Result<Tensor<CpuRuntime>> {
        aqlm_unpack_codes_impl(self, codes, nbits)
    }

    fn aqlm_dequantize(
        &self,
        codes: &Tensor<CpuRuntime>,
        codebooks: &Tensor<CpuRuntime>,
        scales: Option<&Tensor<CpuRuntime>>,
    ) -> Result<Tensor<CpuRuntime>> {
        aqlm_dequantize_impl(self, codes, codebooks, scales)
    }

    fn aqlm_dequantize_gemm(
        &self,
        input: &Tensor<CpuRuntime>,
        codes: &Tensor<CpuRuntime>,
        codebooks: &Tensor<CpuRuntime>,
        scales: &Tensor<CpuRuntime>,
        bias: Option<&Tensor<CpuRuntime>>,
    ) -> Result<Tensor<CpuRuntime>> {
        aqlm_dequantize_gemm_impl(self, input, codes, codebooks, scales, bias)
    }

    fn aqlm_partitioned_gemm(
        &self,
        input: &Tensor<CpuRuntime>,
        codes: &Tensor<CpuRuntime>,
        codebooks: &Tensor<CpuRuntime>,
        scales: &Tensor<CpuRuntime>,
        partition_sizes: &[usize],
        bias: Option<&Tensor<CpuRuntime>>,
    ) -> Result<Tensor<CpuRuntime>> {
        aqlm_partitioned_gemm_impl(self, input, codes, codebooks, scales, partition_sizes, bias)
    }
}
