//! AQLM linear method: weight allocation and forward dispatch

use std::sync::Arc;

use super::config::AqlmConfig;
use super::path::{AqlmPath, select_path};
use super::weights::{AqlmWeights, WeightAttrs};
use crate::error::{Error, Result};
use crate::ops::traits::AqlmOps;
use crate::quant::traits::AqlmGemmOps;
use numr::dtype::DType;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Linear layer method for AQLM-quantized weights.
///
/// Holds the configuration and the fused kernel used for small batches.
/// Larger partitioned batches go through [`AqlmOps::aqlm_partitioned_gemm`].
pub struct AqlmLinearMethod<R: Runtime> {
    config: AqlmConfig,
    kernel: Arc<dyn AqlmGemmOps<R>>,
}

impl<R: Runtime<DType = DType>> AqlmLinearMethod<R> {
    /// Create the method.
    ///
    /// # Errors
    ///
    /// `Error::MissingKernel` when no fused kernel is available. The dequantize
    /// path is a batch-size optimization, not a substitute for the kernel.
    pub fn new(config: AqlmConfig, kernel: Option<Arc<dyn AqlmGemmOps<R>>>) -> Result<Self> {
        config.validate()?;
        let kernel = kernel.ok_or(Error::MissingKernel { name: "aqlm_gemm" })?;
        Ok(Self { config, kernel })
    }

    pub fn config(&self) -> &AqlmConfig {
        &self.config
    }

    /// Allocate zeroed codes/codebooks/scales for one layer shard.
    ///
    /// - codes: `[out, in / pack_factor, num_codebooks]` in the storage width
    /// - codebooks: `[num_codebooks * P, 2^nbits, out_group_size, in_group_size]`
    /// - scales: `[out / out_group_size, 1, 1, 1]`
    ///
    /// where `out = sum(output_partition_sizes)` and `P` is the partition count.
    pub fn create_weights(
        &self,
        input_size_per_partition: usize,
        output_partition_sizes: &[usize],
        params_dtype: DType,
        device: &R::Device,
    ) -> Result<AqlmWeights<R>> {
        let cfg = &self.config;
        if !cfg.supported_act_dtypes().contains(&params_dtype) {
            return Err(Error::Config {
                reason: format!(
                    "params dtype {:?} not supported by aqlm (supported: {:?})",
                    params_dtype,
                    cfg.supported_act_dtypes()
                ),
            });
        }
        if input_size_per_partition % cfg.in_group_size != 0 {
            return Err(Error::Config {
                reason: format!(
                    "input size {} is not aligned with in_group_size {}; \
                     this can be caused by too large tensor parallel size",
                    input_size_per_partition, cfg.in_group_size
                ),
            });
        }
        if output_partition_sizes.is_empty() {
            return Err(Error::Config {
                reason: "output_partition_sizes must not be empty".into(),
            });
        }
        let output_size_per_partition: usize = output_partition_sizes.iter().sum();
        if output_size_per_partition % cfg.out_group_size != 0 {
            return Err(Error::Config {
                reason: format!(
                    "output size {} is not aligned with out_group_size {}; \
                     this can be caused by too large tensor parallel size",
                    output_size_per_partition, cfg.out_group_size
                ),
            });
        }
        let codebook_size = cfg.codebook_size()?;

        let codes = Tensor::<R>::zeros(
            &[
                output_size_per_partition,
                input_size_per_partition / cfg.pack_factor(),
                cfg.num_codebooks,
            ],
            cfg.code_storage().dtype(),
            device,
        );
        let codebooks = Tensor::<R>::zeros(
            &[
                cfg.num_codebooks * output_partition_sizes.len(),
                codebook_size,
                cfg.out_group_size,
                cfg.in_group_size,
            ],
            params_dtype,
            device,
        );
        let scales = Tensor::<R>::zeros(
            &[output_size_per_partition / cfg.out_group_size, 1, 1, 1],
            params_dtype,
            device,
        );

        log::debug!(
            "aqlm create_weights: codes {:?} ({}), codebooks {:?}, scales {:?}",
            codes.shape(),
            cfg.code_storage(),
            codebooks.shape(),
            scales.shape()
        );

        Ok(AqlmWeights {
            codes,
            codebooks,
            scales,
            codes_attrs: WeightAttrs::codes(cfg),
            codebooks_attrs: WeightAttrs::codebooks(Some(output_partition_sizes.to_vec())),
            scales_attrs: WeightAttrs::scales(cfg),
        })
    }

    /// Forward: `x @ W^T + bias` with `W` decoded from `weights`.
    ///
    /// `x`: `[..., in_features]`, output: `[..., out_features]`
    pub fn apply_weights<C>(
        &self,
        client: &C,
        weights: &AqlmWeights<R>,
        x: &Tensor<R>,
        bias: Option<&Tensor<R>>,
    ) -> Result<Tensor<R>>
    where
        C: RuntimeClient<R> + AqlmOps<R>,
    {
        if !self.config.supported_act_dtypes().contains(&x.dtype()) {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: x.dtype(),
            });
        }
        let partition_sizes = weights.output_partition_sizes();
        match (select_path(x.shape(), partition_sizes), partition_sizes) {
            (AqlmPath::DequantGemm, Some(parts)) => client.aqlm_partitioned_gemm(
                x,
                &weights.codes,
                &weights.codebooks,
                &weights.scales,
                parts,
                bias,
            ),
            _ => self.kernel.aqlm_gemm(
                x,
                &weights.codes,
                &weights.codebooks,
                &weights.scales,
                partition_sizes,
                bias,
            ),
        }
    }

    /// Mixture-of-experts forward is not available for AQLM weights.
    pub fn apply_moe_weights(
        &self,
        _w1: &AqlmWeights<R>,
        _w2: &AqlmWeights<R>,
        _x: &Tensor<R>,
        _gating_output: &Tensor<R>,
        _topk: usize,
        _renormalize: bool,
    ) -> Result<Tensor<R>> {
        Err(Error::Unsupported {
            feature: "aqlm fused moe",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn method(device: &CpuDevice, config: AqlmConfig) -> AqlmLinearMethod<CpuRuntime> {
        let kernel: Arc<dyn AqlmGemmOps<CpuRuntime>> = Arc::new(CpuClient::new(device.clone()));
        AqlmLinearMethod::new(config, Some(kernel)).unwrap()
    }

    #[test]
    fn test_create_weights_shapes_and_attrs() {
        let (_client, device) = cpu_setup();
        let config = AqlmConfig::new(8, 8, 2, 1).unwrap();
        let m = method(&device, config);

        let w = m.create_weights(64, &[16, 8, 8], DType::F32, &device).unwrap();
        assert_eq!(w.codes.shape(), &[32, 8, 2]);
        assert_eq!(w.codes.dtype(), DType::I8);
        assert_eq!(w.codebooks.shape(), &[6, 256, 1, 8]);
        assert_eq!(w.scales.shape(), &[32, 1, 1, 1]);
        assert_eq!(w.output_partition_sizes(), Some(&[16usize, 8, 8][..]));
        assert_eq!(w.in_features(), 64);
        assert_eq!(w.out_features(), 32);

        assert_eq!(w.codes_attrs.pack_factor, Some(8));
        assert_eq!(w.codes_attrs.packed_dim, Some(1));
        assert_eq!(w.codes_attrs.input_dim, Some(1));
        assert!(w.codebooks_attrs.is_metadata);
        assert_eq!(w.scales_attrs.pack_factor, Some(1));
        assert_eq!(w.scales_attrs.output_dim, Some(0));
    }

    #[test]
    fn test_create_weights_wide_codes() {
        let (_client, device) = cpu_setup();
        let m = method(&device, AqlmConfig::new(8, 12, 1, 1).unwrap());
        let w = m.create_weights(16, &[4], DType::F32, &device).unwrap();
        assert_eq!(w.codes.dtype(), DType::I16);
        assert_eq!(w.codebooks.shape(), &[1, 4096, 1, 8]);
    }

    #[test]
    fn test_create_weights_rejects_misalignment_and_dtype() {
        let (_client, device) = cpu_setup();
        let m = method(&device, AqlmConfig::new(8, 4, 1, 1).unwrap());
        assert!(matches!(
            m.create_weights(12, &[4], DType::F32, &device),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            m.create_weights(16, &[4], DType::F64, &device),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            m.create_weights(16, &[], DType::F32, &device),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_missing_kernel() {
        let config = AqlmConfig::new(8, 8, 1, 1).unwrap();
        let result = AqlmLinearMethod::<CpuRuntime>::new(config, None);
        assert!(matches!(result, Err(Error::MissingKernel { .. })));
    }

    #[test]
    fn test_apply_zero_weights() {
        let (client, device) = cpu_setup();
        let m = method(&device, AqlmConfig::new(4, 4, 1, 1).unwrap());
        let w = m.create_weights(8, &[3, 3], DType::F32, &device).unwrap();
        for rows in [2usize, 40] {
            let x = Tensor::<CpuRuntime>::ones(&[rows, 8], DType::F32, &device);
            let out = m.apply_weights(&client, &w, &x, None).unwrap();
            assert_eq!(out.shape(), &[rows, 6]);
            assert!(out.to_vec::<f32>().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_apply_rejects_unsupported_activation_dtype() {
        let (client, device) = cpu_setup();
        let m = method(&device, AqlmConfig::new(4, 4, 1, 1).unwrap());
        let w = m.create_weights(8, &[2], DType::F32, &device).unwrap();
        let x = Tensor::<CpuRuntime>::ones(&[1, 8], DType::F64, &device);
        assert!(matches!(
            m.apply_weights(&client, &w, &x, None),
            Err(Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_moe_unsupported() {
        let (_client, device) = cpu_setup();
        let m = method(&device, AqlmConfig::new(4, 4, 1, 1).unwrap());
        let w = m.create_weights(8, &[2], DType::F32, &device).unwrap();
        let x = Tensor::<CpuRuntime>::ones(&[1, 8], DType::F32, &device);
        let gating = Tensor::<CpuRuntime>::ones(&[1, 2], DType::F32, &device);
        let result = m.apply_moe_weights(&w, &w, &x, &gating, 1, false);
        assert!(matches!(result, Err(Error::Unsupported { .. })));
    }
}
