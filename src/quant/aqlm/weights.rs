//! AQLM weight bundle and sharding metadata

use super::config::AqlmConfig;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Loader metadata attached to a quantized parameter.
///
/// Describes which axes map to the layer's input/output dims and how packed
/// axes relate to logical sizes, so tensor-parallel loaders can shard them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightAttrs {
    pub input_dim: Option<usize>,
    pub output_dim: Option<usize>,
    /// Axis holding packed elements
    pub packed_dim: Option<usize>,
    /// Logical elements per stored element along `packed_dim`
    pub pack_factor: Option<usize>,
    /// Fixed-size metadata concatenated along dim 0 (not sharded by output)
    pub is_metadata: bool,
    pub output_partition_sizes: Option<Vec<usize>>,
}

impl WeightAttrs {
    /// Codes: `[out, in / pack_factor, num_codebooks]`
    pub fn codes(config: &AqlmConfig) -> Self {
        Self {
            input_dim: Some(1),
            output_dim: Some(0),
            packed_dim: Some(1),
            pack_factor: Some(config.pack_factor()),
            ..Self::default()
        }
    }

    /// Codebooks: one block per output partition
    pub fn codebooks(output_partition_sizes: Option<Vec<usize>>) -> Self {
        Self {
            is_metadata: true,
            output_partition_sizes,
            ..Self::default()
        }
    }

    /// Scales: `[out / out_group_size, 1, 1, 1]`
    pub fn scales(config: &AqlmConfig) -> Self {
        Self {
            output_dim: Some(0),
            packed_dim: Some(0),
            pack_factor: Some(config.out_group_size),
            ..Self::default()
        }
    }
}

/// Quantized parameters of one AQLM linear layer.
#[derive(Clone)]
pub struct AqlmWeights<R: Runtime> {
    pub codes: Tensor<R>,
    pub codebooks: Tensor<R>,
    pub scales: Tensor<R>,
    pub codes_attrs: WeightAttrs,
    pub codebooks_attrs: WeightAttrs,
    pub scales_attrs: WeightAttrs,
}

impl<R: Runtime> AqlmWeights<R> {
    /// Bundle loaded tensors with the attrs `config` implies.
    ///
    /// `output_partition_sizes` is `None` for weights loaded without
    /// partition metadata; such weights always take the fused path.
    pub fn from_parts(
        config: &AqlmConfig,
        codes: Tensor<R>,
        codebooks: Tensor<R>,
        scales: Tensor<R>,
        output_partition_sizes: Option<Vec<usize>>,
    ) -> Self {
        Self {
            codes,
            codebooks,
            scales,
            codes_attrs: WeightAttrs::codes(config),
            codebooks_attrs: WeightAttrs::codebooks(output_partition_sizes),
            scales_attrs: WeightAttrs::scales(config),
        }
    }

    pub fn output_partition_sizes(&self) -> Option<&[usize]> {
        self.codebooks_attrs.output_partition_sizes.as_deref()
    }

    /// Output features across all partitions
    pub fn out_features(&self) -> usize {
        self.codes.shape()[0] * self.codebooks.shape()[2]
    }

    /// Input features covered by the codes
    pub fn in_features(&self) -> usize {
        self.codes.shape()[1] * self.codebooks.shape()[3]
    }
}
