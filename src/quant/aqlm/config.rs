//! AQLM quantization configuration
//!
//! Parsed from the `quantization_config` object of a model's config.json:
//!
//! ```json
//! {
//!   "quant_method": "aqlm",
//!   "in_group_size": 8,
//!   "out_group_size": 1,
//!   "num_codebooks": 1,
//!   "nbits_per_codebook": 16
//! }
//! ```

use super::storage::CodeStorage;
use crate::error::{Error, Result};
use numr::dtype::DType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quantization method name as it appears in `quant_method`.
pub const AQLM_METHOD_NAME: &str = "aqlm";

/// Activation / parameter dtypes the AQLM kernels accept.
pub const SUPPORTED_ACT_DTYPES: &[DType] = &[DType::F32];

/// AQLM configuration
///
/// # Invariants (checked by [`AqlmConfig::validate`])
///
/// - `out_group_size == 1` (larger output groups are not supported by the kernels)
/// - `in_group_size > 0`, `num_codebooks > 0`
/// - `nbits_per_codebook` in `1..=64`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AqlmConfig {
    /// Input features sharing one code
    pub in_group_size: usize,
    /// Bits per codebook index; the codebook has `2^nbits` atoms
    pub nbits_per_codebook: u32,
    /// Codebooks summed per group (per output partition)
    pub num_codebooks: usize,
    /// Output features sharing one code
    pub out_group_size: usize,
}

impl AqlmConfig {
    /// Create and validate a configuration.
    pub fn new(
        in_group_size: usize,
        nbits_per_codebook: u32,
        num_codebooks: usize,
        out_group_size: usize,
    ) -> Result<Self> {
        Self {
            in_group_size,
            nbits_per_codebook,
            num_codebooks,
            out_group_size,
        }
        .checked()
    }

    /// Build from a `quantization_config` JSON object.
    ///
    /// All four keys are required; other keys (`quant_method`, ...) are ignored.
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(config.clone()).map_err(|e| Error::Config {
            reason: format!("Failed to parse AQLM config: {e}"),
        })?;
        config.checked()
    }

    /// Parse a `quantization_config` JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| Error::Config {
            reason: format!("Failed to parse AQLM config: {e}"),
        })?;
        config.checked()
    }

    fn checked(self) -> Result<Self> {
        self.validate()?;
        log::info!("created {self}");
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.out_group_size != 1 {
            return Err(Error::Config {
                reason: format!("out_group_size must be 1, got {}", self.out_group_size),
            });
        }
        if self.in_group_size == 0 {
            return Err(Error::Config {
                reason: "in_group_size must be > 0".into(),
            });
        }
        if self.num_codebooks == 0 {
            return Err(Error::Config {
                reason: "num_codebooks must be > 0".into(),
            });
        }
        CodeStorage::for_bits(self.nbits_per_codebook)?;
        Ok(())
    }

    /// Method name
    pub fn name(&self) -> &'static str {
        AQLM_METHOD_NAME
    }

    /// Weight elements covered by one code group
    pub fn pack_factor(&self) -> usize {
        self.in_group_size * self.out_group_size
    }

    /// Atoms per codebook (`2^nbits_per_codebook`)
    ///
    /// # Errors
    ///
    /// `Error::Config` when `2^nbits_per_codebook` does not fit in `usize`.
    pub fn codebook_size(&self) -> Result<usize> {
        1usize
            .checked_shl(self.nbits_per_codebook)
            .ok_or_else(|| Error::Config {
                reason: format!("{}-bit codebooks cannot be allocated", self.nbits_per_codebook),
            })
    }

    /// Storage width for the codes tensor
    pub fn code_storage(&self) -> CodeStorage {
        // validate() guarantees nbits is in range
        CodeStorage::for_bits(self.nbits_per_codebook).unwrap_or(CodeStorage::I64)
    }

    pub fn supported_act_dtypes(&self) -> &'static [DType] {
        SUPPORTED_ACT_DTYPES
    }

    /// Extra config files required next to config.json (none)
    pub fn config_filenames(&self) -> &'static [&'static str] {
        &[]
    }

    /// Activation names that need rescaling (none)
    pub fn scaled_act_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fused projections (QKV, gate/up) keep a single merged parameter
    pub fn merge_weight(&self) -> bool {
        true
    }

    /// AQLM does not dictate a RoPE layout
    pub fn rope_style(&self) -> Option<bool> {
        None
    }

    /// Whether (embedding, lm_head) are quantized
    pub fn quant_vocab(&self) -> [bool; 2] {
        [false, false]
    }

    pub fn support_fused_moe(&self) -> bool {
        false
    }
}

impl fmt::Display for AqlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AqlmConfig(in_group_size={}, nbits_per_codebook={}, num_codebooks={}, out_group_size={})",
            self.in_group_size, self.nbits_per_codebook, self.num_codebooks, self.out_group_size
        )
    }
}
