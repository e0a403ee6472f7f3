//! aqlm error types

use numr::dtype::DType;

/// aqlm result type
pub type Result<T> = std::result::Result<T, Error>;

/// aqlm errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid quantization configuration, raised at setup time
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// The fused AQLM kernel was not provided
    #[error("missing kernel: {name} is required but was not provided")]
    MissingKernel {
        /// Kernel name
        name: &'static str,
    },

    /// Shape invariant between codes, scales and partitions does not hold
    #[error("invariant violation: {reason}")]
    InvariantViolation {
        /// Description of what went wrong
        reason: String,
    },

    /// DType mismatch for quantized operations
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Feature that is deliberately not implemented
    #[error("unsupported: {feature}")]
    Unsupported {
        /// Feature name
        feature: &'static str,
    },
}
