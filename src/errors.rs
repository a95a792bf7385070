use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Errors with matrix multiplication inputs.
#[derive(Clone, Debug, PartialEq)]
pub enum GemmError {
    /// Number of columns in the LHS does not match rows of the RHS.
    KSizeMismatch,
    /// Result matrix shape does not match the LHS row and RHS column counts.
    ResultSizeMismatch,
    /// A per-index offset vector length does not match the corresponding
    /// result dimension.
    WrongOffsetSize,
    /// The buffer provided for the output is too short.
    OutputSizeMismatch,
}

impl Display for GemmError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::KSizeMismatch => {
                write!(fmt, "columns of the LHS must match rows of the RHS")
            }
            Self::ResultSizeMismatch => {
                write!(fmt, "result shape does not match input shapes")
            }
            Self::WrongOffsetSize => {
                write!(fmt, "offset vector length does not match result dimension")
            }
            Self::OutputSizeMismatch => write!(fmt, "output buffer has wrong length"),
        }
    }
}

impl Error for GemmError {}

/// Result type returned by the public GEMM entry points.
pub type GemmResult = Result<(), GemmError>;
