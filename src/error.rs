use std::fmt;
use thiserror::Error;

/// Everything that can go wrong between pressing the shutter and a saved receipt.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The recognition collaborator failed, or returned zero usable fragments.
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// Network failure or non-success status from the completion service.
    #[error("completion service unreachable: {0}")]
    Transport(String),

    /// The service response was missing required fields, had mismatched types,
    /// or used a shape we do not recognize.
    #[error("response violated the extraction schema: {0}")]
    Schema(String),

    /// The decoded payload was structurally sound but unusable as a receipt.
    #[error("receipt validation failed: {0}")]
    Validation(String),

    /// The persistence collaborator failed to commit.
    #[error("storage failed: {0}")]
    Storage(String),

    /// A capture was requested while another scan is still running. This is a
    /// rejection, not a pipeline failure: the in-flight scan is untouched.
    #[error("a scan is already in flight")]
    ScanInFlight,
}

impl ScanError {
    /// Stable machine-readable kind, surfaced alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::Recognition(_) => "recognition",
            ScanError::Transport(_) => "transport",
            ScanError::Schema(_) => "schema",
            ScanError::Validation(_) => "validation",
            ScanError::Storage(_) => "storage",
            ScanError::ScanInFlight => "scan-in-flight",
        }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        ScanError::Transport(err.to_string())
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        ScanError::Storage(err.to_string())
    }
}

/// Conditions the assembler reports without failing the scan.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyWarning {
    /// Receipt-level and summed item-level discounts disagree; the larger
    /// value was kept.
    DiscountMismatch { declared: f64, item_sum: f64 },
    /// The service's date string did not parse; the capture time was used.
    InferredDate,
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyWarning::DiscountMismatch { declared, item_sum } => write!(
                f,
                "receipt-level discount total {declared:.2} disagrees with summed item discounts {item_sum:.2}; kept the larger"
            ),
            AssemblyWarning::InferredDate => {
                write!(f, "receipt date could not be parsed; capture time substituted")
            }
        }
    }
}
