//! Error types for the export pipeline

use crate::retry::FailureReason;
use std::fmt;

pub type Result<T> = std::result::Result<T, ExporterError>;

#[derive(Debug)]
pub enum ExporterError {
    /// Invalid or contradictory configuration, fatal at startup
    Config(String),

    /// Delivery kept failing with retryable reasons until the policy gave up
    TransientExport { attempts: u32, reason: FailureReason, message: String },

    /// Delivery failed with a reason no retry can fix
    PermanentExport { attempts: u32, reason: FailureReason, message: String },

    /// The batch could not be encoded; indicates a defect upstream
    Marshal(String),

    /// Export was attempted after shutdown began
    Rejected(String),

    /// IO operation failed
    Io(std::io::Error),

    /// HTTP client failed
    Http(reqwest::Error),

    /// JSON serialization failed
    Json(serde_json::Error),
}

impl ExporterError {
    /// Only transient delivery failures are worth handing back to a retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExporterError::TransientExport { .. })
    }

    /// Number of physical sends made before the error surfaced, if any were made.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ExporterError::TransientExport { attempts, .. }
            | ExporterError::PermanentExport { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl fmt::Display for ExporterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExporterError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ExporterError::TransientExport { attempts, reason, message } => write!(
                f,
                "Export failed after {} attempts ({}): {}",
                attempts, reason, message
            ),
            ExporterError::PermanentExport { attempts, reason, message } => write!(
                f,
                "Export rejected on attempt {} ({}): {}",
                attempts, reason, message
            ),
            ExporterError::Marshal(msg) => write!(f, "Marshaling fault: {}", msg),
            ExporterError::Rejected(msg) => write!(f, "Export rejected: {}", msg),
            ExporterError::Io(err) => write!(f, "IO error: {}", err),
            ExporterError::Http(err) => write!(f, "HTTP error: {}", err),
            ExporterError::Json(err) => write!(f, "JSON error: {}", err),
        }
    }
}

impl std::error::Error for ExporterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExporterError::Io(err) => Some(err),
            ExporterError::Http(err) => Some(err),
            ExporterError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExporterError {
    fn from(err: std::io::Error) -> Self {
        ExporterError::Io(err)
    }
}

impl From<reqwest::Error> for ExporterError {
    fn from(err: reqwest::Error) -> Self {
        ExporterError::Http(err)
    }
}

impl From<serde_json::Error> for ExporterError {
    fn from(err: serde_json::Error) -> Self {
        ExporterError::Json(err)
    }
}
