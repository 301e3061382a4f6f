// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture engine
//!
//! Only session construction and reconfiguration failures surface as
//! [`CaptureError`]. Per-tick conditions (no buffer ready, a skipped
//! conversion, one bad audio read) are outcomes, not errors, and are absorbed
//! by the component that sees them.

use std::fmt;

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Capture engine error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The video device could not be opened (missing node, permission denied)
    DeviceOpen { path: String, reason: String },
    /// The driver rejected the requested format or granted an unusable layout
    FormatNegotiation(String),
    /// Buffer request, query or memory mapping failed
    Allocation(String),
    /// Queueing buffers or STREAMON failed
    StreamOn(String),
    /// STREAMOFF failed
    StreamOff(String),
    /// Dequeue failed for a reason other than "not ready yet"
    Dequeue(String),
    /// The audio capture handle could not be opened or started
    AudioOpen(String),
    /// Rebuilding the sessions after a settings change failed; engine is inert
    Reconfiguration(Box<CaptureError>),
    /// A setting is outside the recognized options
    InvalidSetting(String),
    /// Operation not valid in the current session state
    InvalidState(String),
    /// Settings file could not be read or written
    Config(String),
}

impl CaptureError {
    /// Whether this failure happened while rebuilding after a settings change
    pub fn is_reconfiguration(&self) -> bool {
        matches!(self, CaptureError::Reconfiguration(_))
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceOpen { path, reason } => {
                write!(f, "Failed to open {}: {}", path, reason)
            }
            CaptureError::FormatNegotiation(msg) => write!(f, "Format negotiation failed: {}", msg),
            CaptureError::Allocation(msg) => write!(f, "Buffer allocation failed: {}", msg),
            CaptureError::StreamOn(msg) => write!(f, "Failed to start streaming: {}", msg),
            CaptureError::StreamOff(msg) => write!(f, "Failed to stop streaming: {}", msg),
            CaptureError::Dequeue(msg) => write!(f, "Dequeue failed: {}", msg),
            CaptureError::AudioOpen(msg) => write!(f, "Failed to open audio capture: {}", msg),
            CaptureError::Reconfiguration(cause) => write!(f, "Reconfiguration failed: {}", cause),
            CaptureError::InvalidSetting(msg) => write!(f, "Invalid setting: {}", msg),
            CaptureError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            CaptureError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Reconfiguration(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconfiguration_wraps_cause() {
        let err = CaptureError::Reconfiguration(Box::new(CaptureError::FormatNegotiation(
            "driver rejected NV12".into(),
        )));
        assert!(err.is_reconfiguration());
        assert_eq!(
            err.to_string(),
            "Reconfiguration failed: Format negotiation failed: driver rejected NV12"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_device_open_message() {
        let err = CaptureError::DeviceOpen {
            path: "/dev/video11".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(err.to_string(), "Failed to open /dev/video11: No such file or directory");
    }
}
