//! Error and status types for the AV1 encode session.
//!
//! Hard failures are `Err(EncodeError)` and map to negative status codes.
//! Everything else (success, silent parameter correction, not-ready) is a
//! [`Status`] with a non-negative code.

use thiserror::Error;

/// Main error type for encode session operations.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// A video parameter is invalid (zero size, zero frame rate, malformed layers).
    #[error("Invalid video parameters: {0}")]
    InvalidVideoParam(String),

    /// The configuration is valid AV1 but not supported by the hardware/profile.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// The session was used before `Init` or after `Close`.
    #[error("Encoder is not initialized")]
    NotInitialized,

    /// The device reported a failure while submitting or querying a frame.
    #[error("Device error: {0}")]
    Device(String),

    /// The GPU stopped responding. Fatal to the hardware context.
    #[error("GPU hang detected on frame {0}")]
    GpuHang(u32),

    /// A fixed-size pool ran out of entries.
    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// A fixed-size write did not fit into its destination.
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes the write required.
        needed: usize,
        /// Bytes available in the destination.
        available: usize,
    },

    /// The decoded picture buffer reached a state the encoder cannot continue from.
    #[error("Invalid DPB state: {0}")]
    InvalidDpbState(String),

    /// The external look-ahead / rate-control engine failed.
    #[error("EncTools error: {0}")]
    EncTools(String),

    /// The operation was cancelled.
    #[error("Operation aborted: {0}")]
    Aborted(String),

    /// Writing into an in-memory buffer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    /// Negative status code reported at the session surface.
    pub fn code(&self) -> i32 {
        match self {
            EncodeError::UnsupportedConfig(_) => -3,
            EncodeError::MemoryAllocation(_) => -4,
            EncodeError::BufferTooSmall { .. } | EncodeError::Io(_) => -5,
            EncodeError::NotInitialized => -8,
            EncodeError::Aborted(_) => -11,
            EncodeError::InvalidVideoParam(_) => -15,
            EncodeError::InvalidDpbState(_) | EncodeError::EncTools(_) => -16,
            EncodeError::Device(_) => -17,
            EncodeError::GpuHang(_) => -21,
        }
    }
}

/// Non-error outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Success.
    #[default]
    Ok,
    /// Success, but a requested parameter was clamped or defaulted.
    ParamCorrected,
    /// The device is busy; retry on a later scheduler turn.
    DeviceBusy,
    /// Not enough buffered input to make progress yet.
    MoreData,
}

impl Status {
    /// Non-negative status code reported at the session surface.
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::DeviceBusy => 2,
            Status::ParamCorrected => 5,
            Status::MoreData => 10,
        }
    }

    /// True for statuses that park a task until a later turn.
    pub fn is_not_ready(self) -> bool {
        matches!(self, Status::DeviceBusy | Status::MoreData)
    }

    /// True when a parameter was silently corrected.
    pub fn is_warning(self) -> bool {
        matches!(self, Status::ParamCorrected)
    }

    fn rank(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::ParamCorrected => 1,
            Status::DeviceBusy => 2,
            Status::MoreData => 3,
        }
    }

    /// Combines two statuses, keeping the first one on a tie.
    pub fn worst(self, other: Status) -> Status {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Result type for encode session operations.
pub type Result<T> = std::result::Result<T, EncodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_negative() {
        let errors = [
            EncodeError::InvalidVideoParam("w".into()),
            EncodeError::UnsupportedConfig("422".into()),
            EncodeError::NotInitialized,
            EncodeError::Device("submit".into()),
            EncodeError::GpuHang(3),
            EncodeError::MemoryAllocation("rec".into()),
            EncodeError::BufferTooSmall {
                needed: 12,
                available: 4,
            },
            EncodeError::InvalidDpbState("empty".into()),
            EncodeError::EncTools("query".into()),
            EncodeError::Aborted("close".into()),
        ];
        for e in &errors {
            assert!(e.code() < 0, "{e} should map to a negative code");
        }
    }

    #[test]
    fn test_status_codes_are_non_negative() {
        for s in [
            Status::Ok,
            Status::ParamCorrected,
            Status::DeviceBusy,
            Status::MoreData,
        ] {
            assert!(s.code() >= 0);
        }
    }

    #[test]
    fn test_worst_status() {
        assert_eq!(Status::Ok.worst(Status::ParamCorrected), Status::ParamCorrected);
        assert_eq!(Status::ParamCorrected.worst(Status::Ok), Status::ParamCorrected);
        assert_eq!(Status::ParamCorrected.worst(Status::MoreData), Status::MoreData);
        assert_eq!(Status::Ok.worst(Status::Ok), Status::Ok);
    }

    #[test]
    fn test_not_ready() {
        assert!(Status::MoreData.is_not_ready());
        assert!(Status::DeviceBusy.is_not_ready());
        assert!(!Status::ParamCorrected.is_not_ready());
        assert!(Status::ParamCorrected.is_warning());
    }
}
