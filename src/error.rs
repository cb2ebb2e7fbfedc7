//! Engine error taxonomy
//!
//! Transport failures are classified once, on their way out of the retry
//! helper, into the variants callers act on. A partially enumerated object
//! list is not an error; see
//! [`ObjectListResult::is_complete`](crate::enumerate::ObjectListResult::is_complete).

use crate::config::ConfigError;
use crate::device::{AddressParseError, RangeError};
use crate::transport::{Rejection, TransportError};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    /// No reply after every attempt
    #[error("request timed out after {attempts} attempts")]
    TransportTimeout { attempts: u32 },
    /// The device refused the request
    #[error("device rejected the request: {0}")]
    ProtocolRejection(Rejection),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// The device could not be reached at all
    #[error("device {instance} is unresponsive")]
    DeviceUnresponsive { instance: u32 },
    #[error(transparent)]
    InvalidAddress(#[from] AddressParseError),
    #[error("invalid instance range {low}..={high}")]
    InvalidRange { low: u32, high: u32 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("session is shut down")]
    ShutDown,
    #[error("session already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Transport failures that are neither timeouts, rejections nor bad replies
    #[error(transparent)]
    Transport(TransportError),
}

impl ReconError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconError::TransportTimeout { .. })
    }
}

impl From<TransportError> for ReconError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => ReconError::TransportTimeout { attempts: 1 },
            TransportError::Rejected(rejection) => ReconError::ProtocolRejection(rejection),
            TransportError::Malformed(message) => ReconError::MalformedResponse(message),
            other => ReconError::Transport(other),
        }
    }
}

impl From<RangeError> for ReconError {
    fn from(error: RangeError) -> Self {
        ReconError::InvalidRange {
            low: error.low,
            high: error.high,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InstanceRange;
    use crate::service::RejectReason;

    #[test]
    fn test_transport_errors_are_classified() {
        assert!(matches!(
            ReconError::from(TransportError::Timeout),
            ReconError::TransportTimeout { attempts: 1 }
        ));
        assert!(matches!(
            ReconError::from(TransportError::Rejected(Rejection::Reject(
                RejectReason::UnrecognizedService
            ))),
            ReconError::ProtocolRejection(_)
        ));
        assert!(matches!(
            ReconError::from(TransportError::Malformed("bad tag".into())),
            ReconError::MalformedResponse(_)
        ));
        assert!(matches!(
            ReconError::from(TransportError::Unavailable("closed".into())),
            ReconError::Transport(_)
        ));
    }

    #[test]
    fn test_misuse_errors() {
        let error: ReconError = InstanceRange::new(9, 3).unwrap_err().into();
        assert_eq!(error.to_string(), "invalid instance range 9..=3");
        assert!(!error.is_retryable());

        let error: ReconError = "nonsense".parse::<crate::device::DeviceAddress>().unwrap_err().into();
        assert!(matches!(error, ReconError::InvalidAddress(_)));
    }
}
