//! Error types for Fanout Core

use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias using Fanout Error
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy error kinds
///
/// Configuration and policy violations are raised before any network
/// activity. Transport failures keep the original [`TransportError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Missing groups, missing remotes, invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Live endpoint count below the die limit
    #[error("{operation}: too low number of live endpoints ({live}, need {required})")]
    InsufficientEndpoints {
        /// Operation that was refused
        operation: &'static str,
        /// Reachable endpoints
        live: usize,
        /// Configured die limit
        required: usize,
    },

    /// Balancer unreachable, never initialised or without a usable answer
    #[error("Balancer unavailable: {0}")]
    BalancerUnavailable(String),

    /// Success-copies policy not met; partial copies were rolled back
    #[error("{operation} for key {key}: not enough copies written ({achieved}, need {required})")]
    InsufficientReplicas {
        /// Operation name
        operation: &'static str,
        /// Key identity
        key: String,
        /// Groups that acknowledged
        achieved: usize,
        /// Groups the policy requires
        required: usize,
    },

    /// No candidate group holds the object
    #[error("{operation}: key {key} not found")]
    NotFound {
        /// Operation name
        operation: &'static str,
        /// Key identity
        key: String,
    },

    /// Bulk keys and payloads differ in length
    #[error("{operation}: counts of keys and data are not equal ({keys} keys, {data} data)")]
    ArityMismatch {
        /// Operation name
        operation: &'static str,
        /// Number of keys
        keys: usize,
        /// Number of payloads
        data: usize,
    },

    /// Opaque failure reported by the storage layer
    #[error("{operation} failed for key {key}: {source}")]
    Transport {
        /// Operation name
        operation: &'static str,
        /// Key identity
        key: String,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Write failed before any group answered
    #[error("Can't write data for key {key}: {reason}")]
    WriteFailed {
        /// Key identity
        key: String,
        /// Failure description
        reason: String,
    },

    /// Read failed for a reason other than a missing object
    #[error("Can't read data for key {key}: {reason}")]
    ReadFailed {
        /// Key identity
        key: String,
        /// Failure description
        reason: String,
    },

    /// Malformed packed container or unparsable transport answer
    #[error("Codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a balancer error
    pub fn balancer(msg: impl Into<String>) -> Self {
        Self::BalancerUnavailable(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Wrap a transport failure with operation and key identity
    pub fn transport(operation: &'static str, key: impl ToString, source: TransportError) -> Self {
        Self::Transport {
            operation,
            key: key.to_string(),
            source,
        }
    }

    /// True for errors produced by policy checks rather than the transport
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::InsufficientEndpoints { .. }
                | Self::InsufficientReplicas { .. }
                | Self::ArityMismatch { .. }
        )
    }
}

#[cfg(feature = "balancer")]
impl From<fanout_protocol::ProtocolError> for Error {
    fn from(err: fanout_protocol::ProtocolError) -> Self {
        Self::BalancerUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_identity() {
        let err = Error::InsufficientReplicas {
            operation: "write",
            key: "photo.jpg".into(),
            achieved: 1,
            required: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("write"));
        assert!(msg.contains("photo.jpg"));
        assert!(err.is_policy_violation());
    }

    #[test]
    fn test_transport_is_not_policy() {
        let err = Error::transport("remove", "k", TransportError::io("connection reset"));
        assert!(!err.is_policy_violation());
        assert!(err.to_string().contains("connection reset"));
    }
}
