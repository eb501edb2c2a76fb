//! Error types for the balancer protocol

use thiserror::Error;

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Balancer protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Request could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Response was not valid msgpack for the expected shape
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The RPC channel failed to deliver the request or the response
    #[error("Channel error on {method}: {source}")]
    Channel {
        /// Balancer method being called
        method: &'static str,
        /// Underlying channel failure
        #[source]
        source: anyhow::Error,
    },
}

impl ProtocolError {
    /// Create a channel error
    pub fn channel(method: &'static str, source: anyhow::Error) -> Self {
        Self::Channel { method, source }
    }
}
