//! Error types for the WebRTC RPC transport

use tonic::{Code, Status};

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dialing or while running calls over a channel
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The signaling server broke the call protocol (stage order, uuid mismatch, duplicate init)
    #[error("Signaling protocol error: {0}")]
    SignalingProtocol(String),

    /// Signaling RPC failed or the signaling stream ended early
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Peer connection or data channel failed, or closed before it was ready
    #[error("Transport error: {0}")]
    Transport(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// A reassembled message grew past the configured limit
    #[error("Message of {size} bytes exceeds the maximum of {limit} bytes")]
    OversizedMessage {
        /// Bytes received for the message when it was discarded
        size: usize,
        /// Maximum message size
        limit: usize,
    },

    /// A stream received frames out of header, message, trailer order
    #[error("Stream protocol error: {0}")]
    Protocol(String),

    /// Non-OK trailers returned by the remote end of a call
    #[error("RPC failed: {0}")]
    RpcStatus(Status),

    /// Credential exchange failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The channel already carries the maximum number of active streams
    #[error("Too many active streams (max {0})")]
    TooManyStreams(usize),

    /// The call or channel was cancelled locally
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The call's local deadline elapsed
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// gRPC call on the direct channel failed
    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),

    /// gRPC connection could not be established
    #[error("gRPC transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Serialization(format!("Failed to decode protobuf: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(format!("Invalid JSON: {}", e))
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Signaling(_)
                | Error::Transport(_)
                | Error::DataChannel(_)
                | Error::DeadlineExceeded(_)
                | Error::GrpcTransport(_)
        ) || matches!(self, Error::Grpc(s) if s.code() == Code::Unavailable)
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a protocol violation by the remote side
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::SignalingProtocol(_) | Error::Protocol(_))
    }

    /// Convert into the status a caller of an RPC observes
    pub fn to_status(&self) -> Status {
        match self {
            Error::RpcStatus(status) | Error::Grpc(status) => status.clone(),
            Error::Cancelled(msg) => Status::cancelled(msg.clone()),
            Error::DeadlineExceeded(msg) => Status::deadline_exceeded(msg.clone()),
            Error::TooManyStreams(_) => Status::resource_exhausted(self.to_string()),
            Error::OversizedMessage { .. } => Status::resource_exhausted(self.to_string()),
            Error::InvalidConfig(_) => Status::invalid_argument(self.to_string()),
            Error::Authentication(_) => Status::unauthenticated(self.to_string()),
            Error::Transport(_)
            | Error::DataChannel(_)
            | Error::Signaling(_)
            | Error::GrpcTransport(_) => Status::unavailable(self.to_string()),
            _ => Status::internal(self.to_string()),
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        e.to_status()
    }
}
