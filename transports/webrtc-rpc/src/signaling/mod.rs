//! Signaling: SDP/ICE exchange through the gRPC signaling service

pub mod client;
pub mod exchange;
pub mod protocol;

pub use client::{CallResponseStream, GrpcSignalingClient, SignalingApi, RPC_HOST_METADATA};
pub use exchange::{CandidateEvent, SignalingExchange, SignalingTasks, CANDIDATE_QUEUE_CAPACITY};
pub use protocol::{decode_sdp, encode_sdp, SessionDescription};
