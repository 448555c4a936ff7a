//! WebRTC peer connection ownership
//!
//! Peer-connection callbacks never act directly: each one only pushes a
//! [`PeerEvent`] into an unbounded queue that a single per-connection event
//! loop drains.

pub mod connection;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::Result;

pub use connection::{RtcPeer, NEGOTIATION_CHANNEL_ID, RPC_CHANNEL_ID};

/// Something that happened on the peer connection or its data channels
#[derive(Debug)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(RTCIceCandidateInit),
    /// Local ICE gathering finished
    GatheringComplete,
    /// Peer connection state changed
    ConnectionState(RTCPeerConnectionState),
    /// The RPC data channel opened
    DataChannelOpen,
    /// The RPC data channel closed
    DataChannelClosed,
    /// The RPC data channel reported an error
    DataChannelError(String),
    /// One datagram arrived on the RPC data channel
    Message(Bytes),
}

/// Operations signaling needs from a peer connection
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Create an offer, apply it locally and return its SDP
    async fn create_offer(&self) -> Result<String>;

    /// Current local SDP, including every candidate gathered so far
    async fn local_description(&self) -> Result<String>;

    /// Apply the remote answer
    async fn set_remote_answer(&self, sdp: String) -> Result<()>;

    /// Add one remote ICE candidate
    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    /// Close the connection; idempotent
    async fn close(&self, reason: &str);
}
