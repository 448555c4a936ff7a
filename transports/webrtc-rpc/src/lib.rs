//! RPC over WebRTC data channels
//!
//! This crate is a client transport that invokes RPC methods on a peer that
//! may be unreachable over direct TCP. Calls are tunneled over a single
//! WebRTC data channel; the peer connection itself is negotiated through a
//! gRPC signaling service.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Dialer                                                │
//! │  ├─ dial_direct  (tonic Channel + single-flight auth)  │
//! │  └─ dial_webrtc                                        │
//! │     ├─ SignalingExchange (Call / CallUpdate over gRPC) │
//! │     └─ RtcPeer (peer connection, data channels 0 + 1)  │
//! │        ↓ (ordered, pre-negotiated data channel)        │
//! │  WebRtcChannel (stream registry, inbound dispatch)     │
//! │  └─ ClientStream per call (headers → msgs → trailers)  │
//! │     └─ PacketCodec (16 373 byte fragments)             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use remotemedia_webrtc_rpc::{DialOptions, WebRtcDialOptions};
//!
//! let options = DialOptions::default().with_webrtc(WebRtcDialOptions {
//!     signaling_address: Some("signaling.example.com:443".to_string()),
//!     ..Default::default()
//! });
//!
//! assert!(options.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use bytes::Bytes;
//! use remotemedia_webrtc_rpc::{DialOptions, Dialer};
//!
//! # async fn example() -> remotemedia_webrtc_rpc::Result<()> {
//! let dialer = Dialer::new(DialOptions::default());
//! let channel = dialer
//!     .dial_webrtc("signaling.example.com:443", "robot.example.com")
//!     .await?;
//!
//! let reply = channel
//!     .unary("/proto.api.robot.v1.RobotService/GetStatus", Bytes::new(), None)
//!     .await?;
//! # let _ = reply;
//! channel.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod auth;
pub mod channels;
pub mod config;
pub mod dial;
pub mod error;
pub mod metadata;
pub mod peer;
pub mod signaling;

/// Generated protobuf and gRPC types
pub mod generated {
    pub mod proto {
        pub mod rpc {
            pub mod v1 {
                tonic::include_proto!("proto.rpc.v1");
            }
            pub mod webrtc {
                pub mod v1 {
                    tonic::include_proto!("proto.rpc.webrtc.v1");
                }
            }
        }
    }
}

pub use auth::{AccessTokenCache, AuthenticatedChannel, Authenticator};
pub use channels::{
    ClientCall, FrameSink, WebRtcChannel, MAX_MESSAGE_SIZE, MAX_PACKET_PAYLOAD, MAX_STREAM_COUNT,
};
pub use config::{Credentials, DialOptions, IceServerConfig, WebRtcDialOptions};
pub use dial::{dial_direct, dial_webrtc, DirectChannel, Dialer};
pub use error::{Error, Result};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
