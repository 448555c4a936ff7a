//! Call multiplexing over the RPC data channel

pub mod client_channel;
pub mod packet;
pub mod stream;

pub use client_channel::{
    ChannelState, FrameSink, WeakWebRtcChannel, WebRtcChannel, MAX_STREAM_COUNT,
};
pub use packet::{PacketOutcome, Reassembler, MAX_MESSAGE_SIZE, MAX_PACKET_PAYLOAD};
pub use stream::ClientCall;
