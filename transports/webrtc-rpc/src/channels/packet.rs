//! Message fragmentation and reassembly
//!
//! An RPC message may be larger than what a single SCTP datagram can carry, so
//! every message is split into `PacketMessage` fragments of at most
//! [`MAX_PACKET_PAYLOAD`] bytes. The last fragment has `eom` set. The
//! receiving side accumulates exactly one message at a time per stream.

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::generated::proto::rpc::webrtc::v1::PacketMessage;
use crate::Error;

/// Maximum payload bytes carried by one fragment
///
/// 16 KiB minus the room the `Request`/`Response` envelope needs, so a
/// fragment never exceeds the 16 KiB data-channel message size.
pub const MAX_PACKET_PAYLOAD: usize = 16_373;

/// Maximum size of one reassembled message (32 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1 << 25;

/// Split a message into fragments, the last one marked end-of-message
///
/// A zero-length message becomes a single empty fragment with `eom` set.
pub fn encode(message: Bytes) -> Vec<PacketMessage> {
    if message.is_empty() {
        return vec![PacketMessage {
            data: Vec::new(),
            eom: true,
        }];
    }

    let total = message.len();
    let mut packets = Vec::with_capacity(total.div_ceil(MAX_PACKET_PAYLOAD));
    let mut offset = 0;
    while offset < total {
        let end = (offset + MAX_PACKET_PAYLOAD).min(total);
        packets.push(PacketMessage {
            data: message[offset..end].to_vec(),
            eom: end == total,
        });
        offset = end;
    }
    packets
}

/// Result of feeding one fragment to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// More fragments are needed
    Pending,
    /// A full message is available
    Complete(Bytes),
    /// The message grew past the limit and was dropped; the stream stays usable
    Discarded {
        /// Total bytes received for the dropped message
        size: usize,
        /// Limit the message exceeded
        limit: usize,
    },
}

impl PacketOutcome {
    /// The error describing a discarded message, if this outcome is one
    pub fn error(&self) -> Option<Error> {
        match *self {
            PacketOutcome::Discarded { size, limit } => {
                Some(Error::OversizedMessage { size, limit })
            }
            _ => None,
        }
    }
}

/// Accumulates fragments of one in-flight message
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    limit: usize,
    /// Bytes seen for a message that is being dropped
    discarding: Option<usize>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Reassembler bounded by [`MAX_MESSAGE_SIZE`]
    pub fn new() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }

    /// Reassembler with a custom message size limit
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            limit,
            discarding: None,
        }
    }

    /// Message size limit
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True while a message is partially received
    pub fn in_progress(&self) -> bool {
        !self.buffer.is_empty() || self.discarding.is_some()
    }

    /// Feed the next fragment
    pub fn push(&mut self, packet: PacketMessage) -> PacketOutcome {
        let data = packet.data;

        if let Some(seen) = self.discarding.as_mut() {
            *seen = seen.saturating_add(data.len());
            if !packet.eom {
                return PacketOutcome::Pending;
            }
            let size = *seen;
            self.discarding = None;
            return PacketOutcome::Discarded {
                size,
                limit: self.limit,
            };
        }

        let size = self.buffer.len().saturating_add(data.len());
        if size > self.limit {
            warn!(
                "Discarding message: {} bytes exceeds limit of {} bytes",
                size, self.limit
            );
            self.buffer = BytesMut::new();
            if packet.eom {
                return PacketOutcome::Discarded {
                    size,
                    limit: self.limit,
                };
            }
            self.discarding = Some(size);
            return PacketOutcome::Pending;
        }

        self.buffer.extend_from_slice(&data);
        if packet.eom {
            PacketOutcome::Complete(self.buffer.split().freeze())
        } else {
            PacketOutcome::Pending
        }
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = None;
    }
}
