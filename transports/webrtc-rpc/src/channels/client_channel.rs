//! Multiplexed RPC channel over a single data channel
//!
//! Every call gets a fresh stream ID from a monotonically increasing counter.
//! Outbound frames are `Request` envelopes written to the shared data channel;
//! inbound `Response` envelopes are routed to the stream they name.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tonic::metadata::MetadataMap;
use tracing::{debug, info, warn};

use super::packet::MAX_MESSAGE_SIZE;
use super::stream::{ClientCall, ClientStream, StreamOwner};
use crate::generated::proto::rpc::webrtc::v1::Response;
use crate::{Error, Result};

/// Maximum number of concurrently active streams per channel
pub const MAX_STREAM_COUNT: usize = 256;

/// Outbound half of the physical transport
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Write one encoded `Request` envelope
    async fn send_frame(&self, frame: Bytes) -> Result<()>;

    /// Tear down the underlying connection
    async fn close(&self, reason: &str);
}

/// Channel readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the data channel to open
    Connecting,
    /// Calls may be issued
    Open,
    /// Closed locally or by a transport failure
    Closed,
}

struct StreamRegistry {
    next_id: u64,
    streams: HashMap<u64, Arc<ClientStream>>,
}

struct ChannelInner {
    sink: Arc<dyn FrameSink>,
    registry: Mutex<StreamRegistry>,
    state: watch::Sender<ChannelState>,
    closed: AtomicBool,
    call_timeout: Option<Duration>,
    message_limit: usize,
}

impl StreamOwner for ChannelInner {
    fn release(&self, id: u64) {
        self.registry.lock().streams.remove(&id);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        for (_, stream) in self.registry.get_mut().streams.drain() {
            stream.abort(Error::Cancelled("channel dropped".to_string()));
        }
    }
}

/// RPC channel tunneled over a WebRTC data channel
///
/// Cheap to clone; all clones share the same streams and connection.
#[derive(Clone)]
pub struct WebRtcChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("state", &self.state())
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

impl WebRtcChannel {
    /// Create a channel writing to `sink`; it starts in [`ChannelState::Connecting`]
    pub fn new(sink: Arc<dyn FrameSink>, call_timeout: Option<Duration>) -> Self {
        Self::with_message_limit(sink, call_timeout, MAX_MESSAGE_SIZE)
    }

    /// Like [`WebRtcChannel::new`] with a custom reassembly limit
    pub fn with_message_limit(
        sink: Arc<dyn FrameSink>,
        call_timeout: Option<Duration>,
        message_limit: usize,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            inner: Arc::new(ChannelInner {
                sink,
                registry: Mutex::new(StreamRegistry {
                    next_id: 0,
                    streams: HashMap::new(),
                }),
                state,
                closed: AtomicBool::new(false),
                call_timeout,
                message_limit,
            }),
        }
    }

    /// Current readiness
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes state changes; errors once every handle is dropped
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Handle that does not keep the channel alive
    pub fn downgrade(&self) -> WeakWebRtcChannel {
        WeakWebRtcChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered streams
    pub fn active_streams(&self) -> usize {
        self.inner.registry.lock().streams.len()
    }

    /// Resolves once the data channel is open
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map_err(|_| Error::Transport("channel dropped before ready".to_string()))?;
        match state {
            ChannelState::Open => Ok(()),
            _ => Err(Error::Transport("channel closed before ready".to_string())),
        }
    }

    /// Register a new stream without sending anything
    pub fn new_stream(&self, method: &str) -> Result<ClientCall> {
        let owner: Weak<dyn StreamOwner> = Arc::downgrade(&self.inner) as Weak<dyn StreamOwner>;
        let mut registry = self.inner.registry.lock();
        // shutdown sets `closed` before it drains the registry under this lock
        if self.is_closed() {
            return Err(Error::Transport("channel is closed".to_string()));
        }
        if registry.streams.len() >= MAX_STREAM_COUNT {
            return Err(Error::TooManyStreams(MAX_STREAM_COUNT));
        }

        registry.next_id += 1;
        let id = registry.next_id;
        let (stream, events) = ClientStream::new(
            id,
            method.to_string(),
            Arc::clone(&self.inner.sink),
            owner,
            self.inner.message_limit,
        );
        registry.streams.insert(id, Arc::clone(&stream));
        drop(registry);

        debug!("Registered stream {} for {}", id, method);
        Ok(ClientCall::new(stream, events))
    }

    /// Start a call; `timeout` falls back to the channel's default call timeout
    pub async fn new_call(
        &self,
        method: &str,
        metadata: &MetadataMap,
        timeout: Option<Duration>,
    ) -> Result<ClientCall> {
        self.ready().await?;
        let call = self.new_stream(method)?;
        call.start(metadata, timeout.or(self.inner.call_timeout))
            .await?;
        Ok(call)
    }

    /// Unary call with raw message bytes
    pub async fn unary(
        &self,
        method: &str,
        request: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.unary_with_metadata(method, &MetadataMap::new(), request, timeout)
            .await
    }

    /// Unary call with request metadata
    pub async fn unary_with_metadata(
        &self,
        method: &str,
        metadata: &MetadataMap,
        request: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let mut call = self.new_call(method, metadata, timeout).await?;
        call.send_message(request).await?;
        call.close_send().await?;

        let reply = call.message().await?.ok_or_else(|| {
            Error::Protocol(format!("unary call to {} returned no message", method))
        })?;
        while call.message().await?.is_some() {
            warn!("Ignoring extra response message for unary call {}", method);
        }
        Ok(reply)
    }

    /// Unary call with prost-encoded messages
    pub async fn unary_message<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let reply = self
            .unary(method, Bytes::from(request.encode_to_vec()), timeout)
            .await?;
        Ok(Resp::decode(reply)?)
    }

    /// Route one datagram received on the data channel
    pub fn handle_frame(&self, data: &[u8]) {
        let response = match Response::decode(data) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping undecodable response frame: {}", e);
                return;
            }
        };

        let Some(id) = response.stream.as_ref().map(|s| s.id) else {
            warn!("Dropping response frame without a stream ID");
            return;
        };

        let stream = self.inner.registry.lock().streams.get(&id).cloned();
        match stream {
            Some(stream) => stream.on_response(response.r#type),
            None => debug!("Dropping response for unknown or closed stream {}", id),
        }
    }

    /// Mark the channel usable
    pub fn mark_open(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        });
    }

    /// Close the connection and cancel every outstanding call; idempotent
    pub async fn close(&self) {
        self.shutdown("channel closed", |reason| Error::Cancelled(reason.to_string()))
            .await;
    }

    /// Tear down after a transport failure; outstanding calls fail as unavailable
    pub async fn fail(&self, reason: &str) {
        self.shutdown(reason, |reason| Error::Transport(reason.to_string()))
            .await;
    }

    /// Whether [`WebRtcChannel::close`] or [`WebRtcChannel::fail`] ran
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn shutdown(&self, reason: &str, error: impl Fn(&str) -> Error) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.state.send_replace(ChannelState::Closed);

        let streams: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.streams.drain().map(|(_, s)| s).collect()
        };
        info!(
            "Closing channel: reason={}, outstanding_streams={}",
            reason,
            streams.len()
        );
        for stream in streams {
            stream.abort(error(reason));
        }

        self.inner.sink.close(reason).await;
    }
}

/// Non-owning handle to a [`WebRtcChannel`]
#[derive(Clone)]
pub struct WeakWebRtcChannel {
    inner: Weak<ChannelInner>,
}

impl WeakWebRtcChannel {
    pub fn upgrade(&self) -> Option<WebRtcChannel> {
        self.inner.upgrade().map(|inner| WebRtcChannel { inner })
    }
}
