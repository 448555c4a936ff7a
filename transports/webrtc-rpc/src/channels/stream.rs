//! Per-call stream state machine
//!
//! Send side: `Created → HeadersSent → (messages) → HalfClosed`.
//! Receive side: `AwaitingHeaders → ReceivingMessages → Done`.
//! Either side may jump to done on cancellation, deadline expiry, a protocol
//! violation or channel shutdown. A stream finishes exactly once; finishing
//! removes it from its channel's registry.

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{debug, warn};

use super::client_channel::FrameSink;
use super::packet::{self, PacketOutcome, Reassembler};
use crate::generated::proto::rpc::webrtc::v1::{
    request, response, Request, RequestHeaders, RequestMessage, ResponseTrailers,
    Stream as StreamId,
};
use crate::metadata;
use crate::{Error, Result};

/// Registry that owns active streams
pub(crate) trait StreamOwner: Send + Sync {
    /// Forget a stream that reached a terminal state
    fn release(&self, id: u64);
}

/// Events delivered from the inbound dispatcher to the caller's handle
#[derive(Debug)]
pub(crate) enum CallEvent {
    Headers(MetadataMap),
    Message(Bytes),
    /// Terminal; carries trailers on success
    Finished(std::result::Result<MetadataMap, Error>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Created,
    HeadersSent,
    HalfClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    AwaitingHeaders,
    ReceivingMessages,
    Done,
}

struct RecvState {
    phase: RecvPhase,
    reassembler: Reassembler,
}

/// One logical call multiplexed over the channel
pub(crate) struct ClientStream {
    id: u64,
    method: String,
    sink: Arc<dyn FrameSink>,
    owner: Weak<dyn StreamOwner>,
    send: tokio::sync::Mutex<SendPhase>,
    recv: Mutex<RecvState>,
    events: mpsc::UnboundedSender<CallEvent>,
    finished: AtomicBool,
    deadline: Mutex<Option<AbortHandle>>,
}

impl ClientStream {
    pub(crate) fn new(
        id: u64,
        method: String,
        sink: Arc<dyn FrameSink>,
        owner: Weak<dyn StreamOwner>,
        message_limit: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(Self {
            id,
            method,
            sink,
            owner,
            send: tokio::sync::Mutex::new(SendPhase::Created),
            recv: Mutex::new(RecvState {
                phase: RecvPhase::AwaitingHeaders,
                reassembler: Reassembler::with_limit(message_limit),
            }),
            events,
            finished: AtomicBool::new(false),
            deadline: Mutex::new(None),
        });
        (stream, rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Send the headers frame; resolves once the frame is handed to the data channel
    pub(crate) async fn start(
        self: &Arc<Self>,
        metadata: &MetadataMap,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut send = self.send.lock().await;
        if *send != SendPhase::Created {
            return Err(Error::Protocol(format!(
                "stream {} already started",
                self.id
            )));
        }
        self.ensure_active()?;

        let headers = RequestHeaders {
            method: self.method.clone(),
            metadata: Some(metadata::to_proto(metadata)),
            timeout: timeout.and_then(|t| prost_types::Duration::try_from(t).ok()),
        };
        self.write(request::Type::Headers(headers)).await?;
        *send = SendPhase::HeadersSent;

        if let Some(timeout) = timeout {
            self.arm_deadline(timeout);
        }

        debug!("Stream {} started: method={}", self.id, self.method);
        Ok(())
    }

    /// Fragment and send one message
    pub(crate) async fn send_message(&self, message: Bytes) -> Result<()> {
        let send = self.send.lock().await;
        match *send {
            SendPhase::Created => {
                return Err(Error::Protocol(format!(
                    "stream {} sent a message before headers",
                    self.id
                )))
            }
            SendPhase::HalfClosed => {
                return Err(Error::Protocol(format!(
                    "stream {} sent a message after close_send",
                    self.id
                )))
            }
            SendPhase::HeadersSent => {}
        }
        self.ensure_active()?;

        for packet in packet::encode(message) {
            self.write(request::Type::Message(RequestMessage {
                has_message: true,
                packet_message: Some(packet),
                eos: false,
            }))
            .await?;
        }
        Ok(())
    }

    /// Tell the server no further messages follow
    pub(crate) async fn close_send(&self) -> Result<()> {
        let mut send = self.send.lock().await;
        match *send {
            SendPhase::Created => {
                return Err(Error::Protocol(format!(
                    "stream {} closed before headers",
                    self.id
                )))
            }
            SendPhase::HalfClosed => return Ok(()),
            SendPhase::HeadersSent => {}
        }
        self.ensure_active()?;

        self.write(request::Type::Message(RequestMessage {
            has_message: false,
            packet_message: None,
            eos: true,
        }))
        .await?;
        *send = SendPhase::HalfClosed;
        Ok(())
    }

    /// Route one inbound frame
    pub(crate) fn on_response(self: &Arc<Self>, kind: Option<response::Type>) {
        let mut recv = self.recv.lock();
        if recv.phase == RecvPhase::Done {
            debug!("Stream {} dropping frame after completion", self.id);
            return;
        }

        let violation = match kind {
            None => Some("response frame without payload".to_string()),
            Some(response::Type::Headers(headers)) => {
                if recv.phase == RecvPhase::AwaitingHeaders {
                    recv.phase = RecvPhase::ReceivingMessages;
                    let _ = self
                        .events
                        .send(CallEvent::Headers(metadata::from_proto(headers.metadata)));
                    None
                } else {
                    Some("headers received after headers or messages".to_string())
                }
            }
            Some(response::Type::Message(message)) => {
                if recv.phase == RecvPhase::AwaitingHeaders {
                    Some("message received before headers".to_string())
                } else {
                    match message.packet_message {
                        None => Some("message frame without packet".to_string()),
                        Some(packet) => {
                            match recv.reassembler.push(packet) {
                                PacketOutcome::Complete(bytes) => {
                                    let _ = self.events.send(CallEvent::Message(bytes));
                                }
                                outcome @ PacketOutcome::Discarded { .. } => {
                                    if let Some(err) = outcome.error() {
                                        warn!("Stream {} dropped message: {}", self.id, err);
                                    }
                                }
                                PacketOutcome::Pending => {}
                            }
                            None
                        }
                    }
                }
            }
            Some(response::Type::Trailers(trailers)) => {
                if recv.phase == RecvPhase::AwaitingHeaders {
                    Some("trailers received before headers".to_string())
                } else {
                    drop(recv);
                    self.finish(trailers_result(trailers));
                    return;
                }
            }
        };

        drop(recv);
        if let Some(violation) = violation {
            warn!("Stream {} protocol violation: {}", self.id, violation);
            if self.finish(Err(Error::Protocol(violation))) {
                self.spawn_reset();
            }
        }
    }

    /// Fail the call locally and reset it on the server
    pub(crate) async fn cancel(&self, reason: &str) {
        if self.finish(Err(Error::Cancelled(reason.to_string()))) {
            self.reset().await;
        }
    }

    /// Cancel from a synchronous context, e.g. when the caller's handle is dropped
    pub(crate) fn cancel_detached(self: &Arc<Self>, reason: &str) {
        if self.finish(Err(Error::Cancelled(reason.to_string()))) {
            self.spawn_reset();
        }
    }

    /// Fail the call because its channel went away; the server is not notified
    pub(crate) fn abort(&self, error: Error) {
        self.finish(Err(error));
    }

    /// Move to the terminal state; returns false when already finished
    fn finish(&self, result: std::result::Result<MetadataMap, Error>) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }

        {
            let mut recv = self.recv.lock();
            recv.phase = RecvPhase::Done;
            recv.reassembler.reset();
        }
        if let Some(timer) = self.deadline.lock().take() {
            timer.abort();
        }

        match &result {
            Ok(_) => debug!("Stream {} finished: method={}", self.id, self.method),
            Err(e) => debug!("Stream {} failed: method={}, {}", self.id, self.method, e),
        }
        let _ = self.events.send(CallEvent::Finished(result));

        if let Some(owner) = self.owner.upgrade() {
            owner.release(self.id);
        }
        true
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::Cancelled(format!("stream {} is closed", self.id)));
        }
        Ok(())
    }

    fn arm_deadline(self: &Arc<Self>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(stream) = weak.upgrade() {
                // Detach so finishing does not abort this task mid-reset
                stream.deadline.lock().take();
                let reason = format!("call to {} exceeded {:?}", stream.method, timeout);
                if stream.finish(Err(Error::DeadlineExceeded(reason))) {
                    stream.reset().await;
                }
            }
        });

        let mut slot = self.deadline.lock();
        if self.is_finished() {
            timer.abort();
        } else {
            *slot = Some(timer.abort_handle());
        }
    }

    async fn reset(&self) {
        if let Err(e) = self.write(request::Type::RstStream(true)).await {
            debug!("Failed to reset stream {}: {}", self.id, e);
        }
    }

    fn spawn_reset(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to reset stream {}", self.id);
            return;
        };
        let stream = Arc::clone(self);
        handle.spawn(async move { stream.reset().await });
    }

    async fn write(&self, kind: request::Type) -> Result<()> {
        let frame = Request {
            stream: Some(StreamId { id: self.id }),
            r#type: Some(kind),
        };
        self.sink
            .send_frame(Bytes::from(frame.encode_to_vec()))
            .await
    }
}

fn trailers_result(trailers: ResponseTrailers) -> std::result::Result<MetadataMap, Error> {
    let md = metadata::from_proto(trailers.metadata);
    let (code, message) = trailers
        .status
        .map(|s| (Code::from_i32(s.code), s.message))
        .unwrap_or((Code::Ok, String::new()));

    if code == Code::Ok {
        Ok(md)
    } else {
        Err(Error::RpcStatus(Status::with_metadata(code, message, md)))
    }
}

/// Caller's handle on one call
///
/// Dropping an unfinished call cancels it and resets the stream on the server.
pub struct ClientCall {
    stream: Arc<ClientStream>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    headers: Option<MetadataMap>,
    trailers: Option<MetadataMap>,
    final_status: Option<Status>,
}

impl std::fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("id", &self.stream.id())
            .field("method", &self.stream.method())
            .field("finished", &self.stream.is_finished())
            .finish()
    }
}

impl ClientCall {
    pub(crate) fn new(stream: Arc<ClientStream>, events: mpsc::UnboundedReceiver<CallEvent>) -> Self {
        Self {
            stream,
            events,
            headers: None,
            trailers: None,
            final_status: None,
        }
    }

    /// Stream ID on the channel
    pub fn id(&self) -> u64 {
        self.stream.id()
    }

    /// Fully qualified method name
    pub fn method(&self) -> &str {
        self.stream.method()
    }

    /// Send request headers; a deadline, if any, starts counting now
    pub async fn start(&self, metadata: &MetadataMap, timeout: Option<Duration>) -> Result<()> {
        self.stream.start(metadata, timeout).await
    }

    /// Send one request message
    pub async fn send_message(&self, message: Bytes) -> Result<()> {
        self.stream.send_message(message).await
    }

    /// Half-close the call
    pub async fn close_send(&self) -> Result<()> {
        self.stream.close_send().await
    }

    /// Wait for the response headers
    pub async fn response_headers(&mut self) -> Result<MetadataMap> {
        loop {
            if let Some(headers) = &self.headers {
                return Ok(headers.clone());
            }
            if let Some(status) = &self.final_status {
                return Err(Error::RpcStatus(status.clone()));
            }
            match self.next_event().await? {
                Some(CallEvent::Message(_)) => {
                    return Err(Error::Protocol(
                        "response message consumed before headers".to_string(),
                    ))
                }
                Some(_) => continue,
                None => return Ok(MetadataMap::new()),
            }
        }
    }

    /// Next response message, or `None` once the call finished with an OK status
    pub async fn message(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.next_event().await? {
                Some(CallEvent::Message(message)) => return Ok(Some(message)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Trailers of a call that completed successfully
    pub fn trailers(&self) -> Option<&MetadataMap> {
        self.trailers.as_ref()
    }

    /// Whether the call reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.stream.is_finished()
    }

    /// Cancel just this call
    pub async fn cancel(&self) {
        self.stream.cancel("cancelled by caller").await;
    }

    /// Adapt the response side into a stream of messages
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::unfold(Some(self), |call| async move {
            let mut call = call?;
            match call.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(call))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Pull one event; `Ok(None)` after a successful finish.
    async fn next_event(&mut self) -> Result<Option<CallEvent>> {
        if let Some(status) = &self.final_status {
            if status.code() == Code::Ok {
                return Ok(None);
            }
            return Err(Error::RpcStatus(status.clone()));
        }

        match self.events.recv().await {
            Some(CallEvent::Headers(headers)) => {
                self.headers = Some(headers.clone());
                Ok(Some(CallEvent::Headers(headers)))
            }
            Some(CallEvent::Message(message)) => Ok(Some(CallEvent::Message(message))),
            Some(CallEvent::Finished(Ok(trailers))) => {
                self.trailers = Some(trailers);
                self.final_status = Some(Status::ok(""));
                Ok(None)
            }
            Some(CallEvent::Finished(Err(e))) => {
                self.final_status = Some(e.to_status());
                Err(e)
            }
            None => {
                let status = Status::cancelled("stream closed");
                self.final_status = Some(status.clone());
                Err(Error::Cancelled("stream closed".to_string()))
            }
        }
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        if !self.stream.is_finished() {
            self.stream.cancel_detached("call dropped");
        }
    }
}
