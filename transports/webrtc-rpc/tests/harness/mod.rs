//! In-process signaling and auth servers for integration tests
//!
//! The signaling server answers every `Call` with a real webrtc-rs peer whose
//! RPC data channel echoes requests back:
//! - `ECHO_METHOD` echoes each message and finishes with an OK status
//! - `FAIL_METHOD` finishes with `NOT_FOUND` once the client half-closes
//! - `HANG_METHOD` sends headers and nothing else

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use remotemedia_webrtc_rpc::generated::proto::rpc::v1::{
    auth_service_server::{AuthService, AuthServiceServer},
    AuthenticateRequest, AuthenticateResponse,
};
use remotemedia_webrtc_rpc::generated::proto::rpc::webrtc::v1::{
    call_response, call_update_request, request, response,
    signaling_service_server::{SignalingService, SignalingServiceServer},
    AnswerRequest, AnswerResponse, CallRequest, CallResponse, CallResponseInitStage,
    CallUpdateRequest, CallUpdateResponse, OptionalWebRtcConfigRequest,
    OptionalWebRtcConfigResponse, PacketMessage, Request as RpcRequest, Response as RpcResponse,
    ResponseHeaders, ResponseMessage, ResponseTrailers, Status as StatusProto, Stream as StreamId,
    WebRtcConfig,
};
use remotemedia_webrtc_rpc::signaling::{decode_sdp, encode_sdp, SessionDescription};
use remotemedia_webrtc_rpc::MAX_PACKET_PAYLOAD;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::Stream;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status, Streaming};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub const ECHO_METHOD: &str = "/test.v1.EchoService/Echo";
pub const FAIL_METHOD: &str = "/test.v1.EchoService/Fail";
pub const HANG_METHOD: &str = "/test.v1.EchoService/Hang";

pub const HOST: &str = "robot.local";
pub const ACCESS_TOKEN: &str = "token-1";
pub const SECRET: &str = "secret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("remotemedia_webrtc_rpc=debug")
        .with_test_writer()
        .try_init();
}

/// What the servers observed
#[derive(Default)]
pub struct ServerState {
    pub authenticate_calls: AtomicUsize,
    pub config_calls: AtomicUsize,
    pub call_requests: Mutex<Vec<CallRequest>>,
    pub updates: Mutex<Vec<CallUpdateRequest>>,
    pub resets: AtomicUsize,
    sessions: Mutex<HashMap<String, AnswerSession>>,
}

impl ServerState {
    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<CallUpdateRequest> {
        self.updates.lock().clone()
    }

    pub fn done_updates(&self) -> usize {
        self.updates()
            .iter()
            .filter(|u| matches!(u.update, Some(call_update_request::Update::Done(true))))
            .count()
    }
}

struct AnswerSession {
    peer_connection: Arc<RTCPeerConnection>,
    _responses: mpsc::Sender<Result<CallResponse, Status>>,
}

/// Server behavior knobs
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Require `authorization: Bearer ACCESS_TOKEN` on signaling calls
    pub require_auth: bool,
    /// `None` answers `OptionalWebRTCConfig` with `Unimplemented`
    pub webrtc_config: Option<WebRtcConfig>,
    /// Answer `OptionalWebRTCConfig` with this status instead
    pub config_error: Option<Code>,
    /// Never answer `OptionalWebRTCConfig`
    pub stall_config: bool,
}

pub struct TestServer {
    pub address: String,
    pub state: Arc<ServerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start auth and signaling services on an ephemeral port
pub async fn start_server(options: ServerOptions) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let state = Arc::new(ServerState::default());

    let auth = TestAuthService {
        state: Arc::clone(&state),
    };
    let signaling = TestSignalingService {
        state: Arc::clone(&state),
        options,
    };

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(AuthServiceServer::new(auth))
            .add_service(SignalingServiceServer::new(signaling))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    TestServer {
        address,
        state,
        handle,
    }
}

struct TestAuthService {
    state: Arc<ServerState>,
}

#[tonic::async_trait]
impl AuthService for TestAuthService {
    async fn authenticate(
        &self,
        request: Request<AuthenticateRequest>,
    ) -> Result<Response<AuthenticateResponse>, Status> {
        self.state.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent callers pile up
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let request = request.into_inner();
        let valid = request
            .credentials
            .map(|c| c.r#type == "api-key" && c.payload == SECRET)
            .unwrap_or(false);
        if !valid || request.entity.is_empty() {
            return Err(Status::unauthenticated("bad credentials"));
        }
        Ok(Response::new(AuthenticateResponse {
            access_token: ACCESS_TOKEN.to_string(),
        }))
    }
}

struct TestSignalingService {
    state: Arc<ServerState>,
    options: ServerOptions,
}

impl TestSignalingService {
    fn check(&self, metadata: &MetadataMap) -> Result<(), Status> {
        let host = metadata.get("rpc-host").and_then(|v| v.to_str().ok());
        if host != Some(HOST) {
            return Err(Status::invalid_argument(format!(
                "unexpected rpc-host {:?}",
                host
            )));
        }
        if self.options.require_auth {
            let bearer = format!("Bearer {}", ACCESS_TOKEN);
            let auth = metadata.get("authorization").and_then(|v| v.to_str().ok());
            if auth != Some(bearer.as_str()) {
                return Err(Status::unauthenticated("missing or wrong bearer token"));
            }
        }
        Ok(())
    }
}

fn internal(e: impl std::fmt::Display) -> Status {
    Status::internal(e.to_string())
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl SignalingService for TestSignalingService {
    type CallStream = ResponseStream<CallResponse>;
    type AnswerStream = ResponseStream<AnswerRequest>;

    async fn call(
        &self,
        request: Request<CallRequest>,
    ) -> Result<Response<Self::CallStream>, Status> {
        self.check(request.metadata())?;
        let call = request.into_inner();
        self.state.call_requests.lock().push(call.clone());

        let offer = decode_sdp(&call.sdp).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let peer_connection = echo_peer(Arc::clone(&self.state)).await.map_err(internal)?;

        let offer = RTCSessionDescription::offer(offer.sdp).map_err(internal)?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(internal)?;
        let answer = peer_connection.create_answer(None).await.map_err(internal)?;
        let mut gathered = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(internal)?;
        let _ = gathered.recv().await;
        let local = peer_connection
            .local_description()
            .await
            .ok_or_else(|| Status::internal("no local description"))?;

        let uuid = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(16);
        let init = CallResponse {
            uuid: uuid.clone(),
            stage: Some(call_response::Stage::Init(CallResponseInitStage {
                sdp: encode_sdp(&SessionDescription::answer(local.sdp)).map_err(internal)?,
            })),
        };

        // Register before answering; candidate updates follow the init stage
        self.state.sessions.lock().insert(
            uuid,
            AnswerSession {
                peer_connection,
                _responses: tx.clone(),
            },
        );
        tx.send(Ok(init)).await.map_err(internal)?;
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn call_update(
        &self,
        request: Request<CallUpdateRequest>,
    ) -> Result<Response<CallUpdateResponse>, Status> {
        self.check(request.metadata())?;
        let update = request.into_inner();
        self.state.updates.lock().push(update.clone());

        let peer_connection = self
            .state
            .sessions
            .lock()
            .get(&update.uuid)
            .map(|s| Arc::clone(&s.peer_connection))
            .ok_or_else(|| Status::not_found(format!("unknown call {}", update.uuid)))?;

        if let Some(call_update_request::Update::Candidate(candidate)) = update.update {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index.map(|i| i as u16),
                username_fragment: candidate.username_fragment,
            };
            peer_connection
                .add_ice_candidate(init)
                .await
                .map_err(internal)?;
        }
        Ok(Response::new(CallUpdateResponse {}))
    }

    async fn answer(
        &self,
        _request: Request<Streaming<AnswerResponse>>,
    ) -> Result<Response<Self::AnswerStream>, Status> {
        Err(Status::new(Code::Unimplemented, "answering is not supported"))
    }

    async fn optional_web_rtc_config(
        &self,
        request: Request<OptionalWebRtcConfigRequest>,
    ) -> Result<Response<OptionalWebRtcConfigResponse>, Status> {
        self.check(request.metadata())?;
        self.state.config_calls.fetch_add(1, Ordering::SeqCst);
        if self.options.stall_config {
            futures::future::pending::<()>().await;
        }
        if let Some(code) = self.options.config_error {
            return Err(Status::new(code, "config unavailable"));
        }
        match &self.options.webrtc_config {
            Some(config) => Ok(Response::new(OptionalWebRtcConfigResponse {
                config: Some(config.clone()),
            })),
            None => Err(Status::unimplemented("no config")),
        }
    }
}

/// Answering peer with the same pre-negotiated channels as the dialer
async fn echo_peer(state: Arc<ServerState>) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let api = APIBuilder::new()
        .with_media_engine(MediaEngine::default())
        .build();
    let peer_connection = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

    let data = peer_connection
        .create_data_channel(
            "data",
            Some(RTCDataChannelInit {
                ordered: Some(true),
                negotiated: Some(0),
                ..Default::default()
            }),
        )
        .await?;
    peer_connection
        .create_data_channel(
            "negotiation",
            Some(RTCDataChannelInit {
                ordered: Some(true),
                negotiated: Some(1),
                ..Default::default()
            }),
        )
        .await?;

    let handler = Arc::new(EchoHandler {
        data_channel: Arc::clone(&data),
        streams: Mutex::new(HashMap::new()),
        state,
    });
    data.on_message(Box::new(move |msg: DataChannelMessage| {
        let handler = Arc::clone(&handler);
        Box::pin(async move { handler.handle(msg.data).await })
    }));

    Ok(peer_connection)
}

struct EchoStream {
    method: String,
    buffer: Vec<u8>,
}

struct EchoHandler {
    data_channel: Arc<RTCDataChannel>,
    streams: Mutex<HashMap<u64, EchoStream>>,
    state: Arc<ServerState>,
}

impl EchoHandler {
    async fn handle(&self, data: Bytes) {
        let Ok(request) = RpcRequest::decode(data) else {
            return;
        };
        let Some(id) = request.stream.map(|s| s.id) else {
            return;
        };

        let mut out = Vec::new();
        match request.r#type {
            Some(request::Type::Headers(headers)) => {
                self.streams.lock().insert(
                    id,
                    EchoStream {
                        method: headers.method,
                        buffer: Vec::new(),
                    },
                );
                out.push(response::Type::Headers(ResponseHeaders { metadata: None }));
            }
            Some(request::Type::Message(message)) => {
                let mut streams = self.streams.lock();
                let Some(stream) = streams.get_mut(&id) else {
                    return;
                };
                if stream.method == HANG_METHOD {
                    return;
                }
                if message.has_message {
                    if let Some(packet) = message.packet_message {
                        stream.buffer.extend_from_slice(&packet.data);
                        if packet.eom {
                            let complete = std::mem::take(&mut stream.buffer);
                            if stream.method == ECHO_METHOD {
                                out.extend(fragment(&complete));
                            }
                        }
                    }
                }
                if message.eos {
                    let status = if stream.method == FAIL_METHOD {
                        StatusProto {
                            code: Code::NotFound as i32,
                            message: "no such thing".to_string(),
                        }
                    } else {
                        StatusProto::default()
                    };
                    out.push(response::Type::Trailers(ResponseTrailers {
                        status: Some(status),
                        metadata: None,
                    }));
                    streams.remove(&id);
                }
            }
            Some(request::Type::RstStream(_)) => {
                self.streams.lock().remove(&id);
                self.state.resets.fetch_add(1, Ordering::SeqCst);
            }
            None => {}
        }

        for kind in out {
            let frame = RpcResponse {
                stream: Some(StreamId { id }),
                r#type: Some(kind),
            };
            let _ = self
                .data_channel
                .send(&Bytes::from(frame.encode_to_vec()))
                .await;
        }
    }
}

fn fragment(message: &[u8]) -> Vec<response::Type> {
    if message.is_empty() {
        return vec![packet(Vec::new(), true)];
    }
    let chunks: Vec<_> = message.chunks(MAX_PACKET_PAYLOAD).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| packet(chunk.to_vec(), i == last))
        .collect()
}

fn packet(data: Vec<u8>, eom: bool) -> response::Type {
    response::Type::Message(ResponseMessage {
        packet_message: Some(PacketMessage { data, eom }),
    })
}
