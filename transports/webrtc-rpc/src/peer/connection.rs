//! Peer connection carrying the pre-negotiated RPC data channels

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{PeerEvent, PeerHandle};
use crate::channels::FrameSink;
use crate::config::IceServerConfig;
use crate::{Error, Result};

/// Data channel ID carrying RPC envelopes
pub const RPC_CHANNEL_ID: u16 = 0;
/// Data channel ID reserved for renegotiation
pub const NEGOTIATION_CHANNEL_ID: u16 = 1;

/// Client side of a WebRTC connection used for RPC
///
/// Both data channels are created pre-negotiated with fixed IDs, so either
/// side may write to them as soon as SCTP is up.
pub struct RtcPeer {
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    _negotiation_channel: Arc<RTCDataChannel>,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RtcPeer {
    /// Build the peer connection and its data channels
    ///
    /// Every callback forwards into `events`.
    #[instrument(skip_all, fields(ice_servers = ice_servers.len()))]
    pub async fn new(
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!("Creating peer connection: connection_id={}", connection_id);

        // Data channels only; no media codecs are registered
        let api = APIBuilder::new()
            .with_media_engine(MediaEngine::default())
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::Transport(format!("Failed to create peer connection: {}", e))
        })?);

        register_connection_callbacks(&peer_connection, &events);

        let channels = async {
            let data = create_negotiated_channel(&peer_connection, "data", RPC_CHANNEL_ID).await?;
            let negotiation =
                create_negotiated_channel(&peer_connection, "negotiation", NEGOTIATION_CHANNEL_ID)
                    .await?;
            Ok::<_, Error>((data, negotiation))
        }
        .await;
        let (data_channel, negotiation_channel) = match channels {
            Ok(channels) => channels,
            Err(e) => {
                warn!("Peer connection setup failed: {}", e);
                let _ = peer_connection.close().await;
                return Err(e);
            }
        };

        register_data_channel_callbacks(&data_channel, &events);
        negotiation_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            Box::pin(async move {
                debug!(
                    "Ignoring {} bytes on the negotiation channel",
                    msg.data.len()
                );
            })
        }));

        Ok(Arc::new(Self {
            connection_id,
            peer_connection,
            data_channel,
            _negotiation_channel: negotiation_channel,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Identifier used in logs
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Tie background tasks to this connection; they are aborted on close
    pub fn retain_tasks(&self, handles: impl IntoIterator<Item = AbortHandle>) {
        if self.closed.load(Ordering::Acquire) {
            handles.into_iter().for_each(|h| h.abort());
            return;
        }
        self.tasks.lock().extend(handles);
    }

    /// Current connection state
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }
}

async fn create_negotiated_channel(
    pc: &Arc<RTCPeerConnection>,
    label: &str,
    id: u16,
) -> Result<Arc<RTCDataChannel>> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        negotiated: Some(id),
        ..Default::default()
    };
    pc.create_data_channel(label, Some(init))
        .await
        .map_err(|e| Error::DataChannel(format!("Failed to create data channel '{}': {}", label, e)))
}

fn register_connection_callbacks(
    pc: &Arc<RTCPeerConnection>,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => PeerEvent::LocalCandidate(init),
                    Err(e) => {
                        warn!("Failed to serialize local ICE candidate: {}", e);
                        return;
                    }
                },
                None => PeerEvent::GatheringComplete,
            };
            let _ = tx.send(event);
        })
    }));

    let tx = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!("ICE gathering state: {}", state);
            if state == RTCIceGathererState::Complete {
                let _ = tx.send(PeerEvent::GatheringComplete);
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ConnectionState(state));
        })
    }));
}

fn register_data_channel_callbacks(
    dc: &Arc<RTCDataChannel>,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelOpen);
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelClosed);
        })
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |err| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannelError(err.to_string()));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::Message(msg.data));
        })
    }));
}

#[async_trait]
impl PeerHandle for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;

        self.local_description().await
    }

    async fn local_description(&self) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::Sdp("No local description after setting offer".to_string()))
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::Sdp(format!("Invalid answer SDP: {}", e)))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Closing peer connection: connection_id={}, reason={}",
            self.connection_id, reason
        );

        if let Err(e) = self.peer_connection.close().await {
            warn!(
                "Error closing peer connection {}: {}",
                self.connection_id, e
            );
        }

        // May include the task running this close; abort last
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl FrameSink for RtcPeer {
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("peer connection is closed".to_string()));
        }
        self.data_channel
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannel(format!("Failed to send frame: {}", e)))
    }

    async fn close(&self, reason: &str) {
        PeerHandle::close(self, reason).await;
    }
}
