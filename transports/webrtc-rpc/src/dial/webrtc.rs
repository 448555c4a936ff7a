//! Dialing a host through signaling and a WebRTC peer connection

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::direct::{dial_with_plan, AuthPlan, ExternalAuthPlan};
use crate::channels::{ChannelState, FrameSink, WeakWebRtcChannel, WebRtcChannel};
use crate::config::{DialOptions, IceServerConfig, WebRtcDialOptions};
use crate::generated::proto::rpc::webrtc::v1::{IceServer, WebRtcConfig};
use crate::peer::{PeerEvent, PeerHandle, RtcPeer};
use crate::signaling::{
    CandidateEvent, GrpcSignalingClient, SignalingApi, SignalingExchange,
    CANDIDATE_QUEUE_CAPACITY,
};
use crate::{Error, Result};

/// Dial `host` over WebRTC, negotiating through the signaling server at `signaling_address`
///
/// Returns once the RPC data channel is open. The whole dial, including the
/// signaling connection, is bounded by `options.dial_timeout`. On failure the
/// peer connection is closed and no channel is returned.
#[instrument(skip(options), fields(trickle = tracing::field::Empty))]
pub async fn dial_webrtc(
    signaling_address: &str,
    host: &str,
    options: &DialOptions,
) -> Result<WebRtcChannel> {
    options.validate()?;
    let started = Instant::now();
    let webrtc = &options.webrtc;

    let connect = async {
        let signaling_channel = dial_with_plan(
            signaling_address,
            webrtc.signaling_insecure,
            options.dial_timeout,
            signaling_auth_plan(host, options),
        )
        .await?;
        let signaling = Arc::new(GrpcSignalingClient::new(signaling_channel.channel(), host)?);
        let extra = signaling.optional_webrtc_config().await?;
        Ok::<_, Error>((signaling_channel, signaling, extra))
    };
    let (_signaling_channel, signaling, extra) =
        tokio::time::timeout(options.dial_timeout, connect)
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "signaling server did not respond within {:?}",
                    options.dial_timeout
                ))
            })??;
    let (ice_servers, trickle) = negotiation_settings(webrtc, extra);
    tracing::Span::current().record("trickle", trickle);
    debug!(
        "Negotiating with {} ICE servers, trickle={}",
        ice_servers.len(),
        trickle
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let peer = RtcPeer::new(&ice_servers, events_tx).await?;
    let sink: Arc<dyn FrameSink> = peer.clone();
    let channel = WebRtcChannel::new(sink, options.call_timeout);

    let (candidates_tx, candidates_rx) = mpsc::channel(CANDIDATE_QUEUE_CAPACITY);
    let event_loop = tokio::spawn(run_event_loop(
        events_rx,
        channel.downgrade(),
        channel.watch_state(),
        Arc::clone(&peer),
        candidates_tx,
    ));
    peer.retain_tasks([event_loop.abort_handle()]);

    let handle: Arc<dyn PeerHandle> = peer.clone();
    let signaling: Arc<dyn SignalingApi> = signaling;
    let exchange = SignalingExchange::new(signaling, handle, trickle);

    let ready = {
        let channel = channel.clone();
        async move { channel.ready().await }
    };
    let remaining = options.dial_timeout.saturating_sub(started.elapsed());

    match exchange.run(candidates_rx, ready, remaining).await {
        Ok(tasks) => {
            peer.retain_tasks(tasks.detach());
            info!(
                "WebRTC channel open: host={}, connection_id={}, elapsed={:?}",
                host,
                peer.connection_id(),
                started.elapsed()
            );
            Ok(channel)
        }
        Err(e) => {
            channel.fail(&format!("dial failed: {}", e)).await;
            Err(e)
        }
    }
}

/// Credentials and entity used against the signaling server
fn signaling_auth_plan(host: &str, options: &DialOptions) -> AuthPlan {
    let webrtc = &options.webrtc;
    let entity = webrtc
        .signaling_auth_entity
        .clone()
        .or_else(|| webrtc.external_auth_entity.clone())
        .unwrap_or_else(|| host.to_string());

    AuthPlan {
        entity: Some(entity),
        credentials: webrtc
            .signaling_credentials
            .clone()
            .or_else(|| options.credentials.clone()),
        external: webrtc
            .external_auth_address
            .clone()
            .map(|address| ExternalAuthPlan {
                address,
                insecure: webrtc.external_auth_insecure,
            }),
    }
}

/// ICE servers and trickle mode after applying the server's optional config
fn negotiation_settings(
    webrtc: &WebRtcDialOptions,
    extra: Option<WebRtcConfig>,
) -> (Vec<IceServerConfig>, bool) {
    let mut ice_servers = webrtc.base_ice_servers();
    let mut trickle = !webrtc.disable_trickle_ice;

    if let Some(config) = extra {
        ice_servers.extend(config.additional_ice_servers.into_iter().map(ice_server_from_proto));
        if config.disable_trickle {
            trickle = false;
        }
    }
    (ice_servers, trickle)
}

fn ice_server_from_proto(server: IceServer) -> IceServerConfig {
    IceServerConfig {
        urls: server.urls,
        username: server.username,
        credential: server.credential,
    }
}

/// Single consumer of peer-connection events
///
/// Holds only a weak handle to the channel; once every channel handle is
/// dropped the peer connection is closed and the loop exits.
async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    channel: WeakWebRtcChannel,
    mut state: watch::Receiver<ChannelState>,
    peer: Arc<RtcPeer>,
    candidates: mpsc::Sender<CandidateEvent>,
) {
    let mut candidates = Some(candidates);

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            changed = state.changed() => match changed {
                Ok(()) => {
                    if *state.borrow_and_update() == ChannelState::Closed {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    PeerHandle::close(&*peer, "channel dropped").await;
                    break;
                }
            },
        };

        let Some(channel) = channel.upgrade() else {
            PeerHandle::close(&*peer, "channel dropped").await;
            break;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(tx) = &candidates {
                    if tx.send(CandidateEvent::Candidate(candidate)).await.is_err() {
                        // Negotiation is over; later candidates have nowhere to go
                        candidates = None;
                    }
                }
            }
            PeerEvent::GatheringComplete => {
                if let Some(tx) = candidates.take() {
                    debug!("ICE gathering complete");
                    let _ = tx.send(CandidateEvent::Done).await;
                }
            }
            PeerEvent::ConnectionState(connection_state) => {
                info!("Peer connection state: {}", connection_state);
                match connection_state {
                    RTCPeerConnectionState::Failed => {
                        channel.fail("peer connection failed").await;
                    }
                    RTCPeerConnectionState::Closed => {
                        channel.fail("peer connection closed").await;
                    }
                    _ => {}
                }
            }
            PeerEvent::DataChannelOpen => {
                debug!("RPC data channel open");
                channel.mark_open();
            }
            PeerEvent::DataChannelClosed => channel.fail("data channel closed").await,
            PeerEvent::DataChannelError(e) => {
                channel.fail(&format!("data channel error: {}", e)).await;
            }
            PeerEvent::Message(data) => channel.handle_frame(&data),
        }

        if channel.is_closed() {
            break;
        }
    }
    debug!("Peer event loop stopped: connection_id={}", peer.connection_id());
}
