//! Caller side of the SDP/ICE handshake
//!
//! Trickle mode: the offer goes out immediately. Local candidates are pushed
//! through `CallUpdate` in discovery order once the answer names the call's
//! uuid, followed by exactly one `done`. Remote candidates arrive as update
//! stages on the `Call` stream.
//!
//! Non-trickle mode: gathering completes first and the full offer is sent with
//! `disable_trickle` set. The server must answer with a single init stage; no
//! `CallUpdate` is ever sent.

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::client::{CallResponseStream, SignalingApi};
use super::protocol::{
    candidate_from_proto, candidate_to_proto, decode_sdp, encode_sdp, SessionDescription,
    SDP_ANSWER,
};
use crate::generated::proto::rpc::webrtc::v1::{
    call_response, call_update_request, CallRequest, CallResponse, CallUpdateRequest,
    Status as StatusProto,
};
use crate::peer::PeerHandle;
use crate::{Error, Result};

/// Capacity of the outbound candidate queue
pub const CANDIDATE_QUEUE_CAPACITY: usize = 128;

/// Upper bound for reporting a failed dial to the signaling server
const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry on the outbound candidate queue
#[derive(Debug, Clone)]
pub enum CandidateEvent {
    /// A newly gathered local candidate
    Candidate(RTCIceCandidateInit),
    /// Local gathering finished; sent once
    Done,
}

/// Background signaling tasks that outlive a successful dial
///
/// Dropping the set aborts the tasks.
#[derive(Debug, Default)]
pub struct SignalingTasks {
    handles: Vec<JoinHandle<()>>,
}

impl SignalingTasks {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Hand the tasks to a new owner without aborting them
    pub fn detach(mut self) -> Vec<AbortHandle> {
        std::mem::take(&mut self.handles)
            .iter()
            .map(JoinHandle::abort_handle)
            .collect()
    }
}

impl Drop for SignalingTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Progress {
    uuid: Option<String>,
    tasks: SignalingTasks,
}

/// One offer/answer handshake for one peer connection
pub struct SignalingExchange {
    signaling: Arc<dyn SignalingApi>,
    peer: Arc<dyn PeerHandle>,
    trickle: bool,
}

impl SignalingExchange {
    pub fn new(signaling: Arc<dyn SignalingApi>, peer: Arc<dyn PeerHandle>, trickle: bool) -> Self {
        Self {
            signaling,
            peer,
            trickle,
        }
    }

    /// Whether candidates are trickled
    pub fn trickle(&self) -> bool {
        self.trickle
    }

    /// Negotiate and wait for `opened`, all within `timeout`
    ///
    /// On failure the peer is closed with the error as reason and, if the
    /// call already has a uuid, the error is reported through `CallUpdate`.
    #[instrument(skip_all, fields(trickle = self.trickle))]
    pub async fn run<F>(
        &self,
        candidates: mpsc::Receiver<CandidateEvent>,
        opened: F,
        timeout: Duration,
    ) -> Result<SignalingTasks>
    where
        F: Future<Output = Result<()>>,
    {
        let mut progress = Progress::default();
        let result =
            match tokio::time::timeout(timeout, self.establish(candidates, opened, &mut progress))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(format!(
                    "timed out after {:?} waiting for the connection",
                    timeout
                ))),
            };

        match result {
            Ok(()) => Ok(progress.tasks),
            Err(e) => {
                drop(progress.tasks);
                warn!("Signaling failed: {}", e);
                if let Some(uuid) = &progress.uuid {
                    self.report_error(uuid, &e).await;
                }
                self.peer.close(&format!("dial failed: {}", e)).await;
                Err(e)
            }
        }
    }

    async fn establish<F>(
        &self,
        mut candidates: mpsc::Receiver<CandidateEvent>,
        opened: F,
        progress: &mut Progress,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let mut offer = self.peer.create_offer().await?;
        if !self.trickle {
            debug!("Waiting for ICE gathering before sending the offer");
            while let Some(event) = candidates.recv().await {
                if matches!(event, CandidateEvent::Done) {
                    break;
                }
            }
            offer = self.peer.local_description().await?;
        }

        let mut responses = self
            .signaling
            .call(CallRequest {
                sdp: encode_sdp(&SessionDescription::offer(offer))?,
                disable_trickle: !self.trickle,
            })
            .await?;

        let (uuid, answer) = match responses.next().await {
            None => {
                return Err(Error::Signaling(
                    "call stream ended before the init stage".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(CallResponse {
                uuid,
                stage: Some(call_response::Stage::Init(init)),
            })) => (uuid, init.sdp),
            Some(Ok(other)) => {
                return Err(Error::SignalingProtocol(format!(
                    "expected init stage first, got {}",
                    stage_name(&other)
                )))
            }
        };
        if uuid.is_empty() {
            return Err(Error::SignalingProtocol(
                "init stage without a call uuid".to_string(),
            ));
        }
        progress.uuid = Some(uuid.clone());

        let answer = decode_sdp(&answer)?;
        if answer.kind != SDP_ANSWER {
            return Err(Error::SignalingProtocol(format!(
                "init stage carried a description of type '{}'",
                answer.kind
            )));
        }
        self.peer.set_remote_answer(answer.sdp).await?;
        info!("Call answered: uuid={}", uuid);

        let (failures_tx, mut failures) = mpsc::channel(2);
        if self.trickle {
            progress.tasks.push(tokio::spawn(send_local_candidates(
                Arc::clone(&self.signaling),
                uuid.clone(),
                candidates,
                failures_tx.clone(),
            )));
        }
        progress.tasks.push(tokio::spawn(apply_remote_updates(
            responses,
            Arc::clone(&self.peer),
            uuid,
            self.trickle,
            failures_tx,
        )));

        tokio::select! {
            result = opened => result,
            Some(e) = failures.recv() => Err(e),
        }
    }

    async fn report_error(&self, uuid: &str, error: &Error) {
        let status = error.to_status();
        let request = CallUpdateRequest {
            uuid: uuid.to_string(),
            update: Some(call_update_request::Update::Error(StatusProto {
                code: status.code() as i32,
                message: error.to_string(),
            })),
        };
        match tokio::time::timeout(ERROR_REPORT_TIMEOUT, self.signaling.call_update(request)).await
        {
            Ok(Ok(())) => debug!("Reported dial failure for call {}", uuid),
            Ok(Err(e)) => debug!("Failed to report dial failure for call {}: {}", uuid, e),
            Err(_) => debug!("Timed out reporting dial failure for call {}", uuid),
        }
    }
}

fn stage_name(response: &CallResponse) -> &'static str {
    match response.stage {
        Some(call_response::Stage::Init(_)) => "init",
        Some(call_response::Stage::Update(_)) => "update",
        None => "no stage",
    }
}

async fn report(failures: &mpsc::Sender<Error>, error: Error) {
    if let Err(mpsc::error::SendError(error)) = failures.send(error).await {
        warn!("Signaling error after the connection opened: {}", error);
    }
}

/// Push local candidates in discovery order, then `done` once
async fn send_local_candidates(
    signaling: Arc<dyn SignalingApi>,
    uuid: String,
    mut candidates: mpsc::Receiver<CandidateEvent>,
    failures: mpsc::Sender<Error>,
) {
    while let Some(event) = candidates.recv().await {
        let update = match event {
            CandidateEvent::Candidate(candidate) => {
                call_update_request::Update::Candidate(candidate_to_proto(candidate))
            }
            CandidateEvent::Done => call_update_request::Update::Done(true),
        };
        let done = matches!(update, call_update_request::Update::Done(_));

        let request = CallUpdateRequest {
            uuid: uuid.clone(),
            update: Some(update),
        };
        if let Err(e) = signaling.call_update(request).await {
            report(&failures, e).await;
            return;
        }
        if done {
            debug!("Sent end of candidates for call {}", uuid);
            return;
        }
    }
}

/// Apply remote candidates from the `Call` stream in arrival order
async fn apply_remote_updates(
    mut responses: CallResponseStream,
    peer: Arc<dyn PeerHandle>,
    uuid: String,
    trickle: bool,
    failures: mpsc::Sender<Error>,
) {
    while let Some(item) = responses.next().await {
        let response = match item {
            Ok(response) => response,
            Err(e) => {
                report(&failures, e).await;
                return;
            }
        };

        if response.uuid != uuid {
            let e = Error::SignalingProtocol(format!(
                "uuid mismatch: expected {}, got {}",
                uuid, response.uuid
            ));
            report(&failures, e).await;
            return;
        }

        let result = match response.stage {
            Some(call_response::Stage::Init(_)) => Err(Error::SignalingProtocol(
                "init stage received twice".to_string(),
            )),
            Some(call_response::Stage::Update(_)) if !trickle => Err(Error::SignalingProtocol(
                "update stage in a non-trickle call".to_string(),
            )),
            Some(call_response::Stage::Update(update)) => match update.candidate {
                None => Err(Error::SignalingProtocol(
                    "update stage without a candidate".to_string(),
                )),
                Some(candidate) => match candidate_from_proto(candidate) {
                    Ok(candidate) => peer.add_remote_candidate(candidate).await,
                    Err(e) => Err(e),
                },
            },
            None => Err(Error::SignalingProtocol(
                "call response without a stage".to_string(),
            )),
        };

        if let Err(e) = result {
            report(&failures, e).await;
            return;
        }
    }
    debug!("Signaling stream ended for call {}", uuid);
}
