//! gRPC client for the signaling service
//!
//! Every request carries `rpc-host: <host>` so the signaling server can route
//! the call to the right answering host.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Code, Request, Streaming};
use tracing::debug;

use crate::auth::AuthenticatedChannel;
use crate::generated::proto::rpc::webrtc::v1::{
    signaling_service_client::SignalingServiceClient, AnswerRequest, AnswerResponse, CallRequest,
    CallResponse, CallUpdateRequest, OptionalWebRtcConfigRequest, WebRtcConfig,
};
use crate::{Error, Result};

/// Metadata key naming the host a signaling request is for
pub const RPC_HOST_METADATA: &str = "rpc-host";

/// Stream of `Call` responses
pub type CallResponseStream = BoxStream<'static, Result<CallResponse>>;

/// The signaling RPCs a dialer consumes
#[async_trait]
pub trait SignalingApi: Send + Sync {
    /// Send an offer; the server streams back one init stage then updates
    async fn call(&self, request: CallRequest) -> Result<CallResponseStream>;

    /// Push a local candidate, the done flag or an error
    async fn call_update(&self, request: CallUpdateRequest) -> Result<()>;

    /// Extra configuration for the host; `None` when the server does not offer any
    async fn optional_webrtc_config(&self) -> Result<Option<WebRtcConfig>>;
}

/// [`SignalingApi`] over a direct gRPC channel
#[derive(Clone)]
pub struct GrpcSignalingClient {
    client: SignalingServiceClient<AuthenticatedChannel>,
    host: String,
    host_header: MetadataValue<Ascii>,
}

impl GrpcSignalingClient {
    /// Client that signals on behalf of `host`
    pub fn new(channel: AuthenticatedChannel, host: &str) -> Result<Self> {
        let host_header = MetadataValue::try_from(host)
            .map_err(|e| Error::InvalidConfig(format!("Invalid host '{}': {}", host, e)))?;
        Ok(Self {
            client: SignalingServiceClient::new(channel),
            host: host.to_string(),
            host_header,
        })
    }

    /// Host every request is tagged with
    pub fn host(&self) -> &str {
        &self.host
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(RPC_HOST_METADATA, self.host_header.clone());
        request
    }

    /// Answering-side duplex RPC
    pub async fn answer<S>(&self, responses: S) -> Result<Streaming<AnswerRequest>>
    where
        S: Stream<Item = AnswerResponse> + Send + 'static,
    {
        let response = self
            .client
            .clone()
            .answer(self.request(responses))
            .await
            .map_err(|s| Error::Signaling(format!("Answer failed: {}", s)))?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl SignalingApi for GrpcSignalingClient {
    async fn call(&self, request: CallRequest) -> Result<CallResponseStream> {
        let response = self
            .client
            .clone()
            .call(self.request(request))
            .await
            .map_err(|s| Error::Signaling(format!("Call failed: {}", s)))?;

        Ok(response
            .into_inner()
            .map(|item| item.map_err(|s| Error::Signaling(format!("Call stream failed: {}", s))))
            .boxed())
    }

    async fn call_update(&self, request: CallUpdateRequest) -> Result<()> {
        self.client
            .clone()
            .call_update(self.request(request))
            .await
            .map_err(|s| Error::Signaling(format!("CallUpdate failed: {}", s)))?;
        Ok(())
    }

    async fn optional_webrtc_config(&self) -> Result<Option<WebRtcConfig>> {
        match self
            .client
            .clone()
            .optional_web_rtc_config(self.request(OptionalWebRtcConfigRequest {}))
            .await
        {
            Ok(response) => Ok(response.into_inner().config),
            Err(status) if status.code() == Code::Unimplemented => {
                debug!("Signaling server has no optional WebRTC config");
                Ok(None)
            }
            Err(status) => Err(Error::Signaling(format!(
                "OptionalWebRTCConfig failed: {}",
                status
            ))),
        }
    }
}
