//! Credential exchange and bearer-token injection for direct gRPC channels
//!
//! Tokens are sent as "authorization: Bearer <token>" metadata. A channel
//! authenticates at most once: concurrent first callers share one in-flight
//! `Authenticate` RPC and every later call reuses the cached token for the
//! channel's lifetime.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::OnceCell;
use tonic::body::Body;
use tonic::transport::Channel;
use tonic::Status;
use tower::Service;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::generated::proto::rpc::v1::{
    auth_service_client::AuthServiceClient,
    external_auth_service_client::ExternalAuthServiceClient, AuthenticateRequest,
    AuthenticateToRequest, Credentials as CredentialsProto,
};
use crate::{Error, Result};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Obtains an access token
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Entity the token is issued for
    fn entity(&self) -> &str;

    /// Perform the credential exchange
    async fn authenticate(&self) -> Result<String>;
}

/// `AuthService.Authenticate` against the dialed server
pub struct GrpcAuthenticator {
    channel: Channel,
    entity: String,
    credentials: Credentials,
}

impl GrpcAuthenticator {
    /// `channel` must not itself carry authentication
    pub fn new(channel: Channel, entity: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            channel,
            entity: entity.into(),
            credentials,
        }
    }
}

#[async_trait]
impl Authenticator for GrpcAuthenticator {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn authenticate(&self) -> Result<String> {
        let mut client = AuthServiceClient::new(self.channel.clone());
        let response = client
            .authenticate(AuthenticateRequest {
                entity: self.entity.clone(),
                credentials: Some(CredentialsProto {
                    r#type: self.credentials.auth_type.clone(),
                    payload: self.credentials.payload.clone(),
                }),
            })
            .await
            .map_err(|s| {
                Error::Authentication(format!(
                    "Authenticate as {} failed: {}: {}",
                    self.entity,
                    s.code(),
                    s.message()
                ))
            })?;

        non_empty(response.into_inner().access_token, &self.entity)
    }
}

/// `ExternalAuthService.AuthenticateTo` through an already authenticated channel
pub struct ExternalAuthenticator {
    channel: AuthenticatedChannel,
    entity: String,
}

impl ExternalAuthenticator {
    /// Request tokens for `entity` from the external auth service behind `channel`
    pub fn new(channel: AuthenticatedChannel, entity: impl Into<String>) -> Self {
        Self {
            channel,
            entity: entity.into(),
        }
    }
}

#[async_trait]
impl Authenticator for ExternalAuthenticator {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn authenticate(&self) -> Result<String> {
        let mut client = ExternalAuthServiceClient::new(self.channel.clone());
        let response = client
            .authenticate_to(AuthenticateToRequest {
                entity: self.entity.clone(),
            })
            .await
            .map_err(|s| {
                Error::Authentication(format!(
                    "AuthenticateTo {} failed: {}: {}",
                    self.entity,
                    s.code(),
                    s.message()
                ))
            })?;

        non_empty(response.into_inner().access_token, &self.entity)
    }
}

fn non_empty(token: String, entity: &str) -> Result<String> {
    if token.is_empty() {
        return Err(Error::Authentication(format!(
            "Empty access token issued for {}",
            entity
        )));
    }
    Ok(token)
}

/// Single-flight access token cache
///
/// The first caller runs the authenticator; callers arriving while it is in
/// flight wait for the same result. A failed attempt is not cached, so the
/// next caller retries.
pub struct AccessTokenCache {
    authenticator: Arc<dyn Authenticator>,
    cell: Mutex<Arc<OnceCell<String>>>,
    attempts: AtomicUsize,
}

impl std::fmt::Debug for AccessTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenCache")
            .field("entity", &self.authenticator.entity())
            .field("cached", &self.cell.lock().initialized())
            .finish()
    }
}

impl AccessTokenCache {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            cell: Mutex::new(Arc::new(OnceCell::new())),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Cached token, authenticating first if needed
    pub async fn token(&self) -> Result<String> {
        let cell = Arc::clone(&*self.cell.lock());
        let token = cell
            .get_or_try_init(|| async {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                debug!("Authenticating entity={}", self.authenticator.entity());
                let token = self.authenticator.authenticate().await?;
                info!("Authenticated entity={}", self.authenticator.entity());
                Ok::<_, Error>(token)
            })
            .await?;
        Ok(token.clone())
    }

    /// Token if one has been obtained
    pub fn cached(&self) -> Option<String> {
        self.cell.lock().get().cloned()
    }

    /// Forget the cached token; the next call authenticates again
    pub fn invalidate(&self) {
        *self.cell.lock() = Arc::new(OnceCell::new());
    }

    /// Number of credential exchanges started
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

/// gRPC channel that attaches the cached bearer token to every call
///
/// Usable anywhere a `tonic` transport channel is, e.g.
/// `SignalingServiceClient::new(channel)`.
#[derive(Clone, Debug)]
pub struct AuthenticatedChannel {
    channel: Channel,
    tokens: Option<Arc<AccessTokenCache>>,
}

impl AuthenticatedChannel {
    /// Wrap `channel`; without a cache calls go out unauthenticated
    pub fn new(channel: Channel, tokens: Option<Arc<AccessTokenCache>>) -> Self {
        Self { channel, tokens }
    }

    /// Underlying transport channel
    pub fn inner(&self) -> &Channel {
        &self.channel
    }

    /// Token cache, if credentials are configured
    pub fn tokens(&self) -> Option<&Arc<AccessTokenCache>> {
        self.tokens.as_ref()
    }
}

impl Service<http::Request<Body>> for AuthenticatedChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.channel.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut request: http::Request<Body>) -> Self::Future {
        // The ready channel is the one that must serve this call
        let clone = self.channel.clone();
        let mut channel = std::mem::replace(&mut self.channel, clone);
        let tokens = self.tokens.clone();

        Box::pin(async move {
            if let Some(tokens) = tokens {
                let token = tokens
                    .token()
                    .await
                    .map_err(|e| Box::new(e.to_status()) as BoxError)?;
                let value = http::HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| {
                        Box::new(Status::unauthenticated(format!(
                            "Invalid access token: {}",
                            e
                        ))) as BoxError
                    })?;
                request
                    .headers_mut()
                    .insert(http::header::AUTHORIZATION, value);
            }
            channel.call(request).await.map_err(Into::into)
        })
    }
}
