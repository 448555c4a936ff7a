//! Direct TCP/TLS gRPC channels

use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, instrument};

use crate::auth::{
    AccessTokenCache, AuthenticatedChannel, Authenticator, ExternalAuthenticator,
    GrpcAuthenticator,
};
use crate::config::{Credentials, DialOptions};
use crate::{Error, Result};

/// A connected direct channel, optionally authenticated
#[derive(Clone, Debug)]
pub struct DirectChannel {
    address: String,
    channel: AuthenticatedChannel,
}

impl DirectChannel {
    /// Address that was dialed
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Channel to hand to generated clients
    pub fn channel(&self) -> AuthenticatedChannel {
        self.channel.clone()
    }

    /// Token cache, if credentials are configured
    pub fn tokens(&self) -> Option<&Arc<AccessTokenCache>> {
        self.channel.tokens()
    }
}

/// How a direct channel authenticates
#[derive(Debug, Clone, Default)]
pub(crate) struct AuthPlan {
    pub entity: Option<String>,
    pub credentials: Option<Credentials>,
    pub external: Option<ExternalAuthPlan>,
}

/// Authenticate at another address first, then exchange the token via `AuthenticateTo`
#[derive(Debug, Clone)]
pub(crate) struct ExternalAuthPlan {
    pub address: String,
    pub insecure: bool,
}

/// Open a direct channel to `address`
///
/// When credentials are configured every call carries a bearer token obtained
/// lazily, at most once, from `AuthService.Authenticate`.
pub async fn dial_direct(address: &str, options: &DialOptions) -> Result<DirectChannel> {
    options.validate()?;
    let plan = AuthPlan {
        entity: options.auth_entity.clone(),
        credentials: options.credentials.clone(),
        external: None,
    };
    dial_with_plan(address, options.insecure, options.dial_timeout, plan).await
}

#[instrument(skip(plan), fields(authenticated = plan.credentials.is_some()))]
pub(crate) async fn dial_with_plan(
    address: &str,
    insecure: bool,
    timeout: Duration,
    plan: AuthPlan,
) -> Result<DirectChannel> {
    let channel = connect(address, insecure, timeout).await?;
    let entity = plan.entity.unwrap_or_else(|| host_of(address));

    let tokens = match (plan.credentials, plan.external) {
        (None, _) => None,
        (Some(credentials), None) => {
            let authenticator = GrpcAuthenticator::new(channel.clone(), entity, credentials);
            Some(Arc::new(AccessTokenCache::new(Arc::new(authenticator))))
        }
        (Some(credentials), Some(external)) => {
            let auth_channel = connect(&external.address, external.insecure, timeout).await?;
            let external_entity = host_of(&external.address);
            let external_tokens = Arc::new(AccessTokenCache::new(Arc::new(
                GrpcAuthenticator::new(auth_channel.clone(), external_entity, credentials),
            )));
            let authenticator = ExternalAuthenticator::new(
                AuthenticatedChannel::new(auth_channel, Some(external_tokens)),
                entity,
            );
            debug!(
                "Using external auth: address={}, entity={}",
                external.address,
                authenticator.entity()
            );
            Some(Arc::new(AccessTokenCache::new(Arc::new(authenticator))))
        }
    };

    info!("Direct channel connected: address={}", address);
    Ok(DirectChannel {
        address: address.to_string(),
        channel: AuthenticatedChannel::new(channel, tokens),
    })
}

/// Connect a tonic channel, with TLS unless `insecure`
pub(crate) async fn connect(address: &str, insecure: bool, timeout: Duration) -> Result<Channel> {
    let uri = endpoint_uri(address, insecure);
    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| Error::InvalidConfig(format!("Invalid address '{}': {}", address, e)))?
        .connect_timeout(timeout);

    if uri.starts_with("https://") {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().with_enabled_roots())?;
    }

    endpoint.connect().await.map_err(|e| {
        Error::Transport(format!("Failed to connect to '{}': {}", address, e))
    })
}

fn endpoint_uri(address: &str, insecure: bool) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if insecure {
        format!("http://{}", address)
    } else {
        format!("https://{}", address)
    }
}

/// Host part of an address, used as the default auth entity
pub(crate) fn host_of(address: &str) -> String {
    let without_scheme = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        }
        _ => authority.to_string(),
    }
}
