//! Configuration types for dialing direct and WebRTC channels

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// STUN servers used when the caller does not override the ICE server list
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:global.stun.twilio.com:3478",
    "stun:stun.l.google.com:19302",
];

/// Default upper bound for a whole WebRTC dial (signaling + ICE + data channel open)
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Environment variable naming the signaling server address
pub const ENV_SIGNALING_ADDRESS: &str = "REMOTEMEDIA_SIGNALING_ADDRESS";
/// Environment variable enabling plaintext signaling ("1"/"true")
pub const ENV_SIGNALING_INSECURE: &str = "REMOTEMEDIA_SIGNALING_INSECURE";
/// Environment variable disabling trickle ICE ("1"/"true")
pub const ENV_DISABLE_TRICKLE_ICE: &str = "REMOTEMEDIA_DISABLE_TRICKLE_ICE";

/// Credentials exchanged for an access token through `AuthService.Authenticate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Credential kind, e.g. "api-key"
    #[serde(rename = "type")]
    pub auth_type: String,

    /// Secret payload
    pub payload: String,
}

impl Credentials {
    /// Create credentials of the given kind
    pub fn new(auth_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            auth_type: auth_type.into(),
            payload: payload.into(),
        }
    }
}

/// ICE (STUN/TURN) server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default)]
    pub username: String,

    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    /// A server without credentials, typically STUN
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Caller's connection intent for a direct or WebRTC dial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialOptions {
    /// Dial without TLS (default: false)
    #[serde(default)]
    pub insecure: bool,

    /// Entity to authenticate as; defaults to the dialed address
    #[serde(default)]
    pub auth_entity: Option<String>,

    /// Credentials for the direct channel (None disables authentication)
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Default deadline applied to calls that do not set their own
    #[serde(default, with = "option_duration_ms")]
    pub call_timeout: Option<Duration>,

    /// Upper bound for establishing a channel (default: 20s)
    #[serde(default = "default_dial_timeout", with = "duration_ms")]
    pub dial_timeout: Duration,

    /// WebRTC negotiation options
    #[serde(default)]
    pub webrtc: WebRtcDialOptions,
}

/// WebRTC-specific negotiation options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcDialOptions {
    /// Signaling server address (host:port or URI)
    #[serde(default)]
    pub signaling_address: Option<String>,

    /// Dial the signaling server without TLS (default: false)
    #[serde(default)]
    pub signaling_insecure: bool,

    /// Entity to authenticate as against the signaling server
    #[serde(default)]
    pub signaling_auth_entity: Option<String>,

    /// Credentials for the signaling server
    #[serde(default)]
    pub signaling_credentials: Option<Credentials>,

    /// Send the complete offer after gathering instead of trickling candidates
    #[serde(default)]
    pub disable_trickle_ice: bool,

    /// Replaces the default STUN list when set
    #[serde(default)]
    pub ice_servers: Option<Vec<IceServerConfig>>,

    /// Authenticate against this address first, then exchange the token
    /// through `ExternalAuthService.AuthenticateTo`
    #[serde(default)]
    pub external_auth_address: Option<String>,

    /// Entity to request a token for through `AuthenticateTo`; defaults to the dialed host
    #[serde(default)]
    pub external_auth_entity: Option<String>,

    /// Dial the external auth service without TLS
    #[serde(default)]
    pub external_auth_insecure: bool,
}

fn default_dial_timeout() -> Duration {
    DEFAULT_DIAL_TIMEOUT
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            auth_entity: None,
            credentials: None,
            call_timeout: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            webrtc: WebRtcDialOptions::default(),
        }
    }
}

impl DialOptions {
    /// Dial without TLS
    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    /// Authenticate every call with `credentials`
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Authenticate as `entity` instead of the dialed address
    pub fn with_auth_entity(mut self, entity: impl Into<String>) -> Self {
        self.auth_entity = Some(entity.into());
        self
    }

    /// Default per-call deadline
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Upper bound for the whole dial
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Replace the WebRTC sub-options
    pub fn with_webrtc(mut self, webrtc: WebRtcDialOptions) -> Self {
        self.webrtc = webrtc;
        self
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `dial_timeout` or `call_timeout` is zero
    /// - any credentials have an empty type or payload
    /// - the WebRTC sub-options are invalid
    pub fn validate(&self) -> Result<()> {
        if self.dial_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "dial_timeout must be greater than zero".to_string(),
            ));
        }

        if matches!(self.call_timeout, Some(t) if t.is_zero()) {
            return Err(Error::InvalidConfig(
                "call_timeout must be greater than zero when set".to_string(),
            ));
        }

        if let Some(creds) = &self.credentials {
            validate_credentials("credentials", creds)?;
        }

        self.webrtc.validate()
    }
}

impl WebRtcDialOptions {
    /// Load the signaling address and negotiation flags from the environment
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Self {
        Self {
            signaling_address: std::env::var(ENV_SIGNALING_ADDRESS)
                .ok()
                .filter(|s| !s.is_empty()),
            signaling_insecure: env_flag(ENV_SIGNALING_INSECURE),
            disable_trickle_ice: env_flag(ENV_DISABLE_TRICKLE_ICE),
            ..Default::default()
        }
    }

    /// ICE servers before any server-provided additions
    pub fn base_ice_servers(&self) -> Vec<IceServerConfig> {
        match &self.ice_servers {
            Some(servers) => servers.clone(),
            None => DEFAULT_ICE_SERVERS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
        }
    }

    /// Validate the WebRTC sub-options
    pub fn validate(&self) -> Result<()> {
        if let Some(servers) = &self.ice_servers {
            for server in servers {
                if server.urls.is_empty() {
                    return Err(Error::InvalidConfig(
                        "ICE server entry has no URLs".to_string(),
                    ));
                }
                for url in &server.urls {
                    if !(url.starts_with("stun:")
                        || url.starts_with("turn:")
                        || url.starts_with("turns:"))
                    {
                        return Err(Error::InvalidConfig(format!(
                            "ICE server URL must start with stun:, turn: or turns:, got {}",
                            url
                        )));
                    }
                }
            }
        }

        if let Some(creds) = &self.signaling_credentials {
            validate_credentials("signaling_credentials", creds)?;
        }

        if self.external_auth_entity.is_some() && self.external_auth_address.is_none() {
            return Err(Error::InvalidConfig(
                "external_auth_entity requires external_auth_address".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_credentials(field: &str, creds: &Credentials) -> Result<()> {
    if creds.auth_type.is_empty() {
        return Err(Error::InvalidConfig(format!("{}: type is empty", field)));
    }
    if creds.payload.is_empty() {
        return Err(Error::InvalidConfig(format!("{}: payload is empty", field)));
    }
    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
