//! Dialing: direct gRPC channels and WebRTC channels established through signaling

pub mod direct;
pub mod webrtc;

pub use direct::{dial_direct, DirectChannel};
pub use webrtc::dial_webrtc;

use crate::channels::WebRtcChannel;
use crate::config::DialOptions;
use crate::{Error, Result};

/// Dials channels with a fixed set of options
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    options: DialOptions,
}

impl Dialer {
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    /// See [`dial_direct`]
    pub async fn dial_direct(&self, address: &str) -> Result<DirectChannel> {
        dial_direct(address, &self.options).await
    }

    /// See [`dial_webrtc`]
    pub async fn dial_webrtc(&self, signaling_address: &str, host: &str) -> Result<WebRtcChannel> {
        dial_webrtc(signaling_address, host, &self.options).await
    }

    /// Dial `host` through the configured `webrtc.signaling_address`
    pub async fn dial_webrtc_host(&self, host: &str) -> Result<WebRtcChannel> {
        let address = self.options.webrtc.signaling_address.as_deref().ok_or_else(|| {
            Error::InvalidConfig("no signaling address configured".to_string())
        })?;
        dial_webrtc(address, host, &self.options).await
    }
}
