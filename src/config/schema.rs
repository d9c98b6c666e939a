use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Upstream RTSP source settings
    pub source: SourceConfig,
    /// Fanout hub settings
    pub hub: HubConfig,
    /// WebRTC viewer settings
    pub webrtc: WebRtcConfig,
    /// Web server settings
    pub web: WebConfig,
}

impl AppConfig {
    /// Reject values the relay cannot run with.
    ///
    /// The source URL is deliberately not checked here: a malformed URL is
    /// reported when the source is first started.
    pub fn validate(&self) -> Result<()> {
        if self.hub.queue_capacity == 0 {
            return Err(AppError::Config(
                "hub.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if !(96..=127).contains(&self.webrtc.payload_type) {
            return Err(AppError::Config(format!(
                "webrtc.payload_type {} is outside the dynamic range 96-127",
                self.webrtc.payload_type
            )));
        }
        if self.source.reconnect_delay_ms == 0 {
            return Err(AppError::Config(
                "source.reconnect_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.source.read_timeout_ms == 0 {
            return Err(AppError::Config(
                "source.read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Upstream RTSP source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// RTSP URL of the camera feed (user-info is used for Basic auth)
    pub url: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// TCP connect timeout
    pub connect_timeout_ms: u64,
    /// Timeout for a single RTSP request/response exchange
    pub request_timeout_ms: u64,
    /// Give up on a playing session after this long without data
    pub read_timeout_ms: u64,
    /// Send OPTIONS keepalives while playing
    pub keepalive: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://127.0.0.1:8900/live".to_string(),
            reconnect_delay_ms: 2000,
            connect_timeout_ms: 5000,
            request_timeout_ms: 10000,
            read_timeout_ms: 10000,
            keepalive: true,
        }
    }
}

/// Fanout hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-viewer packet queue capacity; packets are dropped for a viewer
    /// whose queue is full
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}
