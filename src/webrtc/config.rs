//! WebRTC viewer configuration

use serde::{Deserialize, Serialize};
use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Dynamic payload type the viewer track is declared with
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Payload type written into every forwarded packet
    pub payload_type: u8,
    /// ICE candidate gathering timeout (ms)
    pub gathering_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough on the operator LAN
            stun_servers: vec![],
            turn_servers: vec![],
            payload_type: DEFAULT_PAYLOAD_TYPE,
            gathering_timeout_ms: 5000,
        }
    }
}

impl WebRtcConfig {
    /// ICE servers for a new peer connection
    ///
    /// TURN entries without credentials are skipped, webrtc-rs rejects them.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        for turn in &self.turn_servers {
            if turn.username.is_empty() || turn.credential.is_empty() {
                warn!(
                    "Skipping TURN server {:?} - credentials required but missing",
                    turn.urls
                );
                continue;
            }
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, e.g. `turn:turn.example.com:3478?transport=udp`
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_without_credentials_is_skipped() {
        let config = WebRtcConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string(), " ".to_string()],
            turn_servers: vec![
                TurnServer {
                    urls: vec!["turn:relay.local:3478".to_string()],
                    username: String::new(),
                    credential: String::new(),
                },
                TurnServer {
                    urls: vec![
                        "turn:relay.local:3478?transport=udp".to_string(),
                        "turn:relay.local:3478?transport=tcp".to_string(),
                    ],
                    username: "op".to_string(),
                    credential: "pw".to_string(),
                },
            ],
            ..Default::default()
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(servers[1].urls.len(), 2);
        assert_eq!(servers[1].username, "op");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: WebRtcConfig = serde_json::from_str(r#"{"gathering_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.gathering_timeout_ms, 1500);
        assert_eq!(config.payload_type, DEFAULT_PAYLOAD_TYPE);
        assert!(config.stun_servers.is_empty());
    }
}
