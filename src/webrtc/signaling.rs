//! Viewer signaling types

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// SDP offer posted as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
}

/// SDP answer returned as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub sdp: String,
    /// Session ID for this viewer
    pub session_id: String,
}

impl AnswerResponse {
    pub fn new(sdp: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            session_id: session_id.into(),
        }
    }
}

/// Request to tear down one viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub session_id: String,
}

/// Per-viewer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    /// Codec and track registered, offer not yet applied
    CodecReady,
    /// Answer produced; waiting for the transport to connect
    AnswerSent,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Transport states that end the session
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }

    /// Map a transport state change, `None` when the session state is unaffected
    pub fn from_transport(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::Connected => Some(PeerState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::CodecReady => write!(f, "codec_ready"),
            PeerState::AnswerSent => write!(f, "answer_sent"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}
