//! WebRTC viewers
//!
//! Architecture:
//! ```text
//! RTSP source ──> SourceSession ──> FanoutHub ──┬─> Subscription ─> forwarder ─> track ─> viewer A
//!                                               └─> Subscription ─> forwarder ─> track ─> viewer B
//!
//! Browser ── POST /offer (SDP) ──> PeerNegotiator ── answer ──> Browser
//! ```
//!
//! Packets are forwarded as received: no depacketization, no transcoding.
//! Each viewer only gets its timestamps rebased and the payload type fixed.

pub mod config;
pub mod mdns;
pub mod negotiator;
pub mod session;
pub mod signaling;
pub mod track;

pub use config::{TurnServer, WebRtcConfig};
pub use negotiator::{parse_offer, NegotiatedAnswer, PeerNegotiator};
pub use session::{PeerSession, PeerSessionInfo, PeerSessionRegistry};
pub use signaling::{AnswerResponse, CloseRequest, OfferRequest, PeerState};
pub use track::{forward_packets, ForwardExit, RtpWriter};
