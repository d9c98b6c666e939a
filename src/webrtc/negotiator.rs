//! Per-viewer offer/answer negotiation
//!
//! Each call to [`PeerNegotiator::negotiate`] builds a dedicated peer
//! connection that can only send H.264 with the configured payload type,
//! subscribes it to the fanout hub and answers the viewer's offer. Anything
//! allocated before a failure is released before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::mdns::{mdns_host_name, mdns_mode};
use super::session::{PeerSession, PeerSessionRegistry};
use super::signaling::PeerState;
use super::track::{forward_packets, h264_codec_parameters, new_video_track, ForwardExit};
use crate::error::{AppError, Result};
use crate::hub::{Subscription, SubscriptionId};
use crate::rtsp::SourceController;

/// Answer for one viewer
#[derive(Debug, Clone)]
pub struct NegotiatedAnswer {
    pub session_id: String,
    pub sdp: String,
}

/// Validate a raw offer before anything is allocated
pub fn parse_offer(sdp: &str) -> Result<RTCSessionDescription> {
    if sdp.trim().is_empty() {
        return Err(AppError::BadRequest("empty SDP offer".to_string()));
    }

    let offer = RTCSessionDescription::offer(sdp.to_string())
        .map_err(|e| AppError::BadRequest(format!("Invalid SDP offer: {}", e)))?;
    let parsed = offer
        .unmarshal()
        .map_err(|e| AppError::BadRequest(format!("Invalid SDP offer: {}", e)))?;

    let has_video = parsed
        .media_descriptions
        .iter()
        .any(|m| m.media_name.media.eq_ignore_ascii_case("video"));
    if !has_video {
        return Err(AppError::BadRequest(
            "SDP offer has no video media section".to_string(),
        ));
    }

    Ok(offer)
}

pub struct PeerNegotiator {
    config: WebRtcConfig,
    source: Arc<SourceController>,
    sessions: Arc<PeerSessionRegistry>,
}

/// Resources that must be released if negotiation fails midway
struct Pending {
    pc: Arc<RTCPeerConnection>,
    forwarder: Option<JoinHandle<ForwardExit>>,
    subscription_id: Option<SubscriptionId>,
}

impl PeerNegotiator {
    pub fn new(
        config: WebRtcConfig,
        source: Arc<SourceController>,
        sessions: Arc<PeerSessionRegistry>,
    ) -> Self {
        Self {
            config,
            source,
            sessions,
        }
    }

    pub fn sessions(&self) -> &Arc<PeerSessionRegistry> {
        &self.sessions
    }

    /// Answer one viewer offer
    pub async fn negotiate(&self, offer_sdp: &str) -> Result<NegotiatedAnswer> {
        let offer = parse_offer(offer_sdp)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(watch::channel(PeerState::New).0);

        let pc = self.new_peer_connection(&session_id).await?;
        let mut pending = Pending {
            pc,
            forwarder: None,
            subscription_id: None,
        };

        match self.answer(&session_id, offer, &state, &mut pending).await {
            Ok(sdp) => {
                let (Some(forwarder), Some(subscription_id)) =
                    (pending.forwarder.take(), pending.subscription_id)
                else {
                    self.release(pending).await;
                    return Err(AppError::Internal("negotiation left no forwarder".to_string()));
                };

                let session = Arc::new(PeerSession::new(
                    session_id.clone(),
                    pending.pc.clone(),
                    state,
                    self.source.hub().clone(),
                    subscription_id,
                    forwarder,
                ));
                self.sessions.insert(session.clone()).await;
                spawn_supervisor(session, self.sessions.clone());

                info!("Viewer session {} negotiated", session_id);
                Ok(NegotiatedAnswer { session_id, sdp })
            }
            Err(e) => {
                warn!("Negotiation for session {} failed: {}", session_id, e);
                self.release(pending).await;
                Err(e)
            }
        }
    }

    async fn new_peer_connection(&self, session_id: &str) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                h264_codec_parameters(self.config.payload_type),
                RTPCodecType::Video,
            )
            .map_err(|e| AppError::WebRtcError(format!("Failed to register H264 codec: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(session_id));
        }
        debug!("WebRTC mDNS mode: {:?} (session {})", mode, session_id);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create peer connection: {}", e)))?;
        Ok(Arc::new(pc))
    }

    async fn answer(
        &self,
        session_id: &str,
        offer: RTCSessionDescription,
        state: &Arc<watch::Sender<PeerState>>,
        pending: &mut Pending,
    ) -> Result<String> {
        let pc = pending.pc.clone();

        let track = new_video_track();
        add_video_track(&pc, track.clone()).await?;
        register_state_handler(&pc, session_id, state.clone());
        state.send_replace(PeerState::CodecReady);

        self.source.ensure_started()?;

        let subscription = self.source.hub().subscribe();
        pending.subscription_id = Some(subscription.id());
        pending.forwarder = Some(spawn_forwarder(
            subscription,
            track,
            self.config.payload_type,
            state.clone(),
        ));

        pc.set_remote_description(offer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        let timeout = Duration::from_millis(self.config.gathering_timeout_ms);
        if tokio::time::timeout(timeout, gather_complete.recv()).await.is_err() {
            warn!(
                "ICE gathering for session {} did not finish within {:?}, answering with partial candidates",
                session_id, timeout
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description after answer".to_string()))?;

        state.send_replace(PeerState::AnswerSent);
        Ok(local.sdp)
    }

    async fn release(&self, pending: Pending) {
        if let Some(id) = pending.subscription_id {
            self.source.hub().unsubscribe(id);
        }
        if let Some(forwarder) = pending.forwarder {
            forwarder.abort();
        }
        if let Err(e) = pending.pc.close().await {
            debug!("Failed to close abandoned peer connection: {}", e);
        }
    }
}

async fn add_video_track(pc: &RTCPeerConnection, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
    let sender = pc
        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

    // Incoming RTCP must be read for the interceptors (NACK, reports) to run
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while sender.read(&mut rtcp_buf).await.is_ok() {}
    });
    Ok(())
}

fn register_state_handler(
    pc: &RTCPeerConnection,
    session_id: &str,
    state: Arc<watch::Sender<PeerState>>,
) {
    let session_id = session_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = state.clone();
        let session_id = session_id.clone();
        Box::pin(async move {
            if let Some(next) = PeerState::from_transport(s) {
                info!("Viewer session {} state: {}", session_id, next);
                state.send_replace(next);
            }
        })
    }));
}

fn spawn_forwarder(
    subscription: Subscription,
    track: Arc<TrackLocalStaticRTP>,
    payload_type: u8,
    state: Arc<watch::Sender<PeerState>>,
) -> JoinHandle<ForwardExit> {
    tokio::spawn(async move {
        let exit = forward_packets(subscription, track, payload_type).await;
        if let ForwardExit::WriteFailed(_) = exit {
            // Outbound failure ends the viewer session like a transport close
            state.send_replace(PeerState::Closed);
        }
        exit
    })
}

/// Close the session once its transport fails, disconnects or closes
fn spawn_supervisor(session: Arc<PeerSession>, sessions: Arc<PeerSessionRegistry>) {
    tokio::spawn(async move {
        let mut state_rx = session.subscribe_state();
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }

        sessions.remove(session.id()).await;
        session.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::hub::FanoutHub;

    fn negotiator() -> PeerNegotiator {
        let source = Arc::new(SourceController::new(
            SourceConfig::default(),
            FanoutHub::new(8),
        ));
        PeerNegotiator::new(
            WebRtcConfig::default(),
            source,
            Arc::new(PeerSessionRegistry::new()),
        )
    }

    #[test]
    fn parse_offer_rejects_empty_and_garbage() {
        assert!(matches!(parse_offer(""), Err(AppError::BadRequest(_))));
        assert!(matches!(parse_offer("   \r\n"), Err(AppError::BadRequest(_))));
        assert!(matches!(parse_offer("hello"), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn parse_offer_requires_video() {
        let audio_only = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n";
        assert!(matches!(parse_offer(audio_only), Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn malformed_offer_allocates_nothing() {
        let negotiator = negotiator();
        let hub = negotiator.source.hub().clone();

        let result = negotiator.negotiate("").await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(negotiator.sessions().count().await, 0);
        assert!(!negotiator.source.is_started());
    }

    #[tokio::test]
    async fn failure_after_subscribe_releases_everything() {
        // Passes offer validation but lacks ICE credentials
        let offer = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n";
        assert!(parse_offer(offer).is_ok());

        let negotiator = negotiator();
        let hub = negotiator.source.hub().clone();

        let result = negotiator.negotiate(offer).await;
        assert!(matches!(result, Err(AppError::WebRtcError(_))));
        assert!(negotiator.source.is_started());
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(negotiator.sessions().count().await, 0);

        negotiator.source.shutdown();
        negotiator.source.join().await;
    }
}
