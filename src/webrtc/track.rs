//! Outbound H.264 track and the per-viewer forwarding task

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::error::{AppError, Result};
use crate::hub::Subscription;
use crate::packet::{Packet, TimestampRebaser};

pub const MIME_TYPE_H264: &str = "video/H264";
pub const H264_CLOCK_RATE: u32 = 90000;
pub const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

pub const VIDEO_TRACK_ID: &str = "video";
pub const VIDEO_STREAM_ID: &str = "feed-relay";

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

/// The single video capability viewers are offered
pub fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_owned(),
        rtcp_feedback: video_rtcp_feedback(),
    }
}

pub fn h264_codec_parameters(payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: h264_capability(),
        payload_type,
        ..Default::default()
    }
}

/// Outbound media carrier for one viewer
pub fn new_video_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        h264_capability(),
        VIDEO_TRACK_ID.to_owned(),
        VIDEO_STREAM_ID.to_owned(),
    ))
}

/// Sink for rebased packets
#[async_trait]
pub trait RtpWriter: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<()>;
}

#[async_trait]
impl RtpWriter for TrackLocalStaticRTP {
    async fn write_rtp(&self, packet: &Packet) -> Result<()> {
        TrackLocalWriter::write_rtp(self, packet)
            .await
            .map(|_| ())
            .map_err(|e| AppError::WebRtcError(format!("Failed to write RTP packet: {}", e)))
    }
}

/// Why a forwarding task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardExit {
    /// Subscription closed by unsubscribe or hub shutdown
    QueueClosed,
    /// The outbound carrier rejected a write
    WriteFailed(String),
}

/// Drain `subscription` into `writer` until either side closes
///
/// The first packet fixes the timestamp origin, so this viewer's stream
/// starts at zero. Every packet carries `payload_type`. The subscription is
/// released before returning.
pub async fn forward_packets<W>(
    mut subscription: Subscription,
    writer: Arc<W>,
    payload_type: u8,
) -> ForwardExit
where
    W: RtpWriter + ?Sized,
{
    let id = subscription.id();
    let mut rebaser = TimestampRebaser::new(payload_type);
    let mut forwarded: u64 = 0;

    let exit = loop {
        let Some(packet) = subscription.recv().await else {
            break ForwardExit::QueueClosed;
        };

        let outbound = rebaser.rebase(&packet);
        if let Err(e) = writer.write_rtp(&outbound).await {
            break ForwardExit::WriteFailed(e.to_string());
        }

        forwarded += 1;
        if forwarded == 1 {
            debug!(
                "Subscription {} timestamp origin {}",
                id,
                rebaser.origin().unwrap_or_default()
            );
        }
        trace!("Subscription {} forwarded seq {}", id, outbound.header.sequence_number);
    };

    subscription.unsubscribe();
    info!(
        "Forwarding for subscription {} stopped after {} packets ({} dropped): {:?}",
        id,
        forwarded,
        subscription.dropped(),
        exit
    );
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::FanoutHub;
    use crate::packet::new_packet;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingWriter {
        packets: Mutex<Vec<Packet>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl RtpWriter for RecordingWriter {
        async fn write_rtp(&self, packet: &Packet) -> Result<()> {
            let mut packets = self.packets.lock();
            if let Some(limit) = self.fail_after {
                if packets.len() >= limit {
                    return Err(AppError::WebRtcError("transport closed".to_string()));
                }
            }
            packets.push(packet.clone());
            Ok(())
        }
    }

    fn packet(seq: u16, ts: u32) -> Arc<Packet> {
        Arc::new(new_packet(
            100,
            seq,
            ts,
            false,
            Bytes::from_static(&[0x41, 0x9a]),
        ))
    }

    #[test]
    fn capability_declares_h264_with_feedback() {
        let params = h264_codec_parameters(96);
        assert_eq!(params.payload_type, 96);
        assert_eq!(params.capability.mime_type, "video/H264");
        assert!(params.capability.sdp_fmtp_line.contains("packetization-mode=1"));
        assert!(params
            .capability
            .rtcp_feedback
            .iter()
            .any(|fb| fb.typ == "nack" && fb.parameter == "pli"));
    }

    #[tokio::test]
    async fn late_joiner_starts_at_zero_with_fixed_payload_type() {
        let hub = FanoutHub::new(16);
        let subscription = hub.subscribe();
        let writer = Arc::new(RecordingWriter::default());

        let task = tokio::spawn(forward_packets(subscription, writer.clone(), 96));

        hub.broadcast(packet(500, 7_200_000));
        hub.broadcast(packet(501, 7_203_000));
        hub.broadcast(packet(502, 7_206_000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.shutdown();

        let exit = task.await.unwrap();
        assert_eq!(exit, ForwardExit::QueueClosed);

        let packets = writer.packets.lock();
        let timestamps: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
        assert_eq!(timestamps, vec![0, 3000, 6000]);
        assert!(packets.iter().all(|p| p.header.payload_type == 96));
        assert_eq!(packets[0].header.sequence_number, 500);
    }

    #[tokio::test]
    async fn write_failure_ends_task_and_unsubscribes() {
        let hub = FanoutHub::new(16);
        let subscription = hub.subscribe();
        let writer = Arc::new(RecordingWriter {
            fail_after: Some(1),
            ..Default::default()
        });
        assert_eq!(hub.subscriber_count(), 1);

        let task = tokio::spawn(forward_packets(subscription, writer.clone(), 96));
        hub.broadcast(packet(1, 0));
        hub.broadcast(packet(2, 3000));

        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, ForwardExit::WriteFailed(_)));
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(writer.packets.lock().len(), 1);
    }
}
