//! Media packet model shared between the RTSP ingest and WebRTC viewers
//!
//! The ingest side produces one [`SharedPacket`] per RTP packet and hands the
//! same allocation to every subscriber. Viewers never mutate the shared
//! packet: [`TimestampRebaser`] produces a private copy with a rebased
//! timestamp and the negotiated payload type. The payload is `Bytes`, so the
//! copy only clones the header and bumps a reference count.

use std::sync::Arc;

use bytes::Bytes;
use rtp::header::Header;
pub use rtp::packet::Packet;

/// Packet as distributed by the fanout hub
pub type SharedPacket = Arc<Packet>;

/// Build a packet from its parts (mostly useful for tests and tooling)
pub fn new_packet(
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    marker: bool,
    payload: Bytes,
) -> Packet {
    Packet {
        header: Header {
            version: 2,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ..Default::default()
        },
        payload,
    }
}

/// Shallow copy of `packet` with the timestamp shifted by `origin` and the
/// payload type replaced
pub fn rebase(packet: &Packet, origin: u32, payload_type: u8) -> Packet {
    let mut header = packet.header.clone();
    header.timestamp = header.timestamp.wrapping_sub(origin);
    header.payload_type = payload_type;
    Packet {
        header,
        payload: packet.payload.clone(),
    }
}

/// Per-subscription timestamp origin
///
/// The first packet observed fixes the origin, so every viewer's stream
/// starts at timestamp zero no matter how long the ingest session has been
/// running. RTP timestamps wrap, so the subtraction wraps as well.
#[derive(Debug, Clone)]
pub struct TimestampRebaser {
    origin: Option<u32>,
    payload_type: u8,
}

impl TimestampRebaser {
    pub fn new(payload_type: u8) -> Self {
        Self {
            origin: None,
            payload_type,
        }
    }

    /// Origin fixed by the first packet, if one has been seen
    pub fn origin(&self) -> Option<u32> {
        self.origin
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn rebase(&mut self, packet: &Packet) -> Packet {
        let origin = *self.origin.get_or_insert(packet.header.timestamp);
        rebase(packet, origin, self.payload_type)
    }
}
