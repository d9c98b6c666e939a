//! RTSP ingest
//!
//! Pulls one H.264 stream from an upstream camera and feeds it to the
//! fanout hub.

pub mod client;
pub mod description;
pub mod lifecycle;
pub mod session;

pub use client::{parse_source_url, RtspClient};
pub use description::{find_h264_format, VideoFormat};
pub use lifecycle::{SourceController, SourceStatus};
pub use session::{SourceSession, SourceState};
