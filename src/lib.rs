//! feed-relay - RTSP to WebRTC fanout relay
//!
//! Pulls one H.264 camera feed over RTSP and forwards its RTP packets,
//! untouched apart from timestamps and payload type, to any number of
//! WebRTC viewers.

pub mod config;
pub mod error;
pub mod hub;
pub mod packet;
pub mod rtsp;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
