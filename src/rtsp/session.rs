//! Ingest session: connect, describe, play, and reconnect forever
//!
//! One [`SourceSession`] owns the upstream RTSP connection. Every packet it
//! receives is handed to [`FanoutHub::broadcast`] from the client's packet
//! callback, which never blocks. Any failure or end of stream is logged and
//! retried after a fixed delay until the cancellation token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::client::{parse_source_url, redact_url, RtspClient};
use super::description::find_h264_format;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::hub::FanoutHub;

/// Interleaved channel requested for RTP (RTCP uses the next one)
const RTP_CHANNEL: u8 = 0;

/// Ingest state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Connecting,
    Describing,
    AwaitingFormat,
    Playing,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Idle => write!(f, "idle"),
            SourceState::Connecting => write!(f, "connecting"),
            SourceState::Describing => write!(f, "describing"),
            SourceState::AwaitingFormat => write!(f, "awaiting_format"),
            SourceState::Playing => write!(f, "playing"),
            SourceState::Reconnecting => write!(f, "reconnecting"),
            SourceState::Closed => write!(f, "closed"),
        }
    }
}

/// Counters shared with status reporting
#[derive(Debug, Default)]
pub struct SourceStats {
    pub packets: AtomicU64,
    pub attempts: AtomicU64,
}

pub struct SourceSession {
    url: Url,
    config: SourceConfig,
    hub: FanoutHub,
    state: Arc<watch::Sender<SourceState>>,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
}

impl SourceSession {
    /// Create a session for `config.url`
    ///
    /// An unparseable source address is a configuration error and is
    /// reported here, never retried.
    pub fn new(
        config: SourceConfig,
        hub: FanoutHub,
        state: Arc<watch::Sender<SourceState>>,
        stats: Arc<SourceStats>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let url = parse_source_url(&config.url)?;
        Ok(Self {
            url,
            config,
            hub,
            state,
            stats,
            cancel,
        })
    }

    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    /// Reconnect loop; returns once the cancellation token fires
    pub async fn run(self) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        info!("Source session started for {}", redact_url(&self.url));

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            let result = self.attempt().await;

            if self.cancel.is_cancelled() {
                break;
            }

            match result {
                Ok(()) => info!("Source stream ended, reconnecting in {:?}", delay),
                Err(e) => warn!("Source session failed: {}, reconnecting in {:?}", e, delay),
            }
            self.set_state(SourceState::Reconnecting);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SourceState::Closed);
        info!("Source session closed");
    }

    /// One connect/describe/setup/play/receive cycle
    async fn attempt(&self) -> Result<()> {
        let mut client = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            client = self.handshake() => client?,
        };

        self.set_state(SourceState::Playing);
        info!("Source playing");
        client.run(&self.cancel, self.config.keepalive).await
    }

    async fn handshake(&self) -> Result<RtspClient> {
        self.set_state(SourceState::Connecting);
        let mut client = RtspClient::connect(
            &self.url,
            Duration::from_millis(self.config.connect_timeout_ms),
            Duration::from_millis(self.config.request_timeout_ms),
        )
        .await?;
        client.set_read_timeout(Duration::from_millis(self.config.read_timeout_ms));

        self.set_state(SourceState::Describing);
        let methods = client.options().await?;
        debug!("Source supports: {}", methods.join(", "));
        let description = client.describe().await?;

        self.set_state(SourceState::AwaitingFormat);
        let format = find_h264_format(&description.sdp, &description.base)?;
        info!(
            "Source offers H264 pt={} clock={} fmtp={}",
            format.payload_type,
            format.clock_rate,
            format.fmtp.as_deref().unwrap_or("-")
        );

        let hub = self.hub.clone();
        let stats = self.stats.clone();
        client.on_packet_rtp(Box::new(move |packet| {
            stats.packets.fetch_add(1, Ordering::Relaxed);
            hub.broadcast(Arc::new(packet));
        }));

        client.setup(&format.control, RTP_CHANNEL).await?;
        client.play(&format.aggregate).await?;
        Ok(client)
    }

    fn set_state(&self, state: SourceState) {
        self.state.send_replace(state);
    }
}
