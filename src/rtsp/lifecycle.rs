//! Start-once control over the ingest session

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{SourceSession, SourceState, SourceStats};
use crate::config::SourceConfig;
use crate::error::{AppError, Result};
use crate::hub::FanoutHub;

#[derive(Default)]
struct Gate {
    started: bool,
    shut_down: bool,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Source status for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub state: SourceState,
    pub started: bool,
    pub starts: usize,
    pub attempts: u64,
    pub packets: u64,
}

/// Owns the fanout hub and the single ingest task
///
/// [`ensure_started`](Self::ensure_started) is called by every viewer
/// negotiation; only the first call spawns the reconnect loop.
pub struct SourceController {
    config: SourceConfig,
    hub: FanoutHub,
    gate: Mutex<Gate>,
    starts: AtomicUsize,
    state: Arc<watch::Sender<SourceState>>,
    stats: Arc<SourceStats>,
}

impl SourceController {
    pub fn new(config: SourceConfig, hub: FanoutHub) -> Self {
        Self {
            config,
            hub,
            gate: Mutex::new(Gate::default()),
            starts: AtomicUsize::new(0),
            state: Arc::new(watch::channel(SourceState::Idle).0),
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn hub(&self) -> &FanoutHub {
        &self.hub
    }

    /// Start the reconnect loop unless it is already running
    ///
    /// A malformed source URL is returned to the caller and leaves the gate
    /// closed, so a later call reports it again.
    pub fn ensure_started(&self) -> Result<()> {
        let mut gate = self.gate.lock();
        if gate.shut_down {
            return Err(AppError::ServiceUnavailable(
                "relay is shutting down".to_string(),
            ));
        }
        if gate.started {
            return Ok(());
        }

        let session = SourceSession::new(
            self.config.clone(),
            self.hub.clone(),
            self.state.clone(),
            self.stats.clone(),
            gate.cancel.clone(),
        )?;

        gate.handle = Some(tokio::spawn(session.run()));
        gate.started = true;
        self.starts.fetch_add(1, Ordering::SeqCst);
        info!("Source ingest started");
        Ok(())
    }

    /// Cancel ingest and close every subscription; idempotent
    pub fn shutdown(&self) {
        let mut gate = self.gate.lock();
        if gate.shut_down {
            return;
        }
        gate.shut_down = true;
        gate.cancel.cancel();
        drop(gate);

        self.hub.shutdown();
        info!("Source ingest shut down");
    }

    /// Stop the ingest task and reopen the start gate
    ///
    /// Does not revive a hub that was shut down.
    pub async fn reset(&self) {
        let handle = {
            let mut gate = self.gate.lock();
            gate.cancel.cancel();
            gate.cancel = CancellationToken::new();
            gate.started = false;
            gate.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("Source task ended abnormally: {}", e);
            }
        }
        self.state.send_replace(SourceState::Idle);
    }

    /// Wait for the ingest task to finish after [`shutdown`](Self::shutdown)
    pub async fn join(&self) {
        let handle = self.gate.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("Source task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.gate.lock().started
    }

    /// Number of times the reconnect loop has been spawned
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SourceState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            state: self.state(),
            started: self.is_started(),
            starts: self.starts(),
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            packets: self.stats.packets.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SourceController {
    fn drop(&mut self) {
        self.gate.get_mut().cancel.cancel();
    }
}
