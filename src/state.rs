use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::ConfigStore;
use crate::hub::FanoutHub;
use crate::rtsp::SourceController;
use crate::webrtc::{PeerNegotiator, PeerSessionRegistry};

/// Application-wide state shared across handlers
///
/// The source controller owns the fanout hub; the negotiator holds the same
/// controller so every viewer subscribes to the one hub.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Ingest lifecycle and fanout hub
    pub source: Arc<SourceController>,
    /// Live viewer sessions
    pub sessions: Arc<PeerSessionRegistry>,
    /// Offer/answer entry point for the HTTP layer
    pub negotiator: PeerNegotiator,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Wire the relay from its configuration
    ///
    /// Nothing connects upstream here; ingest starts with the first viewer.
    pub fn new(config: ConfigStore, shutdown_tx: broadcast::Sender<()>) -> Arc<Self> {
        let app_config = config.get();
        let hub = FanoutHub::new(app_config.hub.queue_capacity);
        let source = Arc::new(SourceController::new(app_config.source.clone(), hub));
        let sessions = Arc::new(PeerSessionRegistry::new());
        let negotiator =
            PeerNegotiator::new(app_config.webrtc.clone(), source.clone(), sessions.clone());

        Arc::new(Self {
            config,
            source,
            sessions,
            negotiator,
            shutdown_tx,
        })
    }

    pub fn hub(&self) -> &FanoutHub {
        self.source.hub()
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop ingest, close every viewer and wait for the source task
    pub async fn shutdown(&self) {
        self.source.shutdown();
        let closed = self.sessions.close_all().await;
        self.source.join().await;
        info!("Relay stopped ({} viewer sessions closed)", closed);
    }
}
