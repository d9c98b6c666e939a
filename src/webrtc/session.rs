//! Viewer sessions and their registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;

use super::signaling::PeerState;
use super::track::ForwardExit;
use crate::error::{AppError, Result};
use crate::hub::{FanoutHub, SubscriptionId};

const FORWARDER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// One negotiated viewer
pub struct PeerSession {
    id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<watch::Sender<PeerState>>,
    hub: FanoutHub,
    subscription_id: SubscriptionId,
    forwarder: parking_lot::Mutex<Option<JoinHandle<ForwardExit>>>,
    created_at: Instant,
    closed: AtomicBool,
}

/// Session info for listing
#[derive(Debug, Clone, Serialize)]
pub struct PeerSessionInfo {
    pub session_id: String,
    pub state: PeerState,
    pub subscription_id: SubscriptionId,
    pub age_secs: u64,
}

impl PeerSession {
    pub fn new(
        id: String,
        pc: Arc<RTCPeerConnection>,
        state: Arc<watch::Sender<PeerState>>,
        hub: FanoutHub,
        subscription_id: SubscriptionId,
        forwarder: JoinHandle<ForwardExit>,
    ) -> Self {
        Self {
            id,
            pc,
            state,
            hub,
            subscription_id,
            forwarder: parking_lot::Mutex::new(Some(forwarder)),
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> PeerSessionInfo {
        PeerSessionInfo {
            session_id: self.id.clone(),
            state: self.state(),
            subscription_id: self.subscription_id,
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Release the subscription and the peer connection; idempotent
    ///
    /// Unsubscribing closes the queue, which ends the forwarding task.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.hub.unsubscribe(self.subscription_id);
        let forwarder = self.forwarder.lock().take();

        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection {}: {}", self.id, e);
        }

        if let Some(mut handle) = forwarder {
            match tokio::time::timeout(FORWARDER_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(exit)) => debug!("Session {} forwarder finished: {:?}", self.id, exit),
                Ok(Err(e)) => debug!("Session {} forwarder aborted: {}", self.id, e),
                Err(_) => {
                    warn!("Session {} forwarder did not stop, aborting", self.id);
                    handle.abort();
                }
            }
        }

        self.state.send_replace(PeerState::Closed);
        info!("Viewer session {} closed", self.id);
    }
}

/// Live viewer sessions keyed by session ID
#[derive(Default)]
pub struct PeerSessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl PeerSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<PeerSession>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id().to_string(), session);
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Close and forget one session
    pub async fn close(&self, session_id: &str) -> Result<()> {
        let session = self
            .remove(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", session_id)))?;
        session.close().await;
        Ok(())
    }

    /// Close every session, used on shutdown
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|session| session.close())).await;
        if count > 0 {
            info!("Closed {} viewer sessions", count);
        }
        count
    }

    pub async fn list(&self) -> Vec<PeerSessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<PeerSessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.subscription_id);
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
