//! Peer-to-peer transport management
//!
//! [`PeerConnectionManager`] owns one call's media transport: it drives
//! description exchange, buffers candidates that arrive before a remote
//! description exists (the relay does not guarantee ordering), and
//! relays connectivity-state changes upward. The actual ICE runtime is a
//! collaborator behind the [`PeerTransport`] trait.

use crate::types::{IceCandidate, SessionDescription, TrackHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Peer transport errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// A session description was empty or unparsable
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// The underlying transport runtime failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation on a transport that was already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Connectivity state reported by the transport runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, nothing negotiated yet
    New,
    /// Candidate pairs being probed
    Checking,
    /// Media is flowing
    Connected,
    /// Connectivity lost, may self-recover
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Torn down locally
    Closed,
}

/// ICE/STUN/TURN-capable transport runtime
///
/// Implemented over the platform's peer-connection API in production
/// and by an in-memory fake in tests. `create_answer` may only be
/// called after a remote description was set.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Create and install the local offer description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create and install the local answer description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Install the remote description
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;

    /// Feed one remote candidate into the ICE agent
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Release all transport resources
    async fn close(&self);

    /// Connectivity-state change stream
    fn subscribe_states(&self) -> broadcast::Receiver<TransportState>;

    /// Locally gathered candidates, to be forwarded over signaling
    fn subscribe_local_candidates(&self) -> broadcast::Receiver<IceCandidate>;

    /// Remote media tracks received so far
    async fn remote_tracks(&self) -> Vec<TrackHandle>;
}

/// Creates one transport per call session
pub trait PeerTransportFactory: Send + Sync + 'static {
    /// Build a fresh, unconnected transport
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot construct a connection.
    fn create(&self) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

/// Per-session owner of the peer-to-peer media transport
pub struct PeerConnectionManager {
    transport: Arc<dyn PeerTransport>,
    pending_remote_candidates: Mutex<Vec<IceCandidate>>,
    have_remote_description: AtomicBool,
    closed: AtomicBool,
}

impl PeerConnectionManager {
    /// Wrap a freshly created transport
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            pending_remote_candidates: Mutex::new(Vec::new()),
            have_remote_description: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Create the local offer (caller side)
    ///
    /// # Errors
    ///
    /// Returns error if the transport is closed or offer creation fails.
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let offer = self.transport.create_offer().await?;
        tracing::debug!(sdp_len = offer.sdp.len(), "Local offer created");
        Ok(offer)
    }

    /// Apply the remote offer and create the local answer (callee side)
    ///
    /// # Errors
    ///
    /// Returns error if the offer is invalid or the transport fails.
    pub async fn create_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.apply_remote_description(remote_offer).await?;
        let answer = self.transport.create_answer().await?;
        tracing::debug!(sdp_len = answer.sdp.len(), "Local answer created");
        Ok(answer)
    }

    /// Install the remote description and flush buffered candidates
    ///
    /// The pending-candidate buffer is drained in arrival order and
    /// cleared the moment the description is applied.
    ///
    /// # Errors
    ///
    /// Returns error if the description is empty or the transport fails.
    pub async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if desc.sdp.trim().is_empty() {
            return Err(PeerError::InvalidDescription(
                "session description cannot be empty".to_string(),
            ));
        }

        self.transport.set_remote_description(desc).await?;
        self.have_remote_description.store(true, Ordering::SeqCst);

        let buffered = std::mem::take(&mut *self.pending_remote_candidates.lock().await);
        if !buffered.is_empty() {
            tracing::debug!(
                count = buffered.len(),
                "Flushing candidates buffered before remote description"
            );
        }
        for candidate in &buffered {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Add a remote candidate, buffering it if no remote description
    /// exists yet
    ///
    /// Early candidates never error; they are queued in order and
    /// flushed by [`Self::apply_remote_description`]. Candidates for a
    /// closed connection are discarded.
    ///
    /// # Errors
    ///
    /// Returns error only if the transport rejects a candidate after
    /// the description was set.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            tracing::trace!("Discarding candidate for closed connection");
            return Ok(());
        }

        if self.have_remote_description.load(Ordering::SeqCst) {
            self.transport.add_ice_candidate(&candidate).await
        } else {
            self.pending_remote_candidates.lock().await.push(candidate);
            Ok(())
        }
    }

    /// Release all transport resources
    ///
    /// Safe to call any number of times; only the first call reaches
    /// the runtime.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending_remote_candidates.lock().await.clear();
        self.transport.close().await;
        tracing::debug!("Peer connection closed");
    }

    /// Connectivity-state change stream
    #[must_use]
    pub fn subscribe_states(&self) -> broadcast::Receiver<TransportState> {
        self.transport.subscribe_states()
    }

    /// Locally gathered candidates to forward over signaling
    #[must_use]
    pub fn subscribe_local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.transport.subscribe_local_candidates()
    }

    /// Remote media tracks received so far
    pub async fn remote_tracks(&self) -> Vec<TrackHandle> {
        self.transport.remote_tracks().await
    }

    /// Number of candidates waiting for a remote description
    pub async fn pending_candidate_count(&self) -> usize {
        self.pending_remote_candidates.lock().await.len()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}
