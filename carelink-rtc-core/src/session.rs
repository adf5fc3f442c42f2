//! Call session management
//!
//! [`CallSessionManager`] is the authoritative state machine for the one
//! live consultation a client may have. Every mutation of call state
//! goes through its handlers (user actions, signaling messages, timer
//! and transport events); the UI layer only invokes the public
//! operations and observes published state. The state machine:
//!
//! ```text
//!          startCall                     invite received
//!   Idle ───────────► OutgoingRinging      Idle ───────► IncomingRinging
//!                          │                                  │
//!             remote accept│                       answerCall │
//!                          ▼                                  ▼
//!                     Negotiating ◄───────────────────────────┘
//!                          │ transport connected
//!                          ▼
//!                      Connected
//!                          │ endCall / remote end / grace expiry
//!                          ▼
//!                        Ended (terminal)
//! ```
//!
//! `Connected` is entered only when the peer transport reports media
//! flow; a completed SDP exchange alone is not enough. Every terminal
//! transition funnels through one teardown routine that releases media,
//! closes the transport and bumps the session epoch so in-flight async
//! work from the dead session is discarded instead of applied.

use crate::config::CallConfig;
use crate::media::{MediaController, MediaError};
use crate::peer::{PeerConnectionManager, PeerError, PeerTransportFactory, TransportState};
use crate::signaling::{
    InvitePayload, MessageKind, RejectPayload, RejectReason, SignalingChannel, SignalingError,
    SignalingMessage, SignalingTransport,
};
use crate::types::{
    CallEvent, CallRole, CallSnapshot, CallState, EndReason, IceCandidate, MediaKind,
    ParticipantId, SessionDescription, SessionId, TrackHandle,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::sleep;

/// Call session errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A non-terminal session already exists
    #[error("Already in a call")]
    Busy,

    /// The operation is not valid in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Peer transport failed
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Signaling failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// One call attempt, owned exclusively by the manager
struct CallSession {
    id: SessionId,
    remote: ParticipantId,
    role: CallRole,
    kind: MediaKind,
    state: CallState,
    reason: Option<EndReason>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    audio_enabled: bool,
    video_enabled: bool,
    /// Cancellation generation; timers and pumps from older epochs no-op
    epoch: u64,
    peer: Option<Arc<PeerConnectionManager>>,
    /// Candidates that arrived before the peer connection existed
    pending_remote_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<TrackHandle>,
    /// Transport is currently in its disconnect grace window
    transport_disconnected: bool,
    /// Invalidates grace timers when connectivity flaps
    disconnect_gen: u64,
}

impl CallSession {
    fn new(
        id: SessionId,
        remote: ParticipantId,
        role: CallRole,
        kind: MediaKind,
        epoch: u64,
    ) -> Self {
        let state = match role {
            CallRole::Caller => CallState::OutgoingRinging,
            CallRole::Callee => CallState::IncomingRinging,
        };
        Self {
            id,
            remote,
            role,
            kind,
            state,
            reason: None,
            started_at: Utc::now(),
            connected_at: None,
            audio_enabled: true,
            video_enabled: kind.has_video(),
            epoch,
            peer: None,
            pending_remote_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            transport_disconnected: false,
            disconnect_gen: 0,
        }
    }

    fn is_ringing(&self) -> bool {
        matches!(
            self.state,
            CallState::OutgoingRinging | CallState::IncomingRinging
        )
    }
}

/// The core call state machine
///
/// Owns at most one non-terminal [`CallSnapshot`]-worth of session at a
/// time. Construct one per signed-in client with the verified local
/// participant id already applied to the signaling channel.
pub struct CallSessionManager<T: SignalingTransport> {
    channel: Arc<SignalingChannel<T>>,
    media: Arc<MediaController>,
    peers: Arc<dyn PeerTransportFactory>,
    config: CallConfig,
    session: RwLock<Option<CallSession>>,
    /// Bumped on every teardown and session creation
    epoch: AtomicU64,
    /// Mirrors `epoch`; wakes the pumps so they exit without waiting
    /// for one more transport event
    epoch_tx: watch::Sender<u64>,
    events: broadcast::Sender<CallEvent>,
}

impl<T: SignalingTransport> CallSessionManager<T> {
    /// Create a session manager
    #[must_use]
    pub fn new(
        channel: Arc<SignalingChannel<T>>,
        media: Arc<MediaController>,
        peers: Arc<dyn PeerTransportFactory>,
        config: CallConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (epoch_tx, _) = watch::channel(0);
        Self {
            channel,
            media,
            peers,
            config,
            session: RwLock::new(None),
            epoch: AtomicU64::new(0),
            epoch_tx,
            events,
        }
    }

    /// Advance the cancellation epoch and wake anything watching it
    fn bump_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.epoch_tx.send_replace(epoch);
        epoch
    }

    /// Subscribe to published call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current call state (`Idle` when no session exists)
    pub async fn state(&self) -> CallState {
        self.session
            .read()
            .await
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    /// Whether a new call may start or an invite may be surfaced
    pub async fn is_idle(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .map_or(true, |s| s.state.is_terminal())
    }

    /// Read-only view of the current session, if any
    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.read().await.as_ref().map(|s| CallSnapshot {
            session_id: s.id,
            remote: s.remote.clone(),
            role: s.role,
            kind: s.kind,
            state: s.state,
            reason: s.reason,
            started_at: s.started_at,
            connected_at: s.connected_at,
            audio_enabled: s.audio_enabled,
            video_enabled: s.video_enabled,
        })
    }

    /// Remote playback handles, available only once connected
    pub async fn remote_tracks(&self) -> Vec<TrackHandle> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| s.state == CallState::Connected)
            .map(|s| s.remote_tracks.clone())
            .unwrap_or_default()
    }

    /// Start an outgoing call
    ///
    /// Acquires local media first, so a denied permission prompt aborts
    /// the attempt before the peer is ever notified, then sends the
    /// invite and arms the ring timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] if a session is live, or the media /
    /// signaling failure that aborted the attempt.
    pub async fn start_call(
        self: &Arc<Self>,
        remote: ParticipantId,
        kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        let id = SessionId::new();
        let epoch = {
            let mut slot = self.session.write().await;
            if slot.as_ref().is_some_and(|s| !s.state.is_terminal()) {
                return Err(CallError::Busy);
            }
            let epoch = self.bump_epoch();
            *slot = Some(CallSession::new(
                id,
                remote.clone(),
                CallRole::Caller,
                kind,
                epoch,
            ));
            epoch
        };

        tracing::info!(session_id = %id, remote = %remote, kind = ?kind, "Starting call");
        self.publish_state(id, CallState::OutgoingRinging, None);

        // Suspension point: the permission prompt can take arbitrarily
        // long and the session may be torn down meanwhile.
        if let Err(e) = self.media.acquire(kind).await {
            let reason = match &e {
                MediaError::PermissionDenied => EndReason::MediaDenied,
                MediaError::DeviceUnavailable(_) => EndReason::MediaUnavailable,
            };
            self.finish(reason, false).await;
            return Err(e.into());
        }
        if !self.session_is_current(id, epoch).await {
            self.media.release().await;
            return Err(CallError::InvalidState(self.state().await));
        }

        if let Err(e) = self
            .channel
            .send(SignalingMessage::invite(
                id,
                self.channel.local_id().clone(),
                kind,
            ))
            .await
        {
            self.finish(EndReason::SignalingLost, false).await;
            return Err(e.into());
        }

        self.arm_ring_timer(id, epoch);
        Ok(id)
    }

    /// Accept the currently ringing incoming call
    ///
    /// Does not leave `IncomingRinging` until media acquisition
    /// resolves; a session torn down during the prompt discards the
    /// stale result.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless an invite is ringing,
    /// or the media/transport/signaling failure that ended the attempt.
    pub async fn answer_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (id, kind, epoch) = {
            let slot = self.session.read().await;
            match slot.as_ref() {
                Some(s) if s.state == CallState::IncomingRinging => (s.id, s.kind, s.epoch),
                other => {
                    return Err(CallError::InvalidState(
                        other.map_or(CallState::Idle, |s| s.state),
                    ))
                }
            }
        };

        if let Err(e) = self.media.acquire(kind).await {
            let reason = match &e {
                MediaError::PermissionDenied => EndReason::MediaDenied,
                MediaError::DeviceUnavailable(_) => EndReason::MediaUnavailable,
            };
            // The caller is waiting; decline instead of leaving them to ring out
            let _ = self
                .channel
                .send(SignalingMessage::reject(
                    id,
                    self.channel.local_id().clone(),
                    RejectReason::Declined,
                ))
                .await;
            self.finish(reason, false).await;
            return Err(e.into());
        }
        if !self.session_is_current(id, epoch).await {
            self.media.release().await;
            return Err(CallError::InvalidState(self.state().await));
        }

        if let Err(e) = self.attach_peer(id, epoch, CallState::IncomingRinging).await {
            self.finish(EndReason::ConnectionFailed, false).await;
            return Err(e);
        }
        self.publish_state(id, CallState::Negotiating, None);

        if let Err(e) = self
            .channel
            .send(SignalingMessage::accept(
                id,
                self.channel.local_id().clone(),
            ))
            .await
        {
            self.finish(EndReason::SignalingLost, false).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Decline the currently ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless an invite is ringing.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.dismiss_incoming(true).await
    }

    /// Hang up
    ///
    /// Valid in every state and idempotent: ending an already ended (or
    /// absent) session has no observable effect.
    pub async fn end_call(&self) {
        let state = self.state().await;
        match state {
            CallState::Idle | CallState::Ended => {}
            CallState::IncomingRinging => {
                // Nothing was acquired or negotiated yet; decline instead
                let _ = self.dismiss_incoming(true).await;
            }
            CallState::OutgoingRinging | CallState::Negotiating | CallState::Connected => {
                self.finish(EndReason::HungUp, true).await;
            }
        }
    }

    /// Toggle the microphone
    ///
    /// Presentation-only: valid while `Connected`, a no-op otherwise.
    /// Returns the resulting enabled flag.
    pub async fn toggle_audio(&self) -> bool {
        let flipped = {
            let mut slot = self.session.write().await;
            match slot.as_mut() {
                Some(s) if s.state == CallState::Connected => {
                    s.audio_enabled = !s.audio_enabled;
                    Some(s.audio_enabled)
                }
                other => return other.as_ref().map_or(false, |s| s.audio_enabled),
            }
        };
        let enabled = flipped.unwrap_or(false);
        self.media.set_audio_enabled(enabled).await;
        enabled
    }

    /// Toggle the camera
    ///
    /// Presentation-only: valid while `Connected`, a no-op otherwise.
    /// Returns the resulting enabled flag.
    pub async fn toggle_video(&self) -> bool {
        let flipped = {
            let mut slot = self.session.write().await;
            match slot.as_mut() {
                Some(s) if s.state == CallState::Connected && s.kind.has_video() => {
                    s.video_enabled = !s.video_enabled;
                    Some(s.video_enabled)
                }
                other => return other.as_ref().map_or(false, |s| s.video_enabled),
            }
        };
        let enabled = flipped.unwrap_or(false);
        self.media.set_video_enabled(enabled).await;
        enabled
    }

    /// Router entry: an invite arrived while this client was idle
    ///
    /// Builds the callee session (echoing the caller's session id),
    /// arms the ring timeout and surfaces the invite to the UI.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] if a session raced in meanwhile, or
    /// an invalid-payload error for a malformed invite.
    pub async fn handle_invite(self: &Arc<Self>, message: &SignalingMessage) -> Result<(), CallError> {
        let payload: InvitePayload = message.payload_as()?;
        let (id, epoch) = {
            let mut slot = self.session.write().await;
            if slot.as_ref().is_some_and(|s| !s.state.is_terminal()) {
                return Err(CallError::Busy);
            }
            let epoch = self.bump_epoch();
            *slot = Some(CallSession::new(
                message.session_id,
                message.sender_id.clone(),
                CallRole::Callee,
                payload.kind,
                epoch,
            ));
            (message.session_id, epoch)
        };

        tracing::info!(
            session_id = %id,
            caller = %message.sender_id,
            kind = ?payload.kind,
            "Incoming call"
        );
        self.publish_state(id, CallState::IncomingRinging, None);
        self.emit(CallEvent::IncomingInvite {
            session_id: id,
            caller: message.sender_id.clone(),
            kind: payload.kind,
        });
        self.arm_ring_timer(id, epoch);
        Ok(())
    }

    /// Router entry: a session-scoped message arrived
    ///
    /// Messages whose session id does not match the live session are
    /// discarded; the signaling channel is shared and a late `accept`
    /// for a timed-out attempt must not resurrect anything.
    pub async fn handle_message(self: &Arc<Self>, message: SignalingMessage) {
        let current = {
            let slot = self.session.read().await;
            slot.as_ref()
                .map(|s| (s.id, s.state, s.role, s.epoch, s.peer.clone()))
        };
        let Some((id, state, role, epoch, peer)) = current else {
            tracing::trace!(session_id = %message.session_id, kind = ?message.kind, "No live session, discarding");
            return;
        };
        if message.session_id != id || state.is_terminal() {
            tracing::trace!(
                session_id = %message.session_id,
                live_session = %id,
                kind = ?message.kind,
                "Discarding message for stale session"
            );
            return;
        }

        match message.kind {
            MessageKind::Accept => self.on_accept(id, state, role, epoch).await,
            MessageKind::Reject => self.on_reject(&message, state, role).await,
            MessageKind::Offer => self.on_offer(&message, id, state, role, peer).await,
            MessageKind::Answer => self.on_answer(&message, state, role, peer).await,
            MessageKind::IceCandidate => self.on_candidate(&message, id, peer).await,
            MessageKind::End => self.finish(EndReason::RemoteHungUp, false).await,
            MessageKind::Invite | MessageKind::Heartbeat => {
                tracing::trace!(session_id = %id, kind = ?message.kind, "Ignoring");
            }
        }
    }

    /// Caller side: the callee picked up, create and send the offer
    async fn on_accept(self: &Arc<Self>, id: SessionId, state: CallState, role: CallRole, epoch: u64) {
        if role != CallRole::Caller || state != CallState::OutgoingRinging {
            tracing::debug!(session_id = %id, state = ?state, "Ignoring accept in wrong state");
            return;
        }

        let pcm = match self.attach_peer(id, epoch, CallState::OutgoingRinging).await {
            Ok(pcm) => pcm,
            Err(_) => {
                self.finish(EndReason::ConnectionFailed, true).await;
                return;
            }
        };
        self.publish_state(id, CallState::Negotiating, None);

        let offer = match pcm.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Offer creation failed");
                self.finish(EndReason::ConnectionFailed, true).await;
                return;
            }
        };
        if self
            .channel
            .send(SignalingMessage::description(
                id,
                self.channel.local_id().clone(),
                &offer,
            ))
            .await
            .is_err()
        {
            self.finish(EndReason::SignalingLost, false).await;
        }
    }

    /// Caller side: the callee declined (or was busy)
    async fn on_reject(&self, message: &SignalingMessage, state: CallState, role: CallRole) {
        if role != CallRole::Caller || state != CallState::OutgoingRinging {
            return;
        }
        let reason = match message.payload_as::<RejectPayload>() {
            Ok(RejectPayload {
                reason: RejectReason::Busy,
            }) => EndReason::Busy,
            _ => EndReason::Rejected,
        };
        self.finish(reason, false).await;
    }

    /// Callee side: apply the remote offer and send back the answer
    async fn on_offer(
        self: &Arc<Self>,
        message: &SignalingMessage,
        id: SessionId,
        state: CallState,
        role: CallRole,
        peer: Option<Arc<PeerConnectionManager>>,
    ) {
        if role != CallRole::Callee || state != CallState::Negotiating {
            tracing::debug!(session_id = %id, state = ?state, "Ignoring offer in wrong state");
            return;
        }
        let Some(pcm) = peer else { return };
        let desc: SessionDescription = match message.payload_as() {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Malformed offer");
                self.finish(EndReason::ConnectionFailed, true).await;
                return;
            }
        };
        let answer = match pcm.create_answer(&desc).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Answer creation failed");
                self.finish(EndReason::ConnectionFailed, true).await;
                return;
            }
        };
        if self
            .channel
            .send(SignalingMessage::description(
                id,
                self.channel.local_id().clone(),
                &answer,
            ))
            .await
            .is_err()
        {
            self.finish(EndReason::SignalingLost, false).await;
        }
    }

    /// Caller side: apply the remote answer
    async fn on_answer(
        &self,
        message: &SignalingMessage,
        state: CallState,
        role: CallRole,
        peer: Option<Arc<PeerConnectionManager>>,
    ) {
        if role != CallRole::Caller || state != CallState::Negotiating {
            return;
        }
        let Some(pcm) = peer else { return };
        let applied = message
            .payload_as::<SessionDescription>()
            .map_err(CallError::from);
        let result = match applied {
            Ok(desc) => pcm
                .apply_remote_description(&desc)
                .await
                .map_err(CallError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(session_id = %message.session_id, error = %e, "Applying answer failed");
            self.finish(EndReason::ConnectionFailed, true).await;
        }
    }

    /// Either side: feed or buffer a remote candidate
    ///
    /// Candidates may legally arrive before the peer connection exists
    /// (callee still ringing) or before the remote description is set;
    /// both buffers preserve arrival order.
    async fn on_candidate(
        &self,
        message: &SignalingMessage,
        id: SessionId,
        peer: Option<Arc<PeerConnectionManager>>,
    ) {
        let candidate: IceCandidate = match message.payload_as() {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Malformed candidate, dropping");
                return;
            }
        };
        match peer {
            Some(pcm) => {
                if let Err(e) = pcm.add_remote_candidate(candidate).await {
                    // A single bad candidate is not fatal; others may connect
                    tracing::warn!(session_id = %id, error = %e, "Candidate rejected");
                }
            }
            None => {
                let mut slot = self.session.write().await;
                if let Some(session) = slot.as_mut().filter(|s| s.id == id) {
                    session.pending_remote_candidates.push(candidate);
                }
            }
        }
    }

    /// Create the per-session peer connection and move to `Negotiating`
    ///
    /// The connectivity and local-candidate pumps subscribe before the
    /// session leaves its ringing state, so no transport event emitted
    /// during negotiation can be missed. Candidates buffered on the
    /// session are handed to the connection, which itself buffers until
    /// a remote description exists.
    async fn attach_peer(
        self: &Arc<Self>,
        id: SessionId,
        epoch: u64,
        expected: CallState,
    ) -> Result<Arc<PeerConnectionManager>, CallError> {
        let transport = self.peers.create()?;
        let pcm = Arc::new(PeerConnectionManager::new(transport));
        self.spawn_transport_pump(pcm.clone(), id, epoch);
        self.spawn_candidate_pump(pcm.clone(), id, epoch);

        let buffered = {
            let mut slot = self.session.write().await;
            let session = match slot
                .as_mut()
                .filter(|s| s.id == id && s.epoch == epoch && s.state == expected)
            {
                Some(session) => session,
                None => {
                    drop(slot);
                    pcm.close().await;
                    return Err(CallError::InvalidState(CallState::Idle));
                }
            };
            session.peer = Some(pcm.clone());
            session.state = CallState::Negotiating;
            std::mem::take(&mut session.pending_remote_candidates)
        };
        for candidate in buffered {
            // Cannot fail: no remote description exists yet, so these queue
            let _ = pcm.add_remote_candidate(candidate).await;
        }
        Ok(pcm)
    }

    /// Forward connectivity-state changes into the state machine
    ///
    /// Exits as soon as the epoch moves past this session, without
    /// waiting for another transport event.
    fn spawn_transport_pump(
        self: &Arc<Self>,
        pcm: Arc<PeerConnectionManager>,
        id: SessionId,
        epoch: u64,
    ) {
        let manager = Arc::clone(self);
        let mut states = pcm.subscribe_states();
        let mut epochs = self.epoch_tx.subscribe();
        tokio::spawn(async move {
            if *epochs.borrow_and_update() != epoch {
                return;
            }
            loop {
                tokio::select! {
                    event = states.recv() => match event {
                        Ok(state) => {
                            manager.on_transport_state(pcm.clone(), id, epoch, state).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(session_id = %id, skipped, "Transport events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = epochs.changed() => {
                        if changed.is_err() || *epochs.borrow_and_update() != epoch {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Forward locally gathered candidates to the peer over signaling
    ///
    /// Exits as soon as the epoch moves past this session, without
    /// waiting for another candidate.
    fn spawn_candidate_pump(
        self: &Arc<Self>,
        pcm: Arc<PeerConnectionManager>,
        id: SessionId,
        epoch: u64,
    ) {
        let manager = Arc::clone(self);
        let mut candidates = pcm.subscribe_local_candidates();
        let mut epochs = self.epoch_tx.subscribe();
        tokio::spawn(async move {
            if *epochs.borrow_and_update() != epoch {
                return;
            }
            loop {
                let candidate = tokio::select! {
                    event = candidates.recv() => match event {
                        Ok(candidate) => candidate,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = epochs.changed() => {
                        if changed.is_err() || *epochs.borrow_and_update() != epoch {
                            break;
                        }
                        continue;
                    }
                };
                let message = SignalingMessage::candidate(
                    id,
                    manager.channel.local_id().clone(),
                    &candidate,
                );
                if manager.channel.send(message).await.is_err() {
                    manager.finish(EndReason::SignalingLost, false).await;
                    break;
                }
            }
        });
    }

    async fn on_transport_state(
        self: &Arc<Self>,
        pcm: Arc<PeerConnectionManager>,
        id: SessionId,
        epoch: u64,
        state: TransportState,
    ) {
        match state {
            TransportState::Connected => {
                let newly_connected = {
                    let mut slot = self.session.write().await;
                    let Some(session) = slot.as_mut().filter(|s| s.id == id && s.epoch == epoch)
                    else {
                        return;
                    };
                    // Cancels any pending grace timer
                    session.transport_disconnected = false;
                    session.disconnect_gen += 1;
                    if session.state == CallState::Negotiating {
                        session.state = CallState::Connected;
                        session.connected_at = Some(Utc::now());
                        true
                    } else {
                        false
                    }
                };
                if newly_connected {
                    let tracks = pcm.remote_tracks().await;
                    {
                        let mut slot = self.session.write().await;
                        if let Some(session) =
                            slot.as_mut().filter(|s| s.id == id && s.epoch == epoch)
                        {
                            session.remote_tracks = tracks.clone();
                        }
                    }
                    tracing::info!(session_id = %id, "Call connected");
                    self.publish_state(id, CallState::Connected, None);
                    self.emit(CallEvent::RemoteTracks {
                        session_id: id,
                        tracks,
                    });
                }
            }
            TransportState::Disconnected => {
                let armed = {
                    let mut slot = self.session.write().await;
                    match slot.as_mut().filter(|s| s.id == id && s.epoch == epoch) {
                        Some(session)
                            if session.state == CallState::Connected
                                && !session.transport_disconnected =>
                        {
                            session.transport_disconnected = true;
                            session.disconnect_gen += 1;
                            Some(session.disconnect_gen)
                        }
                        _ => None,
                    }
                };
                // No state is published: a blip that recovers inside the
                // grace window is invisible to the UI.
                if let Some(generation) = armed {
                    tracing::warn!(session_id = %id, "Transport disconnected, grace period started");
                    let manager = Arc::clone(self);
                    let grace = self.config.disconnect_grace;
                    tokio::spawn(async move {
                        sleep(grace).await;
                        manager.on_grace_timeout(id, epoch, generation).await;
                    });
                }
            }
            TransportState::Failed => {
                tracing::warn!(session_id = %id, "Transport failed");
                if self.session_is_current(id, epoch).await {
                    self.finish(EndReason::ConnectionFailed, true).await;
                }
            }
            TransportState::New | TransportState::Checking | TransportState::Closed => {
                tracing::trace!(session_id = %id, state = ?state, "Transport state");
            }
        }
    }

    /// Grace window expired; end the call unless connectivity returned
    async fn on_grace_timeout(&self, id: SessionId, epoch: u64, generation: u64) {
        let still_down = {
            let slot = self.session.read().await;
            slot.as_ref().is_some_and(|s| {
                s.id == id
                    && s.epoch == epoch
                    && s.state == CallState::Connected
                    && s.transport_disconnected
                    && s.disconnect_gen == generation
            })
        };
        if still_down {
            tracing::warn!(session_id = %id, "Transport did not recover within grace period");
            self.finish(EndReason::ConnectionFailed, true).await;
        }
    }

    fn arm_ring_timer(self: &Arc<Self>, id: SessionId, epoch: u64) {
        let manager = Arc::clone(self);
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            manager.on_ring_timeout(id, epoch).await;
        });
    }

    /// Ring timeout; a no-op if the session already moved on
    async fn on_ring_timeout(&self, id: SessionId, epoch: u64) {
        let role = {
            let slot = self.session.read().await;
            slot.as_ref()
                .filter(|s| s.id == id && s.epoch == epoch && s.is_ringing())
                .map(|s| s.role)
        };
        match role {
            Some(CallRole::Caller) => {
                tracing::info!(session_id = %id, "No answer within ring timeout");
                self.finish(EndReason::NoAnswer, true).await;
            }
            Some(CallRole::Callee) => {
                // The caller already gave up; resolve silently
                tracing::info!(session_id = %id, "Incoming call expired");
                let _ = self.dismiss_incoming(false).await;
            }
            None => {}
        }
    }

    /// Drop a still-ringing incoming session back to idle
    async fn dismiss_incoming(&self, send_reject: bool) -> Result<(), CallError> {
        let id = {
            let mut slot = self.session.write().await;
            match slot.as_ref() {
                Some(s) if s.state == CallState::IncomingRinging => {
                    let id = s.id;
                    *slot = None;
                    id
                }
                other => {
                    return Err(CallError::InvalidState(
                        other.map_or(CallState::Idle, |s| s.state),
                    ))
                }
            }
        };
        self.bump_epoch();
        if send_reject {
            let message = SignalingMessage::reject(
                id,
                self.channel.local_id().clone(),
                RejectReason::Declined,
            );
            if let Err(e) = self.channel.send(message).await {
                tracing::warn!(session_id = %id, error = %e, "Could not deliver reject");
            }
        }
        // No media, no transport: nothing to release on this path
        self.publish_state(id, CallState::Idle, None);
        Ok(())
    }

    /// The single teardown path for every terminal transition
    ///
    /// Marks the session ended, bumps the epoch (cancelling timers and
    /// pumps), releases media exactly once, closes the transport, and
    /// optionally notifies the peer. Reentrant calls are no-ops.
    async fn finish(&self, reason: EndReason, send_end: bool) {
        let ended = {
            let mut slot = self.session.write().await;
            let Some(session) = slot.as_mut().filter(|s| !s.state.is_terminal()) else {
                return;
            };
            let old_state = session.state;
            session.state = CallState::Ended;
            session.reason = Some(reason);
            session.pending_remote_candidates.clear();
            session.remote_tracks.clear();
            session.transport_disconnected = false;
            tracing::debug!(
                session_id = %session.id,
                old_state = ?old_state,
                reason = ?reason,
                "Call state transition"
            );
            (session.id, session.peer.take())
        };
        let (id, peer) = ended;

        self.bump_epoch();
        let released = self.media.release().await;
        if let Some(pcm) = peer {
            pcm.close().await;
        }
        if send_end {
            let message =
                SignalingMessage::end(id, self.channel.local_id().clone(), Some(reason));
            if let Err(e) = self.channel.send(message).await {
                tracing::warn!(session_id = %id, error = %e, "Could not deliver end");
            }
        }

        tracing::info!(session_id = %id, reason = ?reason, released_media = released, "Call ended");
        self.publish_state(id, CallState::Ended, Some(reason));
    }

    async fn session_is_current(&self, id: SessionId, epoch: u64) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.id == id && s.epoch == epoch && !s.state.is_terminal())
    }

    fn publish_state(&self, id: SessionId, state: CallState, reason: Option<EndReason>) {
        self.emit(CallEvent::StateChanged {
            session_id: id,
            state,
            reason,
        });
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine; state is also queryable
        let _ = self.events.send(event);
    }
}
