//! Inbound signaling dispatch
//!
//! [`IncomingCallRouter`] owns the receive side of the signaling
//! channel: it is the only task that calls `recv`, so every inbound
//! frame has exactly one interpretation. Invites are gated on the
//! session manager being idle (busy clients auto-reject without any
//! user interaction, which is also what resolves two clients calling
//! each other at the same instant); everything else is handed to the
//! manager, which discards frames for sessions it no longer owns.

use crate::session::{CallError, CallSessionManager};
use crate::signaling::{
    MessageKind, RejectReason, SignalingChannel, SignalingError, SignalingMessage,
    SignalingTransport,
};
use std::sync::Arc;

/// Receive loop for a client's signaling channel
pub struct IncomingCallRouter<T: SignalingTransport> {
    channel: Arc<SignalingChannel<T>>,
    manager: Arc<CallSessionManager<T>>,
}

impl<T: SignalingTransport> IncomingCallRouter<T> {
    /// Create a router over the shared channel and session manager
    #[must_use]
    pub fn new(channel: Arc<SignalingChannel<T>>, manager: Arc<CallSessionManager<T>>) -> Self {
        Self { channel, manager }
    }

    /// Drive the receive loop until the channel closes
    ///
    /// Transient receive errors are logged and skipped;
    /// [`SignalingError::Closed`] ends the loop.
    pub async fn run(&self) {
        loop {
            match self.channel.recv().await {
                Ok(message) => self.dispatch(message).await,
                Err(SignalingError::Closed) => {
                    tracing::info!("Signaling channel closed, router stopping");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Signaling receive failed");
                }
            }
        }
    }

    /// Run the receive loop on its own task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn dispatch(&self, message: SignalingMessage) {
        match message.kind {
            MessageKind::Heartbeat => {
                tracing::trace!(sender = %message.sender_id, "Heartbeat");
            }
            MessageKind::Invite => self.dispatch_invite(message).await,
            _ => self.manager.handle_message(message).await,
        }
    }

    /// Surface the invite if this client can take a call, otherwise
    /// reject it as busy on the caller's behalf
    async fn dispatch_invite(&self, message: SignalingMessage) {
        if !self.manager.is_idle().await {
            tracing::info!(
                session_id = %message.session_id,
                caller = %message.sender_id,
                "Invite while busy, auto-rejecting"
            );
            self.reject_busy(&message).await;
            return;
        }
        match self.manager.handle_invite(&message).await {
            Ok(()) => {}
            // A session raced in between the idle check and the handler
            Err(CallError::Busy) => self.reject_busy(&message).await,
            Err(e) => {
                tracing::warn!(
                    session_id = %message.session_id,
                    error = %e,
                    "Dropping unusable invite"
                );
            }
        }
    }

    async fn reject_busy(&self, message: &SignalingMessage) {
        let reject = SignalingMessage::reject(
            message.session_id,
            self.channel.local_id().clone(),
            RejectReason::Busy,
        );
        if let Err(e) = self.channel.send(reject).await {
            tracing::warn!(
                session_id = %message.session_id,
                error = %e,
                "Could not deliver busy reject"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::media::{LocalTracks, MediaBackend, MediaController, MediaError};
    use crate::peer::{PeerError, PeerTransport, PeerTransportFactory, TransportState};
    use crate::types::{
        CallState, IceCandidate, MediaKind, ParticipantId, SessionDescription, SessionId,
        TrackHandle,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct NullMedia;

    #[async_trait]
    impl MediaBackend for NullMedia {
        async fn capture(&self, kind: MediaKind) -> Result<LocalTracks, MediaError> {
            Ok(LocalTracks::for_kind(kind))
        }
        async fn stop(&self, _tracks: &LocalTracks) {}
    }

    struct NullTransport {
        states: broadcast::Sender<TransportState>,
        candidates: broadcast::Sender<IceCandidate>,
    }

    #[async_trait]
    impl PeerTransport for NullTransport {
        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn set_remote_description(
            &self,
            _desc: &SessionDescription,
        ) -> Result<(), PeerError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), PeerError> {
            Ok(())
        }
        async fn close(&self) {}
        fn subscribe_states(&self) -> broadcast::Receiver<TransportState> {
            self.states.subscribe()
        }
        fn subscribe_local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
            self.candidates.subscribe()
        }
        async fn remote_tracks(&self) -> Vec<TrackHandle> {
            Vec::new()
        }
    }

    struct NullFactory;

    impl PeerTransportFactory for NullFactory {
        fn create(&self) -> Result<Arc<dyn PeerTransport>, PeerError> {
            let (states, _) = broadcast::channel(8);
            let (candidates, _) = broadcast::channel(8);
            Ok(Arc::new(NullTransport { states, candidates }))
        }
    }

    /// Replays queued inbound frames, then reports the channel closed
    struct ScriptedTransport {
        inbound: StdMutex<VecDeque<SignalingMessage>>,
        sent: StdMutex<Vec<SignalingMessage>>,
    }

    impl ScriptedTransport {
        fn new(frames: Vec<SignalingMessage>) -> Self {
            Self {
                inbound: StdMutex::new(frames.into()),
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for ScriptedTransport {
        async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn recv(&self) -> Result<SignalingMessage, SignalingError> {
            self.inbound
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(SignalingError::Closed)
        }
    }

    fn inbound(mut message: SignalingMessage, seq: u64) -> SignalingMessage {
        message.seq = seq;
        message
    }

    fn setup(
        frames: Vec<SignalingMessage>,
    ) -> (
        Arc<ScriptedTransport>,
        Arc<CallSessionManager<ScriptedTransport>>,
        IncomingCallRouter<ScriptedTransport>,
    ) {
        let transport = Arc::new(ScriptedTransport::new(frames));
        let channel = Arc::new(SignalingChannel::new(
            transport.clone(),
            ParticipantId::new("dr-lopez"),
            1,
            Duration::from_millis(1),
        ));
        let manager = Arc::new(CallSessionManager::new(
            channel.clone(),
            Arc::new(MediaController::new(Arc::new(NullMedia))),
            Arc::new(NullFactory),
            CallConfig::default(),
        ));
        let router = IncomingCallRouter::new(channel, manager.clone());
        (transport, manager, router)
    }

    #[tokio::test]
    async fn invite_while_idle_starts_ringing() {
        let session = SessionId::new();
        let invite = inbound(
            SignalingMessage::invite(session, ParticipantId::new("pt-garcia"), MediaKind::Video),
            1,
        );
        let (transport, manager, router) = setup(vec![invite]);

        router.run().await;

        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CallState::IncomingRinging);
        assert_eq!(snapshot.session_id, session);
        assert_eq!(snapshot.remote, ParticipantId::new("pt-garcia"));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invite_while_busy_is_auto_rejected() {
        let other = SessionId::new();
        let invite = inbound(
            SignalingMessage::invite(other, ParticipantId::new("pt-nguyen"), MediaKind::Audio),
            1,
        );
        let (transport, manager, router) = setup(vec![invite]);

        manager
            .start_call(ParticipantId::new("pt-garcia"), MediaKind::Audio)
            .await
            .unwrap();
        router.run().await;

        // The live call is untouched
        assert_eq!(manager.state().await, CallState::OutgoingRinging);

        let sent = transport.sent.lock().unwrap();
        let reject = sent
            .iter()
            .find(|m| m.kind == MessageKind::Reject)
            .unwrap();
        assert_eq!(reject.session_id, other);
        let payload: crate::signaling::RejectPayload = reject.payload_as().unwrap();
        assert_eq!(payload.reason, RejectReason::Busy);
    }

    #[tokio::test]
    async fn heartbeats_and_malformed_invites_are_dropped() {
        let session = SessionId::new();
        let mut heartbeat = SignalingMessage::accept(session, ParticipantId::new("relay"));
        heartbeat.kind = MessageKind::Heartbeat;
        // An invite without its payload cannot be surfaced
        let mut bare_invite = SignalingMessage::accept(session, ParticipantId::new("pt-garcia"));
        bare_invite.kind = MessageKind::Invite;
        let (transport, manager, router) =
            setup(vec![inbound(heartbeat, 1), inbound(bare_invite, 2)]);

        router.run().await;

        assert_eq!(manager.state().await, CallState::Idle);
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
