//! Call signaling protocol and channel
//!
//! Carries the out-of-band messages (invite, accept, offer, answer,
//! candidates, end) that bootstrap a direct media connection. The relay
//! behind [`SignalingTransport`] guarantees at-least-once delivery but
//! not ordering; duplicates are filtered here, ordering tolerance lives
//! in the candidate buffers.

use crate::types::{EndReason, IceCandidate, MediaKind, ParticipantId, SessionDescription, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Underlying transport failed to deliver or receive
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport is gone and will not produce further messages
    #[error("Signaling channel closed")]
    Closed,

    /// All send attempts were exhausted
    #[error("Signaling channel lost after {attempts} attempts")]
    ChannelLost {
        /// How many sends were tried
        attempts: u32,
    },

    /// A message payload was missing or malformed
    #[error("Invalid payload for {kind:?} message")]
    InvalidPayload {
        /// Message type whose payload failed to decode
        kind: MessageKind,
    },
}

/// Signaling message types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Start a call attempt
    Invite,
    /// Callee picked up
    Accept,
    /// Callee declined (or auto-rejected as busy)
    Reject,
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Discovered network path
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    /// Terminate the session
    End,
    /// Channel liveness probe
    Heartbeat,
}

/// One signaling frame (JSON object on the wire)
///
/// Field names follow the relay's JSON contract: camelCase keys, a
/// kebab-case `type` tag, `payload` is an object or null, `sentAt` is
/// ISO-8601. `seq` is assigned once by the sending channel and reused
/// verbatim on retries so the receiver can drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Message type
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Session this message belongs to
    pub session_id: SessionId,
    /// Verified id of the sender
    pub sender_id: ParticipantId,
    /// Sender-assigned sequence identifier
    #[serde(default)]
    pub seq: u64,
    /// Type-specific body
    pub payload: Option<serde_json::Value>,
    /// When the sender produced this frame
    pub sent_at: DateTime<Utc>,
}

/// Body of an `invite` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    /// Requested media for the call
    pub kind: MediaKind,
}

/// Body of a `reject` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPayload {
    /// Why the invite was declined
    pub reason: RejectReason,
}

/// Why an invite was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    /// The callee was already in a call
    Busy,
    /// The callee pressed decline
    Declined,
}

/// Body of an `end` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndPayload {
    /// Why the sender ended the session, in its wire spelling
    pub reason: Option<EndReason>,
}

impl SignalingMessage {
    fn new(
        kind: MessageKind,
        session_id: SessionId,
        sender_id: ParticipantId,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            session_id,
            sender_id,
            seq: 0,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Build an `invite` frame
    #[must_use]
    pub fn invite(session_id: SessionId, sender_id: ParticipantId, kind: MediaKind) -> Self {
        let payload = serde_json::to_value(InvitePayload { kind }).ok();
        Self::new(MessageKind::Invite, session_id, sender_id, payload)
    }

    /// Build an `accept` frame
    #[must_use]
    pub fn accept(session_id: SessionId, sender_id: ParticipantId) -> Self {
        Self::new(MessageKind::Accept, session_id, sender_id, None)
    }

    /// Build a `reject` frame
    #[must_use]
    pub fn reject(session_id: SessionId, sender_id: ParticipantId, reason: RejectReason) -> Self {
        let payload = serde_json::to_value(RejectPayload { reason }).ok();
        Self::new(MessageKind::Reject, session_id, sender_id, payload)
    }

    /// Build an `offer` or `answer` frame from a session description
    #[must_use]
    pub fn description(
        session_id: SessionId,
        sender_id: ParticipantId,
        desc: &SessionDescription,
    ) -> Self {
        let kind = match desc.kind {
            crate::types::SdpKind::Offer => MessageKind::Offer,
            crate::types::SdpKind::Answer => MessageKind::Answer,
        };
        let payload = serde_json::to_value(desc).ok();
        Self::new(kind, session_id, sender_id, payload)
    }

    /// Build an `ice-candidate` frame
    #[must_use]
    pub fn candidate(
        session_id: SessionId,
        sender_id: ParticipantId,
        candidate: &IceCandidate,
    ) -> Self {
        let payload = serde_json::to_value(candidate).ok();
        Self::new(MessageKind::IceCandidate, session_id, sender_id, payload)
    }

    /// Build an `end` frame
    #[must_use]
    pub fn end(session_id: SessionId, sender_id: ParticipantId, reason: Option<EndReason>) -> Self {
        let payload = serde_json::to_value(EndPayload { reason }).ok();
        Self::new(MessageKind::End, session_id, sender_id, payload)
    }

    /// Decode the payload as the given type
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidPayload`] if the payload is
    /// missing or does not match `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, SignalingError> {
        self.payload
            .clone()
            .ok_or(SignalingError::InvalidPayload { kind: self.kind })
            .and_then(|value| {
                serde_json::from_value(value)
                    .map_err(|_| SignalingError::InvalidPayload { kind: self.kind })
            })
    }
}

/// Bidirectional signaling transport
///
/// Implement this for the concrete relay connection (websocket, in-memory
/// pair in tests). The transport is shared across all of a client's
/// sessions; demultiplexing by session id happens above it.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Deliver one frame to the relay
    async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError>;

    /// Wait for the next inbound frame
    async fn recv(&self) -> Result<SignalingMessage, SignalingError>;
}

/// Duplicate frames remembered per channel
const DEDUP_WINDOW: usize = 128;

/// Persistent signaling channel with retry, sequencing and dedup
///
/// `send` assigns each outgoing frame a sequence id once and retries the
/// identical frame a bounded number of times; `recv` drops frames whose
/// `(sender, seq)` pair was already seen, taming the relay's
/// at-least-once delivery.
pub struct SignalingChannel<T: SignalingTransport> {
    transport: Arc<T>,
    local_id: ParticipantId,
    next_seq: AtomicU64,
    retry_attempts: u32,
    retry_delay: Duration,
    seen: Mutex<DedupWindow>,
}

struct DedupWindow {
    order: VecDeque<(ParticipantId, u64)>,
    set: HashSet<(ParticipantId, u64)>,
}

impl DedupWindow {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(DEDUP_WINDOW),
            set: HashSet::with_capacity(DEDUP_WINDOW),
        }
    }

    /// Returns true if the key was already present
    fn check_and_insert(&mut self, key: (ParticipantId, u64)) -> bool {
        if self.set.contains(&key) {
            return true;
        }
        if self.order.len() == DEDUP_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        false
    }
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create a channel over the given transport
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        local_id: ParticipantId,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            local_id,
            next_seq: AtomicU64::new(1),
            retry_attempts: retry_attempts.max(1),
            retry_delay,
            seen: Mutex::new(DedupWindow::new()),
        }
    }

    /// The local participant this channel sends as
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Send a frame, retrying on transport failure
    ///
    /// The sequence id is assigned exactly once; retries resend the same
    /// frame so the receiving side can deduplicate.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::ChannelLost`] once all attempts fail.
    pub async fn send(&self, mut message: SignalingMessage) -> Result<(), SignalingError> {
        message.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=self.retry_attempts {
            match self.transport.send(&message).await {
                Ok(()) => {
                    tracing::trace!(
                        session_id = %message.session_id,
                        kind = ?message.kind,
                        seq = message.seq,
                        "Signaling message sent"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %message.session_id,
                        kind = ?message.kind,
                        seq = message.seq,
                        attempt,
                        error = %e,
                        "Signaling send failed"
                    );
                    if attempt < self.retry_attempts {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(SignalingError::ChannelLost {
            attempts: self.retry_attempts,
        })
    }

    /// Receive the next non-duplicate frame
    ///
    /// # Errors
    ///
    /// Propagates transport errors; [`SignalingError::Closed`] means no
    /// further messages will arrive.
    pub async fn recv(&self) -> Result<SignalingMessage, SignalingError> {
        loop {
            let message = self.transport.recv().await?;
            let key = (message.sender_id.clone(), message.seq);
            let duplicate = self.seen.lock().await.check_and_insert(key);
            if duplicate {
                tracing::trace!(
                    session_id = %message.session_id,
                    sender = %message.sender_id,
                    seq = message.seq,
                    "Dropping duplicate signaling message"
                );
                continue;
            }
            tracing::trace!(
                session_id = %message.session_id,
                kind = ?message.kind,
                sender = %message.sender_id,
                "Signaling message received"
            );
            return Ok(message);
        }
    }
}
