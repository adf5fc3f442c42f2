//! Core call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call attempt
///
/// Generated by the caller and echoed by the callee, so both sides of a
/// call share the same id for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, verified user identifier supplied by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the call this client is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// This client initiated the call
    Caller,
    /// This client was invited
    Callee,
}

/// Media requested for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone only
    Audio,
    /// Microphone and camera
    Video,
}

impl MediaKind {
    /// Check whether this kind includes a camera track
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Call session state
///
/// `Ended` is terminal for one session; a new call constructs a fresh
/// session with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No live session
    Idle,
    /// Invite sent, waiting for the callee to pick up
    OutgoingRinging,
    /// Invite received, waiting for the local user to pick up
    IncomingRinging,
    /// Capabilities and candidates being exchanged
    Negotiating,
    /// Media is flowing
    Connected,
    /// Session is over
    Ended,
}

impl CallState {
    /// Whether this state can still transition somewhere else
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Why a session reached `Ended`
///
/// Distinct reasons let the UI offer different follow-ups: "retry" for
/// `SignalingLost`, nothing for a plain hang-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up or cancelled
    HungUp,
    /// Remote side sent `end`
    RemoteHungUp,
    /// Callee declined the invite
    Rejected,
    /// Peer was already in a call
    Busy,
    /// Ring timeout expired with no answer
    NoAnswer,
    /// Transport failed and did not recover within the grace period
    ConnectionFailed,
    /// Signaling channel stayed unreachable through all retries
    SignalingLost,
    /// User denied the camera/microphone permission prompt
    MediaDenied,
    /// No usable capture device
    MediaUnavailable,
}

/// Unique identifier for a media track handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub Uuid);

impl TrackId {
    /// Create a new random track ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a single media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone / speaker audio
    Audio,
    /// Camera video
    Video,
}

/// Opaque handle to a live media track
///
/// The hardware itself is owned by the media controller (local tracks)
/// or the peer transport (remote tracks); consumers only ever hold
/// clones of this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackHandle {
    /// Track identifier
    pub id: TrackId,
    /// Audio or video
    pub kind: TrackKind,
    /// Whether the track is currently producing media
    pub enabled: bool,
}

impl TrackHandle {
    /// Create an enabled handle of the given kind
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: TrackId::new(),
            kind,
            enabled: true,
        }
    }
}

/// A session description exchanged as `offer`/`answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Direction of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Caller side of the exchange
    Offer,
    /// Callee side of the exchange
    Answer,
}

/// A discovered network path offered during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Read-only view of the current session published to UI consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    /// Session identifier
    pub session_id: SessionId,
    /// The other participant
    pub remote: ParticipantId,
    /// Caller or callee
    pub role: CallRole,
    /// Audio or video call
    pub kind: MediaKind,
    /// Current state
    pub state: CallState,
    /// Terminal reason, once `Ended`
    pub reason: Option<EndReason>,
    /// When negotiation began
    pub started_at: DateTime<Utc>,
    /// When media first flowed
    pub connected_at: Option<DateTime<Utc>>,
    /// Microphone presentation flag
    pub audio_enabled: bool,
    /// Camera presentation flag
    pub video_enabled: bool,
}

/// Notifications published by the session manager
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An invite arrived while idle and awaits a user decision
    IncomingInvite {
        /// Session identifier (caller-generated)
        session_id: SessionId,
        /// Who is calling
        caller: ParticipantId,
        /// Requested media
        kind: MediaKind,
    },
    /// The session moved to a new state
    StateChanged {
        /// Session identifier
        session_id: SessionId,
        /// New state
        state: CallState,
        /// Terminal reason when `state == Ended`
        reason: Option<EndReason>,
    },
    /// Remote tracks became available for playback
    ///
    /// Only ever published after the session reached `Connected`.
    RemoteTracks {
        /// Session identifier
        session_id: SessionId,
        /// Playback handles
        tracks: Vec<TrackHandle>,
    },
}
