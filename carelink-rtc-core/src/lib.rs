//! Real-time call session management for CareLink consultations
//!
//! This crate owns the client-side lifetime of a doctor–patient call:
//! signaling over the relay, local camera/microphone ownership, the
//! peer-to-peer transport and the call state machine that ties them
//! together. Platform concerns (the actual relay socket, the ICE
//! runtime, the capture API) plug in behind traits.
//!
//! # Architecture
//!
//! - [`signaling`]: wire protocol, retrying/deduplicating channel
//! - [`media`]: exclusive owner of local capture tracks
//! - [`peer`]: per-session transport with candidate buffering
//! - [`session`]: the call state machine
//! - [`router`]: sole consumer of inbound signaling frames
//!
//! # Example
//!
//! ```no_run
//! use carelink_rtc_core::prelude::*;
//! use std::sync::Arc;
//!
//! # use carelink_rtc_core::{LocalTracks, SignalingMessage};
//! # use async_trait::async_trait;
//! # struct MyRelay;
//! # #[async_trait]
//! # impl SignalingTransport for MyRelay {
//! #     async fn send(&self, _m: &SignalingMessage) -> Result<(), SignalingError> { Ok(()) }
//! #     async fn recv(&self) -> Result<SignalingMessage, SignalingError> { Err(SignalingError::Closed) }
//! # }
//! # struct MyMedia;
//! # #[async_trait]
//! # impl MediaBackend for MyMedia {
//! #     async fn capture(&self, kind: MediaKind) -> Result<LocalTracks, MediaError> { Ok(LocalTracks::for_kind(kind)) }
//! #     async fn stop(&self, _t: &LocalTracks) {}
//! # }
//! # struct MyIce;
//! # impl PeerTransportFactory for MyIce {
//! #     fn create(&self) -> Result<Arc<dyn PeerTransport>, PeerError> { Err(PeerError::Closed) }
//! # }
//! # async fn run() -> Result<(), CallError> {
//! let config = CallConfig::default();
//! let channel = Arc::new(SignalingChannel::new(
//!     Arc::new(MyRelay),
//!     ParticipantId::new("dr-lopez"),
//!     config.signaling_retry_attempts,
//!     config.signaling_retry_delay,
//! ));
//! let media = Arc::new(MediaController::new(Arc::new(MyMedia)));
//! let manager = Arc::new(CallSessionManager::new(
//!     channel.clone(),
//!     media,
//!     Arc::new(MyIce),
//!     config,
//! ));
//!
//! IncomingCallRouter::new(channel, manager.clone()).spawn();
//!
//! let mut events = manager.subscribe_events();
//! let session = manager
//!     .start_call(ParticipantId::new("pt-garcia"), MediaKind::Video)
//!     .await?;
//! # let _ = (events.recv().await, session);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod media;
pub mod peer;
pub mod router;
pub mod session;
pub mod signaling;
pub mod types;

pub use config::CallConfig;
pub use media::{LocalTracks, MediaBackend, MediaController, MediaError};
pub use peer::{
    PeerConnectionManager, PeerError, PeerTransport, PeerTransportFactory, TransportState,
};
pub use router::IncomingCallRouter;
pub use session::{CallError, CallSessionManager};
pub use signaling::{
    EndPayload, InvitePayload, MessageKind, RejectPayload, RejectReason, SignalingChannel,
    SignalingError, SignalingMessage, SignalingTransport,
};
pub use types::{
    CallEvent, CallRole, CallSnapshot, CallState, EndReason, IceCandidate, MediaKind,
    ParticipantId, SdpKind, SessionDescription, SessionId, TrackHandle, TrackId, TrackKind,
};

/// Commonly used types for building on this crate
pub mod prelude {
    pub use crate::config::CallConfig;
    pub use crate::media::{MediaBackend, MediaController, MediaError};
    pub use crate::peer::{PeerError, PeerTransport, PeerTransportFactory};
    pub use crate::router::IncomingCallRouter;
    pub use crate::session::{CallError, CallSessionManager};
    pub use crate::signaling::{SignalingChannel, SignalingError, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallRole, CallSnapshot, CallState, EndReason, MediaKind, ParticipantId,
        SessionId,
    };
}
