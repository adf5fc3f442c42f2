//! Local media ownership
//!
//! The [`MediaController`] is the single owner of the client's camera
//! and microphone for the lifetime of one call session. Acquisition is
//! the only operation in the subsystem that may prompt the user, so it
//! is slow, fallible and cancellable; release is idempotent and runs on
//! every exit path so hardware handles can never leak between sessions.

use crate::types::{MediaKind, TrackHandle, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Media acquisition errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// The user denied the capture permission prompt
    #[error("Capture permission denied")]
    PermissionDenied,

    /// No usable capture device
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Tracks captured for the local participant
#[derive(Debug, Clone)]
pub struct LocalTracks {
    /// Microphone track, always present
    pub audio: TrackHandle,
    /// Camera track, present for video calls
    pub video: Option<TrackHandle>,
}

impl LocalTracks {
    /// Build a fresh set of handles for the given call kind
    #[must_use]
    pub fn for_kind(kind: MediaKind) -> Self {
        Self {
            audio: TrackHandle::new(TrackKind::Audio),
            video: kind
                .has_video()
                .then(|| TrackHandle::new(TrackKind::Video)),
        }
    }

    /// All handles as a flat list
    #[must_use]
    pub fn handles(&self) -> Vec<TrackHandle> {
        let mut handles = vec![self.audio];
        if let Some(video) = self.video {
            handles.push(video);
        }
        handles
    }
}

/// Capture backend abstraction
///
/// Implemented by the browser/runtime media API in production and by an
/// in-memory fake in tests.
#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    /// Open the capture devices for the given call kind
    ///
    /// May prompt the user and therefore suspend for a long time.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] or
    /// [`MediaError::DeviceUnavailable`].
    async fn capture(&self, kind: MediaKind) -> Result<LocalTracks, MediaError>;

    /// Stop and detach previously captured tracks
    async fn stop(&self, tracks: &LocalTracks);
}

/// Exclusive owner of local microphone and camera tracks
pub struct MediaController {
    backend: Arc<dyn MediaBackend>,
    tracks: RwLock<Option<LocalTracks>>,
}

impl MediaController {
    /// Create a controller over the given capture backend
    #[must_use]
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            tracks: RwLock::new(None),
        }
    }

    /// Acquire capture devices for a call
    ///
    /// Holds the device lock across the (potentially slow) capture so a
    /// concurrent session can never grab hardware that is still owned.
    ///
    /// # Errors
    ///
    /// Fails with [`MediaError::DeviceUnavailable`] if tracks from a
    /// previous session were not released yet, or with the backend's
    /// error if the prompt is denied or no device exists.
    pub async fn acquire(&self, kind: MediaKind) -> Result<LocalTracks, MediaError> {
        let mut slot = self.tracks.write().await;
        if slot.is_some() {
            return Err(MediaError::DeviceUnavailable(
                "capture devices still held by a previous session".to_string(),
            ));
        }

        let tracks = self.backend.capture(kind).await?;
        tracing::debug!(kind = ?kind, tracks = tracks.handles().len(), "Local media acquired");
        *slot = Some(tracks.clone());
        Ok(tracks)
    }

    /// Toggle the microphone track without reacquiring hardware
    ///
    /// Returns the new enabled value, or `None` if no audio track is held.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Option<bool> {
        let mut slot = self.tracks.write().await;
        let tracks = slot.as_mut()?;
        tracks.audio.enabled = enabled;
        Some(enabled)
    }

    /// Toggle the camera track without reacquiring hardware
    ///
    /// Returns the new enabled value, or `None` if no video track is held.
    pub async fn set_video_enabled(&self, enabled: bool) -> Option<bool> {
        let mut slot = self.tracks.write().await;
        let video = slot.as_mut()?.video.as_mut()?;
        video.enabled = enabled;
        Some(enabled)
    }

    /// Stop and detach all held tracks
    ///
    /// Idempotent: calling it with nothing held is a no-op. Returns
    /// whether tracks were actually released.
    pub async fn release(&self) -> bool {
        let taken = self.tracks.write().await.take();
        match taken {
            Some(tracks) => {
                self.backend.stop(&tracks).await;
                tracing::debug!(tracks = tracks.handles().len(), "Local media released");
                true
            }
            None => false,
        }
    }

    /// Whether capture devices are currently held
    pub async fn is_acquired(&self) -> bool {
        self.tracks.read().await.is_some()
    }

    /// Current local track handles, for the UI layer
    pub async fn local_tracks(&self) -> Option<Vec<TrackHandle>> {
        self.tracks.read().await.as_ref().map(LocalTracks::handles)
    }
}
