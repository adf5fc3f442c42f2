//! Session manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable parameters for call setup and supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long an invite may ring before the attempt is abandoned
    pub ring_timeout: Duration,
    /// How long a connected transport may stay `Disconnected` before the
    /// call is declared dropped
    pub disconnect_grace: Duration,
    /// Send attempts per signaling message before the channel is
    /// considered lost
    pub signaling_retry_attempts: u32,
    /// Delay between signaling send attempts
    pub signaling_retry_delay: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            disconnect_grace: Duration::from_secs(8),
            signaling_retry_attempts: 3,
            signaling_retry_delay: Duration::from_millis(250),
            event_capacity: 100,
        }
    }
}
