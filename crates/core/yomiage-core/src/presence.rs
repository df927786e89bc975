//! Presence monitor
//!
//! Invoked after every voice-state change, once the platform's voice-state
//! view has been updated, so the session can leave a channel it is alone in.

use crate::session::VoiceSession;
use std::sync::Arc;
use tracing::{debug, warn};

/// Auto-leave trigger for a [`VoiceSession`]
#[derive(Clone)]
pub struct PresenceMonitor {
    session: Arc<VoiceSession>,
}

impl PresenceMonitor {
    /// Watch `session`
    pub fn new(session: Arc<VoiceSession>) -> Self {
        Self { session }
    }

    /// React to a voice occupancy change; returns whether the session left
    pub async fn on_occupancy_changed(&self) -> bool {
        match self.session.check_auto_leave().await {
            Ok(left) => {
                if left {
                    debug!("Auto-leave completed");
                }
                left
            }
            Err(e) => {
                warn!(error = %e, "Auto-leave check failed");
                false
            }
        }
    }
}
