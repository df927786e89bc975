//! Error types for the yomiage core
//!
//! The `Display` text of every variant is what the command router sends back
//! to the originating text channel, so keep it short and user-facing.

use thiserror::Error;

/// Main error type for session, pipeline and routing operations
#[derive(Debug, Error)]
pub enum YomiageError {
    /// `join` while a voice connection already exists
    #[error("Bot is already in voice-chat.")]
    AlreadyConnected,

    /// Operation needs a voice connection but the session is idle
    #[error("Bot is not in voice-chat.")]
    NotConnected,

    /// Requesting user is not in any voice channel the bot can see
    #[error("could not find user's voice state")]
    UserNotInVoice,

    /// Speed outside the accepted range or not finite
    #[error("Speed must be between {min} and {max}.")]
    SpeedOutOfRange {
        /// Lower bound (inclusive)
        min: f64,
        /// Upper bound (inclusive)
        max: f64,
    },

    /// Speed argument could not be parsed as a number
    #[error("Speed must be a number.")]
    NonNumericSpeed(String),

    /// The encoder could not be started (bad source, missing binary, ...)
    #[error("Failed to start transcoding: {0}")]
    EncodeStart(String),

    /// The voice stream terminated with something other than end-of-stream
    #[error("Voice stream error: {0}")]
    Stream(String),

    /// The platform refused or failed the voice join
    #[error("Failed to join voice channel: {0}")]
    VoiceJoin(String),

    /// Tearing down the voice connection failed
    #[error("Failed to leave voice channel: {0}")]
    VoiceDisconnect(String),

    /// Sending a chat message failed
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenient Result type using YomiageError
pub type Result<T> = std::result::Result<T, YomiageError>;

impl YomiageError {
    /// Create an encode start error
    pub fn encode_start(msg: impl Into<String>) -> Self {
        YomiageError::EncodeStart(msg.into())
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        YomiageError::Stream(msg.into())
    }

    /// Create a voice join error
    pub fn voice_join(msg: impl Into<String>) -> Self {
        YomiageError::VoiceJoin(msg.into())
    }

    /// Create a voice disconnect error
    pub fn voice_disconnect(msg: impl Into<String>) -> Self {
        YomiageError::VoiceDisconnect(msg.into())
    }

    /// Create a messaging error
    pub fn messaging(msg: impl Into<String>) -> Self {
        YomiageError::Messaging(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        YomiageError::Config(msg.into())
    }

    /// Whether the error comes from a user mistake rather than a platform or
    /// pipeline failure. Used to pick the log level at the router boundary.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            YomiageError::AlreadyConnected
                | YomiageError::NotConnected
                | YomiageError::UserNotInVoice
                | YomiageError::SpeedOutOfRange { .. }
                | YomiageError::NonNumericSpeed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_user_facing() {
        assert_eq!(
            YomiageError::AlreadyConnected.to_string(),
            "Bot is already in voice-chat."
        );
        let err = YomiageError::SpeedOutOfRange { min: 0.5, max: 100.0 };
        assert_eq!(err.to_string(), "Speed must be between 0.5 and 100.");
    }

    #[test]
    fn test_user_error_classification() {
        assert!(YomiageError::NonNumericSpeed("abc".into()).is_user_error());
        assert!(YomiageError::UserNotInVoice.is_user_error());
        assert!(!YomiageError::stream("broken pipe").is_user_error());
        assert!(!YomiageError::voice_disconnect("gone").is_user_error());
    }
}
