//! Yomiage core
//!
//! Platform-agnostic core of a text-to-speech voice bot: messages posted in a
//! text channel are synthesized and streamed into the voice channel the bot
//! was invited to. It includes:
//!
//! - Voice session state machine (join, leave, speak, speed, auto-leave)
//! - Speech request building with per-message language detection
//! - Transcode pipeline with progress sampling and cancellation
//! - Command routing for chat messages
//! - Collaborator traits implemented by platform adaptors, plus test doubles
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use yomiage_core::testing::{FakeEncoder, FakePlatform};
//! use yomiage_core::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Arc::new(VoiceSession::new(
//!         Arc::new(FakePlatform::new()),
//!         Arc::new(FakeEncoder::new()),
//!         SessionConfig::default(),
//!     )?);
//!     let router = CommandRouter::new(session, CommandPrefix::parse("yomi"));
//!     let _ = router;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use uuid::Uuid;

pub mod config;
pub mod error;
pub mod platform;
pub mod presence;
pub mod router;
pub mod session;
pub mod speech;
pub mod testing;
pub mod transcode;
pub mod utils;

pub use config::{
    get_env_float, get_env_int, get_env_or, get_required_env, load_env, BotConfig,
    MENTION_PREFIX,
};
pub use error::{Result, YomiageError};
pub use platform::{
    ChatPlatform, InboundMessage, StreamFault, StreamResult, VoiceConnection, VoiceLocation,
    VoiceOccupant, VoiceStream,
};
pub use presence::PresenceMonitor;
pub use router::{Command, CommandPrefix, CommandRouter};
pub use session::{
    parse_speed, validate_speed, SessionConfig, SessionStatus, SpeakOutcome, VoiceSession,
    JOINED_MESSAGE, LEFT_MESSAGE, MAX_SPEED, MIN_SPEED, SKIPPED_MESSAGE,
};
pub use speech::{SpeechConfig, SpeechRequest, SpeechRequestBuilder};
pub use transcode::{
    EncodeOptions, EncodeSession, EncodedAudio, Encoder, JobHandle, JobState, PipelineConfig,
    PlaybackJob, PlaybackProgress, TranscodePipeline, TranscodeStats,
};
pub use utils::{init_logging, init_logging_with_level};
