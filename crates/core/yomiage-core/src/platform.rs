//! Messaging platform collaborator interfaces
//!
//! The session core never talks to a gateway directly. Adaptors implement
//! these traits; tests use the fakes in [`crate::testing`].

use crate::transcode::EncodedAudio;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Where a user currently sits in voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceLocation {
    /// Guild the voice channel belongs to
    pub guild_id: u64,
    /// Voice channel ID
    pub channel_id: u64,
}

/// One entry of the occupancy enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceOccupant {
    /// Guild ID
    pub guild_id: u64,
    /// Voice channel ID
    pub channel_id: u64,
    /// User in that channel
    pub user_id: u64,
}

/// An inbound chat message, already stripped of platform types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel the message was posted in
    pub channel_id: u64,
    /// Author of the message
    pub author_id: u64,
    /// Whether the author is a bot account
    pub author_is_bot: bool,
    /// Raw message content
    pub content: String,
}

/// Why a voice stream stopped without a clean completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// The source ran dry; treated as a successful completion
    EndOfStream,
    /// Anything else
    Failed(String),
}

/// Terminal value sent on a stream's completion channel
pub type StreamResult = std::result::Result<(), StreamFault>;

/// Messaging platform client
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post `text` to a text channel
    async fn send_message(&self, channel_id: u64, text: &str) -> Result<()>;

    /// Find the voice channel `user_id` is currently in, across all guilds
    async fn lookup_user_voice_channel(&self, user_id: u64) -> Option<VoiceLocation>;

    /// Connect to a voice channel
    async fn join_voice_channel(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceConnection>>;

    /// Every known voice occupant in every guild visible to the bot
    fn voice_occupants(&self) -> Vec<VoiceOccupant>;
}

/// A live voice-channel connection
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Guild of the connected channel
    fn guild_id(&self) -> u64;

    /// Connected voice channel
    fn channel_id(&self) -> u64;

    /// Whether the transport handshake has completed
    async fn is_ready(&self) -> bool;

    /// Toggle the speaking indicator
    async fn set_speaking(&self, speaking: bool) -> Result<()>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<()>;

    /// Start sending `audio` into the channel
    ///
    /// The connection reports the terminal status on `done` exactly once.
    async fn stream(
        &self,
        audio: EncodedAudio,
        done: oneshot::Sender<StreamResult>,
    ) -> Result<Box<dyn VoiceStream>>;
}

/// Handle on an in-flight voice stream
#[async_trait]
pub trait VoiceStream: Send + Sync {
    /// How much audio has been sent so far
    async fn playback_position(&self) -> Duration;

    /// Stop sending immediately
    fn stop(&self);
}
