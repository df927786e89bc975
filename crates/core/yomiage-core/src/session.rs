//! Voice session state machine
//!
//! One session tracks one voice connection: `Idle` (no connection),
//! `Connected` (connection, nothing playing) and `Playing` (connection plus one
//! active [`PlaybackJob`]).
//!
//! Two locks are involved. `state` guards the connection handle and the
//! authoritative text channel and is only held briefly, so join, leave and
//! the auto-leave check stay responsive. `playback_guard` is held for the
//! whole of a speak call, which queues concurrent speech in arrival order.
//! Leave never takes `playback_guard`; it cancels the active job through its
//! [`JobHandle`] instead.
//!
//! [`PlaybackJob`]: crate::transcode::PlaybackJob

use crate::platform::{ChatPlatform, InboundMessage, VoiceConnection};
use crate::speech::{SpeechConfig, SpeechRequestBuilder};
use crate::transcode::{Encoder, JobHandle, JobState, PipelineConfig, TranscodePipeline};
use crate::{Result, YomiageError};
use parking_lot::Mutex;
use regex::RegexSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Slowest accepted speech speed
pub const MIN_SPEED: f64 = 0.5;
/// Fastest accepted speech speed
pub const MAX_SPEED: f64 = 100.0;

/// Reply after a successful join
pub const JOINED_MESSAGE: &str = "Joined to voice chat!";
/// Reply after leaving, manual or automatic
pub const LEFT_MESSAGE: &str = "Left from voice chat...";
/// Reply when a message is not read because it matched an ignore pattern
pub const SKIPPED_MESSAGE: &str = "Skipped reading aloud.";

/// Session behaviour settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages starting with this marker are never read
    pub ignore_prefix: String,
    /// Messages matching any of these regexes are skipped with a notice
    pub ignore_patterns: Vec<String>,
    /// Speed used until someone changes it
    pub default_speed: f64,
    /// Synthesis endpoint settings
    pub speech: SpeechConfig,
    /// Encoder and send loop settings
    pub pipeline: PipelineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ignore_prefix: ";".to_string(),
            // custom emoji, user/role mentions, channel references and links
            ignore_patterns: vec![
                "<a:".to_string(),
                "<:".to_string(),
                "<@".to_string(),
                "<#".to_string(),
                "<@&".to_string(),
                "http".to_string(),
            ],
            default_speed: 1.0,
            speech: SpeechConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Check everything that would otherwise fail at the first message
    pub fn validate(&self) -> Result<()> {
        validate_speed(self.default_speed)?;
        RegexSet::new(&self.ignore_patterns)
            .map_err(|e| YomiageError::config(format!("invalid ignore pattern: {}", e)))?;
        SpeechRequestBuilder::new(self.speech.clone())?;
        self.pipeline.validate()
    }
}

/// Coarse session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No voice connection
    Idle,
    /// Voice connection, nothing playing
    Connected,
    /// Voice connection with an active playback
    Playing,
}

/// What a speak request turned into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Silently dropped (bot author, wrong channel, not connected, ignore marker)
    Ignored,
    /// Matched an ignore pattern; a notice was sent instead
    Skipped,
    /// A playback job ran to the given terminal state
    Played(JobState),
}

/// Parse a speed argument without range checking
pub fn parse_speed(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| YomiageError::NonNumericSpeed(raw.to_string()))
}

/// Check that `speed` is finite and within [`MIN_SPEED`, `MAX_SPEED`]
pub fn validate_speed(speed: f64) -> Result<f64> {
    if speed.is_finite() && (MIN_SPEED..=MAX_SPEED).contains(&speed) {
        Ok(speed)
    } else {
        Err(YomiageError::SpeedOutOfRange {
            min: MIN_SPEED,
            max: MAX_SPEED,
        })
    }
}

#[derive(Default)]
struct SessionState {
    connection: Option<Arc<dyn VoiceConnection>>,
    text_channel_id: Option<u64>,
    // bumped on every join so a stale check never tears down a newer connection
    generation: u64,
}

struct Departure {
    text_channel_id: Option<u64>,
    disconnect: Result<()>,
}

/// The voice session shared by every event handler
pub struct VoiceSession {
    platform: Arc<dyn ChatPlatform>,
    pipeline: TranscodePipeline,
    speech: SpeechRequestBuilder,
    ignore_prefix: String,
    ignore_patterns: RegexSet,
    state: AsyncMutex<SessionState>,
    speed: Mutex<f64>,
    playback_guard: AsyncMutex<()>,
    active_job: Mutex<Option<JobHandle>>,
    bot_user_id: OnceLock<u64>,
}

impl VoiceSession {
    /// Create an idle session
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        encoder: Arc<dyn Encoder>,
        config: SessionConfig,
    ) -> Result<Self> {
        let default_speed = validate_speed(config.default_speed)?;
        let ignore_patterns = RegexSet::new(&config.ignore_patterns)
            .map_err(|e| YomiageError::config(format!("invalid ignore pattern: {}", e)))?;
        config.pipeline.validate()?;
        Ok(Self {
            platform,
            pipeline: TranscodePipeline::new(encoder, config.pipeline),
            speech: SpeechRequestBuilder::new(config.speech)?,
            ignore_prefix: config.ignore_prefix,
            ignore_patterns,
            state: AsyncMutex::new(SessionState::default()),
            speed: Mutex::new(default_speed),
            playback_guard: AsyncMutex::new(()),
            active_job: Mutex::new(None),
            bot_user_id: OnceLock::new(),
        })
    }

    /// Record the bot's own user ID once the platform has confirmed it
    ///
    /// Only the first call has an effect; returns whether it was this one.
    pub fn set_bot_user_id(&self, user_id: u64) -> bool {
        match self.bot_user_id.set(user_id) {
            Ok(()) => true,
            Err(_) => {
                if self.bot_user_id.get() != Some(&user_id) {
                    warn!(user_id = %user_id, "Ignoring a second, different bot identity");
                }
                false
            }
        }
    }

    /// The bot's own user ID, once known
    pub fn bot_user_id(&self) -> Option<u64> {
        self.bot_user_id.get().copied()
    }

    /// Current coarse state
    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        if state.connection.is_none() {
            SessionStatus::Idle
        } else if self.active_job.lock().is_some() {
            SessionStatus::Playing
        } else {
            SessionStatus::Connected
        }
    }

    /// Channel whose messages are currently read aloud
    pub async fn text_channel_id(&self) -> Option<u64> {
        let state = self.state.lock().await;
        state.connection.as_ref().and(state.text_channel_id)
    }

    /// Current voice connection
    pub async fn connection(&self) -> Option<Arc<dyn VoiceConnection>> {
        self.state.lock().await.connection.clone()
    }

    /// Speed used for the next playback
    pub fn speed(&self) -> f64 {
        *self.speed.lock()
    }

    /// Join the voice channel `user_id` is in and read messages from `origin_channel_id`
    pub async fn join(&self, user_id: u64, origin_channel_id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connection.is_some() {
            return Err(YomiageError::AlreadyConnected);
        }

        let location = self
            .platform
            .lookup_user_voice_channel(user_id)
            .await
            .ok_or(YomiageError::UserNotInVoice)?;
        let connection = self
            .platform
            .join_voice_channel(location.guild_id, location.channel_id)
            .await?;

        state.connection = Some(connection);
        state.text_channel_id = Some(origin_channel_id);
        state.generation += 1;
        drop(state);

        info!(
            guild_id = %location.guild_id,
            voice_channel_id = %location.channel_id,
            text_channel_id = %origin_channel_id,
            "Joined voice channel"
        );
        self.notify(origin_channel_id, JOINED_MESSAGE).await;
        Ok(())
    }

    /// Leave the voice channel, canceling any playback in flight
    ///
    /// The session is idle afterwards even when the platform disconnect fails;
    /// that failure is still returned.
    pub async fn leave(&self) -> Result<()> {
        let departure = self.depart(None).await?;
        departure.disconnect?;
        if let Some(channel_id) = departure.text_channel_id {
            self.notify(channel_id, LEFT_MESSAGE).await;
        }
        Ok(())
    }

    /// Change the speed used by later playbacks; a running one is unaffected
    ///
    /// Allowed in any state.
    pub fn set_speed(&self, speed: f64) -> Result<f64> {
        let speed = validate_speed(speed)?;
        *self.speed.lock() = speed;
        info!(speed = %speed, "Speech speed changed");
        Ok(speed)
    }

    /// Parse `raw` and apply it with [`VoiceSession::set_speed`]
    pub fn set_speed_text(&self, raw: &str) -> Result<f64> {
        self.set_speed(parse_speed(raw)?)
    }

    /// Read `message` aloud if it is addressed to this session
    ///
    /// Waits behind any playback already in progress.
    pub async fn speak(&self, message: &InboundMessage) -> Result<SpeakOutcome> {
        if message.author_is_bot || self.bot_user_id() == Some(message.author_id) {
            return Ok(SpeakOutcome::Ignored);
        }
        if !self.accepts_channel(message.channel_id).await {
            return Ok(SpeakOutcome::Ignored);
        }
        if self.is_ignore_marked(&message.content) {
            return Ok(SpeakOutcome::Ignored);
        }
        if self.ignore_patterns.is_match(&message.content) {
            debug!(channel_id = %message.channel_id, "Message matched an ignore pattern");
            self.notify(message.channel_id, SKIPPED_MESSAGE).await;
            return Ok(SpeakOutcome::Skipped);
        }

        let _guard = self.playback_guard.lock().await;

        // re-check: a leave may have happened while queued
        let (connection, generation) = {
            let state = self.state.lock().await;
            match (&state.connection, state.text_channel_id) {
                (Some(conn), Some(channel)) if channel == message.channel_id => {
                    (conn.clone(), state.generation)
                }
                _ => return Ok(SpeakOutcome::Ignored),
            }
        };

        let speed = self.speed();
        let request = self.speech.build(&message.content);
        info!(
            guild_id = %connection.guild_id(),
            language = %request.language,
            speed = %speed,
            text_len = %message.content.len(),
            "Starting playback"
        );
        let mut job = self.pipeline.start(request, speed).await?;

        {
            let state = self.state.lock().await;
            if state.connection.is_none() || state.generation != generation {
                info!(job_id = %job.id(), "Connection went away before playback started");
                return Ok(SpeakOutcome::Played(JobState::Canceled));
            }
            *self.active_job.lock() = Some(job.handle());
        }

        let result = self.pipeline.run(&mut job, connection.as_ref()).await;

        {
            let mut active = self.active_job.lock();
            if active.as_ref().map(JobHandle::id) == Some(job.id()) {
                *active = None;
            }
        }

        result.map(SpeakOutcome::Played)
    }

    /// Leave if the bot is the only occupant left in its voice channel
    ///
    /// Returns whether a leave happened. Disconnect failures are logged, and
    /// the departure notice is still sent when a text channel is known.
    pub async fn check_auto_leave(&self) -> Result<bool> {
        let (connection, generation) = {
            let state = self.state.lock().await;
            match &state.connection {
                Some(conn) => (conn.clone(), state.generation),
                None => return Ok(false),
            }
        };
        if !connection.is_ready().await {
            return Ok(false);
        }

        let bot_user_id = self.bot_user_id();
        let channel_id = connection.channel_id();
        let occupied = self
            .platform
            .voice_occupants()
            .iter()
            .any(|o| o.channel_id == channel_id && Some(o.user_id) != bot_user_id);
        if occupied {
            return Ok(false);
        }

        info!(
            guild_id = %connection.guild_id(),
            voice_channel_id = %channel_id,
            "Alone in voice channel, leaving"
        );
        let departure = match self.depart(Some(generation)).await {
            Ok(d) => d,
            Err(YomiageError::NotConnected) => return Ok(false),
            Err(e) => return Err(e),
        };
        if let Err(e) = &departure.disconnect {
            warn!(error = %e, "Auto-leave disconnect failed");
        }
        if let Some(text_channel_id) = departure.text_channel_id {
            self.notify(text_channel_id, LEFT_MESSAGE).await;
        }
        Ok(true)
    }

    /// Send `text` to `channel_id`, logging instead of failing
    pub async fn notify(&self, channel_id: u64, text: &str) {
        if let Err(e) = self.platform.send_message(channel_id, text).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to send message");
        }
    }

    /// Whether a message in `channel_id` may drive this session right now
    ///
    /// True when connected and the channel is the one recorded at join.
    pub async fn accepts_channel(&self, channel_id: u64) -> bool {
        let state = self.state.lock().await;
        state.connection.is_some() && state.text_channel_id == Some(channel_id)
    }

    /// Whether `content` starts with the ignore marker
    pub fn is_ignore_marked(&self, content: &str) -> bool {
        !self.ignore_prefix.is_empty() && content.starts_with(&self.ignore_prefix)
    }

    async fn depart(&self, expected_generation: Option<u64>) -> Result<Departure> {
        let (connection, text_channel_id) = {
            let mut state = self.state.lock().await;
            if expected_generation.is_some_and(|g| g != state.generation) {
                return Err(YomiageError::NotConnected);
            }
            let connection = state.connection.take().ok_or(YomiageError::NotConnected)?;
            (connection, state.text_channel_id.take())
        };

        let active = self.active_job.lock().clone();
        if let Some(job) = active {
            info!(job_id = %job.id(), "Canceling playback before leaving");
            job.cancel();
            let final_state = job.wait().await;
            debug!(job_id = %job.id(), state = ?final_state, "Playback stopped");
        }

        let disconnect = connection
            .disconnect()
            .await
            .map_err(|e| match e {
                YomiageError::VoiceDisconnect(_) => e,
                other => YomiageError::voice_disconnect(other.to_string()),
            });
        if disconnect.is_ok() {
            info!(guild_id = %connection.guild_id(), "Left voice channel");
        }

        Ok(Departure {
            text_channel_id,
            disconnect,
        })
    }
}
