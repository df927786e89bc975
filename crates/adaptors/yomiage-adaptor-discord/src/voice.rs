//! Discord Voice Support
//!
//! Songbird-backed voice connections and the voice-state tracker the core
//! uses to find users and detect empty channels.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId};
use songbird::driver::Bitrate;
use songbird::input::{Input, RawAdapter};
use songbird::tracks::{PlayMode, Track, TrackHandle};
use songbird::{Call, Event, EventContext, EventHandler as SongbirdEventHandler, Songbird, TrackEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::io::ReadOnlySource;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use yomiage_core::{
    ChatPlatform, EncodedAudio, Result, StreamFault, StreamResult, VoiceConnection, VoiceLocation,
    VoiceOccupant, VoiceStream, YomiageError,
};

/// Custom voice state tracker - maps (guild_id, user_id) -> channel_id
///
/// Seeded from `guild_create` and kept current from `voice_state_update`;
/// more reliable than serenity's cache for voice state tracking.
#[derive(Clone, Default)]
pub struct VoiceStateMap {
    states: Arc<RwLock<HashMap<(u64, u64), u64>>>,
}

impl VoiceStateMap {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `user_id` as sitting in `channel_id`, or as gone when `None`
    pub fn update(&self, guild_id: u64, user_id: u64, channel_id: Option<u64>) {
        let mut states = self.states.write();
        match channel_id {
            Some(cid) => {
                states.insert((guild_id, user_id), cid);
            }
            None => {
                states.remove(&(guild_id, user_id));
            }
        }
    }

    /// Replace everything known about `guild_id`
    pub fn seed_guild(&self, guild_id: u64, occupants: impl IntoIterator<Item = (u64, u64)>) {
        let mut states = self.states.write();
        states.retain(|(g, _), _| *g != guild_id);
        for (user_id, channel_id) in occupants {
            states.insert((guild_id, user_id), channel_id);
        }
    }

    /// First voice channel `user_id` is found in, across all guilds
    pub fn find_user(&self, user_id: u64) -> Option<VoiceLocation> {
        self.states
            .read()
            .iter()
            .find(|((_, uid), _)| *uid == user_id)
            .map(|((guild_id, _), channel_id)| VoiceLocation {
                guild_id: *guild_id,
                channel_id: *channel_id,
            })
    }

    /// Every tracked occupant
    pub fn occupants(&self) -> Vec<VoiceOccupant> {
        self.states
            .read()
            .iter()
            .map(|((guild_id, user_id), channel_id)| VoiceOccupant {
                guild_id: *guild_id,
                channel_id: *channel_id,
                user_id: *user_id,
            })
            .collect()
    }

    /// Number of tracked occupants
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether nobody is tracked
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

/// [`ChatPlatform`] over serenity's HTTP client and songbird
pub struct DiscordPlatform {
    http: Arc<Http>,
    songbird: Arc<Songbird>,
    voice_states: VoiceStateMap,
    reply_prefix: String,
}

impl DiscordPlatform {
    /// Create a platform; `reply_prefix` is put in front of every outbound message
    pub fn new(
        http: Arc<Http>,
        songbird: Arc<Songbird>,
        voice_states: VoiceStateMap,
        reply_prefix: impl Into<String>,
    ) -> Self {
        Self {
            http,
            songbird,
            voice_states,
            reply_prefix: reply_prefix.into(),
        }
    }
}

#[async_trait]
impl ChatPlatform for DiscordPlatform {
    async fn send_message(&self, channel_id: u64, text: &str) -> Result<()> {
        let content = format!("{}{}", self.reply_prefix, text);
        info!(channel_id = %channel_id, ">>> {}", content);
        ChannelId::new(channel_id)
            .say(&self.http, content)
            .await
            .map_err(|e| YomiageError::messaging(format!("discord send error: {:?}", e)))?;
        Ok(())
    }

    async fn lookup_user_voice_channel(&self, user_id: u64) -> Option<VoiceLocation> {
        let location = self.voice_states.find_user(user_id);
        debug!(user_id = %user_id, location = ?location, "Voice channel lookup");
        location
    }

    async fn join_voice_channel(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceConnection>> {
        let call_lock = self
            .songbird
            .join(GuildId::new(guild_id), ChannelId::new(channel_id))
            .await
            .map_err(|e| YomiageError::voice_join(e.to_string()))?;

        {
            let mut call = call_lock.lock().await;
            if let Err(e) = call.deafen(true).await {
                warn!(guild_id = %guild_id, error = %e, "Failed to self-deafen");
            }
        }

        Ok(Arc::new(DiscordVoiceConnection::new(
            guild_id,
            channel_id,
            self.songbird.clone(),
        )))
    }

    fn voice_occupants(&self) -> Vec<VoiceOccupant> {
        self.voice_states.occupants()
    }
}

/// One songbird call, addressed by guild
pub struct DiscordVoiceConnection {
    guild_id: u64,
    // last channel the call was seen in; the bot can be moved after joining
    channel_id: AtomicU64,
    songbird: Arc<Songbird>,
    speaking: AtomicBool,
}

impl DiscordVoiceConnection {
    /// Wrap the songbird call for `guild_id`
    pub fn new(guild_id: u64, channel_id: u64, songbird: Arc<Songbird>) -> Self {
        Self {
            guild_id,
            channel_id: AtomicU64::new(channel_id),
            songbird,
            speaking: AtomicBool::new(false),
        }
    }

    /// Last value passed to `set_speaking`
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    fn call(&self) -> Option<Arc<AsyncMutex<Call>>> {
        self.songbird.get(GuildId::new(self.guild_id))
    }
}

#[async_trait]
impl VoiceConnection for DiscordVoiceConnection {
    fn guild_id(&self) -> u64 {
        self.guild_id
    }

    fn channel_id(&self) -> u64 {
        // a call busy with playback keeps the last channel it was seen in
        let live = self.call().and_then(|call| {
            call.try_lock()
                .ok()
                .and_then(|call| call.current_channel())
                .map(|channel| channel.0.get())
        });
        resolve_channel(live, &self.channel_id)
    }

    async fn is_ready(&self) -> bool {
        match self.call() {
            Some(call) => call.lock().await.current_connection().is_some(),
            None => false,
        }
    }

    async fn set_speaking(&self, speaking: bool) -> Result<()> {
        // songbird sends the SPEAKING opcode itself while a track plays
        self.speaking.store(speaking, Ordering::SeqCst);
        debug!(guild_id = %self.guild_id, speaking = %speaking, "Speaking flag");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.songbird
            .remove(GuildId::new(self.guild_id))
            .await
            .map_err(|e| YomiageError::voice_disconnect(e.to_string()))
    }

    async fn stream(
        &self,
        audio: EncodedAudio,
        done: oneshot::Sender<StreamResult>,
    ) -> Result<Box<dyn VoiceStream>> {
        let call_lock = self
            .call()
            .ok_or_else(|| YomiageError::stream("voice connection is gone"))?;

        let bitrate = i32::try_from(audio.bitrate_kbps.saturating_mul(1000)).unwrap_or(i32::MAX);
        let source = ReadOnlySource::new(audio.reader);
        let input: Input = RawAdapter::new(source, audio.sample_rate, audio.channels).into();

        let track = {
            let mut call = call_lock.lock().await;
            call.set_bitrate(Bitrate::BitsPerSecond(bitrate));
            // start paused so the end events are registered before any audio plays
            call.play(Track::from(input).pause())
        };

        let notifier = TrackEndNotifier::new(done);
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), notifier.clone())
                .map_err(|e| YomiageError::stream(e.to_string()))?;
        }
        track
            .play()
            .map_err(|e| YomiageError::stream(e.to_string()))?;

        info!(guild_id = %self.guild_id, bitrate = %bitrate, "Started playing audio in voice channel");
        Ok(Box::new(DiscordVoiceStream { track }))
    }
}

/// Prefer the live channel and remember it, else fall back to the last one seen
fn resolve_channel(live: Option<u64>, last_known: &AtomicU64) -> u64 {
    match live {
        Some(channel_id) => {
            last_known.store(channel_id, Ordering::SeqCst);
            channel_id
        }
        None => last_known.load(Ordering::SeqCst),
    }
}

/// Reports the end of a track on the pipeline's completion channel
#[derive(Clone)]
struct TrackEndNotifier {
    done: Arc<Mutex<Option<oneshot::Sender<StreamResult>>>>,
}

impl TrackEndNotifier {
    fn new(done: oneshot::Sender<StreamResult>) -> Self {
        Self {
            done: Arc::new(Mutex::new(Some(done))),
        }
    }
}

#[async_trait]
impl SongbirdEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            let result = tracks
                .iter()
                .find_map(|(state, _)| match &state.playing {
                    PlayMode::Errored(e) => Some(Err(StreamFault::Failed(format!("{:?}", e)))),
                    _ => None,
                })
                .unwrap_or(Err(StreamFault::EndOfStream));
            let sender = self.done.lock().take();
            if let Some(tx) = sender {
                let _ = tx.send(result);
            }
        }
        None
    }
}

struct DiscordVoiceStream {
    track: TrackHandle,
}

#[async_trait]
impl VoiceStream for DiscordVoiceStream {
    async fn playback_position(&self) -> Duration {
        match self.track.get_info().await {
            Ok(state) => state.position,
            Err(_) => Duration::ZERO,
        }
    }

    fn stop(&self) {
        if let Err(e) = self.track.stop() {
            debug!(error = %e, "Track already finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_state_updates() {
        let states = VoiceStateMap::new();
        states.update(1, 100, Some(10));
        states.update(1, 101, Some(10));
        assert_eq!(
            states.find_user(100),
            Some(VoiceLocation {
                guild_id: 1,
                channel_id: 10
            })
        );

        states.update(1, 100, Some(11));
        assert_eq!(states.find_user(100).map(|l| l.channel_id), Some(11));

        states.update(1, 100, None);
        assert_eq!(states.find_user(100), None);
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn test_seed_guild_replaces_only_that_guild() {
        let states = VoiceStateMap::new();
        states.update(1, 100, Some(10));
        states.update(2, 200, Some(20));

        states.seed_guild(1, [(101, 12), (102, 12)]);

        let mut occupants = states.occupants();
        occupants.sort_by_key(|o| o.user_id);
        let users: Vec<u64> = occupants.iter().map(|o| o.user_id).collect();
        assert_eq!(users, vec![101, 102, 200]);
        assert!(occupants.iter().all(|o| o.guild_id != 1 || o.channel_id == 12));
    }

    #[test]
    fn test_resolve_channel_follows_moves() {
        let last_known = AtomicU64::new(10);

        assert_eq!(resolve_channel(None, &last_known), 10);
        assert_eq!(resolve_channel(Some(11), &last_known), 11);
        // a later contended read still reports the channel the bot was moved to
        assert_eq!(resolve_channel(None, &last_known), 11);
    }

    #[tokio::test]
    async fn test_connection_without_call_keeps_joined_channel() {
        let songbird = Songbird::serenity();
        let conn = DiscordVoiceConnection::new(1, 10, songbird);
        assert_eq!(conn.channel_id(), 10);
        assert!(!conn.is_ready().await);
    }

    #[test]
    fn test_empty_tracker() {
        let states = VoiceStateMap::new();
        assert!(states.is_empty());
        assert!(states.occupants().is_empty());
        assert_eq!(states.find_user(1), None);
    }
}
