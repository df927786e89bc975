//! In-memory doubles for the platform and encoder collaborators
//!
//! Used by the unit tests in this crate and by the integration tests under
//! `tests/`. Every double records what was asked of it so tests can assert on
//! ordering and side effects without a gateway or an ffmpeg binary.

use crate::platform::{
    ChatPlatform, StreamResult, VoiceConnection, VoiceLocation, VoiceOccupant, VoiceStream,
};
use crate::transcode::{EncodeOptions, EncodeSession, EncodedAudio, Encoder, TranscodeStats};
use crate::{Result, YomiageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// Encoder double; produces silent output and counts truncations
#[derive(Default)]
pub struct FakeEncoder {
    calls: Mutex<Vec<(String, EncodeOptions)>>,
    fail_next: Mutex<Option<String>>,
    truncations: Arc<AtomicUsize>,
}

impl FakeEncoder {
    /// Create an encoder that always starts
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `encode` call fail with [`YomiageError::EncodeStart`]
    pub fn fail_next(&self, msg: &str) {
        *self.fail_next.lock() = Some(msg.to_string());
    }

    /// Sources passed to `encode`, in call order
    pub fn sources(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    /// Options passed to `encode`, in call order
    pub fn options(&self) -> Vec<EncodeOptions> {
        self.calls.lock().iter().map(|(_, o)| o.clone()).collect()
    }

    /// How many sessions have been truncated
    pub fn truncations(&self) -> usize {
        self.truncations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(&self, source: &str, options: &EncodeOptions) -> Result<Box<dyn EncodeSession>> {
        if let Some(msg) = self.fail_next.lock().take() {
            return Err(YomiageError::encode_start(msg));
        }
        self.calls.lock().push((source.to_string(), options.clone()));
        Ok(Box::new(FakeEncodeSession {
            output: Some(EncodedAudio {
                reader: Box::new(std::io::empty()),
                sample_rate: 48_000,
                channels: 2,
                bitrate_kbps: options.bitrate_kbps,
            }),
            truncations: self.truncations.clone(),
            truncated: false,
        }))
    }
}

struct FakeEncodeSession {
    output: Option<EncodedAudio>,
    truncations: Arc<AtomicUsize>,
    truncated: bool,
}

impl EncodeSession for FakeEncodeSession {
    fn stats(&self) -> TranscodeStats {
        TranscodeStats {
            duration: Duration::from_secs(1),
            size_kb: 16,
            bitrate_kbps: 120.0,
            speed: 1.0,
        }
    }

    fn take_output(&mut self) -> Option<EncodedAudio> {
        self.output.take()
    }

    fn truncate(&mut self) {
        if !self.truncated {
            self.truncated = true;
            self.truncations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ConnectionState {
    guild_id: u64,
    channel_id: u64,
    ready: AtomicBool,
    speaking_now: AtomicBool,
    speaking_history: Mutex<Vec<bool>>,
    overlaps: AtomicUsize,
    fail_release: AtomicBool,
    fail_disconnect: AtomicBool,
    auto_finish: Mutex<Option<StreamResult>>,
    pending: Mutex<Option<oneshot::Sender<StreamResult>>>,
    streams: AtomicUsize,
    stopped: AtomicUsize,
    position_queries: AtomicUsize,
    disconnects: AtomicUsize,
    stream_started: Notify,
}

/// Voice connection double
///
/// Streams stay open until [`FakeVoiceConnection::finish_stream`] is called,
/// unless an automatic result has been set.
#[derive(Clone)]
pub struct FakeVoiceConnection {
    state: Arc<ConnectionState>,
}

impl FakeVoiceConnection {
    /// A ready connection to `channel_id` in `guild_id`
    pub fn new(guild_id: u64, channel_id: u64) -> Self {
        Self {
            state: Arc::new(ConnectionState {
                guild_id,
                channel_id,
                ready: AtomicBool::new(true),
                speaking_now: AtomicBool::new(false),
                speaking_history: Mutex::new(Vec::new()),
                overlaps: AtomicUsize::new(0),
                fail_release: AtomicBool::new(false),
                fail_disconnect: AtomicBool::new(false),
                auto_finish: Mutex::new(None),
                pending: Mutex::new(None),
                streams: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                position_queries: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                stream_started: Notify::new(),
            }),
        }
    }

    /// Finish every future stream immediately with `result`
    pub fn set_auto_finish(&self, result: Option<StreamResult>) {
        *self.state.auto_finish.lock() = result;
    }

    /// Report `result` on the currently open stream
    pub fn finish_stream(&self, result: StreamResult) -> bool {
        match self.state.pending.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Wait until a stream has been started (consumes one start notification)
    pub async fn wait_stream_started(&self) {
        self.state.stream_started.notified().await;
    }

    /// Mark the transport as (not) ready
    pub fn set_ready(&self, ready: bool) {
        self.state.ready.store(ready, Ordering::SeqCst);
    }

    /// Make `set_speaking(false)` fail
    pub fn fail_speaking_release(&self) {
        self.state.fail_release.store(true, Ordering::SeqCst);
    }

    /// Make `disconnect` fail
    pub fn fail_disconnect(&self) {
        self.state.fail_disconnect.store(true, Ordering::SeqCst);
    }

    /// Every value passed to `set_speaking`, in order
    pub fn speaking_history(&self) -> Vec<bool> {
        self.state.speaking_history.lock().clone()
    }

    /// How many times speaking was raised while already raised
    pub fn speaking_overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    /// Number of streams started
    pub fn streams_started(&self) -> usize {
        self.state.streams.load(Ordering::SeqCst)
    }

    /// Number of streams stopped early
    pub fn stopped_streams(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Number of playback position samples taken
    pub fn position_queries(&self) -> usize {
        self.state.position_queries.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls
    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceConnection for FakeVoiceConnection {
    fn guild_id(&self) -> u64 {
        self.state.guild_id
    }

    fn channel_id(&self) -> u64 {
        self.state.channel_id
    }

    async fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    async fn set_speaking(&self, speaking: bool) -> Result<()> {
        self.state.speaking_history.lock().push(speaking);
        if !speaking && self.state.fail_release.load(Ordering::SeqCst) {
            return Err(YomiageError::stream("speaking flag stuck"));
        }
        let was = self.state.speaking_now.swap(speaking, Ordering::SeqCst);
        if speaking && was {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_disconnect.load(Ordering::SeqCst) {
            return Err(YomiageError::voice_disconnect("gateway closed"));
        }
        self.state.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stream(
        &self,
        _audio: EncodedAudio,
        done: oneshot::Sender<StreamResult>,
    ) -> Result<Box<dyn VoiceStream>> {
        self.state.streams.fetch_add(1, Ordering::SeqCst);
        match self.state.auto_finish.lock().clone() {
            Some(result) => {
                let _ = done.send(result);
            }
            None => *self.state.pending.lock() = Some(done),
        }
        self.state.stream_started.notify_one();
        Ok(Box::new(FakeVoiceStream {
            state: self.state.clone(),
            started_at: Instant::now(),
        }))
    }
}

struct FakeVoiceStream {
    state: Arc<ConnectionState>,
    started_at: Instant,
}

#[async_trait]
impl VoiceStream for FakeVoiceStream {
    async fn playback_position(&self) -> Duration {
        self.state.position_queries.fetch_add(1, Ordering::SeqCst);
        self.started_at.elapsed()
    }

    fn stop(&self) {
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.state.pending.lock().take() {
            let _ = tx.send(Ok(()));
        }
    }
}

/// Chat platform double
#[derive(Default)]
pub struct FakePlatform {
    voice_states: Mutex<HashMap<(u64, u64), u64>>,
    sent: Mutex<Vec<(u64, String)>>,
    connections: Mutex<Vec<FakeVoiceConnection>>,
    fail_next_join: Mutex<Option<String>>,
}

impl FakePlatform {
    /// An empty platform with nobody in voice
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `user_id` into `channel_id` of `guild_id`
    pub fn set_voice_state(&self, guild_id: u64, user_id: u64, channel_id: u64) {
        self.voice_states.lock().insert((guild_id, user_id), channel_id);
    }

    /// Remove `user_id` from voice in `guild_id`
    pub fn remove_voice_state(&self, guild_id: u64, user_id: u64) {
        self.voice_states.lock().remove(&(guild_id, user_id));
    }

    /// Make the next join fail with [`YomiageError::VoiceJoin`]
    pub fn fail_next_join(&self, msg: &str) {
        *self.fail_next_join.lock() = Some(msg.to_string());
    }

    /// All messages sent, in order
    pub fn sent_messages(&self) -> Vec<(u64, String)> {
        self.sent.lock().clone()
    }

    /// Messages sent to `channel_id`, in order
    pub fn messages_to(&self, channel_id: u64) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Most recently created voice connection
    pub fn last_connection(&self) -> Option<FakeVoiceConnection> {
        self.connections.lock().last().cloned()
    }

    /// Number of successful joins
    pub fn join_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn send_message(&self, channel_id: u64, text: &str) -> Result<()> {
        self.sent.lock().push((channel_id, text.to_string()));
        Ok(())
    }

    async fn lookup_user_voice_channel(&self, user_id: u64) -> Option<VoiceLocation> {
        self.voice_states
            .lock()
            .iter()
            .find(|((_, uid), _)| *uid == user_id)
            .map(|((guild_id, _), channel_id)| VoiceLocation {
                guild_id: *guild_id,
                channel_id: *channel_id,
            })
    }

    async fn join_voice_channel(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceConnection>> {
        if let Some(msg) = self.fail_next_join.lock().take() {
            return Err(YomiageError::voice_join(msg));
        }
        let conn = FakeVoiceConnection::new(guild_id, channel_id);
        self.connections.lock().push(conn.clone());
        Ok(Arc::new(conn))
    }

    fn voice_occupants(&self) -> Vec<VoiceOccupant> {
        self.voice_states
            .lock()
            .iter()
            .map(|((guild_id, user_id), channel_id)| VoiceOccupant {
                guild_id: *guild_id,
                channel_id: *channel_id,
                user_id: *user_id,
            })
            .collect()
    }
}
