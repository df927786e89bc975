//! Transcode pipeline
//!
//! Drives one utterance from the synthesis endpoint into a voice connection:
//! start the encoder, raise the speaking flag, stream, poll progress once per
//! interval, and lower the flag again whatever the outcome.

use crate::platform::{StreamFault, VoiceConnection};
use crate::speech::SpeechRequest;
use crate::{Result, YomiageError};
use async_trait::async_trait;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline settings shared by every job
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target bitrate handed to the encoder
    pub bitrate_kbps: u32,
    /// Encoder compression level, 0 disables it
    pub compression_level: u32,
    /// How often progress is sampled while streaming
    pub progress_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: 120,
            compression_level: 0,
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Reject settings the encoder or the progress ticker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bitrate_kbps == 0 {
            return Err(YomiageError::config("bitrate must be greater than zero"));
        }
        if self.progress_interval.is_zero() {
            return Err(YomiageError::config(
                "progress interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Options passed to the encoder for one job
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOptions {
    /// Compression level
    pub compression_level: u32,
    /// Emit raw frames without a container
    pub raw_output: bool,
    /// Target bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Audio filter expression
    pub audio_filter: String,
}

/// Encoder-side statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TranscodeStats {
    /// Amount of audio transcoded so far
    pub duration: Duration,
    /// Output produced so far in kB
    pub size_kb: u64,
    /// Effective output bitrate in kbit/s
    pub bitrate_kbps: f32,
    /// Encode speed relative to realtime
    pub speed: f32,
}

/// Encoder output ready to be sent into a voice connection
pub struct EncodedAudio {
    /// Raw interleaved f32 little-endian PCM
    pub reader: Box<dyn Read + Send + Sync>,
    /// Sample rate of `reader`
    pub sample_rate: u32,
    /// Channel count of `reader`
    pub channels: u32,
    /// Bitrate the transport should encode at
    pub bitrate_kbps: u32,
}

impl fmt::Debug for EncodedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedAudio")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("bitrate_kbps", &self.bitrate_kbps)
            .finish_non_exhaustive()
    }
}

/// External audio encoder
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Start encoding `source` (a URL or path)
    ///
    /// Fails with [`YomiageError::EncodeStart`] when the source is unreachable
    /// or the encoder cannot be launched.
    async fn encode(&self, source: &str, options: &EncodeOptions) -> Result<Box<dyn EncodeSession>>;
}

/// A running encode
pub trait EncodeSession: Send + Sync {
    /// Current statistics
    fn stats(&self) -> TranscodeStats;

    /// Hand over the output stream; `None` once taken
    fn take_output(&mut self) -> Option<EncodedAudio>;

    /// Stop the encoder and drop whatever output is still buffered
    fn truncate(&mut self);
}

/// Lifecycle of a playback job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Encoder started, not finished yet
    Running,
    /// Stream reached its end
    Completed,
    /// Stream or transport failure
    Failed(String),
    /// Stopped by a leave
    Canceled,
}

impl JobState {
    /// Whether the job can no longer change state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// Last sampled progress of a job
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackProgress {
    /// Audio already sent to the voice channel
    pub position: Duration,
    /// Encoder statistics at the same instant
    pub transcode: TranscodeStats,
}

/// One utterance on its way into a voice channel
pub struct PlaybackJob {
    id: Uuid,
    request: SpeechRequest,
    speed: f64,
    encode: Box<dyn EncodeSession>,
    cancel: CancellationToken,
    state: watch::Sender<JobState>,
    progress: PlaybackProgress,
}

impl PlaybackJob {
    fn new(request: SpeechRequest, speed: f64, encode: Box<dyn EncodeSession>) -> Self {
        let (state, _) = watch::channel(JobState::Running);
        Self {
            id: Uuid::new_v4(),
            request,
            speed,
            encode,
            cancel: CancellationToken::new(),
            state,
            progress: PlaybackProgress::default(),
        }
    }

    /// Job ID, used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Text being spoken
    pub fn text(&self) -> &str {
        &self.request.text
    }

    /// Language code the text was sent with
    pub fn language(&self) -> &str {
        &self.request.language
    }

    /// Speed captured when the job was created
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Last sampled progress
    pub fn progress(&self) -> PlaybackProgress {
        self.progress
    }

    /// A cloneable handle that can cancel and await this job
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
        }
    }

    fn finish(&self, state: JobState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = state;
            true
        });
    }
}

impl Drop for PlaybackJob {
    fn drop(&mut self) {
        // A job dropped before reaching a terminal state never played to the end.
        self.finish(JobState::Canceled);
    }
}

impl fmt::Debug for PlaybackJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackJob")
            .field("id", &self.id)
            .field("language", &self.request.language)
            .field("speed", &self.speed)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Cancel/await side of a [`PlaybackJob`]
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    /// ID of the job this handle belongs to
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask the job to stop; returns immediately
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current state of the job
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        let result = rx.wait_for(JobState::is_terminal).await.map(|s| s.clone());
        result.unwrap_or(JobState::Canceled)
    }
}

/// Encoder plus send loop
pub struct TranscodePipeline {
    encoder: Arc<dyn Encoder>,
    config: PipelineConfig,
}

impl TranscodePipeline {
    /// Create a pipeline around `encoder`
    pub fn new(encoder: Arc<dyn Encoder>, config: PipelineConfig) -> Self {
        Self { encoder, config }
    }

    /// Encoder options for a job at `speed`
    pub fn encode_options(&self, speed: f64) -> EncodeOptions {
        EncodeOptions {
            compression_level: self.config.compression_level,
            raw_output: true,
            bitrate_kbps: self.config.bitrate_kbps,
            audio_filter: format!("atempo={:.6}", speed),
        }
    }

    /// Start the encoder for `request`
    pub async fn start(&self, request: SpeechRequest, speed: f64) -> Result<PlaybackJob> {
        let options = self.encode_options(speed);
        let encode = self.encoder.encode(request.url.as_str(), &options).await?;
        let job = PlaybackJob::new(request, speed, encode);
        debug!(
            job_id = %job.id(),
            language = %job.language(),
            speed = %speed,
            filter = %options.audio_filter,
            "Encoder started"
        );
        Ok(job)
    }

    /// Stream `job` into `connection` until it completes, fails or is canceled
    ///
    /// The speaking flag is raised before the stream starts and lowered after
    /// it ends on every path. A failure to lower it is logged, not returned.
    pub async fn run(&self, job: &mut PlaybackJob, connection: &dyn VoiceConnection) -> Result<JobState> {
        if job.cancel.is_cancelled() {
            job.encode.truncate();
            job.finish(JobState::Canceled);
            return Ok(JobState::Canceled);
        }

        if let Err(e) = connection.set_speaking(true).await {
            job.encode.truncate();
            job.finish(JobState::Failed(e.to_string()));
            return Err(e);
        }

        let result = self.send(job, connection).await;

        if let Err(e) = connection.set_speaking(false).await {
            error!(job_id = %job.id(), error = %e, "Failed to clear speaking flag");
        }

        match &result {
            Ok(state) => job.finish(state.clone()),
            Err(e) => job.finish(JobState::Failed(e.to_string())),
        }
        result
    }

    async fn send(&self, job: &mut PlaybackJob, connection: &dyn VoiceConnection) -> Result<JobState> {
        let audio = job
            .encode
            .take_output()
            .ok_or_else(|| YomiageError::stream("encoder output already consumed"))?;

        let (done_tx, mut done_rx) = oneshot::channel();
        let stream = connection.stream(audio, done_tx).await?;

        let period = self.config.progress_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = job.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stream.stop();
                    job.encode.truncate();
                    info!(job_id = %job.id(), "Playback canceled");
                    return Ok(JobState::Canceled);
                }
                done = &mut done_rx => {
                    return match done {
                        Ok(Ok(())) | Ok(Err(StreamFault::EndOfStream)) => {
                            job.encode.truncate();
                            info!(job_id = %job.id(), "Playback completed");
                            Ok(JobState::Completed)
                        }
                        Ok(Err(StreamFault::Failed(msg))) => {
                            stream.stop();
                            warn!(job_id = %job.id(), error = %msg, "Voice stream failed");
                            Err(YomiageError::stream(msg))
                        }
                        Err(_) => {
                            stream.stop();
                            Err(YomiageError::stream("voice stream ended without a status"))
                        }
                    };
                }
                _ = ticker.tick() => {
                    let position = stream.playback_position().await;
                    let stats = job.encode.stats();
                    job.progress = PlaybackProgress { position, transcode: stats };
                    info!(
                        job_id = %job.id(),
                        playback = ?position,
                        transcoded = ?stats.duration,
                        size_kb = stats.size_kb,
                        bitrate_kbps = %format!("{:.2}", stats.bitrate_kbps),
                        speed = %format!("{:.1}x", stats.speed),
                        "Sending now..."
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{SpeechConfig, SpeechRequestBuilder};
    use crate::testing::{FakeEncoder, FakeVoiceConnection};

    fn request(text: &str) -> SpeechRequest {
        SpeechRequestBuilder::new(SpeechConfig::default())
            .unwrap()
            .build(text)
    }

    fn pipeline(encoder: Arc<FakeEncoder>) -> TranscodePipeline {
        TranscodePipeline::new(encoder, PipelineConfig::default())
    }

    #[test]
    fn test_encode_options_carry_speed() {
        let p = pipeline(Arc::new(FakeEncoder::new()));
        let opts = p.encode_options(1.5);
        assert_eq!(opts.audio_filter, "atempo=1.500000");
        assert_eq!(opts.bitrate_kbps, 120);
        assert_eq!(opts.compression_level, 0);
        assert!(opts.raw_output);
    }

    #[tokio::test]
    async fn test_start_failure_is_encode_start() {
        let encoder = Arc::new(FakeEncoder::new());
        encoder.fail_next("connection refused");
        let p = pipeline(encoder);
        let err = p.start(request("hello"), 1.0).await.unwrap_err();
        assert!(matches!(err, YomiageError::EncodeStart(_)));
    }

    #[tokio::test]
    async fn test_end_of_stream_counts_as_success() {
        let encoder = Arc::new(FakeEncoder::new());
        let p = pipeline(encoder.clone());
        let conn = FakeVoiceConnection::new(1, 10);
        conn.set_auto_finish(Some(Err(StreamFault::EndOfStream)));

        let mut job = p.start(request("hello"), 1.0).await.unwrap();
        let state = p.run(&mut job, &conn).await.unwrap();

        assert_eq!(state, JobState::Completed);
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(conn.speaking_history(), vec![true, false]);
        assert_eq!(encoder.truncations(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_clears_speaking() {
        let p = pipeline(Arc::new(FakeEncoder::new()));
        let conn = FakeVoiceConnection::new(1, 10);
        conn.set_auto_finish(Some(Err(StreamFault::Failed("udp closed".into()))));

        let mut job = p.start(request("hello"), 1.0).await.unwrap();
        let err = p.run(&mut job, &conn).await.unwrap_err();

        assert!(matches!(err, YomiageError::Stream(ref m) if m == "udp closed"));
        assert_eq!(job.state(), JobState::Failed("Voice stream error: udp closed".into()));
        assert_eq!(conn.speaking_history(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_speaking_release_failure_is_not_fatal() {
        let p = pipeline(Arc::new(FakeEncoder::new()));
        let conn = FakeVoiceConnection::new(1, 10);
        conn.set_auto_finish(Some(Ok(())));
        conn.fail_speaking_release();

        let mut job = p.start(request("hello"), 1.0).await.unwrap();
        assert_eq!(p.run(&mut job, &conn).await.unwrap(), JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_stream_promptly() {
        let encoder = Arc::new(FakeEncoder::new());
        let p = pipeline(encoder.clone());
        let conn = FakeVoiceConnection::new(1, 10);

        let mut job = p.start(request("a long sentence"), 1.0).await.unwrap();
        let handle = job.handle();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            handle.cancel();
            handle.wait().await
        });

        let state = p.run(&mut job, &conn).await.unwrap();
        assert_eq!(state, JobState::Canceled);
        assert_eq!(canceller.await.unwrap(), JobState::Canceled);
        assert_eq!(conn.stopped_streams(), 1);
        assert_eq!(encoder.truncations(), 1);
        assert_eq!(conn.speaking_history(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_sampled_each_interval() {
        let p = pipeline(Arc::new(FakeEncoder::new()));
        let conn = FakeVoiceConnection::new(1, 10);

        let mut job = p.start(request("hello"), 1.0).await.unwrap();
        let finisher = {
            let conn = conn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                conn.finish_stream(Ok(()));
            })
        };

        p.run(&mut job, &conn).await.unwrap();
        finisher.await.unwrap();
        assert_eq!(conn.position_queries(), 3);
        assert_eq!(job.progress().position, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_dropped_job_reports_canceled() {
        let p = pipeline(Arc::new(FakeEncoder::new()));
        let job = p.start(request("hello"), 1.0).await.unwrap();
        let handle = job.handle();
        drop(job);
        assert_eq!(handle.wait().await, JobState::Canceled);
    }
}
