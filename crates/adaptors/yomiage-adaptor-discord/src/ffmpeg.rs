//! ffmpeg-backed encoder
//!
//! The synthesis response is fetched over HTTP and piped into an `ffmpeg`
//! child that applies the tempo filter and emits raw 48 kHz stereo f32 PCM,
//! which songbird re-encodes to Opus. Progress is read from `-progress`
//! key/value output on stderr.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use yomiage_core::{
    EncodeOptions, EncodeSession, EncodedAudio, Encoder, Result, TranscodeStats, YomiageError,
};

/// Output sample rate expected by the voice transport
pub const SAMPLE_RATE: u32 = 48_000;
/// Output channel count expected by the voice transport
pub const CHANNELS: u32 = 2;

/// Command-line arguments for one encode
pub fn ffmpeg_args(options: &EncodeOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-progress",
        "pipe:2",
        "-i",
        "pipe:0",
        "-map",
        "0:a",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if !options.audio_filter.is_empty() {
        args.push("-af".to_string());
        args.push(options.audio_filter.clone());
    }
    args.push("-compression_level".to_string());
    args.push(options.compression_level.to_string());
    args.push("-b:a".to_string());
    args.push(format!("{}k", options.bitrate_kbps));
    args.extend(
        [
            "-f".to_string(),
            "f32le".to_string(),
            "-ar".to_string(),
            SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            CHANNELS.to_string(),
            "pipe:1".to_string(),
        ],
    );
    args
}

/// One recognised `-progress` line
#[derive(Debug, Clone, Copy, PartialEq)]
enum ProgressField {
    Duration(Duration),
    SizeBytes(u64),
    Bitrate(f32),
    Speed(f32),
}

fn parse_progress_line(line: &str) -> Option<ProgressField> {
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    match key.trim() {
        "out_time_us" | "out_time_ms" => value
            .parse::<u64>()
            .ok()
            .map(|us| ProgressField::Duration(Duration::from_micros(us))),
        "total_size" => value.parse::<u64>().ok().map(ProgressField::SizeBytes),
        "bitrate" => value
            .strip_suffix("kbits/s")
            .and_then(|v| v.trim().parse::<f32>().ok())
            .map(ProgressField::Bitrate),
        "speed" => value
            .strip_suffix('x')
            .and_then(|v| v.trim().parse::<f32>().ok())
            .map(ProgressField::Speed),
        _ => None,
    }
}

fn apply_progress(stats: &mut TranscodeStats, field: ProgressField) {
    match field {
        ProgressField::Duration(d) => stats.duration = d,
        ProgressField::SizeBytes(bytes) => stats.size_kb = bytes / 1024,
        ProgressField::Bitrate(kbps) => stats.bitrate_kbps = kbps,
        ProgressField::Speed(speed) => stats.speed = speed,
    }
}

/// [`Encoder`] that shells out to ffmpeg
pub struct FfmpegEncoder {
    ffmpeg_path: String,
    http: HttpClient,
}

impl FfmpegEncoder {
    /// Use the ffmpeg binary at `ffmpeg_path` (a bare name is looked up on `PATH`)
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            http: HttpClient::new(),
        }
    }

    async fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(source)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| YomiageError::encode_start(format!("synthesis request failed: {}", e)))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| YomiageError::encode_start(format!("synthesis body unreadable: {}", e)))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, source: &str, options: &EncodeOptions) -> Result<Box<dyn EncodeSession>> {
        if !options.raw_output {
            return Err(YomiageError::encode_start("only raw PCM output is supported"));
        }

        let body = self.fetch(source).await?;
        debug!(bytes = %body.len(), "Fetched synthesized audio");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(ffmpeg_args(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                YomiageError::encode_start(format!("failed to launch {}: {}", self.ffmpeg_path, e))
            })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(YomiageError::encode_start("ffmpeg pipes unavailable"));
            }
        };

        std::thread::spawn(move || {
            let mut stdin = stdin;
            // a broken pipe here means the session was truncated
            if let Err(e) = stdin.write_all(&body) {
                debug!(error = %e, "ffmpeg input closed early");
            }
        });

        let stats = Arc::new(Mutex::new(TranscodeStats::default()));
        {
            let stats = stats.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    match parse_progress_line(&line) {
                        Some(field) => apply_progress(&mut stats.lock(), field),
                        None if line.contains('=') => {}
                        None => warn!(line = %line, "ffmpeg"),
                    }
                }
            });
        }

        Ok(Box::new(FfmpegSession {
            child,
            output: Some(EncodedAudio {
                reader: Box::new(stdout),
                sample_rate: SAMPLE_RATE,
                channels: CHANNELS,
                bitrate_kbps: options.bitrate_kbps,
            }),
            stats,
            finished: false,
        }))
    }
}

struct FfmpegSession {
    child: Child,
    output: Option<EncodedAudio>,
    stats: Arc<Mutex<TranscodeStats>>,
    finished: bool,
}

impl EncodeSession for FfmpegSession {
    fn stats(&self) -> TranscodeStats {
        *self.stats.lock()
    }

    fn take_output(&mut self) -> Option<EncodedAudio> {
        self.output.take()
    }

    fn truncate(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.output = None;
        // already exited on a clean end of stream
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => debug!(status = %status, "ffmpeg stopped"),
            Err(e) => warn!(error = %e, "Failed to reap ffmpeg"),
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        self.truncate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(filter: &str) -> EncodeOptions {
        EncodeOptions {
            compression_level: 0,
            raw_output: true,
            bitrate_kbps: 120,
            audio_filter: filter.to_string(),
        }
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = ffmpeg_args(&options("atempo=1.500000"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-hide_banner -loglevel error -nostats -progress pipe:2 -i pipe:0"));
        assert!(joined.contains("-af atempo=1.500000"));
        assert!(joined.contains("-compression_level 0"));
        assert!(joined.contains("-b:a 120k"));
        assert!(joined.ends_with("-f f32le -ar 48000 -ac 2 pipe:1"));
    }

    #[test]
    fn test_ffmpeg_args_without_filter() {
        let args = ffmpeg_args(&options(""));
        assert!(!args.iter().any(|a| a == "-af"));
    }

    #[test]
    fn test_parse_progress_lines() {
        assert_eq!(
            parse_progress_line("out_time_us=2500000"),
            Some(ProgressField::Duration(Duration::from_millis(2500)))
        );
        assert_eq!(
            parse_progress_line("total_size=20480"),
            Some(ProgressField::SizeBytes(20480))
        );
        assert_eq!(
            parse_progress_line("bitrate= 128.5kbits/s"),
            Some(ProgressField::Bitrate(128.5))
        );
        assert_eq!(parse_progress_line("speed=1.52x"), Some(ProgressField::Speed(1.52)));
    }

    #[test]
    fn test_parse_progress_ignores_unknown_and_na() {
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("bitrate=N/A"), None);
        assert_eq!(parse_progress_line("speed=N/A"), None);
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("Invalid data found"), None);
    }

    #[test]
    fn test_apply_progress() {
        let mut stats = TranscodeStats::default();
        apply_progress(&mut stats, ProgressField::SizeBytes(4096));
        apply_progress(&mut stats, ProgressField::Speed(2.0));
        assert_eq!(stats.size_kb, 4);
        assert_eq!(stats.speed, 2.0);
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_to_start() {
        let encoder = FfmpegEncoder::new("ffmpeg");
        let err = match encoder.encode("http://127.0.0.1:9/tts", &options("atempo=1.0")).await {
            Err(e) => e,
            Ok(_) => panic!("encode should fail"),
        };
        assert!(matches!(err, YomiageError::EncodeStart(_)));
    }

    #[tokio::test]
    async fn test_container_output_rejected() {
        let encoder = FfmpegEncoder::new("ffmpeg");
        let mut opts = options("atempo=1.0");
        opts.raw_output = false;
        assert!(encoder.encode("http://127.0.0.1:9/tts", &opts).await.is_err());
    }
}
