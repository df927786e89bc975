//! Configuration management and environment variable loading

use crate::session::SessionConfig;
use crate::speech::SpeechConfig;
use crate::transcode::PipelineConfig;
use crate::{Result, YomiageError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix value that switches command matching to the bot's @mention
pub const MENTION_PREFIX: &str = "mention";

/// Load environment variables from a .env file
///
/// Returns the file that was loaded, or `None` when there is none. Only a
/// malformed file is an error.
pub fn load_env() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(dotenvy::Error::LineParse(line, pos)) => Err(YomiageError::config(format!(
            "Failed to parse .env file at line {}, position {}",
            line, pos
        ))),
        Err(dotenvy::Error::Io(_)) => Ok(None),
        Err(e) => Err(YomiageError::config(format!(
            "Failed to load .env file: {}",
            e
        ))),
    }
}

/// Get required environment variable
pub fn get_required_env(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            YomiageError::config(format!(
                "Required environment variable '{}' is not set. \
                 Check your .env file or system environment.",
                key
            ))
        })
}

/// Get optional environment variable with default
pub fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get environment variable as integer
pub fn get_env_int<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Get environment variable as float
pub fn get_env_float(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Process-wide bot configuration
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Secret bot token
    pub token: String,
    /// Command prefix, or [`MENTION_PREFIX`] to answer to @mentions
    pub prefix: String,
    /// Text put in front of every reply
    pub reply_prefix: String,
    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,
    /// Session behaviour
    pub session: SessionConfig,
}

impl BotConfig {
    /// Build the configuration from environment variables
    ///
    /// `DISCORD_TOKEN` wins over the legacy `TOKEN` variable.
    pub fn from_env() -> Result<Self> {
        let token = get_required_env("DISCORD_TOKEN").or_else(|_| get_required_env("TOKEN"))?;

        let speech_defaults = SpeechConfig::default();
        let speech = SpeechConfig {
            endpoint: get_env_or("YOMIAGE_TTS_ENDPOINT", &speech_defaults.endpoint),
            latin_language: get_env_or("YOMIAGE_LATIN_LANG", &speech_defaults.latin_language),
            default_language: get_env_or("YOMIAGE_DEFAULT_LANG", &speech_defaults.default_language),
            ..speech_defaults
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            bitrate_kbps: get_env_int("YOMIAGE_BITRATE_KBPS", pipeline_defaults.bitrate_kbps),
            progress_interval: Duration::from_millis(get_env_int(
                "YOMIAGE_PROGRESS_INTERVAL_MS",
                pipeline_defaults.progress_interval.as_millis() as u64,
            )),
            ..pipeline_defaults
        };

        let session_defaults = SessionConfig::default();
        let ignore_patterns = match env::var("YOMIAGE_IGNORE_PATTERNS") {
            Ok(raw) => parse_pattern_list(&raw),
            Err(_) => session_defaults.ignore_patterns.clone(),
        };
        let session = SessionConfig {
            ignore_prefix: get_env_or("YOMIAGE_IGNORE_PREFIX", &session_defaults.ignore_prefix),
            ignore_patterns,
            default_speed: get_env_float("YOMIAGE_DEFAULT_SPEED", session_defaults.default_speed),
            speech,
            pipeline,
        };
        session.validate()?;

        Ok(Self {
            token,
            prefix: get_env_or("YOMIAGE_PREFIX", MENTION_PREFIX),
            reply_prefix: get_env_or("YOMIAGE_REPLY_PREFIX", "[BOT] "),
            ffmpeg_path: get_env_or("YOMIAGE_FFMPEG", "ffmpeg"),
            session,
        })
    }
}

/// One regex per line, blank lines dropped
fn parse_pattern_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
