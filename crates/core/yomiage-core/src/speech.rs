//! Speech request building
//!
//! Turns chat text into a GET URL for the synthesis endpoint. The endpoint
//! answers with an audio byte stream that the transcode pipeline consumes.

use crate::{Result, YomiageError};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Synthesis endpoint settings
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Base URL of the synthesis endpoint
    pub endpoint: String,
    /// Language used when the text is plain ASCII letters, digits and punctuation
    pub latin_language: String,
    /// Language used for everything else
    pub default_language: String,
    /// Fixed `client` parameter expected by the endpoint
    pub client: String,
    /// Fixed `textlen` parameter expected by the endpoint
    pub text_len: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://translate.google.com/translate_tts".to_string(),
            latin_language: "en".to_string(),
            default_language: "ja".to_string(),
            client: "tw-ob".to_string(),
            text_len: 32,
        }
    }
}

fn latin_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9\s.,]+$").expect("static regex"))
}

/// A built synthesis request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    /// Text to be spoken
    pub text: String,
    /// Language code sent to the endpoint
    pub language: String,
    /// Full request URL
    pub url: Url,
}

/// Builds synthesis requests; holds only immutable settings
#[derive(Debug, Clone)]
pub struct SpeechRequestBuilder {
    config: SpeechConfig,
    endpoint: Url,
}

impl SpeechRequestBuilder {
    /// Create a builder for the given endpoint settings
    pub fn new(config: SpeechConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            YomiageError::config(format!("invalid synthesis endpoint '{}': {}", config.endpoint, e))
        })?;
        Ok(Self { config, endpoint })
    }

    /// Pick the language code for `text`
    pub fn detect_language(&self, text: &str) -> &str {
        if latin_pattern().is_match(text) {
            &self.config.latin_language
        } else {
            &self.config.default_language
        }
    }

    /// Build the synthesis URL for `text` in `language`
    ///
    /// The text is form-encoded, so spaces become `+`.
    pub fn build_url(&self, text: &str, language: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("ie", "UTF-8")
            .append_pair("textlen", &self.config.text_len.to_string())
            .append_pair("client", &self.config.client)
            .append_pair("q", text)
            .append_pair("tl", language);
        url
    }

    /// Detect the language and build the request in one step
    pub fn build(&self, text: &str) -> SpeechRequest {
        let language = self.detect_language(text).to_string();
        let url = self.build_url(text, &language);
        SpeechRequest {
            text: text.to_string(),
            language,
            url,
        }
    }
}
