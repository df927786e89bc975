//! Command router
//!
//! Maps inbound chat messages onto session operations and reports failures
//! back to the channel the message came from.

use crate::config::MENTION_PREFIX;
use crate::platform::InboundMessage;
use crate::session::{SpeakOutcome, VoiceSession};
use crate::YomiageError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How commands are addressed to the bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPrefix {
    /// Commands start with an @mention of the bot
    Mention,
    /// Commands start with a fixed word
    Literal(String),
}

impl CommandPrefix {
    /// Interpret a configured prefix; `mention` selects [`CommandPrefix::Mention`]
    pub fn parse(raw: &str) -> Self {
        if raw == MENTION_PREFIX {
            CommandPrefix::Mention
        } else {
            CommandPrefix::Literal(raw.to_string())
        }
    }

    /// Render the prefix as it appears in message text
    ///
    /// A mention prefix has no rendering until the bot identity is known.
    pub fn render(&self, bot_user_id: Option<u64>) -> Option<String> {
        match self {
            CommandPrefix::Literal(word) => Some(word.clone()),
            CommandPrefix::Mention => bot_user_id.map(|id| format!("<@{}>", id)),
        }
    }
}

/// A parsed inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `<prefix> join`
    Join,
    /// `<prefix> leave`
    Leave,
    /// `<prefix> speed <value>`, carrying the raw value
    Speed(String),
    /// Anything else; a candidate for reading aloud
    Speak,
}

/// Routes messages to a [`VoiceSession`]
pub struct CommandRouter {
    session: Arc<VoiceSession>,
    prefix: CommandPrefix,
}

impl CommandRouter {
    /// Create a router for `session`
    pub fn new(session: Arc<VoiceSession>, prefix: CommandPrefix) -> Self {
        Self { session, prefix }
    }

    /// The routed session
    pub fn session(&self) -> &Arc<VoiceSession> {
        &self.session
    }

    /// Configured prefix
    pub fn prefix(&self) -> &CommandPrefix {
        &self.prefix
    }

    /// Classify `content`
    pub fn parse_command(&self, content: &str) -> Command {
        let Some(name) = self.prefix.render(self.session.bot_user_id()) else {
            return Command::Speak;
        };

        let is = |cmd: &str| content.starts_with(&format!("{} {}", name, cmd));
        if is("join") {
            Command::Join
        } else if is("leave") {
            Command::Leave
        } else if is("speed") {
            let arg = content
                .strip_prefix(&format!("{} speed ", name))
                .unwrap_or(content);
            Command::Speed(arg.to_string())
        } else {
            Command::Speak
        }
    }

    /// Handle one inbound message
    ///
    /// Returns the command that was dispatched, or `None` when the message
    /// was dropped before dispatch. Errors are logged and sent back to the
    /// message's channel rather than returned.
    pub async fn handle_message(&self, message: &InboundMessage) -> Option<Command> {
        if message.author_is_bot || self.session.bot_user_id() == Some(message.author_id) {
            return None;
        }

        let command = self.parse_command(&message.content);

        if command == Command::Join {
            if let Err(e) = self.session.join(message.author_id, message.channel_id).await {
                self.report(message.channel_id, e).await;
            }
            return Some(command);
        }

        if let Some(text_channel_id) = self.session.text_channel_id().await {
            if text_channel_id != message.channel_id {
                return None;
            }
        }
        if self.session.is_ignore_marked(&message.content) {
            debug!(channel_id = %message.channel_id, "Message carries the ignore marker");
            return None;
        }

        match &command {
            Command::Join => {}
            Command::Leave => {
                if let Err(e) = self.session.leave().await {
                    self.report(message.channel_id, e).await;
                }
            }
            Command::Speed(raw) => match self.session.set_speed_text(raw) {
                Ok(speed) => {
                    self.session
                        .notify(message.channel_id, &format!("Changed speed to {}", speed))
                        .await;
                }
                Err(e) => self.report(message.channel_id, e).await,
            },
            Command::Speak => match self.session.speak(message).await {
                Ok(SpeakOutcome::Played(state)) => {
                    debug!(channel_id = %message.channel_id, state = ?state, "Message read aloud");
                }
                Ok(_) => {}
                Err(e) => self.report(message.channel_id, e).await,
            },
        }
        Some(command)
    }

    async fn report(&self, channel_id: u64, error: YomiageError) {
        if error.is_user_error() {
            info!(channel_id = %channel_id, error = %error, "Command rejected");
        } else {
            warn!(channel_id = %channel_id, error = %error, "Command failed");
        }
        self.session.notify(channel_id, &error.to_string()).await;
    }
}
