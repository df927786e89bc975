//! Discord adaptor for yomiage
//!
//! Wires the core session to a serenity gateway client: inbound messages go
//! to the [`CommandRouter`], voice-state updates feed the voice-state tracker
//! and then the [`PresenceMonitor`], and voice goes through songbird.

use serenity::async_trait as serenity_async_trait;
use serenity::http::Http;
use serenity::model::channel::Message as DiscordMessage;
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::guild::Guild;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use songbird::serenity::SerenityInit;
use songbird::Songbird;
use std::sync::Arc;
use tracing::info;
use yomiage_core::{
    BotConfig, CommandPrefix, CommandRouter, InboundMessage, PresenceMonitor, Result,
    VoiceSession, YomiageError,
};

pub mod ffmpeg;
pub mod voice;

pub use ffmpeg::{ffmpeg_args, FfmpegEncoder};
pub use voice::{DiscordPlatform, DiscordVoiceConnection, VoiceStateMap};

/// Gateway settings
#[derive(Clone)]
pub struct DiscordConfig {
    /// Bot token
    pub token: String,
    /// Gateway intents
    pub intents: GatewayIntents,
}

impl DiscordConfig {
    /// Default intents for `token`: guild messages with content, and voice states
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            intents: GatewayIntents::GUILDS
                | GatewayIntents::GUILD_MESSAGES
                | GatewayIntents::MESSAGE_CONTENT
                | GatewayIntents::GUILD_VOICE_STATES,
        }
    }
}

struct Handler {
    router: CommandRouter,
    presence: PresenceMonitor,
    voice_states: VoiceStateMap,
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: DiscordMessage) {
        info!(
            channel_id = %msg.channel_id.get(),
            author = %msg.author.name,
            content = %msg.content,
            "Message received"
        );

        let inbound = InboundMessage {
            channel_id: msg.channel_id.get(),
            author_id: msg.author.id.get(),
            author_is_bot: msg.author.bot,
            content: msg.content,
        };
        self.router.handle_message(&inbound).await;
    }

    async fn ready(&self, _ctx: Context, data_about_bot: Ready) {
        let bot_id = data_about_bot.user.id.get();
        self.router.session().set_bot_user_id(bot_id);
        info!(
            user = %data_about_bot.user.name,
            user_id = %bot_id,
            guilds_count = %data_about_bot.guilds.len(),
            "Discord ready"
        );
    }

    /// Populate initial voice states when guild data is received
    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        let guild_id = guild.id.get();
        let occupants = guild.voice_states.iter().filter_map(|(user_id, state)| {
            state.channel_id.map(|cid| (user_id.get(), cid.get()))
        });
        self.voice_states.seed_guild(guild_id, occupants);
        info!(
            guild_id = %guild_id,
            guild_name = %guild.name,
            tracked_users = %self.voice_states.len(),
            "Voice states initialized from guild_create"
        );
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id.map(|g| g.get()) else {
            return;
        };
        let user_id = new.user_id.get();
        let channel_id = new.channel_id.map(|c| c.get());
        info!(
            guild_id = %guild_id,
            user_id = %user_id,
            old_channel = ?old.as_ref().and_then(|o| o.channel_id).map(|c| c.get()),
            new_channel = ?channel_id,
            "Voice state update"
        );
        self.voice_states.update(guild_id, user_id, channel_id);
        self.presence.on_occupancy_changed().await;
    }
}

/// Build a gateway client running the yomiage session described by `config`
///
/// The returned client is not started yet.
pub async fn build_client(config: BotConfig) -> Result<Client> {
    let discord = DiscordConfig::new(config.token.clone());
    let songbird = Songbird::serenity();
    let voice_states = VoiceStateMap::new();

    let platform = Arc::new(DiscordPlatform::new(
        Arc::new(Http::new(&discord.token)),
        songbird.clone(),
        voice_states.clone(),
        config.reply_prefix.clone(),
    ));
    let encoder = Arc::new(FfmpegEncoder::new(config.ffmpeg_path.clone()));
    let session = Arc::new(VoiceSession::new(platform, encoder, config.session)?);

    let handler = Handler {
        router: CommandRouter::new(session.clone(), CommandPrefix::parse(&config.prefix)),
        presence: PresenceMonitor::new(session),
        voice_states,
    };

    info!(prefix = %config.prefix, "Creating Discord client");
    Client::builder(&discord.token, discord.intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await
        .map_err(|e| YomiageError::messaging(format!("Err creating Discord client: {:?}", e)))
}
