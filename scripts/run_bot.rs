use clap::Parser;
use tracing::{debug, error, info};
use yomiage_adaptor_discord::build_client;
use yomiage_core::utils::logger::init_logging_with_level;
use yomiage_core::{load_env, BotConfig};

#[derive(Parser, Debug)]
#[command(name = "run-bot", about = "Read text-channel messages aloud in Discord voice")]
struct Cli {
    /// Command prefix; `mention` answers to @mentions of the bot
    #[arg(long, env = "YOMIAGE_PREFIX")]
    prefix: Option<String>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "YOMIAGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> yomiage_core::Result<()> {
    // .env first so clap's env fallbacks see its values
    let env_file = load_env()?;
    let cli = Cli::parse();
    init_logging_with_level(Some(&cli.log_level));
    match env_file {
        Some(path) => info!("Loaded environment from: {}", path.display()),
        None => debug!("No .env file found - using system environment variables only"),
    }

    let mut config = BotConfig::from_env()?;
    if let Some(prefix) = cli.prefix {
        config.prefix = prefix;
    }

    let mut client = build_client(config).await?;
    let shard_manager = client.shard_manager.clone();

    let gateway = tokio::spawn(async move {
        if let Err(why) = client.start().await {
            error!(error = %format!("{:?}", why), "Discord client error");
        }
    });
    info!("Bot is running. Press Ctrl-C to exit.");

    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = async {
            if let Some(ref mut s) = term { s.recv().await; }
        } => {},
    }

    info!("Shutting down");
    shard_manager.shutdown_all().await;
    if let Err(e) = gateway.await {
        error!(error = %e, "Gateway task panicked");
    }
    Ok(())
}
