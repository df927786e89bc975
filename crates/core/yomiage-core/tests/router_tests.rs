use std::sync::Arc;
use yomiage_core::testing::{FakeEncoder, FakePlatform};
use yomiage_core::{
    Command, CommandPrefix, CommandRouter, InboundMessage, PresenceMonitor, SessionConfig,
    SessionStatus, VoiceSession, JOINED_MESSAGE, LEFT_MESSAGE,
};

const GUILD: u64 = 1;
const VOICE: u64 = 10;
const TEXT: u64 = 500;
const USER: u64 = 100;
const BOT: u64 = 999;

fn setup(prefix: &str) -> (Arc<FakePlatform>, Arc<FakeEncoder>, CommandRouter) {
    let platform = Arc::new(FakePlatform::new());
    let encoder = Arc::new(FakeEncoder::new());
    let session =
        VoiceSession::new(platform.clone(), encoder.clone(), SessionConfig::default()).unwrap();
    session.set_bot_user_id(BOT);
    platform.set_voice_state(GUILD, USER, VOICE);
    let router = CommandRouter::new(Arc::new(session), CommandPrefix::parse(prefix));
    (platform, encoder, router)
}

fn message(channel_id: u64, content: &str) -> InboundMessage {
    InboundMessage {
        channel_id,
        author_id: USER,
        author_is_bot: false,
        content: content.to_string(),
    }
}

#[tokio::test]
async fn test_join_and_double_join() {
    let (platform, _, router) = setup("yomi");

    assert_eq!(router.handle_message(&message(TEXT, "yomi join")).await, Some(Command::Join));
    assert_eq!(router.handle_message(&message(TEXT, "yomi join")).await, Some(Command::Join));

    assert_eq!(
        platform.messages_to(TEXT),
        vec![
            JOINED_MESSAGE.to_string(),
            "Bot is already in voice-chat.".to_string()
        ]
    );
    assert_eq!(platform.join_count(), 1);
}

#[tokio::test]
async fn test_join_from_user_outside_voice() {
    let (platform, _, router) = setup("yomi");
    platform.remove_voice_state(GUILD, USER);

    router.handle_message(&message(TEXT, "yomi join")).await;

    assert_eq!(
        platform.messages_to(TEXT),
        vec!["could not find user's voice state".to_string()]
    );
    assert_eq!(router.session().status().await, SessionStatus::Idle);
}

#[tokio::test]
async fn test_speed_commands() {
    let (platform, _, router) = setup("yomi");

    router.handle_message(&message(TEXT, "yomi speed 2.0")).await;
    router.handle_message(&message(TEXT, "yomi speed abc")).await;
    router.handle_message(&message(TEXT, "yomi speed 0.1")).await;

    assert_eq!(
        platform.messages_to(TEXT),
        vec![
            "Changed speed to 2".to_string(),
            "Speed must be a number.".to_string(),
            "Speed must be between 0.5 and 100.".to_string(),
        ]
    );
    assert_eq!(router.session().speed(), 2.0);
}

#[tokio::test]
async fn test_leave_when_idle_reports_error() {
    let (platform, _, router) = setup("yomi");

    router.handle_message(&message(TEXT, "yomi leave")).await;

    assert_eq!(
        platform.messages_to(TEXT),
        vec!["Bot is not in voice-chat.".to_string()]
    );
}

#[tokio::test]
async fn test_join_then_leave() {
    let (platform, _, router) = setup("yomi");

    router.handle_message(&message(TEXT, "yomi join")).await;
    router.handle_message(&message(TEXT, "yomi leave")).await;

    assert_eq!(
        platform.messages_to(TEXT),
        vec![JOINED_MESSAGE.to_string(), LEFT_MESSAGE.to_string()]
    );
    assert_eq!(router.session().status().await, SessionStatus::Idle);
}

#[tokio::test]
async fn test_connected_session_only_listens_to_its_channel() {
    let (platform, encoder, router) = setup("yomi");
    router.handle_message(&message(TEXT, "yomi join")).await;
    platform.last_connection().unwrap().set_auto_finish(Some(Ok(())));

    assert_eq!(router.handle_message(&message(TEXT + 1, "hello")).await, None);
    assert_eq!(router.handle_message(&message(TEXT + 1, "yomi leave")).await, None);
    assert_eq!(router.handle_message(&message(TEXT, ";yomi leave")).await, None);
    assert_eq!(router.session().status().await, SessionStatus::Connected);
    assert!(encoder.sources().is_empty());

    assert_eq!(router.handle_message(&message(TEXT, "hello")).await, Some(Command::Speak));
    assert_eq!(encoder.sources().len(), 1);
}

#[tokio::test]
async fn test_bot_messages_are_dropped() {
    let (platform, _, router) = setup("yomi");
    let mut msg = message(TEXT, "yomi join");
    msg.author_is_bot = true;

    assert_eq!(router.handle_message(&msg).await, None);

    let mut own = message(TEXT, "yomi join");
    own.author_id = BOT;
    assert_eq!(router.handle_message(&own).await, None);
    assert!(platform.sent_messages().is_empty());
}

#[tokio::test]
async fn test_mention_prefix() {
    let (platform, _, router) = setup("mention");

    router.handle_message(&message(TEXT, "<@999> join")).await;
    assert_eq!(platform.messages_to(TEXT), vec![JOINED_MESSAGE.to_string()]);

    router.handle_message(&message(TEXT, "<@999> speed 1.5")).await;
    assert_eq!(router.session().speed(), 1.5);
}

#[tokio::test]
async fn test_failed_speak_is_reported_to_channel() {
    let (platform, encoder, router) = setup("yomi");
    router.handle_message(&message(TEXT, "yomi join")).await;
    encoder.fail_next("connection refused");

    router.handle_message(&message(TEXT, "hello")).await;

    assert_eq!(
        platform.messages_to(TEXT).last().unwrap(),
        "Failed to start transcoding: connection refused"
    );
    assert_eq!(router.session().status().await, SessionStatus::Connected);
}

#[tokio::test]
async fn test_presence_monitor_leaves_empty_channel() {
    let (platform, _, router) = setup("yomi");
    let monitor = PresenceMonitor::new(router.session().clone());
    router.handle_message(&message(TEXT, "yomi join")).await;

    assert!(!monitor.on_occupancy_changed().await);

    platform.remove_voice_state(GUILD, USER);
    assert!(monitor.on_occupancy_changed().await);
    assert_eq!(router.session().status().await, SessionStatus::Idle);

    // nothing left to do on further updates
    assert!(!monitor.on_occupancy_changed().await);
}
