//! Channel attach/detach lifecycle and how it follows the connection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client, connected_client, mock_transport, MockConnection, WAIT};
use rt_client::{
    codes, Channel, ChannelEvent, ChannelState, ConnectionState, ErrorInfo, FixedDelay, Message,
    ProtocolMessage,
};
use rt_protocol::{flags, Action};
use serde_json::json;

async fn wait_channel(channel: &Channel, state: ChannelState) {
    tokio::time::timeout(WAIT, channel.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for channel {state}"))
        .expect("client shut down");
}

/// Attach `channel` on `conn` and confirm it with serial `s1`.
async fn attach(channel: &Channel, conn: &mut MockConnection) {
    let done = channel.attach();
    let frame = conn.next_sent().await;
    assert_eq!(frame.action, Action::Attach);
    assert_eq!(frame.channel.as_deref(), Some(channel.name()));
    let mut attached = ProtocolMessage::attached(channel.name());
    attached.channel_serial = Some("s1".into());
    conn.deliver(attached);
    done.await.unwrap();
}

fn channel_error(name: &str, error: ErrorInfo) -> ProtocolMessage {
    let mut frame = ProtocolMessage::error(error);
    frame.channel = Some(name.into());
    frame
}

#[tokio::test(start_paused = true)]
async fn attach_and_receive_messages() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    let mut messages = chat.subscribe();

    attach(&chat, &mut conn).await;
    assert_eq!(chat.state(), ChannelState::Attached);
    assert_eq!(chat.serial().as_deref(), Some("s1"));

    let mut frame = ProtocolMessage::new(Action::Message);
    frame.channel = Some("chat".into());
    frame.id = Some("frame-9".into());
    frame.connection_id = Some("conn-other".into());
    frame.timestamp = Some(1_700_000_000_000);
    frame.channel_serial = Some("s2".into());
    frame.messages = vec![
        Message::new("greet", json!("hi")),
        Message::new("greet", json!("again")).with_id("explicit"),
    ];
    conn.deliver(frame);

    let first = tokio::time::timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(first.id.as_deref(), Some("frame-9:0"));
    assert_eq!(first.connection_id.as_deref(), Some("conn-other"));
    assert_eq!(first.timestamp, Some(1_700_000_000_000));
    let second = tokio::time::timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(second.id.as_deref(), Some("explicit"));
    assert_eq!(chat.serial().as_deref(), Some("s2"));
}

#[tokio::test(start_paused = true)]
async fn messages_for_an_unattached_channel_are_dropped() {
    let (factory, mut server) = mock_transport();
    let (client, conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    let mut messages = chat.subscribe();

    let mut frame = ProtocolMessage::publish("chat", vec![Message::new("x", json!(1))]);
    frame.action = Action::Message;
    conn.deliver(frame);
    // Round-trip through the worker so the frame has been processed.
    client.channel("other").detach().await.unwrap();
    assert!(messages.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn attach_on_a_fresh_client_connects_first() {
    let (factory, mut server) = mock_transport();
    let client = client(factory).auto_connect(false).build().unwrap();
    let chat = client.channel("chat");

    let done = chat.attach();
    let mut conn = server.accept().await;
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert!(conn.try_sent().is_none(), "attach must wait for connected");

    conn.connected("conn-1", "key-1");
    let frame = conn.next_sent().await;
    assert_eq!(frame.action, Action::Attach);
    conn.deliver(ProtocolMessage::attached("chat"));
    done.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn resumed_connection_reattaches_with_resume_flag() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;
    let mut changes = chat.on_state_change();

    conn.drop_connection(None);
    let mut next = server.accept().await;
    assert_eq!(chat.state(), ChannelState::Suspended);
    let suspended = changes.next().await.unwrap();
    assert_eq!(suspended.event, ChannelEvent::Suspended);

    next.connected("conn-1", "key-1");
    let frame = next.next_sent().await;
    assert_eq!(frame.action, Action::Attach);
    assert!(frame.has_flag(flags::ATTACH_RESUME));
    assert_eq!(frame.channel_serial.as_deref(), Some("s1"));

    next.deliver(ProtocolMessage::attached("chat").with_flag(flags::RESUMED));
    wait_channel(&chat, ChannelState::Attached).await;
    let attaching = changes.next().await.unwrap();
    assert_eq!(attaching.event, ChannelEvent::Attaching);
    let attached = changes.next().await.unwrap();
    assert_eq!(attached.event, ChannelEvent::Attached);
    assert!(attached.resumed);
}

#[tokio::test(start_paused = true)]
async fn fresh_connection_reattaches_without_resume_flag() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;

    conn.drop_connection(None);
    let mut next = server.accept().await;
    next.connected("conn-2", "key-2");
    let frame = next.next_sent().await;
    assert_eq!(frame.action, Action::Attach);
    assert!(!frame.has_flag(flags::ATTACH_RESUME));
}

#[tokio::test(start_paused = true)]
async fn attach_timeout_suspends_and_retries() {
    let (factory, mut server) = mock_transport();
    let builder = client(factory).channel_retry_delay(Arc::new(FixedDelay(Duration::from_secs(5))));
    let (client, mut conn) = connected_client(builder, &mut server).await;
    let chat = client.channel("chat");

    let done = chat.attach();
    assert_eq!(conn.next_sent().await.action, Action::Attach);
    let err = done.await.unwrap_err().error_info();
    assert_eq!(err.code, codes::CHANNEL_ATTACH_TIMEOUT);
    assert_eq!(chat.state(), ChannelState::Suspended);

    let started = tokio::time::Instant::now();
    let retry = conn.next_sent().await;
    assert_eq!(retry.action, Action::Attach);
    assert!(started.elapsed() >= Duration::from_secs(5));

    conn.deliver(ProtocolMessage::attached("chat"));
    wait_channel(&chat, ChannelState::Attached).await;
    assert_eq!(chat.error_reason(), None);
}

#[tokio::test(start_paused = true)]
async fn channel_error_fails_only_that_channel() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    let news = client.channel("news");
    attach(&chat, &mut conn).await;
    attach(&news, &mut conn).await;

    let denied = ErrorInfo::new(codes::OPERATION_NOT_PERMITTED, 401, "denied");
    conn.deliver(channel_error("chat", denied.clone()));
    wait_channel(&chat, ChannelState::Failed).await;
    assert_eq!(chat.error_reason(), Some(denied));
    assert_eq!(news.state(), ChannelState::Attached);
    assert_eq!(client.state(), ConnectionState::Connected);

    let err = chat
        .publish_one("n", json!(1))
        .unwrap()
        .await
        .unwrap_err()
        .error_info();
    assert_eq!(err.code, codes::CHANNEL_INVALID_STATE);
}

#[tokio::test(start_paused = true)]
async fn attach_denied_by_capability_fails_channel() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");

    let done = chat.attach();
    conn.next_sent().await;
    let denied = ErrorInfo::new(codes::OPERATION_NOT_PERMITTED, 401, "no subscribe capability");
    conn.deliver(ProtocolMessage::detached("chat").with_error(denied.clone()));

    let err = done.await.unwrap_err().error_info();
    assert_eq!(err, denied);
    assert_eq!(chat.state(), ChannelState::Failed);
}

#[tokio::test(start_paused = true)]
async fn connection_failure_fails_channels() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;

    let fatal = ErrorInfo::new(codes::BAD_REQUEST, 400, "protocol violation");
    conn.deliver(ProtocolMessage::error(fatal.clone()));
    wait_channel(&chat, ChannelState::Failed).await;
    assert_eq!(chat.error_reason(), Some(fatal));
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn detach_roundtrip() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;

    let done = chat.detach();
    let frame = conn.next_sent().await;
    assert_eq!(frame.action, Action::Detach);
    assert_eq!(chat.state(), ChannelState::Detaching);

    conn.deliver(ProtocolMessage::detached("chat"));
    done.await.unwrap();
    assert_eq!(chat.state(), ChannelState::Detached);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_detached_reattaches() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;

    let kicked = ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 500, "server restart");
    conn.deliver(ProtocolMessage::detached("chat").with_error(kicked.clone()));
    let frame = conn.next_sent().await;
    assert_eq!(frame.action, Action::Attach);
    assert_eq!(chat.state(), ChannelState::Attaching);
    assert_eq!(chat.error_reason(), Some(kicked));

    conn.deliver(ProtocolMessage::attached("chat"));
    wait_channel(&chat, ChannelState::Attached).await;
}

#[tokio::test(start_paused = true)]
async fn release_detaches_and_forgets_the_channel() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;
    assert_eq!(client.channel_names(), vec!["chat".to_string()]);

    client.release("chat");
    assert!(client.channel_names().is_empty());
    assert_eq!(conn.next_sent().await.action, Action::Detach);
    conn.deliver(ProtocolMessage::detached("chat"));
    wait_channel(&chat, ChannelState::Detached).await;

    let again = client.channel("chat");
    assert_eq!(again.state(), ChannelState::Initialized);
}

#[tokio::test(start_paused = true)]
async fn close_detaches_channels() {
    let (factory, mut server) = mock_transport();
    let (client, mut conn) = connected_client(client(factory), &mut server).await;
    let chat = client.channel("chat");
    attach(&chat, &mut conn).await;

    client.close();
    assert_eq!(conn.next_sent().await.action, Action::Close);
    conn.deliver(ProtocolMessage::new(Action::Closed));
    wait_channel(&chat, ChannelState::Detached).await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn attach_on_a_failed_connection_is_rejected() {
    let (factory, mut server) = mock_transport();
    let (client, conn) = connected_client(client(factory), &mut server).await;
    let fatal = ErrorInfo::new(codes::BAD_REQUEST, 400, "protocol violation");
    conn.deliver(ProtocolMessage::error(fatal.clone()));
    common::wait_for_state(&client, ConnectionState::Failed).await;

    let err = client.channel("chat").attach().await.unwrap_err().error_info();
    assert_eq!(err, fatal);
}
