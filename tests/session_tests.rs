// Session resolution and ChatSession flow tests

mod common;
use common::{chat, message, setup_logging, test_config, wait_for, MockApi, LOCAL_USER, PEER_USER};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use tripchat::error::ChatError;
use tripchat::models::{ChatContext, ConnectionState, DeliveryStatus};
use tripchat::sync::events;
use tripchat::sync::memory::{loopback_responder, MemoryTransport};
use tripchat::sync::session::SessionResolver;
use tripchat::sync::ChatSession;

fn connected_transport() -> Arc<MemoryTransport> {
    let transport = MemoryTransport::new();
    transport.complete_handshake();
    transport.set_responder(loopback_responder(LOCAL_USER));
    transport
}

fn event_names(transport: &MemoryTransport) -> Vec<String> {
    transport.emitted().into_iter().map(|(name, _)| name).collect()
}

//------------------------------------------------------------------------------
// RESOLVER
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_resolve_existing_and_missing_chat() {
    setup_logging();
    let api = MockApi::new();
    let booking = ChatContext::new("booking", "b1");
    api.add_chat(chat("c1", &booking, &[LOCAL_USER, PEER_USER]));
    let resolver = SessionResolver::new(api, connected_transport(), Duration::from_millis(300));

    let resolved = resolver.resolve(&booking).await.unwrap().unwrap();
    assert_eq!(resolved.chat_id, "c1");
    assert_eq!(resolved.participants.len(), 2);

    let missing = resolver.resolve(&ChatContext::new("quote", "q404")).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_join_and_leave() {
    setup_logging();
    let transport = connected_transport();
    let resolver = SessionResolver::new(MockApi::new(), transport.clone(), Duration::from_millis(300));

    assert!(!resolver.join(None).await.unwrap());
    assert!(transport.emitted().is_empty());

    assert!(resolver.join(Some("c1")).await.unwrap());
    assert!(resolver.join(Some("c1")).await.unwrap());
    assert_eq!(resolver.joined_chat().as_deref(), Some("c1"));
    assert_eq!(event_names(&transport), vec![events::JOIN_CHAT]);

    // Switching rooms leaves the previous one first.
    assert!(resolver.join(Some("c2")).await.unwrap());
    assert_eq!(
        event_names(&transport),
        vec![events::JOIN_CHAT, events::LEAVE_CHAT, events::JOIN_CHAT]
    );
    assert_eq!(transport.emitted_named(events::LEAVE_CHAT)[0]["chatId"], "c1");

    assert!(resolver.leave().await.unwrap());
    assert!(!resolver.leave().await.unwrap());
    assert_eq!(resolver.joined_chat(), None);
}

#[tokio::test]
async fn test_rejected_join() {
    setup_logging();
    let transport = connected_transport();
    transport.set_responder(Box::new(|_: &str, payload: &Value| {
        vec![(
            events::ERROR.to_string(),
            json!({ "requestId": payload["requestId"], "message": "not a participant" }),
        )]
    }));
    let resolver = SessionResolver::new(MockApi::new(), transport, Duration::from_millis(300));

    let err = resolver.join(Some("c9")).await.unwrap_err();
    assert_eq!(err, ChatError::socket(events::JOIN_CHAT, "not a participant"));
    assert_eq!(resolver.joined_chat(), None);
}

//------------------------------------------------------------------------------
// CHAT SESSION
//------------------------------------------------------------------------------

#[tokio::test]
async fn test_open_joins_loads_and_marks_read() {
    setup_logging();
    let api = MockApi::new();
    let booking = ChatContext::new("booking", "b1");
    api.add_chat(chat("c1", &booking, &[LOCAL_USER, PEER_USER]));
    api.set_history("c1", vec![message("p1", "c1", PEER_USER, DeliveryStatus::Sent, 1)]);
    let transport = connected_transport();

    let (session, _events) = ChatSession::new(test_config(LOCAL_USER), api, transport.clone());
    session.connect();
    assert!(session.connection().is_connected());

    let opened = session.open(booking).await.unwrap().unwrap();
    assert_eq!(opened.chat_id, "c1");
    assert_eq!(session.resolver().joined_chat().as_deref(), Some("c1"));
    assert_eq!(session.engine().messages().len(), 1);

    assert!(wait_for(|| session.engine().is_acknowledged("p1")).await);
    assert_eq!(transport.emitted_named(events::MARK_AS_READ).len(), 1);
    // Our read never changes the peer's status.
    assert_eq!(session.engine().messages()[0].delivery_status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn test_first_message_joins_created_chat() {
    setup_logging();
    let api = MockApi::new();
    let quote = ChatContext::new("quote", "q1");
    let transport = connected_transport();

    let (session, _events) = ChatSession::new(test_config(LOCAL_USER), api.clone(), transport.clone());
    session.connect();
    assert!(session.open(quote.clone()).await.unwrap().is_none());
    assert!(transport.emitted_named(events::JOIN_CHAT).is_empty());

    // The loopback server creates `chat-q1` on the first send.
    api.add_chat(chat("chat-q1", &quote, &[LOCAL_USER, PEER_USER]));
    let sent = session.send("Is a child seat available?").await.unwrap();

    assert_eq!(sent.chat_id.as_deref(), Some("chat-q1"));
    assert_eq!(session.engine().chat_id().as_deref(), Some("chat-q1"));
    assert_eq!(session.resolver().joined_chat().as_deref(), Some("chat-q1"));
    assert_eq!(transport.emitted_named(events::JOIN_CHAT)[0]["chatId"], "chat-q1");
    assert_eq!(session.chat_unread(), Some(0));

    // Later messages address the chat directly.
    session.send("Thanks").await.unwrap();
    let sends = transport.emitted_named(events::SEND_MESSAGE);
    assert_eq!(sends[1]["chatId"], "chat-q1");
    assert_eq!(session.engine().messages().len(), 2);
}

#[tokio::test]
async fn test_reconnect_rejoins_and_resyncs() {
    setup_logging();
    let api = MockApi::new();
    let booking = ChatContext::new("booking", "b1");
    api.add_chat(chat("c1", &booking, &[LOCAL_USER, PEER_USER]));
    api.set_history("c1", vec![message("m1", "c1", LOCAL_USER, DeliveryStatus::Sent, 1)]);
    let transport = connected_transport();

    let (session, _events) = ChatSession::new(test_config(LOCAL_USER), api.clone(), transport.clone());
    session.connect();
    session.open(booking).await.unwrap();
    assert_eq!(transport.emitted_named(events::JOIN_CHAT).len(), 1);

    transport.drop_connection("network lost");
    assert_eq!(session.connection().state(), ConnectionState::Disconnected);
    assert!(wait_for(|| session.resolver().joined_chat().is_none()).await);

    // Sent while we were away; the push is lost.
    api.set_history(
        "c1",
        vec![
            message("m1", "c1", LOCAL_USER, DeliveryStatus::Delivered, 1),
            message("m2", "c1", PEER_USER, DeliveryStatus::Sent, 2),
        ],
    );
    assert!(!transport.deliver(events::USER_ONLINE, json!({ "userId": PEER_USER })));

    assert!(session.connection().reconnect());
    assert!(wait_for(|| session.engine().messages().len() == 2).await);
    assert!(wait_for(|| transport.emitted_named(events::JOIN_CHAT).len() == 2).await);
    assert_eq!(session.engine().messages()[0].delivery_status, DeliveryStatus::Delivered);
    assert_eq!(session.resolver().joined_chat().as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_logout_tears_everything_down() {
    setup_logging();
    let api = MockApi::new();
    let booking = ChatContext::new("booking", "b1");
    api.add_chat(chat("c1", &booking, &[LOCAL_USER, PEER_USER]));
    let transport = connected_transport();

    let (session, _events) = ChatSession::new(test_config(LOCAL_USER), api, transport.clone());
    session.connect();
    session.open(booking).await.unwrap();

    session.logout().await;
    assert_eq!(transport.emitted_named(events::LEAVE_CHAT).len(), 1);
    assert_eq!(session.connection().state(), ConnectionState::Disconnected);
    assert_eq!(session.engine().context(), None);
    assert_eq!(transport.listener_count(events::MESSAGE_SENT), 0);
    assert_eq!(transport.listener_count(events::UNREAD_COUNT_UPDATED), 0);

    // A late handshake from the torn-down attempt changes nothing.
    assert!(!transport.complete_handshake());
    assert_eq!(session.connection().state(), ConnectionState::Disconnected);

    session.logout().await;
}

#[tokio::test]
async fn test_login_again_after_logout() {
    setup_logging();
    let api = MockApi::new();
    let booking = ChatContext::new("booking", "b1");
    api.add_chat(chat("c1", &booking, &[LOCAL_USER, PEER_USER]));
    let transport = connected_transport();

    let (session, _events) = ChatSession::new(test_config(LOCAL_USER), api, transport.clone());
    session.connect();
    session.logout().await;
    assert_eq!(transport.listener_count(events::UNREAD_COUNT_UPDATED), 0);

    session.connect();
    assert!(session.connection().is_connected());
    assert_eq!(transport.listener_count(events::UNREAD_COUNT_UPDATED), 1);

    transport.deliver(events::UNREAD_COUNT_UPDATED, json!({ "unreadCount": 7 }));
    assert_eq!(session.global_unread().count(), 7);

    session.open(booking).await.unwrap();
    assert_eq!(session.resolver().joined_chat().as_deref(), Some("c1"));
}
