//! Notification, like, connection and conversation feeds.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bazaar_client::{
    ChangeEvent, ErrorClass, EventClass, Filter, InjectedFailure, MemoryBackend, Operation,
    QueryClient, Scope, Select,
};
use bazaar_feeds::{
    ConnectionFeed, ConnectionStatus, ConversationFeed, FeedError, LikeFeed, Notification,
    NotificationFeed, TableWatcher, is_provisional,
};
use bazaar_sync::{FeedHealth, FeedOrder};
use common::{context, live, row, settle, ts, until};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn seed_notification(backend: &MemoryBackend, id: &str, user: &str, secs: i64, read: bool) {
    backend.insert_row(
        "notifications",
        row(json!({
            "id": id,
            "user_id": user,
            "kind": "like",
            "actor_id": "bob",
            "created_at": ts(secs),
            "read_at": if read { json!(ts(secs + 1)) } else { Value::Null },
        })),
    );
}

#[tokio::test(start_paused = true)]
async fn test_notification_unread_count_follows_snapshot() {
    let backend = MemoryBackend::new();
    seed_notification(&backend, "n1", "alice", 0, true);
    seed_notification(&backend, "n2", "alice", 1, false);
    seed_notification(&backend, "n3", "alice", 2, false);
    seed_notification(&backend, "n4", "bob", 3, false);

    let feed = NotificationFeed::open(context(&backend), "alice").await.unwrap();
    live(feed.health()).await;
    let ids: Vec<String> = feed.notifications().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec!["n3", "n2", "n1"]);
    assert_eq!(feed.unread_count(), 2);

    backend
        .insert(
            "notifications",
            row(json!({"user_id": "alice", "kind": "comment", "read_at": null})),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(feed.notifications().len(), 4);
    assert_eq!(feed.unread_count(), 3);

    assert!(feed.mark_read("n2").await.unwrap().unwrap().is_confirmed());
    assert_eq!(feed.unread_count(), 2);
    assert!(feed.mark_read("n2").await.unwrap().is_none());

    assert!(feed.mark_all_read().await.unwrap().unwrap().is_confirmed());
    settle().await;
    assert_eq!(feed.unread_count(), 0);
    assert!(
        backend
            .rows("notifications")
            .iter()
            .filter(|r| r["user_id"] == "alice")
            .all(|r| !r["read_at"].is_null())
    );
    assert!(backend.row("notifications", "n4").unwrap()["read_at"].is_null());
}

#[tokio::test(start_paused = true)]
async fn test_failed_dismiss_restores_notification() {
    let backend = MemoryBackend::new();
    seed_notification(&backend, "n1", "alice", 0, false);
    seed_notification(&backend, "n2", "alice", 1, false);
    let ctx = context(&backend);
    let feed = NotificationFeed::open(ctx.clone(), "alice").await.unwrap();
    live(feed.health()).await;

    backend.fail_next(Operation::Delete, InjectedFailure::Transient);
    let outcome = feed.dismiss("n1").await.unwrap();
    assert!(!outcome.is_confirmed());
    assert_eq!(feed.notifications().len(), 2);
    assert_eq!(ctx.notices().len(), 1);

    assert!(feed.dismiss("n1").await.unwrap().is_confirmed());
    settle().await;
    assert!(feed.get("n1").is_none());
    assert!(backend.row("notifications", "n1").is_none());
    assert_eq!(feed.unread_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_pending_mark_read() {
    let backend = MemoryBackend::new();
    seed_notification(&backend, "n1", "alice", 0, false);
    seed_notification(&backend, "n2", "alice", 1, false);
    let feed = Arc::new(NotificationFeed::open(context(&backend), "alice").await.unwrap());
    live(feed.health()).await;

    backend.set_command_latency(Duration::from_millis(200));
    let mark = tokio::spawn({
        let feed = Arc::clone(&feed);
        async move { feed.mark_read("n1").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(feed.get("n1").unwrap().is_read());

    // The server has not applied the update yet when the page is reloaded.
    backend.set_command_latency(Duration::ZERO);
    feed.refresh().await.unwrap();
    assert!(feed.get("n1").unwrap().is_read());
    assert_eq!(feed.unread_count(), 1);

    let outcome = mark.await.unwrap().unwrap().unwrap();
    assert!(outcome.is_confirmed());
    assert!(feed.get("n1").unwrap().is_read());
    assert_eq!(feed.unread_count(), 1);
}

fn seed_post(backend: &MemoryBackend, id: &str, likes: i64, secs: i64) {
    backend.insert_row(
        "posts",
        row(json!({
            "id": id,
            "author_id": "carol",
            "body": "post",
            "likes_count": likes,
            "created_at": ts(secs),
        })),
    );
}

#[tokio::test(start_paused = true)]
async fn test_like_push_before_response_counts_once() {
    let backend = MemoryBackend::new();
    seed_post(&backend, "p1", 3, 0);
    let feed = Arc::new(LikeFeed::new(context(&backend), "alice"));
    feed.watch(["p1"]).await.unwrap();
    live(feed.health()).await;
    assert_eq!(feed.likes("p1").unwrap().likes_count, 3);

    backend.set_command_latency(Duration::from_millis(200));
    let toggle = tokio::spawn({
        let feed = Arc::clone(&feed);
        async move { feed.toggle_like("p1").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let liked = feed.likes("p1").unwrap();
    assert_eq!((liked.likes_count, liked.is_liked), (4, true));

    // The server's own count for this like arrives before the response.
    backend.emit(ChangeEvent::update(
        "posts",
        row(json!({"id": "p1", "likes_count": 4})),
    ));
    settle().await;
    assert_eq!(feed.likes("p1").unwrap().likes_count, 4);

    let outcome = toggle.await.unwrap().unwrap();
    assert!(outcome.is_confirmed());
    let liked = feed.likes("p1").unwrap();
    assert_eq!((liked.likes_count, liked.is_liked), (4, true));
    assert_eq!(backend.rows("likes").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_denied_like_reverts() {
    let backend = MemoryBackend::new();
    seed_post(&backend, "p1", 3, 0);
    let ctx = context(&backend);
    let feed = LikeFeed::new(ctx.clone(), "alice");
    feed.watch(["p1"]).await.unwrap();

    backend.fail_next(Operation::Insert, InjectedFailure::Denied);
    let outcome = feed.toggle_like("p1").await.unwrap();
    assert!(!outcome.is_confirmed());

    let likes = feed.likes("p1").unwrap();
    assert_eq!((likes.likes_count, likes.is_liked), (3, false));
    let notices = ctx.notices().notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].action, "like post");
    assert_eq!(notices[0].class, ErrorClass::AuthorizationDenied);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_like_is_not_a_failure() {
    let backend = MemoryBackend::new();
    seed_post(&backend, "p1", 3, 0);
    let ctx = context(&backend);
    let feed = LikeFeed::new(ctx.clone(), "alice");
    feed.watch(["p1"]).await.unwrap();

    backend.fail_next(Operation::Insert, InjectedFailure::Conflict);
    assert!(feed.toggle_like("p1").await.unwrap().is_confirmed());
    assert!(feed.likes("p1").unwrap().is_liked);
    assert!(ctx.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_watch_replaces_scope_and_reads_own_likes() {
    let backend = MemoryBackend::new();
    seed_post(&backend, "p1", 3, 0);
    seed_post(&backend, "p2", 7, 1);
    seed_post(&backend, "p3", 1, 2);
    backend.insert_row("likes", row(json!({"id": "l1", "post_id": "p2", "user_id": "alice"})));
    let feed = LikeFeed::new(context(&backend), "alice");

    feed.watch(["p2", "p1", "p2"]).await.unwrap();
    live(feed.health()).await;
    assert_eq!(feed.watched(), vec!["p1", "p2"]);
    assert!(feed.likes("p2").unwrap().is_liked);
    assert!(!feed.likes("p1").unwrap().is_liked);
    let subscribes = backend.subscribe_count();

    feed.watch(["p1", "p2"]).await.unwrap();
    assert_eq!(backend.subscribe_count(), subscribes);

    feed.watch(["p3"]).await.unwrap();
    live(feed.health()).await;
    assert!(feed.likes("p1").is_none());
    assert_eq!(feed.likes("p3").unwrap().likes_count, 1);

    backend.emit(ChangeEvent::update("posts", row(json!({"id": "p1", "likes_count": 9}))));
    backend.emit(ChangeEvent::update("posts", row(json!({"id": "p3", "likes_count": 2}))));
    settle().await;
    assert!(feed.likes("p1").is_none());
    assert_eq!(feed.likes("p3").unwrap().likes_count, 2);

    assert!(matches!(
        feed.toggle_like("p1").await.unwrap_err(),
        FeedError::NotInFeed(_)
    ));
}

fn seed_request(backend: &MemoryBackend, id: &str, from: &str, to: &str, status: &str) {
    backend.insert_row(
        "connections",
        row(json!({
            "id": id,
            "requester_id": from,
            "addressee_id": to,
            "status": status,
            "created_at": ts(0),
        })),
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_requests_lifecycle() {
    let backend = MemoryBackend::new();
    seed_request(&backend, "r1", "bob", "alice", "pending");
    seed_request(&backend, "r2", "dave", "erin", "pending");
    let feed = ConnectionFeed::open(context(&backend), "alice").await.unwrap();
    until(|| feed.health() == FeedHealth::Live).await;

    assert_eq!(feed.requests().len(), 1);
    assert_eq!(feed.incoming_pending().len(), 1);
    assert_eq!(feed.status_with("bob"), Some(ConnectionStatus::Pending));

    assert!(feed.respond("r1", true).await.unwrap().is_confirmed());
    assert_eq!(feed.status_with("bob"), Some(ConnectionStatus::Accepted));
    assert_eq!(backend.row("connections", "r1").unwrap()["status"], "accepted");
    assert!(matches!(
        feed.connect("bob").await.unwrap_err(),
        FeedError::Validation(_)
    ));

    let outcome = feed.connect("carol").await.unwrap();
    assert!(outcome.is_confirmed());
    settle().await;
    let outgoing = feed.outgoing_pending();
    assert_eq!(outgoing.len(), 1);
    assert!(!is_provisional(&outgoing[0].id));
    assert_eq!(outgoing[0].addressee_id, "carol");
    assert!(matches!(
        feed.connect("carol").await.unwrap_err(),
        FeedError::Validation(_)
    ));

    let request_id = outgoing[0].id.clone();
    assert!(feed.cancel_connect(&request_id).await.unwrap().is_confirmed());
    settle().await;
    assert_eq!(feed.status_with("carol"), None);
    assert!(backend.row("connections", &request_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connection_guards() {
    let backend = MemoryBackend::new();
    seed_request(&backend, "r1", "alice", "bob", "pending");
    let feed = ConnectionFeed::open(context(&backend), "alice").await.unwrap();

    assert!(matches!(
        feed.connect("alice").await.unwrap_err(),
        FeedError::Validation(_)
    ));
    // Only the addressee may answer.
    assert!(matches!(
        feed.respond("r1", true).await.unwrap_err(),
        FeedError::Validation(_)
    ));
    assert!(matches!(
        feed.cancel_connect("missing").await.unwrap_err(),
        FeedError::NotInFeed(_)
    ));
    assert_eq!(backend.call_count(Operation::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn test_incoming_request_is_pushed() {
    let backend = MemoryBackend::new();
    let feed = ConnectionFeed::open(context(&backend), "alice").await.unwrap();
    until(|| feed.health() == FeedHealth::Live).await;

    backend
        .insert(
            "connections",
            row(json!({"requester_id": "bob", "addressee_id": "alice", "status": "pending"})),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(feed.incoming_pending().len(), 1);
    assert!(feed.outgoing_pending().is_empty());
}

fn serve_conversations(backend: &MemoryBackend) {
    let source = backend.clone();
    backend.register_procedure("get_conversations", move |_args| {
        Ok(Value::Array(
            source
                .rows("conversations")
                .into_iter()
                .map(Value::Object)
                .collect(),
        ))
    });
}

fn seed_conversation(backend: &MemoryBackend, id: &str, other: &str, secs: i64) {
    backend.insert_row(
        "conversations",
        row(json!({
            "id": id,
            "other_user_id": other,
            "last_message": "earlier",
            "last_message_at": ts(secs),
            "unread_count": 0,
        })),
    );
}

#[tokio::test(start_paused = true)]
async fn test_conversation_list_follows_new_messages() {
    let backend = MemoryBackend::new();
    serve_conversations(&backend);
    seed_conversation(&backend, "c1", "bob", 0);
    seed_conversation(&backend, "c2", "carol", 10);
    let feed = ConversationFeed::open(context(&backend), "alice").await.unwrap();
    live(feed.health()).await;

    let order: Vec<String> = feed.conversations().into_iter().map(|c| c.id).collect();
    assert_eq!(order, vec!["c2", "c1"]);

    backend
        .insert(
            "messages",
            row(json!({"conversation_id": "c1", "sender_id": "bob", "body": "hey"})),
        )
        .await
        .unwrap();
    backend
        .insert(
            "messages",
            row(json!({"conversation_id": "c1", "sender_id": "alice", "body": "hi bob"})),
        )
        .await
        .unwrap();
    settle().await;

    let conversations = feed.conversations();
    assert_eq!(conversations[0].id, "c1");
    assert_eq!(conversations[0].last_message.as_deref(), Some("hi bob"));
    assert_eq!(conversations[0].unread_count, 1);
    assert_eq!(feed.total_unread(), 1);

    assert!(feed.mark_seen("c1"));
    assert_eq!(feed.total_unread(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_conversation_counts_each_message_once() {
    let backend = MemoryBackend::new();
    serve_conversations(&backend);
    backend.insert_row(
        "conversations",
        row(json!({
            "id": "c1",
            "other_user_id": "bob",
            "last_message": "already counted",
            "last_message_at": ts(10),
            "unread_count": 1,
        })),
    );
    let feed = ConversationFeed::open(context(&backend), "alice").await.unwrap();
    live(feed.health()).await;

    // Realtime lags the query: this message is already in the reloaded count.
    backend.emit(ChangeEvent::insert(
        "messages",
        row(json!({
            "id": "m0",
            "conversation_id": "c1",
            "sender_id": "bob",
            "body": "already counted",
            "created_at": ts(10),
        })),
    ));
    settle().await;
    assert_eq!(feed.total_unread(), 1);

    let fresh = ChangeEvent::insert(
        "messages",
        row(json!({
            "id": "m1",
            "conversation_id": "c1",
            "sender_id": "bob",
            "body": "new",
            "created_at": ts(20),
        })),
    );
    backend.emit(fresh.clone());
    backend.emit(fresh);
    settle().await;

    let conversation = feed.get("c1").unwrap();
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(conversation.last_message.as_deref(), Some("new"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_conversation_triggers_reload() {
    let backend = MemoryBackend::new();
    serve_conversations(&backend);
    seed_conversation(&backend, "c1", "bob", 0);
    let feed = ConversationFeed::open(context(&backend), "alice").await.unwrap();
    live(feed.health()).await;
    assert_eq!(feed.conversations().len(), 1);

    seed_conversation(&backend, "c9", "zoe", 5);
    backend
        .insert(
            "messages",
            row(json!({"conversation_id": "c9", "sender_id": "zoe", "body": "new here"})),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(feed.conversations().len(), 2);
    assert!(feed.get("c9").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_conversation_procedure_must_return_list() {
    let backend = MemoryBackend::new();
    backend.register_procedure("get_conversations", |_args| Ok(json!({"oops": true})));

    let err = ConversationFeed::open(context(&backend), "alice")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FeedError::UnexpectedResponse { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_table_watcher_rescopes() {
    let backend = MemoryBackend::new();
    seed_notification(&backend, "n1", "alice", 0, false);
    seed_notification(&backend, "n2", "bob", 1, false);
    let for_user = |user: &str| {
        (
            Scope::new("notifications", EventClass::All).with_filter(Filter::eq("user_id", user)),
            Select::new("notifications").filter(Filter::eq("user_id", user)),
        )
    };

    let (scope, query) = for_user("alice");
    let watcher: TableWatcher<Notification> =
        TableWatcher::open(context(&backend), FeedOrder::NewestFirst, scope, query)
            .await
            .unwrap();
    live(watcher.health()).await;
    assert_eq!(watcher.records().len(), 1);

    let (scope, query) = for_user("bob");
    watcher.rescope(scope.clone(), query).await.unwrap();
    live(watcher.health()).await;
    assert_eq!(watcher.scope(), Some(scope));
    assert!(watcher.get("n1").is_none());

    backend
        .insert("notifications", row(json!({"user_id": "alice", "kind": "like"})))
        .await
        .unwrap();
    backend
        .insert("notifications", row(json!({"user_id": "bob", "kind": "like"})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(watcher.records().len(), 2);
    assert!(watcher.records().iter().all(|n| n.user_id == "bob"));
}
