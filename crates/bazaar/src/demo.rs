//! Scripted session against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use bazaar_client::{InjectedFailure, MemoryBackend, Operation, QueryClient, Row};
use bazaar_feeds::{
    ConversationFeed, FeedContext, LikeFeed, MessageFeed, NotificationFeed, TrendingAggregator,
};
use bazaar_sync::{FeedHealth, SyncConfig};
use chrono::{Duration as ChronoDuration, Utc};
use miette::{IntoDiagnostic, Result};
use serde_json::{Value, json};
use tracing::info;

const ME: &str = "ada";
const OTHER: &str = "grace";

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn seed(backend: &MemoryBackend) {
    let start = Utc::now() - ChronoDuration::hours(2);
    for i in 0..5 {
        let sender = if i % 2 == 0 { OTHER } else { ME };
        backend.insert_row(
            "messages",
            row(json!({
                "id": format!("m{}", i),
                "conversation_id": "c1",
                "sender_id": sender,
                "body": format!("message {}", i),
                "created_at": (start + ChronoDuration::minutes(i)).to_rfc3339(),
                "read_at": null,
            })),
        );
    }
    for (id, likes) in [("p1", 3), ("p2", 11)] {
        backend.insert_row(
            "posts",
            row(json!({
                "id": id,
                "author_id": OTHER,
                "body": format!("post {}", id),
                "likes_count": likes,
                "created_at": start.to_rfc3339(),
            })),
        );
    }
    backend.insert_row(
        "notifications",
        row(json!({
            "id": "n1",
            "user_id": ME,
            "kind": "connection_request",
            "actor_id": OTHER,
            "created_at": start.to_rfc3339(),
            "read_at": null,
        })),
    );
    backend.insert_row(
        "conversations",
        row(json!({
            "id": "c1",
            "other_user_id": OTHER,
            "other_display_name": "Grace",
            "last_message": "message 4",
            "last_message_at": (start + ChronoDuration::minutes(4)).to_rfc3339(),
            "unread_count": 0,
        })),
    );

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
    let source = backend.clone();
    backend.register_procedure("get_trending_posts", move |_args| {
        let mut posts: Vec<Value> = source.rows("posts").into_iter().map(Value::Object).collect();
        posts.sort_by_key(|p| std::cmp::Reverse(p["likes_count"].as_i64().unwrap_or(0)));
        Ok(Value::Array(posts))
    });
    backend.register_procedure("get_suggested_users", |_args| {
        Ok(json!([{ "id": "linus", "display_name": "Linus", "mutual_connections": 2 }]))
    });
}

async fn wait_live(mut health: tokio::sync::watch::Receiver<FeedHealth>) -> Result<()> {
    tokio::time::timeout(
        Duration::from_secs(5),
        health.wait_for(|h| *h == FeedHealth::Live),
    )
    .await
    .into_diagnostic()?
    .into_diagnostic()?;
    Ok(())
}

pub async fn run() -> Result<()> {
    let backend = MemoryBackend::new();
    seed(&backend);
    let ctx = FeedContext::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        SyncConfig::default(),
    )
    .map_err(|e| miette::miette!("{}", e))?;

    let messages = MessageFeed::new(ctx.clone(), ME);
    messages
        .open_conversation("c1")
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    wait_live(messages.health()).await?;
    info!(count = messages.messages().len(), "conversation loaded");

    let outcome = messages
        .send("On my way with the drafts", None)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(confirmed = outcome.is_confirmed(), "message sent");

    backend
        .insert(
            "messages",
            row(json!({ "conversation_id": "c1", "sender_id": OTHER, "body": "Great, see you", "reply_to_id": "m4" })),
        )
        .await
        .into_diagnostic()?;

    let likes = LikeFeed::new(ctx.clone(), ME);
    likes
        .watch(["p1", "p2"])
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    likes
        .toggle_like("p1")
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    backend.fail_next(Operation::Insert, InjectedFailure::Denied);
    let denied = likes
        .toggle_like("p2")
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(confirmed = denied.is_confirmed(), "like with injected denial");

    let notifications = NotificationFeed::open(ctx.clone(), ME)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    notifications
        .mark_all_read()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let conversations = ConversationFeed::open(ctx.clone(), ME)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let trending = TrendingAggregator::spawn(&ctx, ME);
    trending
        .refresh()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("conversation c1:");
    for message in messages.messages() {
        let reply = message
            .reply_to
            .as_ref()
            .map(|r| format!(" (re: {})", r.body))
            .unwrap_or_default();
        println!("  {:<6} {}{}", message.sender_id, message.body, reply);
    }
    println!("likes:");
    for post in likes.snapshot().records() {
        println!("  {} {} liked={}", post.id, post.likes_count, post.is_liked);
    }
    println!("unread notifications: {}", notifications.unread_count());
    println!("unread conversations: {}", conversations.total_unread());
    println!("trending:");
    for post in trending.snapshot().posts {
        println!("  {} ({} likes)", post.id, post.likes_count);
    }
    println!("notices:");
    for notice in ctx.notices().notices() {
        println!("  {}: {} ({})", notice.action, notice.class, notice.message);
    }

    trending.stop().await;
    ctx.manager().close_all();
    Ok(())
}
