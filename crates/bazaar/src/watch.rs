//! Live commands against a real backend.

use std::sync::Arc;

use bazaar_client::{ClientConfig, RealtimeSocket, RestClient};
use bazaar_feeds::{
    ConnectionFeed, FeedContext, MessageFeed, NotificationFeed, TrendingAggregator,
};
use bazaar_sync::SyncConfig;
use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::Connection;

fn connect(connection: &Connection, config: SyncConfig) -> Result<(FeedContext, RealtimeSocket)> {
    let mut client_config = ClientConfig::new(&connection.url, &connection.api_key);
    if let Some(token) = &connection.access_token {
        client_config = client_config.with_access_token(token);
    }
    client_config
        .validate()
        .map_err(|e| miette::miette!("invalid connection settings: {}", e))?;

    let rest = RestClient::new(&client_config)
        .map_err(|e| miette::miette!("failed to create REST client: {}", e))?;
    let socket = RealtimeSocket::new(client_config)
        .map_err(|e| miette::miette!("failed to create realtime socket: {}", e))?;
    let ctx = FeedContext::new(Arc::new(rest), Arc::new(socket.clone()), config)
        .map_err(|e| miette::miette!("{}", e))?;
    Ok((ctx, socket))
}

/// Follow the user's feeds until interrupted.
pub async fn run(connection: &Connection, conversation: Option<&str>, page_size: usize) -> Result<()> {
    let config = SyncConfig {
        page_size,
        ..SyncConfig::default()
    };
    let (ctx, socket) = connect(connection, config)?;
    let user_id = connection.user_id.as_str();

    let notifications = NotificationFeed::open(ctx.clone(), user_id)
        .await
        .map_err(|e| miette::miette!("failed to open notifications: {}", e))?;
    let connections = ConnectionFeed::open(ctx.clone(), user_id)
        .await
        .map_err(|e| miette::miette!("failed to open connections: {}", e))?;
    let messages = MessageFeed::new(ctx.clone(), user_id);
    if let Some(conversation) = conversation {
        messages
            .open_conversation(conversation)
            .await
            .map_err(|e| miette::miette!("failed to open conversation: {}", e))?;
    }

    info!(
        notifications = notifications.notifications().len(),
        unread = notifications.unread_count(),
        incoming_requests = connections.incoming_pending().len(),
        messages = messages.messages().len(),
        "feeds open, waiting for changes"
    );

    let mut notification_rx = notifications.subscribe();
    let mut connection_rx = connections.subscribe();
    let mut message_rx = messages.subscribe();
    let mut notice_rx = ctx.notices().subscribe();
    let mut health_rx = messages.health();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            Ok(()) = notification_rx.changed() => {
                let snapshot = notification_rx.borrow_and_update().clone();
                info!(
                    count = snapshot.len(),
                    unread = bazaar_feeds::unread_count_of(&snapshot),
                    "notifications changed"
                );
            }
            Ok(()) = connection_rx.changed() => {
                connection_rx.borrow_and_update();
                info!(
                    incoming = connections.incoming_pending().len(),
                    outgoing = connections.outgoing_pending().len(),
                    "connection requests changed"
                );
            }
            Ok(()) = message_rx.changed() => {
                let snapshot = message_rx.borrow_and_update().clone();
                if let Some(last) = snapshot.records().last() {
                    info!(count = snapshot.len(), from = %last.sender_id, body = %last.preview().body, "messages changed");
                }
            }
            Ok(()) = health_rx.changed() => {
                let health = *health_rx.borrow_and_update();
                if health.is_degraded() {
                    warn!("conversation feed degraded, updates paused");
                } else {
                    info!(?health, "conversation feed health");
                }
            }
            Ok(()) = notice_rx.changed() => {
                if let Some(notice) = notice_rx.borrow_and_update().last() {
                    warn!(action = %notice.action, class = %notice.class, message = %notice.message, "action failed");
                }
            }
        }
    }

    messages.close();
    ctx.manager().close_all();
    socket.disconnect().await;
    Ok(())
}

/// Print trending results on every poll until interrupted.
pub async fn run_trending(connection: &Connection, poll_interval: u64) -> Result<()> {
    let config = SyncConfig {
        trending_poll_secs: poll_interval,
        ..SyncConfig::default()
    };
    let (ctx, socket) = connect(connection, config)?;
    let aggregator = TrendingAggregator::spawn(&ctx, connection.user_id.as_str());
    let mut rx: watch::Receiver<_> = aggregator.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                changed.into_diagnostic()?;
                let snapshot = rx.borrow_and_update().clone();
                if let Some(error) = &snapshot.last_error {
                    warn!(error = %error, "trending poll failed, showing previous results");
                    continue;
                }
                for post in &snapshot.posts {
                    println!("{:>5}  {}  {}", post.likes_count, post.author_id, post.body);
                }
                for user in &snapshot.users {
                    println!(
                        "  suggested: {} ({} mutual)",
                        user.display_name.as_deref().unwrap_or(&user.id),
                        user.mutual_connections
                    );
                }
            }
        }
    }

    aggregator.stop().await;
    socket.disconnect().await;
    Ok(())
}
