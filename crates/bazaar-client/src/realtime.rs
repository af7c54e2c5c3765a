//! Realtime change feed over a single Phoenix-protocol WebSocket.
//!
//! Every remote subscription is one channel (`realtime:<scope>:<id>`) joined
//! with a `postgres_changes` configuration. The socket is opened lazily on
//! the first subscribe and shared by all channels. Losing the socket ends
//! every channel with [`FeedMessage::Disconnected`]; resubscribing is the
//! caller's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    ChangeEvent, ChangeFeed, ClientConfig, ClientError, EventClass, FeedCallback, FeedMessage,
    RemoteSubscription, Row, Scope,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// One frame of the Phoenix channel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

struct Channel {
    join_ref: String,
    callback: FeedCallback,
}

struct SocketInner {
    config: ClientConfig,
    ws_write: Mutex<Option<WsSink>>,
    /// Joined (or joining) channels by topic.
    channels: DashMap<String, Channel>,
    /// Join replies awaited by `subscribe`, keyed by message ref.
    pending: DashMap<String, oneshot::Sender<PhoenixMessage>>,
    next_ref: AtomicU64,
    connected: AtomicBool,
    /// Bumped on every connect and disconnect; background tasks of an older
    /// connection exit when it moves on.
    epoch: AtomicU64,
    connect_lock: Mutex<()>,
}

impl SocketInner {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn send(&self, msg: &PhoenixMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(msg)?;
        let mut ws = self.ws_write.lock().await;
        let sink = ws
            .as_mut()
            .ok_or_else(|| ClientError::WebSocket("socket not connected".into()))?;
        trace!(topic = %msg.topic, event = %msg.event, "sending frame");
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }
}

/// [`ChangeFeed`] backed by the realtime WebSocket endpoint.
#[derive(Clone)]
pub struct RealtimeSocket {
    inner: Arc<SocketInner>,
}

impl RealtimeSocket {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SocketInner {
                config,
                ws_write: Mutex::new(None),
                channels: DashMap::new(),
                pending: DashMap::new(),
                next_ref: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                connect_lock: Mutex::new(()),
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of channels currently joined or joining.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Close the socket. Channels are dropped without a `Disconnected` message.
    pub async fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.channels.clear();
        self.inner.pending.clear();

        if let Some(mut sink) = self.inner.ws_write.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        info!("realtime socket closed");
    }

    async fn ensure_connected(&self) -> Result<(), ClientError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let url = build_ws_url(&self.inner.config.base_url, &self.inner.config.api_key)?;
        debug!(url = %url, "connecting realtime socket");

        let connect = connect_async(url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.inner.config.connect_timeout(), connect)
            .await
            .map_err(|_| ClientError::Timeout("realtime connect".into()))?
            .map_err(|e| ClientError::WebSocket(format!("connection failed: {}", e)))?;

        let (write, read) = ws_stream.split();
        *self.inner.ws_write.lock().await = Some(write);
        self.inner.connected.store(true, Ordering::SeqCst);
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(run_reader(Arc::clone(&self.inner), read, epoch));
        tokio::spawn(run_heartbeat(Arc::clone(&self.inner), epoch));

        info!("realtime socket connected");
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for RealtimeSocket {
    #[instrument(skip(self, callback), fields(scope = %scope))]
    async fn subscribe(
        &self,
        scope: &Scope,
        callback: FeedCallback,
    ) -> Result<RemoteSubscription, ClientError> {
        self.ensure_connected().await?;

        let id = self.inner.next_ref();
        let topic = format!("realtime:{}:{}", scope, id);
        let join_ref = id.to_string();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(join_ref.clone(), reply_tx);
        self.inner.channels.insert(
            topic.clone(),
            Channel {
                join_ref: join_ref.clone(),
                callback,
            },
        );

        let join = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_join".to_string(),
            payload: join_payload(scope, self.inner.config.bearer()),
            msg_ref: Some(join_ref.clone()),
            join_ref: Some(join_ref.clone()),
        };

        let outcome = match self.inner.send(&join).await {
            Ok(()) => tokio::time::timeout(self.inner.config.join_timeout(), reply_rx).await,
            Err(e) => {
                self.inner.pending.remove(&join_ref);
                self.inner.channels.remove(&topic);
                return Err(e);
            }
        };

        let result = match outcome {
            Ok(Ok(reply)) => join_result(&reply.payload),
            Ok(Err(_)) => Err(ClientError::WebSocket(
                "connection closed during join".into(),
            )),
            Err(_) => Err(ClientError::Timeout(format!("join of {}", topic))),
        };

        match result {
            Ok(()) => {
                debug!(topic = %topic, "channel joined");
                Ok(RemoteSubscription { id, topic })
            }
            Err(e) => {
                self.inner.pending.remove(&join_ref);
                self.inner.channels.remove(&topic);
                warn!(topic = %topic, error = %e, "channel join failed");
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(topic = %subscription.topic))]
    async fn unsubscribe(&self, subscription: RemoteSubscription) -> Result<(), ClientError> {
        let Some((topic, channel)) = self.inner.channels.remove(&subscription.topic) else {
            return Ok(());
        };

        if self.is_connected() {
            let leave = PhoenixMessage {
                topic,
                event: "phx_leave".to_string(),
                payload: json!({}),
                msg_ref: Some(self.inner.next_ref().to_string()),
                join_ref: Some(channel.join_ref),
            };
            if let Err(e) = self.inner.send(&leave).await {
                debug!(error = %e, "failed to send leave, socket already gone");
            }
        }
        Ok(())
    }
}

async fn run_reader(inner: Arc<SocketInner>, mut read: WsRead, epoch: u64) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(&inner, text.as_str()),
            Some(Ok(Message::Ping(data))) => {
                if let Some(sink) = inner.ws_write.lock().await.as_mut() {
                    let _ = sink.send(Message::Pong(data)).await;
                }
            }
            Some(Ok(Message::Close(_))) => break "socket closed by server".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("socket read error: {}", e),
            None => break "socket stream ended".to_string(),
        }
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
    };

    // A newer connection or an explicit disconnect owns the state now.
    if inner
        .epoch
        .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    warn!(reason = %reason, "realtime socket lost");
    inner.connected.store(false, Ordering::SeqCst);
    inner.ws_write.lock().await.take();
    inner.pending.clear();

    let topics: Vec<String> = inner.channels.iter().map(|c| c.key().clone()).collect();
    for topic in topics {
        if let Some((_, channel)) = inner.channels.remove(&topic) {
            (channel.callback)(FeedMessage::Disconnected {
                reason: reason.clone(),
            });
        }
    }
}

async fn run_heartbeat(inner: Arc<SocketInner>, epoch: u64) {
    let mut interval = tokio::time::interval(inner.config.heartbeat_interval());
    interval.tick().await;
    loop {
        interval.tick().await;
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }
        let heartbeat = PhoenixMessage {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(inner.next_ref().to_string()),
            join_ref: None,
        };
        if let Err(e) = inner.send(&heartbeat).await {
            warn!(error = %e, "heartbeat failed");
            break;
        }
    }
}

fn handle_frame(inner: &SocketInner, text: &str) {
    let msg: PhoenixMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "failed to parse realtime frame");
            return;
        }
    };

    match msg.event.as_str() {
        "phx_reply" => {
            if let Some(msg_ref) = &msg.msg_ref
                && let Some((_, tx)) = inner.pending.remove(msg_ref)
            {
                let _ = tx.send(msg);
            }
        }
        "postgres_changes" => {
            let callback = match inner.channels.get(&msg.topic) {
                Some(channel) => Arc::clone(&channel.callback),
                None => return,
            };
            match parse_change(&msg.payload) {
                Some(event) => callback(FeedMessage::Change(event)),
                None => warn!(topic = %msg.topic, "unparseable change payload"),
            }
        }
        "phx_error" | "phx_close" => {
            close_channel(inner, &msg.topic, format!("channel {}", msg.event));
        }
        "system" => {
            let status = msg.payload.get("status").and_then(Value::as_str);
            if status == Some("error") {
                let message = msg
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("system error")
                    .to_string();
                close_channel(inner, &msg.topic, message);
            }
        }
        other => trace!(event = %other, "ignoring realtime frame"),
    }
}

fn close_channel(inner: &SocketInner, topic: &str, reason: String) {
    if let Some((_, channel)) = inner.channels.remove(topic) {
        debug!(topic = %topic, reason = %reason, "channel closed by server");
        (channel.callback)(FeedMessage::Disconnected { reason });
    }
}

/// Convert the project URL into the realtime WebSocket endpoint.
pub fn build_ws_url(base_url: &str, api_key: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base_url).map_err(|e| ClientError::Config(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::Config(format!(
                "unsupported URL scheme: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Config("failed to set websocket scheme".into()))?;

    let mut path = url.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str("realtime/v1/websocket");
    url.set_path(&path);

    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");

    Ok(url)
}

/// `phx_join` payload asking for row changes in `scope`.
pub fn join_payload(scope: &Scope, access_token: &str) -> Value {
    let mut change = json!({
        "event": scope.event().as_str(),
        "schema": "public",
        "table": scope.table(),
    });
    if let Some(filter) = scope.filter() {
        change["filter"] = Value::String(filter.expression());
    }

    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        },
        "access_token": access_token,
    })
}

fn join_result(payload: &Value) -> Result<(), ClientError> {
    if payload.get("status").and_then(Value::as_str) == Some("ok") {
        return Ok(());
    }

    let reason = payload
        .get("response")
        .and_then(|r| r.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("join rejected")
        .to_string();

    let lowered = reason.to_lowercase();
    if lowered.contains("unauthorized") || lowered.contains("forbidden") || lowered.contains("jwt")
    {
        Err(ClientError::AuthorizationDenied(reason))
    } else {
        Err(ClientError::WebSocket(format!("join rejected: {}", reason)))
    }
}

/// Decode the `data` object of a `postgres_changes` frame.
pub fn parse_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;

    let event = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .and_then(EventClass::parse)
        .filter(|class| *class != EventClass::All)?;
    let table = data.get("table")?.as_str()?.to_string();

    let row = |key: &str| -> Option<Row> {
        data.get(key)
            .and_then(Value::as_object)
            .filter(|row| !row.is_empty())
            .cloned()
    };

    let commit_timestamp = data
        .get("commit_timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    Some(ChangeEvent {
        event,
        table,
        new_row: row("record"),
        old_row: row("old_record"),
        commit_timestamp,
    })
}
