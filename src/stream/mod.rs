//! Persistent streaming client.
//!
//! [`StreamClient`] owns one long-lived duplex connection and a registry of
//! subscriptions. Transport failures never surface as errors: they become
//! state transitions and [`StreamEvent`]s, and the client reconnects with
//! exponential backoff. After every reconnect all active subscriptions are
//! re-sent, in the order they were created, before [`StreamEvent::Ready`] is
//! emitted.
//!
//! All state transitions are made by a single background task. The public
//! methods only send it commands, so an explicit [`disconnect`] can never race
//! with a scheduled reconnect.
//!
//! [`disconnect`]: StreamClient::disconnect
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use hypersim::stream::{SubscriptionParams, Topic};
//!
//! # async fn example() -> hypersim::Result<()> {
//! let client = hypersim::mainnet_ws();
//! client.connect().await?;
//!
//! client
//!     .subscribe_with(Topic::Trades, SubscriptionParams::coin("BTC"), |msg| {
//!         println!("trade: {}", msg.data);
//!     })
//!     .await?;
//!
//! let mut messages = client.messages();
//! while let Some(msg) = messages.next().await {
//!     println!("{}: {}", msg.kind, msg.data);
//! }
//! # Ok(())
//! # }
//! ```

mod controller;
mod transport;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use chrono::Utc;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;

pub use transport::{Connector, FrameSink, Transport, WsConnector};

use crate::{Error, Result, hooks::HookEngine};
use controller::{Command, Controller};

/// Topic families understood by the streaming endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    #[display("trades")]
    Trades,
    #[display("book")]
    Book,
    #[display("bbo")]
    Bbo,
    #[display("l2Book")]
    L2Book,
    #[display("candle")]
    Candle,
    #[display("userFills")]
    UserFills,
    #[display("userOrders")]
    UserOrders,
    #[display("userEvents")]
    UserEvents,
    #[display("notification")]
    Notification,
}

/// Optional topic parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl SubscriptionParams {
    pub fn coin(coin: impl Into<String>) -> Self {
        Self {
            coin: Some(coin.into()),
            ..Self::default()
        }
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }
}

/// Dedup key of a subscription: `topic[:coin][:user][:interval]`.
pub fn subscription_key(topic: Topic, params: &SubscriptionParams) -> String {
    let mut parts = vec![topic.to_string()];
    parts.extend(
        [&params.coin, &params.user, &params.interval]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .cloned(),
    );
    parts.join(":")
}

/// Registered subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub topic: Topic,
    pub params: SubscriptionParams,
    pub active: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Subscription {
    pub fn key(&self) -> String {
        subscription_key(self.topic, &self.params)
    }
}

/// Wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub const HEARTBEAT: &'static str = "heartbeat";

    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            subscription_id: None,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Self::HEARTBEAT, Value::Null)
    }

    pub(crate) fn subscribe(sub: &Subscription) -> Self {
        Self::control("subscribe", sub)
    }

    pub(crate) fn unsubscribe(sub: &Subscription) -> Self {
        Self::control("unsubscribe", sub)
    }

    fn control(kind: &str, sub: &Subscription) -> Self {
        let mut data = json!({ "type": sub.topic });
        if let (Some(map), Ok(Value::Object(params))) =
            (data.as_object_mut(), serde_json::to_value(&sub.params))
        {
            map.extend(params);
        }

        Self {
            subscription_id: Some(sub.id.clone()),
            ..Self::new(kind, data)
        }
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.kind == Self::HEARTBEAT
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("reconnecting")]
    Reconnecting,
    #[display("error")]
    Error,
    #[display("closing")]
    Closing,
    #[display("closed")]
    Closed,
}

/// Notification published by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged(ConnectionState),
    /// Connected, subscriptions replayed and the outbound queue flushed.
    Ready,
    Message(Envelope),
    Error(String),
    Closed,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    pub reconnect: bool,
    /// Reconnect attempts before giving up. Reset after each successful connect.
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub handshake_timeout: Duration,
    /// Outbound messages kept while disconnected.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            queue_capacity: 1000,
        }
    }
}

impl StreamConfig {
    /// `min(max_delay, base_delay * 2^attempt)`
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnects: u64,
    pub errors: u64,
    /// Outbound messages dropped because the queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    reconnects: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamMetrics {
        StreamMetrics {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Callback invoked for each message of a subscription.
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// State shared between the handle and the background tasks.
///
/// Only the controller task writes `registry`, `handlers` and `state`.
struct Shared {
    registry: RwLock<Vec<Subscription>>,
    handlers: RwLock<std::collections::HashMap<String, Vec<MessageHandler>>>,
    events: broadcast::Sender<StreamEvent>,
    counters: Counters,
    hooks: ArcSwapOption<HookEngine>,
}

impl Shared {
    fn emit(&self, event: StreamEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

/// Handle to a streaming connection.
///
/// Cheap to clone; every clone talks to the same connection. The background
/// task stops after [`disconnect`](Self::disconnect) or once every handle is
/// dropped.
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamClient {
    /// Creates a client. Nothing is opened until [`connect`](Self::connect).
    ///
    /// Must be called within a tokio runtime.
    pub fn new(connector: impl Connector + 'static, config: StreamConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            registry: RwLock::new(Vec::new()),
            handlers: RwLock::new(Default::default()),
            events,
            counters: Counters::default(),
            hooks: ArcSwapOption::empty(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        tokio::spawn(Controller::new(Arc::new(connector), config, shared.clone(), rx, state_tx).run());

        Self {
            shared,
            commands: tx,
            state: state_rx,
        }
    }

    /// WebSocket client for `url`.
    pub fn ws(url: Url, config: StreamConfig) -> Self {
        Self::new(WsConnector::new(url), config)
    }

    /// Fires `on-connect` and `on-disconnect` on `hooks`.
    pub fn with_hooks(self, hooks: Arc<HookEngine>) -> Self {
        self.shared.hooks.store(Some(hooks));
        self
    }

    /// Opens the connection.
    ///
    /// Does nothing if already connected or connecting. A failed attempt is
    /// reported through [`events`](Self::events) and retried in the
    /// background; only a closed client yields an error.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect(reply))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Closes the connection for good and clears every subscription.
    ///
    /// Idempotent.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Disconnect(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Subscribes to `topic`.
    ///
    /// Returns the subscription id. Subscribing twice to the same topic and
    /// parameters returns the existing id.
    pub async fn subscribe(&self, topic: Topic, params: SubscriptionParams) -> Result<String> {
        self.subscribe_inner(topic, params, None).await
    }

    /// Same as [`subscribe`](Self::subscribe), routing the subscription's
    /// messages to `handler`.
    ///
    /// On an existing subscription `handler` runs alongside the ones already
    /// registered.
    pub async fn subscribe_with<F>(
        &self,
        topic: Topic,
        params: SubscriptionParams,
        handler: F,
    ) -> Result<String>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, params, Some(Arc::new(handler))).await
    }

    async fn subscribe_inner(
        &self,
        topic: Topic,
        params: SubscriptionParams,
        handler: Option<MessageHandler>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            topic,
            params,
            handler,
            reply,
        })?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Unsubscribe {
            id: id.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Sends `message`, queueing it while not connected.
    pub fn send(&self, message: Envelope) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        self.command(Command::Send(text))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel following every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Stream of inbound data messages, heartbeats excluded.
    pub fn messages(&self) -> BoxStream<'static, Envelope> {
        let rx = self.events();
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(StreamEvent::Message(msg)) => return Some((msg, rx)),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("message stream lagged, skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    /// Registered subscriptions in creation order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.read().clone()
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.shared.counters.snapshot()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("state", &self.state())
            .field("subscriptions", &self.shared.registry.read().len())
            .finish_non_exhaustive()
    }
}
