use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, interval_at, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;

use super::{
    ConnectionState, Connector, Counters, Envelope, FrameSink, MessageHandler, Shared,
    StreamConfig, StreamEvent, Subscription, SubscriptionParams, Topic, subscription_key,
};
use crate::{
    Error, Result,
    hooks::{HookContext, HookName},
};

pub(super) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Subscribe {
        topic: Topic,
        params: SubscriptionParams,
        handler: Option<MessageHandler>,
        reply: oneshot::Sender<Result<String>>,
    },
    Unsubscribe {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Send(String),
}

/// Reports from the tasks of one session.
enum Signal {
    Closed { generation: u64, reason: String },
    Stale { generation: u64, idle: Duration },
}

struct Session {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

/// Owner of the connection state machine.
pub(super) struct Controller {
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
    dispatch: mpsc::UnboundedSender<Envelope>,
    session: Option<Session>,
    generation: u64,
    queue: VecDeque<String>,
    attempts: u32,
    reconnect_at: Option<Instant>,
    next_id: u64,
}

impl Controller {
    pub(super) fn new(
        connector: Arc<dyn Connector>,
        config: StreamConfig,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (dispatch, inbound) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(shared.clone(), inbound));

        Self {
            connector,
            config,
            shared,
            commands,
            state,
            signals_tx,
            signals,
            dispatch,
            session: None,
            generation: 0,
            queue: VecDeque::new(),
            attempts: 0,
            reconnect_at: None,
            next_id: 0,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // every handle is gone
                        self.close().await;
                        return;
                    };
                    if self.handle(command).await {
                        return;
                    }
                }
                Some(signal) = self.signals.recv() => self.on_signal(signal).await,
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    Counters::bump(&self.shared.counters.reconnects);
                    self.open().await;
                }
            }
        }
    }

    /// Returns `true` once the client is closed.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(reply) => {
                match self.current() {
                    ConnectionState::Connected | ConnectionState::Connecting => {}
                    _ => {
                        self.reconnect_at = None;
                        self.attempts = 0;
                        self.open().await;
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect(reply) => {
                self.close().await;
                let _ = reply.send(());
                return true;
            }
            Command::Subscribe {
                topic,
                params,
                handler,
                reply,
            } => {
                let _ = reply.send(Ok(self.subscribe(topic, params, handler)));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.unsubscribe(&id));
            }
            Command::Send(text) => self.send(text),
        }
        false
    }

    fn subscribe(
        &mut self,
        topic: Topic,
        params: SubscriptionParams,
        handler: Option<MessageHandler>,
    ) -> String {
        let key = subscription_key(topic, &params);
        let existing = self
            .shared
            .registry
            .read()
            .iter()
            .find(|sub| sub.key() == key)
            .map(|sub| sub.id.clone());
        if let Some(id) = existing {
            log::debug!("already subscribed to {key}");
            if let Some(handler) = handler {
                self.shared.handlers.write().entry(id.clone()).or_default().push(handler);
            }
            return id;
        }

        self.next_id += 1;
        let sub = Subscription {
            id: format!("sub_{}", self.next_id),
            topic,
            params,
            active: true,
            created_at: Utc::now().timestamp_millis(),
        };
        let id = sub.id.clone();

        if let Some(handler) = handler {
            self.shared.handlers.write().insert(id.clone(), vec![handler]);
        }
        if let Some(session) = &self.session {
            if let Ok(text) = serde_json::to_string(&Envelope::subscribe(&sub)) {
                let _ = session.outbound.send(text);
            }
        }
        log::debug!("subscribed to {key} as {id}");
        self.shared.registry.write().push(sub);

        id
    }

    fn unsubscribe(&mut self, id: &str) -> Result<()> {
        let removed = {
            let mut registry = self.shared.registry.write();
            let pos = registry
                .iter()
                .position(|sub| sub.id == id)
                .ok_or_else(|| Error::validation(format!("unknown subscription {id}")))?;
            let mut sub = registry.remove(pos);
            sub.active = false;
            sub
        };
        self.shared.handlers.write().remove(id);

        if let Some(session) = &self.session {
            if let Ok(text) = serde_json::to_string(&Envelope::unsubscribe(&removed)) {
                let _ = session.outbound.send(text);
            }
        }
        log::debug!("unsubscribed {id}");
        Ok(())
    }

    fn send(&mut self, text: String) {
        let text = match &self.session {
            Some(session) => match session.outbound.send(text) {
                Ok(()) => return,
                Err(mpsc::error::SendError(text)) => text,
            },
            None => text,
        };

        if self.config.queue_capacity == 0 {
            Counters::bump(&self.shared.counters.dropped);
            log::warn!("outbound queue disabled, dropping message");
            return;
        }
        if self.queue.len() >= self.config.queue_capacity {
            self.queue.pop_front();
            Counters::bump(&self.shared.counters.dropped);
            log::warn!("outbound queue full, dropping oldest message");
        }
        self.queue.push_back(text);
    }

    /// Opens a transport and starts a session, or schedules the next attempt.
    async fn open(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let endpoint = self.connector.endpoint();

        let transport = match timeout(self.config.handshake_timeout, self.connector.connect()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                log::error!("unable to connect to {endpoint}: {err:?}");
                self.fail(format!("connect failed: {err:#}"));
                return;
            }
            Err(_) => {
                log::error!("timed out connecting to {endpoint}");
                self.fail(Error::timeout(self.config.handshake_timeout).to_string());
                return;
            }
        };

        let mut sink = transport.sink;

        // replay before anything else is written, in registry order
        let replay: Vec<Subscription> = self
            .shared
            .registry
            .read()
            .iter()
            .filter(|sub| sub.active)
            .cloned()
            .collect();
        for sub in &replay {
            log::debug!("resubscribing to {}", sub.key());
            let sent = match serde_json::to_string(&Envelope::subscribe(sub)) {
                Ok(text) => sink.send_text(text).await,
                Err(err) => Err(err.into()),
            };
            match sent {
                Ok(()) => Counters::bump(&self.shared.counters.sent),
                Err(err) => {
                    Counters::bump(&self.shared.counters.errors);
                    log::warn!("replaying {} failed: {err:?}", sub.key());
                }
            }
        }

        while let Some(text) = self.queue.pop_front() {
            if let Err(err) = sink.send_text(text.clone()).await {
                log::warn!("flushing queued message failed: {err:?}");
                self.queue.push_front(text);
                break;
            }
            Counters::bump(&self.shared.counters.sent);
        }

        self.generation += 1;
        self.session = Some(self.spawn_session(sink, transport.inbound));
        self.attempts = 0;

        log::info!("connected to {endpoint}");
        self.set_state(ConnectionState::Connected);
        self.fire(HookName::OnConnect, &endpoint);
        self.shared.emit(StreamEvent::Ready);
    }

    fn spawn_session(&self, sink: Box<dyn FrameSink>, inbound: BoxStream<'static, String>) -> Session {
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let activity = Arc::new(Mutex::new(Instant::now()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            cancel.clone(),
            self.signals_tx.clone(),
            self.shared.clone(),
            generation,
        ));
        tokio::spawn(read_loop(
            inbound,
            cancel.clone(),
            activity.clone(),
            self.dispatch.clone(),
            self.signals_tx.clone(),
            self.shared.clone(),
            generation,
        ));
        tokio::spawn(heartbeat_loop(
            self.config.heartbeat_interval,
            outbound.clone(),
            activity,
            cancel.clone(),
            self.signals_tx.clone(),
            generation,
        ));

        Session {
            generation,
            outbound,
            cancel,
            writer,
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        let (generation, reason) = match signal {
            Signal::Closed { generation, reason } => (generation, reason),
            Signal::Stale { generation, idle } => (
                generation,
                format!("no inbound activity for {}ms", idle.as_millis()),
            ),
        };

        // late report from an earlier session
        if self.session.as_ref().is_none_or(|s| s.generation != generation) {
            return;
        }

        log::warn!("connection to {} lost: {reason}", self.connector.endpoint());
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        self.fire(HookName::OnDisconnect, &reason);
        self.fail(reason);
    }

    /// Records a failure and schedules a reconnect if the budget allows.
    fn fail(&mut self, reason: String) {
        Counters::bump(&self.shared.counters.errors);
        self.shared.emit(StreamEvent::Error(reason));

        if !self.config.reconnect || self.attempts >= self.config.max_attempts {
            if self.config.reconnect {
                log::error!(
                    "giving up on {} after {} reconnect attempts",
                    self.connector.endpoint(),
                    self.attempts
                );
            }
            self.set_state(ConnectionState::Error);
            return;
        }

        let delay = self.config.reconnect_delay(self.attempts);
        self.attempts += 1;
        self.reconnect_at = Some(crate::deadline(Instant::now(), delay));
        log::info!(
            "reconnecting to {} in {}ms (attempt {}/{})",
            self.connector.endpoint(),
            delay.as_millis(),
            self.attempts,
            self.config.max_attempts
        );
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.cancel.cancel();
        // the writer closes the sink on cancellation
        if timeout(self.config.handshake_timeout, session.writer).await.is_err() {
            log::warn!("transport did not close in time");
        }
    }

    async fn close(&mut self) {
        if self.current() == ConnectionState::Closed {
            return;
        }

        let was_connected = self.session.is_some();
        self.set_state(ConnectionState::Closing);
        self.reconnect_at = None;
        self.teardown().await;

        self.queue.clear();
        self.shared.registry.write().clear();
        self.shared.handlers.write().clear();

        self.set_state(ConnectionState::Closed);
        if was_connected {
            self.fire(HookName::OnDisconnect, "closed");
        }
        self.shared.emit(StreamEvent::Closed);
        log::info!("closed connection to {}", self.connector.endpoint());
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
        if changed {
            log::debug!("stream state: {next}");
            self.shared.emit(StreamEvent::StateChanged(next));
        }
    }

    fn fire(&self, hook: HookName, detail: &str) {
        let Some(hooks) = self.shared.hooks.load_full() else {
            return;
        };
        let payload = json!({
            "endpoint": self.connector.endpoint(),
            "detail": detail,
        });
        let ctx = HookContext::new(format!("stream-{}", self.generation), payload.clone());
        hooks.fire(hook, ctx, &payload);
    }
}

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<Signal>,
    shared: Arc<Shared>,
    generation: u64,
) {
    loop {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            text = outbound.recv() => text,
        };
        let Some(text) = text else { break };

        if let Err(err) = sink.send_text(text).await {
            let _ = signals.send(Signal::Closed {
                generation,
                reason: format!("send failed: {err:#}"),
            });
            return;
        }
        Counters::bump(&shared.counters.sent);
    }

    if let Err(err) = sink.close().await {
        log::debug!("closing transport: {err:?}");
    }
}

async fn read_loop(
    mut inbound: BoxStream<'static, String>,
    cancel: CancellationToken,
    activity: Arc<Mutex<Instant>>,
    dispatch: mpsc::UnboundedSender<Envelope>,
    signals: mpsc::UnboundedSender<Signal>,
    shared: Arc<Shared>,
    generation: u64,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = inbound.next() => frame,
        };
        let Some(text) = frame else {
            let _ = signals.send(Signal::Closed {
                generation,
                reason: "closed by remote".into(),
            });
            return;
        };

        *activity.lock() = Instant::now();
        Counters::bump(&shared.counters.received);

        match serde_json::from_str::<Envelope>(&text) {
            Ok(msg) if msg.is_heartbeat() => {}
            Ok(msg) => {
                let _ = dispatch.send(msg);
            }
            Err(err) => log::warn!("unable to parse: {text}: {err:?}"),
        }
    }
}

async fn heartbeat_loop(
    period: Duration,
    outbound: mpsc::UnboundedSender<String>,
    activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<Signal>,
    generation: u64,
) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(crate::deadline(Instant::now(), period), period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let idle = activity.lock().elapsed();
        if idle > period.saturating_mul(2) {
            let _ = signals.send(Signal::Stale { generation, idle });
            return;
        }

        if let Ok(text) = serde_json::to_string(&Envelope::heartbeat()) {
            let _ = outbound.send(text);
        }
    }
}

/// Delivers inbound messages to subscription handlers and event listeners.
///
/// Runs apart from the reader so a slow handler never stalls the transport.
async fn dispatch_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(msg) = inbound.recv().await {
        let handlers: Vec<MessageHandler> = match &msg.subscription_id {
            Some(id) => shared.handlers.read().get(id).cloned().unwrap_or_default(),
            None => {
                let handlers = shared.handlers.read();
                shared
                    .registry
                    .read()
                    .iter()
                    .filter(|sub| sub.active && sub.topic.to_string() == msg.kind)
                    .filter_map(|sub| handlers.get(&sub.id))
                    .flatten()
                    .cloned()
                    .collect()
            }
        };

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&msg))).is_err() {
                log::warn!("message handler panicked on {}", msg.kind);
            }
        }

        shared.emit(StreamEvent::Message(msg));
    }
}
