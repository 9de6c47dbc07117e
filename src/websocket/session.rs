//! Self-healing streaming session
//!
//! A [`Session`] owns one connection at a time. While active it runs three
//! duties on that connection: heartbeat emission, staleness detection and
//! message receipt. Any of them failing posts a fault to the session's
//! supervisor task, which drives the `Restarting -> Connecting` transition
//! in a loop until the feed is back or the restart limit is hit.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{Connection, Connector, Inbound, TungsteniteConnector, WsSink, WsSource};
use super::handler::{ErrorSink, MessageSink};
use crate::config::SessionConfig;
use crate::error::{FeedError, Result};
use crate::feeds::{Feed, Keepalive};
use crate::metrics::{FAULTS, INBOUND_FRAMES, RESTARTS};

/// Bound on closing the write half during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Restarting,
    /// Terminal until the next explicit start
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Restarting => "restarting",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The open connection and the duties running on it
struct Link {
    conn_id: String,
    sink: Arc<AsyncMutex<WsSink>>,
    stop_tx: watch::Sender<bool>,
    duties: Vec<JoinHandle<()>>,
}

/// A duty failure, tagged with the connection it happened on
struct Fault {
    conn_id: Option<String>,
    error: FeedError,
}

enum Direction {
    Subscribe,
    Unsubscribe,
}

struct Inner {
    feed: Arc<dyn Feed>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    errors: Arc<dyn ErrorSink>,
    messages: Arc<dyn MessageSink>,
    state: Mutex<SessionState>,
    link: AsyncMutex<Option<Link>>,
    conn_id: Mutex<Option<String>>,
    subscriptions: Mutex<Vec<Value>>,
    restart_log: Mutex<VecDeque<Instant>>,
    restarts: AtomicUsize,
    last_inbound: Arc<Mutex<Instant>>,
    faults: mpsc::UnboundedSender<Fault>,
    /// Serializes start, stop and the connect half of a restart
    lifecycle: AsyncMutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            let _ = link.stop_tx.send(true);
            for duty in link.duties {
                duty.abort();
            }
        }
    }
}

/// Handle to a streaming session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Session over real WebSocket connections. Must be called inside a
    /// tokio runtime; the restart supervisor is spawned here.
    pub fn new(
        feed: Arc<dyn Feed>,
        config: SessionConfig,
        errors: Arc<dyn ErrorSink>,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        Self::with_connector(feed, Arc::new(TungsteniteConnector), config, errors, messages)
    }

    pub fn with_connector(
        feed: Arc<dyn Feed>,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        errors: Arc<dyn ErrorSink>,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            feed,
            connector,
            config,
            errors,
            messages,
            state: Mutex::new(SessionState::Disconnected),
            link: AsyncMutex::new(None),
            conn_id: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            restart_log: Mutex::new(VecDeque::new()),
            restarts: AtomicUsize::new(0),
            last_inbound: Arc::new(Mutex::new(Instant::now())),
            faults,
            lifecycle: AsyncMutex::new(()),
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), fault_rx));
        Self { inner }
    }

    pub fn feed_name(&self) -> &'static str {
        self.inner.feed.name()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Identifier of the current connection; regenerated on every connect
    pub fn conn_id(&self) -> Option<String> {
        self.inner.conn_id.lock().clone()
    }

    /// Replay list, in subscription order
    pub fn subscriptions(&self) -> Vec<Value> {
        self.inner.subscriptions.lock().clone()
    }

    /// Restarts performed over the session's lifetime
    pub fn restart_count(&self) -> usize {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// Open the connection and start the duties.
    ///
    /// Fails with `RestartLimitExceeded` while too many restarts sit inside
    /// the trailing window. A connect or auth failure is returned to the
    /// caller and also handed to the supervisor when the session has already
    /// restarted before.
    pub async fn start(&self) -> Result<()> {
        let result = {
            let _guard = self.inner.lifecycle.lock().await;
            if self.state() == SessionState::Active {
                return Ok(());
            }
            self.connect_locked().await
        };

        match result {
            Ok(()) => {
                self.after_connect().await;
                Ok(())
            }
            Err(e) => {
                if e.is_transient() && self.restart_count() > 0 {
                    let _ = self.inner.faults.send(Fault {
                        conn_id: None,
                        error: e.clone(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Tear the connection down and reconnect after the restart delay,
    /// retrying until connected, stopped, or over the restart limit
    pub async fn restart(&self) -> Result<()> {
        self.run_restart(true, None).await
    }

    /// Close the connection and stop all duties. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.teardown().await;
        if self.state() != SessionState::Stopped {
            info!(feed = self.feed_name(), "Session stopped");
        }
        self.set_state(SessionState::Stopped);
    }

    /// Record `descriptor` for replay and send it if connected.
    ///
    /// Returns whether a frame went out.
    pub async fn subscribe(&self, descriptor: Value) -> bool {
        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if !subscriptions.contains(&descriptor) {
                subscriptions.push(descriptor.clone());
            }
        }
        self.send_descriptor(&descriptor, Direction::Subscribe).await
    }

    /// Drop `descriptor` from the replay list and send the unsubscribe if connected
    pub async fn unsubscribe(&self, descriptor: Value) -> bool {
        self.inner.subscriptions.lock().retain(|d| d != &descriptor);
        self.send_descriptor(&descriptor, Direction::Unsubscribe).await
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.inner.state.lock();
        if *current != state {
            debug!(feed = self.feed_name(), from = %*current, to = %state, "Session state change");
            *current = state;
        }
    }

    fn report(&self, err: &FeedError) {
        FAULTS
            .with_label_values(&[self.feed_name(), err.kind()])
            .inc();
        self.inner.errors.on_error(err);
    }

    fn check_restart_limit(&self) -> Result<()> {
        let window = self.inner.config.restart_limit_window;
        let now = Instant::now();
        let mut log = self.inner.restart_log.lock();
        while log
            .front()
            .is_some_and(|at| now.duration_since(*at) >= window)
        {
            log.pop_front();
        }
        if log.len() > self.inner.config.restart_limit_num {
            return Err(FeedError::RestartLimitExceeded {
                count: log.len(),
                window,
            });
        }
        Ok(())
    }

    fn record_restart(&self) {
        self.inner.restart_log.lock().push_back(Instant::now());
        self.inner.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Rejects duty periods the timers cannot run on, feed defaults included
    fn check_periods(&self) -> Result<()> {
        self.inner.config.validate()?;
        if self.heartbeat_period().is_zero() {
            return Err(FeedError::Config(format!(
                "{} heartbeat interval must be non-zero",
                self.feed_name()
            )));
        }
        Ok(())
    }

    fn heartbeat_period(&self) -> Duration {
        self.inner
            .config
            .heartbeat_interval
            .unwrap_or_else(|| self.inner.feed.heartbeat_interval())
    }

    /// Connect, authenticate and launch the duties. Caller holds `lifecycle`.
    async fn connect_locked(&self) -> Result<()> {
        if let Err(e) = self.check_periods() {
            error!(feed = self.feed_name(), error = %e, "Invalid session timings");
            self.set_state(SessionState::Stopped);
            self.report(&e);
            return Err(e);
        }

        if let Err(e) = self.check_restart_limit() {
            error!(feed = self.feed_name(), error = %e, "Restart limit exceeded");
            self.teardown().await;
            self.set_state(SessionState::Stopped);
            self.report(&e);
            return Err(e);
        }

        self.set_state(SessionState::Connecting);
        let (conn, conn_id) = match self.open().await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(feed = self.feed_name(), error = %e, "Connect failed");
                self.set_state(SessionState::Disconnected);
                self.report(&e);
                return Err(e);
            }
        };

        self.teardown().await;
        *self.inner.last_inbound.lock() = Instant::now();
        let link = self.launch(conn, conn_id.clone());
        *self.inner.link.lock().await = Some(link);
        *self.inner.conn_id.lock() = Some(conn_id.clone());
        self.set_state(SessionState::Active);
        info!(feed = self.feed_name(), conn_id = %conn_id, "Session active");
        Ok(())
    }

    async fn open(&self) -> Result<(Connection, String)> {
        let inner = &self.inner;
        let url = inner.feed.endpoint().await?;
        let mut conn = timeout(inner.config.connect_timeout, inner.connector.connect(&url))
            .await
            .map_err(|_| FeedError::ConnectFailure(format!("timed out connecting to {}", url)))??;
        let conn_id = Uuid::new_v4().to_string();

        if inner.feed.requires_auth() {
            self.set_state(SessionState::Authenticating);
            let auth = timeout(
                inner.config.auth_timeout,
                inner.feed.authenticate(&mut conn, &conn_id),
            )
            .await
            .map_err(|_| FeedError::AuthFailure("handshake timed out".to_string()))
            .and_then(|result| {
                result.map_err(|e| match e {
                    FeedError::AuthFailure(_) => e,
                    other => FeedError::AuthFailure(other.to_string()),
                })
            });
            if let Err(e) = auth {
                conn.close().await;
                return Err(e);
            }
        }

        Ok((conn, conn_id))
    }

    fn launch(&self, conn: Connection, conn_id: String) -> Link {
        let inner = &self.inner;
        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = Arc::new(AsyncMutex::new(conn.sink));
        let ctx = DutyContext {
            feed: inner.feed.clone(),
            conn_id: conn_id.clone(),
            sink: sink.clone(),
            stop: stop_rx,
            faults: inner.faults.clone(),
            errors: inner.errors.clone(),
            last_inbound: inner.last_inbound.clone(),
        };
        let duties = vec![
            tokio::spawn(heartbeat(ctx.clone(), self.heartbeat_period())),
            tokio::spawn(staleness(ctx.clone(), inner.config.staleness_interval)),
            tokio::spawn(receive(ctx, conn.source, inner.messages.clone())),
        ];

        Link {
            conn_id,
            sink,
            stop_tx,
            duties,
        }
    }

    /// Signal the duties, close the connection and forget its identifier
    async fn teardown(&self) {
        let link = self.inner.link.lock().await.take();
        *self.inner.conn_id.lock() = None;
        let Some(link) = link else {
            return;
        };

        let _ = link.stop_tx.send(true);
        for duty in &link.duties {
            duty.abort();
        }
        let sink = link.sink.clone();
        let closed = timeout(CLOSE_TIMEOUT, async move {
            let _ = sink.lock().await.close().await;
        })
        .await;
        if closed.is_err() {
            warn!(conn_id = %link.conn_id, "Timed out closing connection");
        }
        debug!(feed = self.feed_name(), conn_id = %link.conn_id, "Connection torn down");
    }

    async fn after_connect(&self) {
        self.replay().await;
        if let Some(conn_id) = self.conn_id() {
            self.inner.messages.on_connected(&conn_id);
        }
    }

    /// Re-send every recorded subscription in original order
    async fn replay(&self) {
        let subscriptions = self.subscriptions();
        if subscriptions.is_empty() {
            return;
        }
        info!(
            feed = self.feed_name(),
            count = subscriptions.len(),
            "Replaying subscriptions"
        );
        for descriptor in &subscriptions {
            self.send_descriptor(descriptor, Direction::Subscribe).await;
        }
    }

    async fn send_descriptor(&self, descriptor: &Value, direction: Direction) -> bool {
        let current = {
            let link = self.inner.link.lock().await;
            link.as_ref()
                .map(|link| (link.conn_id.clone(), link.sink.clone()))
        };
        let Some((conn_id, sink)) = current else {
            debug!(descriptor = %descriptor, "Not connected, recorded for replay");
            return false;
        };

        let frame = match direction {
            Direction::Subscribe => self.inner.feed.subscribe_frame(descriptor, &conn_id),
            Direction::Unsubscribe => self.inner.feed.unsubscribe_frame(descriptor, &conn_id),
        };
        let Some(frame) = frame else {
            return false;
        };

        let sent = sink.lock().await.send(Message::Text(frame)).await;
        match sent {
            Ok(()) => true,
            Err(e) => {
                self.report(&FeedError::SendFailure(format!("{}: {}", descriptor, e)));
                false
            }
        }
    }

    /// `origin` is the connection a supervisor-driven restart is recovering;
    /// the restart is dropped if that connection has already been replaced.
    async fn run_restart(&self, explicit: bool, origin: Option<String>) -> Result<()> {
        let delay = self.inner.config.restart_delay;
        let mut first = true;

        loop {
            {
                let _guard = self.inner.lifecycle.lock().await;
                let state = self.state();
                if state == SessionState::Stopped && !(explicit && first) {
                    return Ok(());
                }
                if first && origin.is_some() && self.conn_id() != origin {
                    return Ok(());
                }
                info!(
                    feed = self.feed_name(),
                    conn_id = ?self.conn_id(),
                    delay_secs = delay.as_secs(),
                    "Restarting session"
                );
                self.record_restart();
                self.teardown().await;
                self.set_state(SessionState::Restarting);
            }
            first = false;

            RESTARTS.with_label_values(&[self.feed_name()]).inc();
            self.report(&FeedError::RestartPending(delay));
            sleep(delay).await;

            let connected = {
                let _guard = self.inner.lifecycle.lock().await;
                match self.state() {
                    SessionState::Stopped | SessionState::Active => return Ok(()),
                    _ => {}
                }
                self.connect_locked().await
            };

            match connected {
                Ok(()) => {
                    self.after_connect().await;
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(_) => continue,
            }
        }
    }
}

/// Restarts the session on every fault from its current connection
async fn supervise(inner: Weak<Inner>, mut faults: mpsc::UnboundedReceiver<Fault>) {
    while let Some(fault) = faults.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let session = Session { inner };
        if session.state() == SessionState::Stopped {
            continue;
        }
        if let Some(conn_id) = &fault.conn_id {
            if session.conn_id().as_deref() != Some(conn_id.as_str()) {
                debug!(conn_id = %conn_id, error = %fault.error, "Ignoring fault from old connection");
                continue;
            }
        }
        if let Err(e) = session.run_restart(false, fault.conn_id).await {
            debug!(error = %e, "Supervisor giving up");
        }
    }
}

/// State shared by the duties of one connection
#[derive(Clone)]
struct DutyContext {
    feed: Arc<dyn Feed>,
    conn_id: String,
    sink: Arc<AsyncMutex<WsSink>>,
    stop: watch::Receiver<bool>,
    faults: mpsc::UnboundedSender<Fault>,
    errors: Arc<dyn ErrorSink>,
    last_inbound: Arc<Mutex<Instant>>,
}

impl DutyContext {
    async fn send(&self, message: Message) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| FeedError::SendFailure(e.to_string()))
    }

    /// Report a fault and hand it to the supervisor, unless we are shutting down
    fn fail(&self, error: FeedError) {
        if *self.stop.borrow() {
            return;
        }
        FAULTS
            .with_label_values(&[self.feed.name(), error.kind()])
            .inc();
        self.errors.on_error(&error);
        let _ = self.faults.send(Fault {
            conn_id: Some(self.conn_id.clone()),
            error,
        });
    }
}

async fn heartbeat(ctx: DutyContext, period: Duration) {
    let mut stop = ctx.stop.clone();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }

        let result = match ctx.feed.keepalive() {
            Keepalive::Ping => ctx.send(Message::Ping(Vec::new())).await,
            Keepalive::Text(text) => ctx.send(Message::Text(text)).await,
            Keepalive::RenewToken => ctx.feed.renew_token().await,
        };
        if let Err(e) = result {
            ctx.fail(match e {
                FeedError::HeartbeatFailure(_) => e,
                other => FeedError::HeartbeatFailure(other.to_string()),
            });
            return;
        }
    }
}

async fn staleness(ctx: DutyContext, window: Duration) {
    let mut stop = ctx.stop.clone();
    let mut ticker = interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }

        let silent_for = ctx.last_inbound.lock().elapsed();
        if silent_for > window {
            ctx.fail(FeedError::StalenessTimeout(silent_for));
            return;
        }
    }
}

async fn receive(ctx: DutyContext, mut source: WsSource, messages: Arc<dyn MessageSink>) {
    let mut stop = ctx.stop.clone();
    let frames = INBOUND_FRAMES.with_label_values(&[ctx.feed.name()]);

    loop {
        let frame = tokio::select! {
            _ = stop.changed() => return,
            frame = source.next() => frame,
        };

        match Inbound::from(frame) {
            Inbound::Text(text) => {
                *ctx.last_inbound.lock() = Instant::now();
                frames.inc();
                if let Some(error) = ctx.feed.fault(&text) {
                    warn!(feed = ctx.feed.name(), conn_id = %ctx.conn_id, error = %error, "Feed reported a fault");
                    ctx.fail(error);
                    return;
                }
                if !ctx.feed.is_control(&text) {
                    messages.on_message(&text);
                }
            }
            Inbound::Ping(data) => {
                *ctx.last_inbound.lock() = Instant::now();
                if let Err(e) = ctx.send(Message::Pong(data)).await {
                    debug!(error = %e, "Failed to answer ping");
                }
            }
            Inbound::Pong | Inbound::Other => {
                *ctx.last_inbound.lock() = Instant::now();
            }
            Inbound::Closed(reason) => {
                ctx.fail(FeedError::ReadFailure(reason));
                return;
            }
        }
    }
}
