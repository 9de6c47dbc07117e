//! Session lifecycle tests against an in-memory connector.
//!
//! Every connect hands the test a [`Wire`]: the frames the session wrote and a
//! sender for frames the session will read. Time is paused so restart delays,
//! heartbeats and staleness windows elapse instantly.

use async_trait::async_trait;
use futures_util::{sink, stream};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::tungstenite::{protocol::Message, Error as WsError};

use market_stream::websocket::{Connection, Connector};
use market_stream::{
    Feed, FeedError, Keepalive, MessageSink, Result, Session, SessionConfig, SessionState,
};

type Frame = std::result::Result<Message, WsError>;

/// Test side of one connection
struct Wire {
    outbound: mpsc::UnboundedReceiver<Message>,
    inbound: mpsc::UnboundedSender<Frame>,
}

impl Wire {
    /// Next text frame the session sent, skipping pings
    async fn next_text(&mut self) -> String {
        loop {
            match self.outbound.recv().await {
                Some(Message::Text(text)) => return text,
                Some(_) => continue,
                None => panic!("connection closed before a text frame"),
            }
        }
    }

    fn push(&self, text: &str) {
        self.inbound
            .send(Ok(Message::Text(text.to_string())))
            .unwrap();
    }
}

struct MockConnector {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    greeting: Option<String>,
    wires: mpsc::UnboundedSender<Wire>,
}

impl MockConnector {
    fn new(greeting: Option<&str>) -> (Arc<Self>, mpsc::UnboundedReceiver<Wire>) {
        let (wires, wire_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            greeting: greeting.map(str::to_string),
            wires,
        });
        (connector, wire_rx)
    }

    fn refusing() -> Arc<Self> {
        let (connector, _) = Self::new(None);
        connector.refuse.store(true, Ordering::SeqCst);
        connector
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FeedError::ConnectFailure("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        if let Some(greeting) = &self.greeting {
            let _ = in_tx.send(Ok(Message::Text(greeting.clone())));
        }

        let sink = sink::unfold(
            out_tx,
            |tx: mpsc::UnboundedSender<Message>, msg: Message| async move {
                tx.send(msg).map_err(|_| WsError::ConnectionClosed)?;
                Ok::<_, WsError>(tx)
            },
        );
        let source = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });

        let _ = self.wires.send(Wire {
            outbound: out_rx,
            inbound: in_tx,
        });
        Ok(Connection::new(Box::pin(sink), Box::pin(source)))
    }
}

#[derive(Default)]
struct TestFeed {
    auth: bool,
    failing_renewal: bool,
}

#[async_trait]
impl Feed for TestFeed {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn endpoint(&self) -> Result<String> {
        Ok("ws://feed.test".to_string())
    }

    fn requires_auth(&self) -> bool {
        self.auth
    }

    async fn authenticate(&self, conn: &mut Connection, conn_id: &str) -> Result<()> {
        conn.send_text(json!({"op": "login", "id": conn_id}).to_string())
            .await?;
        match conn.recv_text().await?.as_str() {
            "welcome" => Ok(()),
            other => Err(FeedError::AuthFailure(other.to_string())),
        }
    }

    fn keepalive(&self) -> Keepalive {
        if self.failing_renewal {
            Keepalive::RenewToken
        } else {
            Keepalive::Ping
        }
    }

    async fn renew_token(&self) -> Result<()> {
        Err(FeedError::RestApi("token revoked".to_string()))
    }

    fn subscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"op": "subscribe", "arg": descriptor}).to_string())
    }

    fn unsubscribe_frame(&self, descriptor: &Value, _conn_id: &str) -> Option<String> {
        Some(json!({"op": "unsubscribe", "arg": descriptor}).to_string())
    }

    fn is_control(&self, raw: &str) -> bool {
        raw == "pong"
    }

    fn fault(&self, raw: &str) -> Option<FeedError> {
        (raw == "expired").then(|| FeedError::HeartbeatFailure("token expired".to_string()))
    }
}

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<String>>,
    connected: Mutex<Vec<String>>,
}

impl MessageSink for Recorder {
    fn on_message(&self, raw: &str) {
        self.messages.lock().push(raw.to_string());
    }

    fn on_connected(&self, conn_id: &str) {
        self.connected.lock().push(conn_id.to_string());
    }
}

struct Harness {
    session: Session,
    errors: Arc<Mutex<Vec<FeedError>>>,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn new(feed: TestFeed, connector: Arc<MockConnector>) -> Self {
        Self::with_config(feed, connector, test_config())
    }

    fn with_config(feed: TestFeed, connector: Arc<MockConnector>, config: SessionConfig) -> Self {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder::default());
        let sink = {
            let errors = errors.clone();
            move |e: &FeedError| errors.lock().push(e.clone())
        };
        let session = Session::with_connector(
            Arc::new(feed),
            connector,
            config,
            Arc::new(sink),
            recorder.clone(),
        );
        Self {
            session,
            errors,
            recorder,
        }
    }

    fn saw(&self, predicate: impl Fn(&FeedError) -> bool) -> bool {
        self.errors.lock().iter().any(predicate)
    }

    async fn wait_active(&self) {
        for _ in 0..1000 {
            if self.session.state() == SessionState::Active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never became active: {}", self.session.state());
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        restart_delay: Duration::from_secs(1),
        restart_limit_num: 10,
        restart_limit_window: Duration::from_secs(300),
        staleness_interval: Duration::from_secs(100),
        ..SessionConfig::default()
    }
}

fn sub(value: &Value) -> String {
    json!({"op": "subscribe", "arg": value}).to_string()
}

#[tokio::test(start_paused = true)]
async fn test_restart_bound_stops_after_limit() {
    let connector = MockConnector::refusing();
    let harness = Harness::new(TestFeed::default(), connector.clone());

    assert!(matches!(
        harness.session.start().await,
        Err(FeedError::ConnectFailure(_))
    ));
    assert_eq!(connector.attempts(), 1);

    let err = assert_err!(harness.session.restart().await);
    assert_eq!(
        err,
        FeedError::RestartLimitExceeded {
            count: 11,
            window: Duration::from_secs(300)
        }
    );
    assert_eq!(connector.attempts(), 11);
    assert_eq!(harness.session.state(), SessionState::Stopped);
    assert!(harness.saw(|e| matches!(e, FeedError::RestartPending(_))));
    assert!(harness.saw(|e| matches!(e, FeedError::RestartLimitExceeded { .. })));

    // Still inside the window: an explicit start makes no new attempt
    assert!(matches!(
        harness.session.start().await,
        Err(FeedError::RestartLimitExceeded { .. })
    ));
    assert_eq!(connector.attempts(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_replay_in_order_after_restart() {
    let (connector, mut wires) = MockConnector::new(None);
    let harness = Harness::new(TestFeed::default(), connector);
    let a = json!({"channel": "book", "symbol": "A"});
    let b = json!({"channel": "book", "symbol": "B"});

    // Recorded while disconnected
    assert!(!harness.session.subscribe(a.clone()).await);
    assert!(!harness.session.subscribe(b.clone()).await);
    assert_eq!(harness.session.subscriptions(), vec![a.clone(), b.clone()]);

    assert_ok!(harness.session.start().await);
    let first_id = harness.session.conn_id().unwrap();
    let mut first = wires.recv().await.unwrap();
    assert_eq!(first.next_text().await, sub(&a));
    assert_eq!(first.next_text().await, sub(&b));

    assert_ok!(harness.session.restart().await);
    assert_eq!(harness.session.state(), SessionState::Active);
    let second_id = harness.session.conn_id().unwrap();
    assert_ne!(first_id, second_id);

    let mut second = wires.recv().await.unwrap();
    assert_eq!(second.next_text().await, sub(&a));
    assert_eq!(second.next_text().await, sub(&b));
    assert_eq!(harness.session.restart_count(), 1);
    assert_eq!(
        harness.recorder.connected.lock().as_slice(),
        &[first_id, second_id]
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_failure_restarts_session() {
    let (connector, mut wires) = MockConnector::new(None);
    let harness = Harness::new(TestFeed::default(), connector.clone());
    assert_ok!(harness.session.start().await);
    let first_id = harness.session.conn_id();

    let first = wires.recv().await.unwrap();
    first.push("hello");
    first.push("pong");
    drop(first);

    let _second = wires.recv().await.unwrap();
    harness.wait_active().await;

    assert_ne!(harness.session.conn_id(), first_id);
    assert_eq!(connector.attempts(), 2);
    assert_eq!(harness.session.restart_count(), 1);
    assert!(harness.saw(|e| matches!(e, FeedError::ReadFailure(_))));
    assert!(harness.saw(|e| matches!(e, FeedError::RestartPending(_))));
    assert_eq!(harness.recorder.messages.lock().as_slice(), &["hello"]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_is_restarted() {
    let (connector, mut wires) = MockConnector::new(None);
    let harness = Harness::new(TestFeed::default(), connector);
    assert_ok!(harness.session.start().await);

    // Keep the connection open but never send anything
    let _first = wires.recv().await.unwrap();
    let _second = wires.recv().await.unwrap();
    harness.wait_active().await;

    assert!(harness.saw(|e| matches!(e, FeedError::StalenessTimeout(d) if *d > Duration::from_secs(100))));
    assert_eq!(harness.session.restart_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failure_restarts_session() {
    let (connector, mut wires) = MockConnector::new(None);
    let feed = TestFeed {
        failing_renewal: true,
        ..TestFeed::default()
    };
    let harness = Harness::new(feed, connector);
    assert_ok!(harness.session.start().await);

    let first = wires.recv().await.unwrap();
    // Keep the connection fresh so only the heartbeat can fail
    first.push("tick");
    let _second = wires.recv().await.unwrap();
    harness.wait_active().await;

    assert!(harness.saw(|e| matches!(e, FeedError::HeartbeatFailure(msg) if msg.contains("token revoked"))));
    assert!(!harness.saw(|e| matches!(e, FeedError::StalenessTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_final() {
    let (connector, mut wires) = MockConnector::new(None);
    let harness = Harness::new(TestFeed::default(), connector.clone());
    assert_ok!(harness.session.start().await);
    let wire = wires.recv().await.unwrap();

    harness.session.stop().await;
    harness.session.stop().await;
    assert_eq!(harness.session.state(), SessionState::Stopped);
    assert_eq!(harness.session.conn_id(), None);

    // Nothing reconnects a stopped session
    drop(wire);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(wires.try_recv().is_err());
    assert_eq!(connector.attempts(), 1);

    // Descriptors are still recorded for the next explicit start
    let c = json!({"channel": "book", "symbol": "C"});
    assert!(!harness.session.subscribe(c.clone()).await);
    assert_ok!(harness.session.start().await);
    let mut next = wires.recv().await.unwrap();
    assert_eq!(next.next_text().await, sub(&c));
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_drops_descriptor_from_replay() {
    let (connector, mut wires) = MockConnector::new(None);
    let harness = Harness::new(TestFeed::default(), connector);
    let a = json!("a");
    let b = json!("b");
    assert_ok!(harness.session.start().await);
    let mut wire = wires.recv().await.unwrap();

    assert!(harness.session.subscribe(a.clone()).await);
    assert!(harness.session.subscribe(b.clone()).await);
    assert!(harness.session.subscribe(a.clone()).await);
    assert_eq!(harness.session.subscriptions(), vec![a.clone(), b.clone()]);

    assert!(harness.session.unsubscribe(a.clone()).await);
    assert_eq!(harness.session.subscriptions(), vec![b.clone()]);
    assert_eq!(wire.next_text().await, sub(&a));
    assert_eq!(wire.next_text().await, sub(&b));
    assert_eq!(wire.next_text().await, sub(&a));
    assert_eq!(
        wire.next_text().await,
        json!({"op": "unsubscribe", "arg": "a"}).to_string()
    );
}

#[tokio::test(start_paused = true)]
async fn test_auth_handshake() {
    let (connector, mut wires) = MockConnector::new(Some("welcome"));
    let feed = TestFeed {
        auth: true,
        ..TestFeed::default()
    };
    let harness = Harness::new(feed, connector);
    assert_ok!(harness.session.start().await);

    let mut wire = wires.recv().await.unwrap();
    let login: Value = serde_json::from_str(&wire.next_text().await).unwrap();
    assert_eq!(login["op"], "login");
    assert_eq!(login["id"], harness.session.conn_id().unwrap());
    // The handshake reply is consumed, not delivered
    assert!(harness.recorder.messages.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_fails_start() {
    let (connector, _wires) = MockConnector::new(Some("denied"));
    let feed = TestFeed {
        auth: true,
        ..TestFeed::default()
    };
    let harness = Harness::new(feed, connector);

    let err = assert_err!(harness.session.start().await);
    assert_eq!(err, FeedError::AuthFailure("denied".to_string()));
    assert_eq!(harness.session.state(), SessionState::Disconnected);
    assert!(harness.saw(|e| matches!(e, FeedError::AuthFailure(_))));
}

#[tokio::test(start_paused = true)]
async fn test_feed_fault_frame_restarts_session() {
    let (connector, mut wires) = MockConnector::new(None);
    let harness = Harness::new(TestFeed::default(), connector.clone());
    assert_ok!(harness.session.start().await);
    let first_id = harness.session.conn_id();

    let first = wires.recv().await.unwrap();
    first.push("expired");
    let _second = wires.recv().await.unwrap();
    harness.wait_active().await;

    assert_ne!(harness.session.conn_id(), first_id);
    assert_eq!(connector.attempts(), 2);
    assert!(harness.saw(|e| matches!(e, FeedError::HeartbeatFailure(msg) if msg.contains("expired"))));
    // The fault frame is not delivered
    assert!(harness.recorder.messages.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_staleness_window_fails_start() {
    let (connector, _wires) = MockConnector::new(None);
    let config = SessionConfig {
        staleness_interval: Duration::ZERO,
        ..test_config()
    };
    let harness = Harness::with_config(TestFeed::default(), connector.clone(), config);

    let err = assert_err!(harness.session.start().await);
    assert!(matches!(err, FeedError::Config(_)));
    assert_eq!(connector.attempts(), 0);
    assert_eq!(harness.session.state(), SessionState::Stopped);
    assert!(harness.saw(|e| matches!(e, FeedError::Config(_))));

    // An explicit restart gives up rather than retrying forever
    let err = assert_err!(harness.session.restart().await);
    assert!(matches!(err, FeedError::Config(_)));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_heartbeat_override_fails_start() {
    let (connector, _wires) = MockConnector::new(None);
    let config = SessionConfig {
        heartbeat_interval: Some(Duration::ZERO),
        ..test_config()
    };
    let harness = Harness::with_config(TestFeed::default(), connector.clone(), config);

    assert!(matches!(
        harness.session.start().await,
        Err(FeedError::Config(_))
    ));
    assert_eq!(connector.attempts(), 0);
}
