//! Shared fixtures: an in-memory node, a connection to it, a token event set
//! and a scanner reading logs through the indexer.

#![allow(dead_code)]

use async_trait::async_trait;
use bloxer::config::{deep_merge, NoExtras};
use bloxer::connection::{Connection, ConnectionSignals, ConnectionState};
use bloxer::events::{EventInfo, EventSet};
use bloxer::indexer::{Flavor, Indexer, IndexerContext, ScanRange, Scanner};
use bloxer::{IndexerError, IndexerResult};
use eyre::bail;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Events of a token contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenEvent {
    Transfer { from: String, to: String, value: u64 },
    Approval { owner: String, spender: String, value: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenEventKind {
    Transfer,
    Approval,
}

impl EventSet for TokenEvent {
    type Kind = TokenEventKind;

    fn kind(&self) -> TokenEventKind {
        match self {
            Self::Transfer { .. } => TokenEventKind::Transfer,
            Self::Approval { .. } => TokenEventKind::Approval,
        }
    }

    fn name(kind: TokenEventKind) -> &'static str {
        match kind {
            TokenEventKind::Transfer => "Transfer",
            TokenEventKind::Approval => "Approval",
        }
    }
}

pub fn transfer(value: u64) -> TokenEvent {
    TokenEvent::Transfer {
        from: "alice".to_string(),
        to: "bob".to_string(),
        value,
    }
}

pub fn approval(value: u64) -> TokenEvent {
    TokenEvent::Approval {
        owner: "alice".to_string(),
        spender: "carol".to_string(),
        value,
    }
}

/// A log emitted by the mock chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub block: u64,
    pub hash: String,
    pub index: u32,
    pub event: TokenEvent,
}

/// Requests understood by [`MockConnection`].
#[derive(Debug, Clone)]
pub enum MockRequest {
    Logs { from: u64, to: u64 },
}

/// One session as seen by the node.
#[derive(Debug, Default)]
struct Session {
    signals: ConnectionSignals,
    subscribed: AtomicBool,
}

/// In-memory chain with scriptable failures.
#[derive(Debug, Default)]
pub struct MockNode {
    head: Mutex<u64>,
    logs: Mutex<BTreeMap<u64, Vec<Log>>>,
    failing_connects: AtomicU32,
    failing_subscriptions: AtomicU32,
    failing_requests: AtomicU32,
    connects: AtomicU32,
    requests: AtomicU32,
    live: Mutex<Option<Arc<Session>>>,
    sessions: Mutex<Vec<Arc<Session>>>,
}

/// Every following connection attempt fails.
pub const ALWAYS: u32 = u32::MAX;

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
            0 => None,
            ALWAYS => Some(ALWAYS),
            n => Some(n - 1),
        })
        .is_ok()
}

impl MockNode {
    pub fn new(head: u64) -> Arc<Self> {
        let node = Self::default();
        *node.head.lock().unwrap() = head;
        Arc::new(node)
    }

    pub fn add_log(&self, block: u64, hash: &str, index: u32, event: TokenEvent) {
        self.logs.lock().unwrap().entry(block).or_default().push(Log {
            block,
            hash: hash.to_string(),
            index,
            event,
        });
    }

    /// Mines `height` and notifies the subscribed session.
    pub fn push_block(&self, height: u64) {
        *self.head.lock().unwrap() = height;
        if let Some(session) = self.live.lock().unwrap().as_ref() {
            if session.subscribed.load(Ordering::SeqCst) {
                session.signals.block(height);
            }
        }
    }

    /// Closes the live session as if the socket dropped.
    pub fn drop_connection(&self) {
        if let Some(session) = self.live.lock().unwrap().take() {
            session.subscribed.store(false, Ordering::SeqCst);
            session.signals.disconnected();
        }
    }

    pub fn fail_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// The next `count` block subscriptions fail after the handshake.
    pub fn fail_subscriptions(&self, count: u32) {
        self.failing_subscriptions.store(count, Ordering::SeqCst);
    }

    pub fn fail_requests(&self, count: u32) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Sessions that completed a handshake and were never closed.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|session| session.signals.is_connected())
            .count()
    }

    fn head(&self) -> u64 {
        *self.head.lock().unwrap()
    }

    fn logs_between(&self, from: u64, to: u64) -> Vec<Log> {
        self.logs
            .lock()
            .unwrap()
            .range(from..=to)
            .flat_map(|(_, logs)| logs.iter().cloned())
            .collect()
    }
}

/// Connection to a [`MockNode`].
#[derive(Debug)]
pub struct MockConnection {
    url: String,
    node: Arc<MockNode>,
    session: Arc<Session>,
}

impl MockConnection {
    pub fn with_node(url: &str, node: Arc<MockNode>) -> Self {
        Self {
            url: url.to_string(),
            node,
            session: Arc::new(Session::default()),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    type Request = MockRequest;
    type Response = Vec<Log>;

    fn new(url: &str) -> Self {
        Self::with_node(url, MockNode::new(0))
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn events(&self) -> broadcast::Receiver<bloxer::ConnectionEvent> {
        self.session.signals.subscribe()
    }

    fn connect(&self) {
        self.node.connects.fetch_add(1, Ordering::SeqCst);
        if self.session.signals.connecting().is_err() {
            return;
        }
        if take_failure(&self.node.failing_connects) {
            self.session.signals.error("connection refused");
            self.session.signals.disconnected();
            return;
        }
        if self.session.signals.connected().is_ok() {
            *self.node.live.lock().unwrap() = Some(Arc::clone(&self.session));
            self.node
                .sessions
                .lock()
                .unwrap()
                .push(Arc::clone(&self.session));
        }
    }

    async fn wait_connection(&self) -> eyre::Result<()> {
        self.session.signals.wait_connected().await
    }

    async fn subscribe_to_latest_block(&self) -> eyre::Result<()> {
        if !self.is_connected() {
            bail!("not connected");
        }
        if take_failure(&self.node.failing_subscriptions) {
            bail!("subscription rejected");
        }
        self.session.subscribed.store(true, Ordering::SeqCst);
        self.session.signals.block(self.node.head());
        Ok(())
    }

    async fn unsubscribe_from_latest_block(&self) -> eyre::Result<()> {
        self.session.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> eyre::Result<()> {
        self.session.subscribed.store(false, Ordering::SeqCst);
        self.session.signals.disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.signals.is_connected()
    }

    fn state(&self) -> ConnectionState {
        self.session.signals.state()
    }

    async fn request(&self, request: MockRequest) -> eyre::Result<Vec<Log>> {
        self.node.requests.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            bail!("not connected");
        }
        if take_failure(&self.node.failing_requests) {
            bail!("request timed out");
        }
        match request {
            MockRequest::Logs { from, to } => Ok(self.node.logs_between(from, to)),
        }
    }
}

/// Flavor binding the engine to the mock chain.
pub struct TestChain;

impl Flavor for TestChain {
    const NAME: &'static str = "Test";
    type Connection = MockConnection;
    type Events = TokenEvent;
    type Config = NoExtras;
    type ScanOptions = ScanRange;
}

/// Reads logs of each range and reports them.
#[derive(Debug, Clone, Default)]
pub struct LogScanner {
    ranges: Arc<Mutex<Vec<ScanRange>>>,
    fail_before: Arc<Mutex<Option<String>>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl LogScanner {
    pub fn ranges(&self) -> Vec<ScanRange> {
        self.ranges.lock().unwrap().clone()
    }

    /// The next scan that reaches `hash` fails before reporting it.
    pub fn fail_before(&self, hash: &str) {
        *self.fail_before.lock().unwrap() = Some(hash.to_string());
    }

    /// The next scan records its range, then waits for the returned
    /// notify before requesting anything.
    pub fn pause_next_scan(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Display form of every error a scan returned, in order.
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    fn should_fail(&self, hash: &str) -> bool {
        let mut fail = self.fail_before.lock().unwrap();
        if fail.as_deref() == Some(hash) {
            *fail = None;
            return true;
        }
        false
    }
}

#[async_trait]
impl Scanner<TestChain> for LogScanner {
    async fn scan(&self, ctx: &IndexerContext<TestChain>, range: ScanRange) -> IndexerResult<u64> {
        self.ranges.lock().unwrap().push(range);

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let result = self.scan_logs(ctx, range).await;
        if let Err(err) = &result {
            self.failures.lock().unwrap().push(err.to_string());
        }
        result
    }
}

impl LogScanner {
    async fn scan_logs(
        &self,
        ctx: &IndexerContext<TestChain>,
        range: ScanRange,
    ) -> IndexerResult<u64> {
        let logs = ctx
            .request(MockRequest::Logs {
                from: range.starting_block,
                to: range.ending_block,
            })
            .await?;

        for log in logs {
            if self.should_fail(&log.hash) {
                return Err(IndexerError::scan(
                    format!("injected failure before {}", log.hash),
                    None,
                ));
            }
            ctx.notify_event(log.event, &log.hash, log.index, log.block)
                .await?;
        }

        ctx.notify_block(range.ending_block).await?;
        Ok(range.ending_block + 1)
    }
}

pub type TestIndexer = Indexer<TestChain, LogScanner>;

/// Fast-retrying configuration without persistence, overridden by `overrides`.
pub fn config(overrides: Value) -> Value {
    deep_merge(
        json!({
            "wsUrl": "ws://mock.node",
            "reconnectTimeout": 10,
            "maxReconnectAttempts": 3,
            "maxRequestRetries": 3,
            "requestRetryTimeout": 10,
            "persist": false,
        }),
        overrides,
    )
}

/// Same as [`config`] with a store at `path`.
pub fn persistent_config(path: &Path, overrides: Value) -> Value {
    config(deep_merge(
        json!({ "persist": true, "persistenceFilePath": path }),
        overrides,
    ))
}

pub fn indexer(node: &Arc<MockNode>, config: Value, scanner: LogScanner) -> Arc<TestIndexer> {
    let node = Arc::clone(node);
    let indexer = Indexer::with_connector(config, scanner, move |url| {
        MockConnection::with_node(url, Arc::clone(&node))
    })
    .expect("valid configuration");
    Arc::new(indexer)
}

pub fn spawn_run(indexer: &Arc<TestIndexer>) -> JoinHandle<IndexerResult<()>> {
    let indexer = Arc::clone(indexer);
    tokio::spawn(async move { indexer.run().await })
}

/// Deliveries of one event kind, in order.
pub type Deliveries = Arc<Mutex<Vec<(TokenEvent, EventInfo)>>>;

pub fn record(indexer: &TestIndexer, kind: TokenEventKind) -> Deliveries {
    let deliveries = Deliveries::default();
    let sink = Arc::clone(&deliveries);
    indexer.on(kind, move |event, info| {
        sink.lock().unwrap().push((event.clone(), info.clone()));
    });
    deliveries
}

pub fn hashes(deliveries: &Deliveries) -> Vec<String> {
    deliveries
        .lock()
        .unwrap()
        .iter()
        .map(|(_, info)| info.hash.clone())
        .collect()
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
