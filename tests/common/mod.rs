#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the realtime integration tests.
//!
//! Provides a scriptable [`MockConnector`] whose links are inspected through
//! [`LinkProbe`], plus recording message handlers and a counting recovery hook.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bbtronic_realtime::{
    Connector, FrameSink, Link, LinkSubscription, MessageHandler, RealtimeError, RecoveryHook,
    TopicMessage,
};
use tokio::sync::watch;
use tokio::time::Instant;

/// Let spawned tasks (link watchers, reconnect timers) run.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the next `open()` does.
#[derive(Debug, Clone)]
pub enum Open {
    Succeed,
    Fail(String),
}

struct ConnectorState {
    script: StdMutex<VecDeque<Open>>,
    fallback: StdMutex<Open>,
    opens: StdMutex<Vec<Instant>>,
    links: StdMutex<Vec<LinkProbe>>,
    gate: watch::Sender<bool>,
}

/// A connector whose `open()` outcomes are scripted in order; once the
/// script runs out every call uses the fallback (succeed by default).
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Open>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(ConnectorState {
                script: StdMutex::new(VecDeque::from(script)),
                fallback: StdMutex::new(Open::Succeed),
                opens: StdMutex::new(Vec::new()),
                links: StdMutex::new(Vec::new()),
                gate,
            }),
        }
    }

    /// Outcome used once the script is exhausted.
    pub fn set_fallback(&self, outcome: Open) {
        *self.state.fallback.lock().unwrap() = outcome;
    }

    /// Make `open()` block until [`release`](Self::release).
    pub fn hold(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.state.gate.send_replace(true);
    }

    /// Number of `open()` calls so far.
    pub fn opens(&self) -> usize {
        self.state.opens.lock().unwrap().len()
    }

    /// When each `open()` call started.
    pub fn open_times(&self) -> Vec<Instant> {
        self.state.opens.lock().unwrap().clone()
    }

    /// Probes of every link handed out, oldest first.
    pub fn links(&self) -> Vec<LinkProbe> {
        self.state.links.lock().unwrap().clone()
    }

    /// Probe of the most recent link.
    pub fn last_link(&self) -> LinkProbe {
        self.links().pop().expect("no link opened yet")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _endpoint: &str) -> Result<Box<dyn Link>, RealtimeError> {
        self.state.opens.lock().unwrap().push(Instant::now());

        let mut gate = self.state.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let outcome = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.state.fallback.lock().unwrap().clone());

        match outcome {
            Open::Succeed => {
                let link = MockLink::new();
                self.state.links.lock().unwrap().push(link.probe());
                Ok(Box::new(link))
            }
            Open::Fail(reason) => Err(RealtimeError::Protocol(reason)),
        }
    }
}

// ── MockLink ────────────────────────────────────────────────────────

struct LinkState {
    live: StdMutex<HashMap<u64, (String, FrameSink)>>,
    next_id: AtomicU64,
    subscribed: StdMutex<Vec<String>>,
    cancelled: StdMutex<Vec<String>>,
    published: StdMutex<Vec<(String, String)>>,
    close_calls: AtomicUsize,
    closed: watch::Sender<bool>,
}

impl LinkState {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn shut(&self) {
        self.closed.send_replace(true);
        self.live.lock().unwrap().clear();
    }
}

/// An in-memory link that records everything the manager does to it.
pub struct MockLink {
    state: Arc<LinkState>,
}

impl MockLink {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            state: Arc::new(LinkState {
                live: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                subscribed: StdMutex::new(Vec::new()),
                cancelled: StdMutex::new(Vec::new()),
                published: StdMutex::new(Vec::new()),
                close_calls: AtomicUsize::new(0),
                closed,
            }),
        }
    }

    pub fn probe(&self) -> LinkProbe {
        LinkProbe {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Link for MockLink {
    fn subscribe(
        &self,
        path: &str,
        sink: FrameSink,
    ) -> Result<Box<dyn LinkSubscription>, RealtimeError> {
        if self.state.is_closed() {
            return Err(RealtimeError::SendFailed("link closed".into()));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .live
            .lock()
            .unwrap()
            .insert(id, (path.to_string(), sink));
        self.state.subscribed.lock().unwrap().push(path.to_string());
        Ok(Box::new(MockSubscription {
            state: Arc::clone(&self.state),
            id,
        }))
    }

    fn publish(&self, path: &str, body: String) -> Result<(), RealtimeError> {
        if self.state.is_closed() {
            return Err(RealtimeError::SendFailed("link closed".into()));
        }
        self.state
            .published
            .lock()
            .unwrap()
            .push((path.to_string(), body));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn closed(&self) {
        let mut rx = self.state.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), RealtimeError> {
        self.state.close_calls.fetch_add(1, Ordering::Relaxed);
        self.state.shut();
        Ok(())
    }
}

struct MockSubscription {
    state: Arc<LinkState>,
    id: u64,
}

impl LinkSubscription for MockSubscription {
    fn cancel(self: Box<Self>) {
        if let Some((path, _)) = self.state.live.lock().unwrap().remove(&self.id) {
            self.state.cancelled.lock().unwrap().push(path);
        }
    }
}

/// Test-side view of a [`MockLink`] owned by the manager.
#[derive(Clone)]
pub struct LinkProbe {
    state: Arc<LinkState>,
}

impl LinkProbe {
    /// Simulate the broker delivering `body` on `path`.
    pub fn deliver(&self, path: &str, body: &str) {
        let sinks: Vec<FrameSink> = self
            .state
            .live
            .lock()
            .unwrap()
            .values()
            .filter(|(p, _)| p == path)
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in sinks {
            sink(body);
        }
    }

    /// Simulate the connection dropping without a close request.
    pub fn drop_connection(&self) {
        self.state.shut();
    }

    /// Paths with a live subscription, sorted.
    pub fn live_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .state
            .live
            .lock()
            .unwrap()
            .values()
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Every path ever subscribed, in order.
    pub fn subscribed(&self) -> Vec<String> {
        self.state.subscribed.lock().unwrap().clone()
    }

    /// Every path whose subscription was cancelled, in order.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.cancelled.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

// ── Handlers and hooks ──────────────────────────────────────────────

/// Collects every message delivered to the handlers it hands out.
#[derive(Clone, Default)]
pub struct Recorder {
    messages: Arc<StdMutex<Vec<(String, TopicMessage)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that records messages tagged with `tag`.
    pub fn handler(&self, tag: &str) -> impl MessageHandler {
        let messages = Arc::clone(&self.messages);
        let tag = tag.to_string();
        move |msg: TopicMessage| messages.lock().unwrap().push((tag.clone(), msg))
    }

    /// `(tag, event)` pairs in delivery order.
    pub fn events(&self) -> Vec<(String, String)> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, msg)| (tag.clone(), msg.event.clone()))
            .collect()
    }

    pub fn messages(&self) -> Vec<TopicMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

/// Counts how often each recovery callback ran.
#[derive(Clone, Default)]
pub struct CountingHook {
    before: Arc<AtomicUsize>,
    recovered: Arc<AtomicUsize>,
}

impl CountingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_count(&self) -> usize {
        self.before.load(Ordering::SeqCst)
    }

    pub fn recovered_count(&self) -> usize {
        self.recovered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecoveryHook for CountingHook {
    async fn before_reconnect(&self) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::SeqCst);
    }
}
