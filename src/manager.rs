//! The shared realtime connection manager.
//!
//! [`ConnectionManager`] owns at most one broker [`Link`] at a time and
//! multiplexes every topic subscription of the application over it. It keeps
//! two registries:
//!
//! * the **active** registry holds the live subscription handle of every topic
//!   currently bound on the open link;
//! * the **durable** registry remembers every topic (and its handler) the
//!   application asked for, so it can be replayed after an automatic
//!   reconnection.
//!
//! When the link drops unexpectedly the manager schedules reconnection
//! attempts with exponential backoff (`base × 2^(n-1)`, up to
//! [`ManagerConfig::max_reconnect_attempts`]). The first connection
//! established after the drop, whether by a scheduled attempt, a manual
//! `connect` or `recover`, replays the durable registry and then runs the
//! application's [`RecoveryHook`].
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::websocket(ManagerConfig::from_env());
//! manager.connect().await?;
//!
//! manager.subscribe("ABC123", |msg: TopicMessage| {
//!     println!("{} -> {:?}", msg.event, msg.fields);
//! })?;
//! manager.send("ABC123", "userUpdate", serde_json::json!({ "userId": 7 }))?;
//!
//! manager.disconnect().await;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RealtimeError, Result};
use crate::handler::{MessageHandler, RecoveryHook};
use crate::link::{Connector, FrameSink, Link, LinkSubscription};
use crate::message::{topic_path, TopicMessage};
use crate::signal::EnvironmentSignal;

/// Environment variable holding the HTTP(S) base URL of the BBTronic API.
pub const API_BASE_URL_ENV: &str = "BBTRONIC_API_BASE_URL";

/// API base URL used when [`API_BASE_URL_ENV`] is unset or empty.
pub const DEFAULT_API_BASE_URL: &str = "https://be-bbtronic-production.up.railway.app";

/// Path of the broker endpoint below the API base URL.
const WEBSOCKET_PATH: &str = "/websocket/websocket";

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_RECONNECT_DELAY: Duration = Duration::from_millis(2000);
const DEFAULT_CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Map an HTTP(S) API base URL to the broker's WebSocket endpoint.
///
/// ```
/// use bbtronic_realtime::manager::ws_endpoint;
///
/// assert_eq!(
///     ws_endpoint("https://api.example.com/"),
///     "wss://api.example.com/websocket/websocket"
/// );
/// assert_eq!(
///     ws_endpoint("http://localhost:8080"),
///     "ws://localhost:8080/websocket/websocket"
/// );
/// ```
pub fn ws_endpoint(api_base: &str) -> String {
    let base = api_base.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}{WEBSOCKET_PATH}")
}

/// Delay before the `attempt`-th automatic reconnection (1-based).
///
/// `base × 2^(attempt-1)`, saturating instead of overflowing.
///
/// ```
/// use std::time::Duration;
/// use bbtronic_realtime::manager::backoff_delay;
///
/// let base = Duration::from_millis(2000);
/// assert_eq!(backoff_delay(base, 1), Duration::from_millis(2000));
/// assert_eq!(backoff_delay(base, 3), Duration::from_millis(8000));
/// ```
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`].
///
/// # Example
///
/// ```
/// use bbtronic_realtime::ManagerConfig;
/// use std::time::Duration;
///
/// let config = ManagerConfig::new("ws://localhost:8080/websocket/websocket")
///     .with_max_reconnect_attempts(3)
///     .with_base_reconnect_delay(Duration::from_millis(500));
/// assert_eq!(config.max_reconnect_attempts, 3);
/// assert_eq!(config.connect_wait_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Broker endpoint handed to the [`Connector`].
    pub endpoint: String,
    /// Automatic reconnection attempts before giving up.
    ///
    /// The counter resets only when a connection is established. Defaults to **5**.
    pub max_reconnect_attempts: u32,
    /// Delay before the first automatic attempt; doubled for every further one.
    ///
    /// Defaults to **2 seconds**.
    pub base_reconnect_delay: Duration,
    /// How long [`ConnectionManager::connect`] waits for an attempt already in
    /// flight before failing with [`RealtimeError::ConnectTimeout`].
    ///
    /// Defaults to **5 seconds**.
    pub connect_wait_timeout: Duration,
}

impl ManagerConfig {
    /// Create a configuration for `endpoint` with default tuning.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_reconnect_delay: DEFAULT_BASE_RECONNECT_DELAY,
            connect_wait_timeout: DEFAULT_CONNECT_WAIT_TIMEOUT,
        }
    }

    /// Create a configuration from an HTTP(S) API base URL. See [`ws_endpoint`].
    pub fn from_api_base(api_base: &str) -> Self {
        Self::new(ws_endpoint(api_base))
    }

    /// Create a configuration from [`API_BASE_URL_ENV`], falling back to
    /// [`DEFAULT_API_BASE_URL`].
    pub fn from_env() -> Self {
        let base = std::env::var(API_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        match base {
            Some(base) => Self::from_api_base(&base),
            None => Self::from_api_base(DEFAULT_API_BASE_URL),
        }
    }

    /// Set the maximum number of automatic reconnection attempts.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the base backoff delay.
    #[must_use]
    pub fn with_base_reconnect_delay(mut self, delay: Duration) -> Self {
        self.base_reconnect_delay = delay;
        self
    }

    /// Set how long a concurrent `connect` waits for the in-flight attempt.
    #[must_use]
    pub fn with_connect_wait_timeout(mut self, timeout: Duration) -> Self {
        self.connect_wait_timeout = timeout;
        self
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Where the manager's single link currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no attempt in flight.
    Disconnected,
    /// An attempt to open a link is in flight.
    Connecting,
    /// A link is open.
    Connected,
}

/// The established link, as returned by [`ConnectionManager::connect`].
///
/// Every successful connection gets a new generation; two handles are equal
/// when they refer to the same connection.
#[derive(Clone)]
pub struct ChannelHandle {
    generation: u64,
    link: Arc<dyn Link>,
}

impl ChannelHandle {
    /// Monotonic identifier of the connection this handle refers to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` once the underlying link has gone away.
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl Eq for ChannelHandle {}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of the most recent connection attempt, broadcast to waiters.
#[derive(Clone)]
enum AttemptOutcome {
    Idle,
    Pending,
    Connected(ChannelHandle),
    Failed(String),
}

struct Channel {
    phase: ConnectionState,
    handle: Option<ChannelHandle>,
    /// Bumped by every attempt and by `disconnect`; stale completions compare against it.
    generation: u64,
    /// Bumped by `disconnect` only; cancels scheduled attempts.
    session: u64,
    attempts: u32,
    /// Set when the link was lost or an attempt failed; cleared by the
    /// first recovery that replays the durable registry.
    needs_recovery: bool,
    active: HashMap<String, Box<dyn LinkSubscription>>,
    durable: HashMap<String, Arc<dyn MessageHandler>>,
    hook: Option<Arc<dyn RecoveryHook>>,
    watcher: Option<JoinHandle<()>>,
}

enum ConnectStep {
    Ready(ChannelHandle),
    Wait(watch::Receiver<AttemptOutcome>),
    Open(u64),
}

struct Inner {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    channel: Mutex<Channel>,
    outcome: watch::Sender<AttemptOutcome>,
}

// ── ConnectionManager ───────────────────────────────────────────────

/// Shared handle to the application's single realtime channel.
///
/// Cloning is cheap; every clone drives the same link and registries.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager that opens links through `connector`.
    ///
    /// No connection is made until [`connect`](Self::connect) is called.
    pub fn new(config: ManagerConfig, connector: impl Connector) -> Self {
        Self::with_connector(config, Arc::new(connector))
    }

    /// Create a manager around an already shared connector.
    pub fn with_connector(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        let (outcome, _) = watch::channel(AttemptOutcome::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                channel: Mutex::new(Channel {
                    phase: ConnectionState::Disconnected,
                    handle: None,
                    generation: 0,
                    session: 0,
                    attempts: 0,
                    needs_recovery: false,
                    active: HashMap::new(),
                    durable: HashMap::new(),
                    hook: None,
                    watcher: None,
                }),
                outcome,
            }),
        }
    }

    /// Create a manager speaking STOMP over WebSocket to `config.endpoint`.
    #[cfg(feature = "transport-websocket")]
    pub fn websocket(config: ManagerConfig) -> Self {
        use crate::stomp::{StompConfig, StompConnector};
        use crate::transports::WebSocketDialer;

        Self::new(
            config,
            StompConnector::new(WebSocketDialer::new(), StompConfig::default()),
        )
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Open the link, or return the one already open.
    ///
    /// Idempotent: while connected, returns the current handle without any
    /// transport activity. While another attempt is in flight, waits for its
    /// outcome instead of starting a second one.
    ///
    /// If the previous link was lost, the new link gets the durable registry
    /// replayed and the recovery hook runs before this returns.
    ///
    /// # Errors
    ///
    /// * [`RealtimeError::ConnectTimeout`] if the in-flight attempt did not
    ///   finish within [`ManagerConfig::connect_wait_timeout`].
    /// * [`RealtimeError::ConnectFailed`] if the attempt failed. Automatic
    ///   reconnection is scheduled in that case.
    pub async fn connect(&self) -> Result<ChannelHandle> {
        self.inner.connect_and_recover().await
    }

    /// Subscribe `handler` to `topic_key` (delivered on `/topic/{topic_key}`).
    ///
    /// Replaces any previous subscription to the same topic, both live and
    /// durable. The durable entry is recorded before the live one.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] if no link is open; nothing is
    /// recorded in that case.
    pub fn subscribe<H: MessageHandler>(&self, topic_key: &str, handler: H) -> Result<()> {
        self.inner.subscribe(topic_key, Arc::new(handler))
    }

    /// Like [`subscribe`](Self::subscribe), for an already shared handler.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] if no link is open.
    pub fn subscribe_shared(&self, topic_key: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.inner.subscribe(topic_key, handler)
    }

    /// Publish `{"event": event, ...payload}` to `/topic/{topic_key}`.
    ///
    /// `payload` must be a JSON object (its fields are merged into the
    /// message) or `null`.
    ///
    /// # Errors
    ///
    /// * [`RealtimeError::NotConnected`] if no link is open. No transport
    ///   activity happens.
    /// * [`RealtimeError::InvalidPayload`] if `payload` is neither an object nor `null`.
    /// * [`RealtimeError::SendFailed`] if the link refused the frame.
    pub fn send(&self, topic_key: &str, event: &str, payload: Value) -> Result<()> {
        let link = self.inner.connected_link()?;
        let message = TopicMessage::with_payload(event, payload)?;
        publish(link.as_ref(), topic_key, &message)
    }

    /// Publish an already built [`TopicMessage`] to `/topic/{topic_key}`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), minus the payload check.
    pub fn send_message(&self, topic_key: &str, message: &TopicMessage) -> Result<()> {
        let link = self.inner.connected_link()?;
        publish(link.as_ref(), topic_key, message)
    }

    /// Stop the live subscription to `topic_key`.
    ///
    /// With `keep_durable` the topic stays in the durable registry and is
    /// replayed after the next automatic reconnection; without it the topic
    /// is forgotten. Unsubscribing an unknown topic is a warning, not an error.
    pub fn unsubscribe(&self, topic_key: &str, keep_durable: bool) {
        let mut channel = self.inner.channel.lock();
        match channel.active.remove(topic_key) {
            Some(subscription) => {
                subscription.cancel();
                debug!(topic = topic_key, keep_durable, "unsubscribed");
            }
            None => warn!(topic = topic_key, "no active subscription to cancel"),
        }
        if !keep_durable {
            channel.durable.remove(topic_key);
        }
    }

    /// Tear everything down: cancel every live subscription, forget every
    /// durable one, close the link, and cancel pending reconnection attempts.
    ///
    /// An attempt in flight is abandoned; anyone waiting on it fails with
    /// [`RealtimeError::ConnectFailed`].
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Reconnect now and, once connected, replay the durable registry and
    /// run the recovery hook.
    ///
    /// Joins the attempt in flight if there is one. If a link is already
    /// open, returns its handle.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn recover(&self) -> Result<ChannelHandle> {
        {
            let mut channel = self.inner.channel.lock();
            if channel.phase != ConnectionState::Connected {
                channel.needs_recovery = true;
            }
        }
        self.inner.connect_and_recover().await
    }

    /// React to the application becoming visible or focused.
    ///
    /// Recovers immediately when there is no link but the durable registry is
    /// not empty; does nothing otherwise.
    pub async fn handle_signal(&self, signal: EnvironmentSignal) {
        let pending = {
            let channel = self.inner.channel.lock();
            channel.phase != ConnectionState::Connected && !channel.durable.is_empty()
        };
        if !pending {
            debug!(%signal, "no recovery needed");
            return;
        }
        info!(%signal, "application is back; recovering realtime channel");
        if let Err(e) = self.recover().await {
            warn!(%signal, "recovery failed: {e}");
        }
    }

    /// Feed environment signals from `signals` into
    /// [`handle_signal`](Self::handle_signal) on a background task.
    ///
    /// The task ends when every sender is dropped or the manager is gone.
    pub fn listen_for_signals(&self, mut signals: mpsc::Receiver<EnvironmentSignal>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.handle_signal(signal).await;
            }
            debug!("environment signal listener stopped");
        })
    }

    /// Install the hook run around automatic recovery, replacing any previous one.
    ///
    /// A bare async closure only receives `on_recovered`. Wrap two closures
    /// with [`hook_fns`](crate::handler::hook_fns) to also run code before
    /// each scheduled attempt.
    pub fn set_recovery_hook(&self, hook: impl RecoveryHook) {
        self.inner.channel.lock().hook = Some(Arc::new(hook));
    }

    /// Remove the recovery hook.
    pub fn clear_recovery_hook(&self) {
        self.inner.channel.lock().hook = None;
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.channel.lock().phase
    }

    /// `true` while a link is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Automatic reconnection attempts made since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.channel.lock().attempts
    }

    /// Topics with a live subscription on the current link, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let channel = self.inner.channel.lock();
        sorted_keys(channel.active.keys())
    }

    /// Topics that will be replayed after an automatic reconnection, sorted.
    pub fn durable_topics(&self) -> Vec<String> {
        let channel = self.inner.channel.lock();
        sorted_keys(channel.durable.keys())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = self.inner.channel.lock();
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &channel.phase)
            .field("generation", &channel.generation)
            .field("reconnect_attempts", &channel.attempts)
            .field("active", &channel.active.len())
            .field("durable", &channel.durable.len())
            .finish()
    }
}

fn sorted_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut keys: Vec<String> = keys.cloned().collect();
    keys.sort();
    keys
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn publish(link: &dyn Link, topic_key: &str, message: &TopicMessage) -> Result<()> {
    let body = message.to_json()?;
    let path = topic_path(topic_key);
    link.publish(&path, body).map_err(|e| match e {
        RealtimeError::SendFailed(_) => e,
        other => RealtimeError::SendFailed(other.to_string()),
    })?;
    debug!(%path, event = %message.event, "published");
    Ok(())
}

// ── Internals ───────────────────────────────────────────────────────

impl Inner {
    async fn connect(self: &Arc<Self>) -> Result<ChannelHandle> {
        let step = {
            let mut channel = self.channel.lock();
            let current = match channel.phase {
                ConnectionState::Connected => channel.handle.clone(),
                _ => None,
            };
            match (channel.phase, current) {
                (ConnectionState::Connected, Some(handle)) => ConnectStep::Ready(handle),
                (ConnectionState::Connecting, _) => ConnectStep::Wait(self.outcome.subscribe()),
                _ => {
                    channel.phase = ConnectionState::Connecting;
                    channel.generation += 1;
                    self.outcome.send_replace(AttemptOutcome::Pending);
                    ConnectStep::Open(channel.generation)
                }
            }
        };

        match step {
            ConnectStep::Ready(handle) => {
                debug!(generation = handle.generation, "already connected");
                Ok(handle)
            }
            ConnectStep::Wait(rx) => self.wait_for_attempt(rx).await,
            ConnectStep::Open(generation) => self.open(generation).await,
        }
    }

    async fn wait_for_attempt(&self, mut rx: watch::Receiver<AttemptOutcome>) -> Result<ChannelHandle> {
        debug!("connection attempt already in flight; waiting for it");
        let waited = tokio::time::timeout(self.config.connect_wait_timeout, async {
            rx.wait_for(|outcome| !matches!(outcome, AttemptOutcome::Pending))
                .await
                .map(|outcome| outcome.clone())
        })
        .await;

        match waited {
            Err(_) => {
                warn!(
                    timeout_ms = millis(self.config.connect_wait_timeout),
                    "timed out waiting for the in-flight connection attempt"
                );
                Err(RealtimeError::ConnectTimeout)
            }
            Ok(Err(_)) => Err(RealtimeError::ConnectFailed("connection manager dropped".into())),
            Ok(Ok(AttemptOutcome::Connected(handle))) => Ok(handle),
            Ok(Ok(AttemptOutcome::Failed(reason))) => Err(RealtimeError::ConnectFailed(reason)),
            Ok(Ok(_)) => Err(RealtimeError::ConnectFailed("no connection attempt".into())),
        }
    }

    async fn open(self: &Arc<Self>, generation: u64) -> Result<ChannelHandle> {
        info!(endpoint = %self.config.endpoint, generation, "opening realtime channel");
        match self.connector.open(&self.config.endpoint).await {
            Ok(link) => {
                let link: Arc<dyn Link> = Arc::from(link);
                let handle = ChannelHandle {
                    generation,
                    link: Arc::clone(&link),
                };
                let accepted = {
                    let mut channel = self.channel.lock();
                    if channel.generation == generation && channel.phase == ConnectionState::Connecting {
                        channel.phase = ConnectionState::Connected;
                        channel.attempts = 0;
                        channel.handle = Some(handle.clone());
                        channel.watcher = Some(self.watch_link(generation, Arc::clone(&link)));
                        self.outcome.send_replace(AttemptOutcome::Connected(handle.clone()));
                        true
                    } else {
                        false
                    }
                };
                if !accepted {
                    debug!(generation, "connection attempt superseded by disconnect; closing link");
                    if let Err(e) = link.close().await {
                        debug!("closing superseded link: {e}");
                    }
                    return Err(RealtimeError::ConnectFailed(
                        "connection attempt superseded by disconnect".into(),
                    ));
                }
                info!(generation, "realtime channel connected");
                Ok(handle)
            }
            Err(e) => {
                let reason = e.to_string();
                let current = {
                    let mut channel = self.channel.lock();
                    let current = channel.generation == generation;
                    if current {
                        channel.phase = ConnectionState::Disconnected;
                        channel.handle = None;
                        channel.needs_recovery = true;
                        self.outcome.send_replace(AttemptOutcome::Failed(reason.clone()));
                    }
                    current
                };
                warn!(generation, "realtime channel connect failed: {reason}");
                if current {
                    self.schedule_reconnect();
                }
                Err(RealtimeError::ConnectFailed(reason))
            }
        }
    }

    /// Spawn the task that notices when `link` goes away on its own.
    fn watch_link(self: &Arc<Self>, generation: u64, link: Arc<dyn Link>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            link.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_link_lost(generation);
            }
        })
    }

    fn on_link_lost(self: &Arc<Self>, generation: u64) {
        let dropped = {
            let mut channel = self.channel.lock();
            if channel.generation != generation || channel.phase != ConnectionState::Connected {
                return;
            }
            channel.phase = ConnectionState::Disconnected;
            channel.handle = None;
            channel.watcher = None;
            channel.needs_recovery = true;
            let dropped = channel.active.len();
            channel.active.clear();
            dropped
        };
        warn!(generation, dropped, "realtime channel lost");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let max = self.config.max_reconnect_attempts;
        let scheduled = {
            let mut channel = self.channel.lock();
            if channel.attempts >= max {
                None
            } else {
                channel.attempts += 1;
                Some((channel.attempts, channel.session, channel.hook.clone()))
            }
        };
        let Some((attempt, session, hook)) = scheduled else {
            error!(max, "maximum reconnect attempts reached; giving up");
            return;
        };

        let delay = backoff_delay(self.config.base_reconnect_delay, attempt);
        info!(
            attempt,
            max,
            delay_ms = millis(delay),
            "scheduling reconnection attempt"
        );
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(hook) = hook {
                hook.before_reconnect().await;
            }
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_scheduled_attempt(session, attempt).await;
            }
        });
    }

    async fn run_scheduled_attempt(self: &Arc<Self>, session: u64, attempt: u32) {
        let skip = {
            let channel = self.channel.lock();
            if channel.session != session {
                Some("cancelled by disconnect")
            } else if channel.phase == ConnectionState::Connected && !channel.needs_recovery {
                Some("already connected")
            } else {
                None
            }
        };
        if let Some(reason) = skip {
            debug!(attempt, "skipping scheduled reconnection: {reason}");
            return;
        }

        info!(attempt, "reconnecting realtime channel");
        if let Err(e) = self.connect_and_recover().await {
            debug!(attempt, "scheduled reconnection failed: {e}");
        }
    }

    async fn connect_and_recover(self: &Arc<Self>) -> Result<ChannelHandle> {
        let handle = self.connect().await?;
        self.finish_recovery(&handle).await;
        Ok(handle)
    }

    /// Replay the durable registry onto `handle` and run the recovery hook,
    /// once per recovered connection.
    async fn finish_recovery(&self, handle: &ChannelHandle) {
        let recovered = {
            let mut channel = self.channel.lock();
            let current = channel.phase == ConnectionState::Connected
                && channel.generation == handle.generation;
            if !current || !channel.needs_recovery {
                None
            } else {
                channel.needs_recovery = false;
                let durable: Vec<(String, Arc<dyn MessageHandler>)> = channel
                    .durable
                    .iter()
                    .map(|(topic, handler)| (topic.clone(), Arc::clone(handler)))
                    .collect();
                let mut replayed = 0usize;
                for (topic, handler) in durable {
                    match bind(&mut channel, &handle.link, &topic, handler) {
                        Ok(()) => replayed += 1,
                        Err(e) => warn!(topic = %topic, "replaying subscription failed: {e}"),
                    }
                }
                Some((replayed, channel.hook.clone()))
            }
        };

        let Some((replayed, hook)) = recovered else {
            return;
        };
        info!(generation = handle.generation, replayed, "realtime channel recovered");
        if let Some(hook) = hook {
            hook.on_recovered().await;
        }
    }

    fn connected_link(&self) -> Result<Arc<dyn Link>> {
        let channel = self.channel.lock();
        match (channel.phase, &channel.handle) {
            (ConnectionState::Connected, Some(handle)) => Ok(Arc::clone(&handle.link)),
            _ => Err(RealtimeError::NotConnected),
        }
    }

    fn subscribe(&self, topic_key: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut channel = self.channel.lock();
        let link = match (channel.phase, &channel.handle) {
            (ConnectionState::Connected, Some(handle)) => Arc::clone(&handle.link),
            _ => return Err(RealtimeError::NotConnected),
        };
        channel
            .durable
            .insert(topic_key.to_string(), Arc::clone(&handler));
        bind(&mut channel, &link, topic_key, handler)
    }

    async fn disconnect(&self) {
        let handle = {
            let mut channel = self.channel.lock();
            for (topic, subscription) in channel.active.drain() {
                subscription.cancel();
                debug!(topic = %topic, "unsubscribed");
            }
            channel.durable.clear();
            channel.generation += 1;
            channel.session += 1;
            channel.needs_recovery = false;
            if channel.phase == ConnectionState::Connecting {
                self.outcome
                    .send_replace(AttemptOutcome::Failed("disconnected".into()));
            }
            channel.phase = ConnectionState::Disconnected;
            channel.watcher = None;
            channel.handle.take()
        };

        match handle {
            Some(handle) => {
                if let Err(e) = handle.link.close().await {
                    debug!("closing link: {e}");
                }
                info!(generation = handle.generation, "realtime channel disconnected");
            }
            None => debug!("disconnect requested with no open link"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The watcher owns a strong reference to the link; aborting it lets
        // the link (and its receive task) go.
        if let Some(watcher) = self.channel.get_mut().watcher.take() {
            watcher.abort();
        }
    }
}

/// Bind `handler` to `topic_key` on `link`, replacing any live subscription.
fn bind(
    channel: &mut Channel,
    link: &Arc<dyn Link>,
    topic_key: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    if let Some(previous) = channel.active.remove(topic_key) {
        debug!(topic = topic_key, "replacing existing subscription");
        previous.cancel();
    }

    let path = topic_path(topic_key);
    let topic = topic_key.to_string();
    let sink: FrameSink = Arc::new(move |body: &str| match TopicMessage::parse(body) {
        Ok(message) => {
            debug!(topic = %topic, event = %message.event, "message received");
            handler.on_message(message);
        }
        Err(e) => warn!(topic = %topic, "dropping message: {e}"),
    });

    let subscription = link.subscribe(&path, sink)?;
    channel.active.insert(topic_key.to_string(), subscription);
    debug!(%path, "subscribed");
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn ws_endpoint_maps_schemes() {
        assert_eq!(
            ws_endpoint("https://be-bbtronic-production.up.railway.app"),
            "wss://be-bbtronic-production.up.railway.app/websocket/websocket"
        );
        assert_eq!(
            ws_endpoint("http://localhost:8080/"),
            "ws://localhost:8080/websocket/websocket"
        );
        assert_eq!(
            ws_endpoint("ws://already.example"),
            "ws://already.example/websocket/websocket"
        );
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(2000);
        let delays: Vec<u128> = (1..=5).map(|n| backoff_delay(base, n).as_millis()).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 32000]);
    }

    #[test]
    fn backoff_saturates() {
        let delay = backoff_delay(Duration::from_secs(1), 200);
        assert_eq!(delay, Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn config_defaults() {
        let config = ManagerConfig::new("ws://x");
        assert_eq!(config.endpoint, "ws://x");
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.base_reconnect_delay, Duration::from_millis(2000));
        assert_eq!(config.connect_wait_timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_from_api_base() {
        let config = ManagerConfig::from_api_base("https://api.example.com");
        assert_eq!(config.endpoint, "wss://api.example.com/websocket/websocket");
    }
}
