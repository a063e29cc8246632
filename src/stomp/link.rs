//! STOMP session over a [`Transport`]: handshake, receive loop, subscriptions.
//!
//! [`StompConnector`] dials a transport, performs the `CONNECT`/`CONNECTED`
//! handshake and hands the transport to a background loop owned by a
//! [`StompLink`]. The loop multiplexes outgoing frames (queued over an
//! unbounded channel, so `subscribe`/`publish` never block) with incoming
//! frames via `tokio::select!`, and routes each `MESSAGE` frame to the sink
//! registered for its `subscription` header.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::error::{RealtimeError, Result};
use crate::link::{Connector, FrameSink, Link, LinkSubscription};
use crate::stomp::frame::{Command, Frame, FrameReader};
use crate::transport::{Dialer, Transport};

/// Default time allowed for the broker to answer `CONNECT`.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for the broker to acknowledge `DISCONNECT`.
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const ACCEPT_VERSION: &str = "1.2";

// ── Configuration ───────────────────────────────────────────────────

/// STOMP session settings.
///
/// # Example
///
/// ```
/// use bbtronic_realtime::stomp::StompConfig;
/// use std::time::Duration;
///
/// let config = StompConfig::default()
///     .with_host("be-bbtronic-production.up.railway.app")
///     .with_handshake_timeout(Duration::from_secs(3));
/// assert_eq!(config.disconnect_timeout, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct StompConfig {
    /// Virtual host sent in the `host` header. Defaults to the endpoint's host name.
    pub host: Option<String>,
    /// Optional `login` header.
    pub login: Option<String>,
    /// Optional `passcode` header.
    pub passcode: Option<String>,
    /// How long to wait for `CONNECTED`. Defaults to **10 seconds**.
    pub handshake_timeout: Duration,
    /// How long [`Link::close`] waits for the `DISCONNECT` receipt before
    /// dropping the transport. Defaults to **1 second**.
    pub disconnect_timeout: Duration,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            host: None,
            login: None,
            passcode: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

impl StompConfig {
    /// Override the virtual host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Send `login`/`passcode` credentials with `CONNECT`.
    #[must_use]
    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    /// How long to wait for `CONNECTED` after sending `CONNECT`.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// How long `close` waits for the `DISCONNECT` receipt before giving up.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    fn connect_frame(&self, endpoint: &str) -> Frame {
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| host_from_endpoint(endpoint).to_string());
        let mut frame = Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", "0,0");
        if let Some(login) = &self.login {
            frame = frame.with_header("login", login.clone());
        }
        if let Some(passcode) = &self.passcode {
            frame = frame.with_header("passcode", passcode.clone());
        }
        frame
    }
}

/// Host name of a URL such as `wss://host:443/path`, without the port.
fn host_from_endpoint(endpoint: &str) -> &str {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.starts_with('[') {
        // [v6]:port
        return authority
            .split_once(']')
            .map_or(authority, |(host, _)| host.trim_start_matches('['));
    }
    authority.split(':').next().unwrap_or(authority)
}

// ── Connector ───────────────────────────────────────────────────────

/// [`Connector`] that runs STOMP 1.2 over transports opened by a [`Dialer`].
#[derive(Debug)]
pub struct StompConnector<D> {
    dialer: D,
    config: StompConfig,
}

impl<D: Dialer> StompConnector<D> {
    pub fn new(dialer: D, config: StompConfig) -> Self {
        Self { dialer, config }
    }
}

#[async_trait]
impl<D: Dialer> Connector for StompConnector<D> {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Link>> {
        let mut transport = self.dialer.dial(endpoint).await?;
        transport
            .send(self.config.connect_frame(endpoint).encode())
            .await?;

        let mut reader = FrameReader::new();
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            await_connected(&mut transport, &mut reader),
        )
        .await;

        let connected = match handshake {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                let _ = transport.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = transport.close().await;
                return Err(RealtimeError::Timeout);
            }
        };
        debug!(
            version = connected.header("version").unwrap_or("?"),
            server = connected.header("server").unwrap_or("?"),
            "STOMP session established"
        );

        Ok(Box::new(StompLink::start(
            transport,
            reader,
            self.config.disconnect_timeout,
        )))
    }
}

async fn await_connected(
    transport: &mut Box<dyn Transport>,
    reader: &mut FrameReader,
) -> Result<Frame> {
    loop {
        match transport.recv().await {
            Some(Ok(text)) => reader.push(&text),
            Some(Err(e)) => return Err(e),
            None => return Err(RealtimeError::TransportClosed),
        }
        while let Some(frame) = reader.next_frame()? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => return Err(broker_error(&frame)),
                other => debug!(command = %other, "ignoring frame before CONNECTED"),
            }
        }
    }
}

fn broker_error(frame: &Frame) -> RealtimeError {
    let message = frame
        .header("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim().to_string());
    RealtimeError::Protocol(format!("broker error: {message}"))
}

// ── Link ────────────────────────────────────────────────────────────

enum LinkCommand {
    Frame(Frame),
    Disconnect {
        receipt: String,
        done: oneshot::Sender<()>,
    },
}

/// State shared between the link handle, its subscriptions and the loop.
struct LinkShared {
    closed: watch::Sender<bool>,
    sinks: Mutex<HashMap<String, FrameSink>>,
    next_id: AtomicU64,
}

impl LinkShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
        self.sinks.lock().clear();
    }
}

/// Marks the link closed when the loop exits, including by unwinding or abort.
struct CloseOnExit<'a>(&'a LinkShared);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

/// A live STOMP session. Created by [`StompConnector`].
pub struct StompLink {
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    shared: Arc<LinkShared>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disconnect_timeout: Duration,
}

impl StompLink {
    fn start(transport: Box<dyn Transport>, reader: FrameReader, disconnect_timeout: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            closed,
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let task = tokio::spawn(link_loop(transport, reader, cmd_rx, Arc::clone(&shared)));

        Self {
            cmd_tx,
            shared,
            task: Mutex::new(Some(task)),
            disconnect_timeout,
        }
    }

    fn queue(&self, frame: Frame) -> Result<()> {
        if self.shared.is_closed() {
            return Err(RealtimeError::SendFailed("link closed".into()));
        }
        self.cmd_tx
            .send(LinkCommand::Frame(frame))
            .map_err(|_| RealtimeError::SendFailed("link closed".into()))
    }
}

#[async_trait]
impl Link for StompLink {
    fn subscribe(&self, path: &str, sink: FrameSink) -> Result<Box<dyn LinkSubscription>> {
        let id = format!("sub-{}", self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.sinks.lock().insert(id.clone(), sink);

        let frame = Frame::new(Command::Subscribe)
            .with_header("id", id.clone())
            .with_header("destination", path)
            .with_header("ack", "auto");
        if let Err(e) = self.queue(frame) {
            self.shared.sinks.lock().remove(&id);
            return Err(e);
        }
        debug!(id = %id, path = %path, "SUBSCRIBE queued");

        Ok(Box::new(StompSubscription {
            id,
            cmd_tx: self.cmd_tx.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn publish(&self, path: &str, body: String) -> Result<()> {
        let frame = Frame::new(Command::Send)
            .with_header("destination", path)
            .with_header("content-type", "application/json")
            .with_body(body);
        self.queue(frame)
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        // The sender lives in `shared`, which we hold, so this only fails
        // if it were dropped; treat that as closed as well.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Ok(());
        }

        let receipt = format!(
            "disconnect-{}",
            self.shared.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (done_tx, done_rx) = oneshot::channel();
        let queued = self
            .cmd_tx
            .send(LinkCommand::Disconnect {
                receipt,
                done: done_tx,
            })
            .is_ok();

        if queued && tokio::time::timeout(self.disconnect_timeout, done_rx).await.is_err() {
            warn!("broker did not acknowledge DISCONNECT in time; dropping transport");
        }

        // Whatever happened, the session is over.
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.mark_closed();
        Ok(())
    }
}

impl std::fmt::Debug for StompLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompLink")
            .field("closed", &self.shared.is_closed())
            .field("subscriptions", &self.shared.sinks.lock().len())
            .finish()
    }
}

impl Drop for StompLink {
    fn drop(&mut self) {
        // No executor context to run a graceful DISCONNECT; abort the loop,
        // which drops the transport.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
        self.shared.mark_closed();
    }
}

struct StompSubscription {
    id: String,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    shared: Arc<LinkShared>,
}

impl LinkSubscription for StompSubscription {
    fn cancel(self: Box<Self>) {
        self.shared.sinks.lock().remove(&self.id);
        if self.shared.is_closed() {
            return;
        }
        let frame = Frame::new(Command::Unsubscribe).with_header("id", self.id.clone());
        if self.cmd_tx.send(LinkCommand::Frame(frame)).is_err() {
            debug!(id = %self.id, "link gone before UNSUBSCRIBE");
        }
    }
}

// ── Link loop ───────────────────────────────────────────────────────

/// Background loop that owns the transport.
///
/// Exits when:
/// - The link handle is dropped (command channel closed)
/// - A `DISCONNECT` receipt arrives
/// - The broker sends `ERROR` or closes the transport
/// - A transport error occurs
async fn link_loop(
    mut transport: Box<dyn Transport>,
    mut reader: FrameReader,
    mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
    shared: Arc<LinkShared>,
) {
    debug!("STOMP link loop started");
    let _close_on_exit = CloseOnExit(&shared);
    let mut pending_receipt: Option<(String, oneshot::Sender<()>)> = None;

    // Frames that arrived in the same message as CONNECTED.
    let mut stop = drain_frames(&mut reader, &shared, &pending_receipt);

    while !stop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LinkCommand::Frame(frame)) => {
                        debug!(command = %frame.command, "sending frame");
                        if let Err(e) = transport.send(frame.encode()).await {
                            error!("transport send error: {e}");
                            stop = true;
                        }
                    }
                    Some(LinkCommand::Disconnect { receipt, done }) => {
                        let frame = Frame::new(Command::Disconnect).with_header("receipt", receipt.clone());
                        match transport.send(frame.encode()).await {
                            Ok(()) => pending_receipt = Some((receipt, done)),
                            Err(e) => {
                                debug!("DISCONNECT not sent: {e}");
                                let _ = transport.close().await;
                                let _ = done.send(());
                                stop = true;
                            }
                        }
                    }
                    None => {
                        debug!("link handle dropped, closing transport");
                        let _ = transport.close().await;
                        stop = true;
                    }
                }
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        reader.push(&text);
                        stop = drain_frames(&mut reader, &shared, &pending_receipt);
                        if stop {
                            let _ = transport.close().await;
                        }
                    }
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        stop = true;
                    }
                    None => {
                        debug!("transport closed by broker");
                        stop = true;
                    }
                }
            }
        }
    }

    shared.mark_closed();
    if let Some((_, done)) = pending_receipt.take() {
        let _ = done.send(());
    }
    debug!("STOMP link loop exited");
}

/// Dispatch every complete frame in `reader`. Returns `true` if the session ended.
fn drain_frames(
    reader: &mut FrameReader,
    shared: &LinkShared,
    pending_receipt: &Option<(String, oneshot::Sender<()>)>,
) -> bool {
    loop {
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(e) => {
                warn!("dropping undecodable STOMP data: {e}");
                return false;
            }
        };

        match frame.command {
            Command::Message => dispatch_message(shared, &frame),
            Command::Receipt => {
                let matches = pending_receipt
                    .as_ref()
                    .is_some_and(|(id, _)| frame.header("receipt-id") == Some(id.as_str()));
                if matches {
                    // The waiter is released after the transport is closed.
                    debug!("DISCONNECT acknowledged");
                    return true;
                }
            }
            Command::Error => {
                warn!("{}", broker_error(&frame));
                return true;
            }
            other => debug!(command = %other, "ignoring frame"),
        }
    }
}

fn dispatch_message(shared: &LinkShared, frame: &Frame) {
    let Some(id) = frame.header("subscription") else {
        warn!("MESSAGE frame without subscription header");
        return;
    };
    // Clone the sink out so the lock is not held while user code runs.
    let sink = shared.sinks.lock().get(id).cloned();
    match sink {
        Some(sink) => sink(&frame.body),
        None => debug!(id = %id, "MESSAGE for unknown or cancelled subscription"),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    /// Broker side of an in-process transport.
    struct BrokerEnd {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<String>,
    }

    impl BrokerEnd {
        async fn expect(&mut self, command: Command) -> Frame {
            let raw = self.from_client.recv().await.expect("client hung up");
            let frame = Frame::decode(&raw).unwrap().unwrap();
            assert_eq!(frame.command, command, "unexpected frame {raw:?}");
            frame
        }

        fn send(&self, raw: impl Into<String>) {
            self.to_client.send(raw.into()).unwrap();
        }
    }

    struct ChannelTransport {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.tx
                .send(message)
                .map_err(|e| RealtimeError::TransportSend(e.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Dialer that hands out one pre-built transport.
    struct OneShotDialer {
        transport: StdMutex<Option<ChannelTransport>>,
    }

    #[async_trait]
    impl Dialer for OneShotDialer {
        async fn dial(&self, _endpoint: &str) -> Result<Box<dyn Transport>> {
            match self.transport.lock().unwrap().take() {
                Some(t) => Ok(Box::new(t)),
                None => Err(RealtimeError::ConnectFailed("already dialed".into())),
            }
        }
    }

    fn pair() -> (StompConnector<OneShotDialer>, BrokerEnd, Arc<AtomicBool>) {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = ChannelTransport {
            tx: client_tx,
            rx: client_rx,
            closed: Arc::clone(&closed),
        };
        let connector = StompConnector::new(
            OneShotDialer {
                transport: StdMutex::new(Some(transport)),
            },
            StompConfig::default().with_handshake_timeout(Duration::from_millis(200)),
        );
        (connector, BrokerEnd { from_client, to_client }, closed)
    }

    async fn open_link(
        connector: &StompConnector<OneShotDialer>,
        broker: &mut BrokerEnd,
    ) -> Box<dyn Link> {
        let open = connector.open("wss://example.test:443/websocket/websocket");
        let handshake = async {
            let connect = broker.expect(Command::Connect).await;
            assert_eq!(connect.header("accept-version"), Some("1.2"));
            assert_eq!(connect.header("host"), Some("example.test"));
            broker.send("CONNECTED\nversion:1.2\n\n\0");
        };
        let (link, ()) = tokio::join!(open, handshake);
        link.unwrap()
    }

    fn recording_sink() -> (FrameSink, Arc<StdMutex<Vec<String>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: FrameSink = Arc::new(move |body: &str| {
            sink_seen.lock().unwrap().push(body.to_string());
        });
        (sink, seen)
    }

    #[test]
    fn host_is_derived_from_endpoint() {
        assert_eq!(host_from_endpoint("wss://a.example:443/ws"), "a.example");
        assert_eq!(host_from_endpoint("ws://localhost/websocket"), "localhost");
        assert_eq!(host_from_endpoint("ws://user@h:1"), "h");
        assert_eq!(host_from_endpoint("ws://[::1]:8080/x"), "::1");
        assert_eq!(host_from_endpoint("plain-host"), "plain-host");
    }

    #[test]
    fn connect_frame_carries_credentials() {
        let frame = StompConfig::default()
            .with_credentials("guest", "secret")
            .connect_frame("ws://h/ws");
        assert_eq!(frame.header("login"), Some("guest"));
        assert_eq!(frame.header("passcode"), Some("secret"));
        assert_eq!(frame.header("heart-beat"), Some("0,0"));
    }

    #[tokio::test]
    async fn handshake_error_frame_fails_open() {
        let (connector, mut broker, closed) = pair();
        let open = connector.open("ws://h/ws");
        let reply = async {
            broker.expect(Command::Connect).await;
            broker.send("ERROR\nmessage:bad credentials\n\n\0");
        };
        let (result, ()) = tokio::join!(open, reply);
        let err = result.err().unwrap();
        assert!(matches!(err, RealtimeError::Protocol(ref m) if m.contains("bad credentials")));
        assert!(closed.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_without_connected() {
        let (connector, _broker, closed) = pair();
        let err = connector.open("ws://h/ws").await.err().unwrap();
        assert!(matches!(err, RealtimeError::Timeout));
        assert!(closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn subscribe_routes_messages_by_subscription_id() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        let (sink_a, seen_a) = recording_sink();
        let (sink_b, seen_b) = recording_sink();
        let _sub_a = link.subscribe("/topic/A", sink_a).unwrap();
        let _sub_b = link.subscribe("/topic/B", sink_b).unwrap();

        let sub_a = broker.expect(Command::Subscribe).await;
        let sub_b = broker.expect(Command::Subscribe).await;
        assert_eq!(sub_a.header("destination"), Some("/topic/A"));
        let id_a = sub_a.header("id").unwrap().to_string();
        let id_b = sub_b.header("id").unwrap().to_string();
        assert_ne!(id_a, id_b);

        broker.send(format!("MESSAGE\nsubscription:{id_b}\n\nb1\0"));
        broker.send(format!(
            "MESSAGE\nsubscription:{id_a}\n\na1\0MESSAGE\nsubscription:{id_a}\n\na2\0"
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen_a.lock().unwrap(), vec!["a1", "a2"]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["b1"]);
    }

    #[tokio::test]
    async fn cancel_sends_unsubscribe_and_stops_delivery() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        let (sink, seen) = recording_sink();
        let sub = link.subscribe("/topic/A", sink).unwrap();
        let id = broker
            .expect(Command::Subscribe)
            .await
            .header("id")
            .unwrap()
            .to_string();

        sub.cancel();
        let unsub = broker.expect(Command::Unsubscribe).await;
        assert_eq!(unsub.header("id"), Some(id.as_str()));

        broker.send(format!("MESSAGE\nsubscription:{id}\n\nlate\0"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_sends_json_send_frame() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        link.publish("/topic/ABC123", r#"{"event":"userLeft"}"#.into())
            .unwrap();
        let send = broker.expect(Command::Send).await;
        assert_eq!(send.header("destination"), Some("/topic/ABC123"));
        assert_eq!(send.header("content-type"), Some("application/json"));
        assert_eq!(send.body, r#"{"event":"userLeft"}"#);
    }

    #[tokio::test]
    async fn broker_hangup_closes_link() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;
        assert!(!link.is_closed());

        drop(broker);
        tokio::time::timeout(Duration::from_secs(1), link.closed())
            .await
            .expect("link should notice the hangup");
        assert!(link.is_closed());

        let err = link.publish("/topic/A", "{}".into()).unwrap_err();
        assert!(matches!(err, RealtimeError::SendFailed(_)));
        let (sink, _) = recording_sink();
        assert!(link.subscribe("/topic/A", sink).is_err());
    }

    #[tokio::test]
    async fn broker_error_frame_closes_link() {
        let (connector, mut broker, closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        broker.send("ERROR\nmessage:boom\n\n\0");
        tokio::time::timeout(Duration::from_secs(1), link.closed())
            .await
            .unwrap();
        assert!(closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn undecodable_frame_does_not_end_the_session() {
        let (connector, mut broker, closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        let (sink, seen) = recording_sink();
        let _sub = link.subscribe("/topic/A", sink).unwrap();
        let id = broker
            .expect(Command::Subscribe)
            .await
            .header("id")
            .unwrap()
            .to_string();

        broker.send(format!(
            "MESSAGE\nsubscription:{id}\ncontent-length:{}\n\nx\0",
            usize::MAX
        ));
        broker.send(format!("MESSAGE\nsubscription:{id}\n\nafter\0"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
        assert!(!link.is_closed());
        assert!(!closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn panicking_sink_still_closes_link() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        let sink: FrameSink = Arc::new(|_body: &str| panic!("handler blew up"));
        let _sub = link.subscribe("/topic/A", sink).unwrap();
        let id = broker
            .expect(Command::Subscribe)
            .await
            .header("id")
            .unwrap()
            .to_string();

        broker.send(format!("MESSAGE\nsubscription:{id}\n\nboom\0"));
        tokio::time::timeout(Duration::from_secs(1), link.closed())
            .await
            .expect("link loop exit should mark the link closed");
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn close_waits_for_disconnect_receipt() {
        let (connector, mut broker, closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        let close = link.close();
        let ack = async {
            let disconnect = broker.expect(Command::Disconnect).await;
            let receipt = disconnect.header("receipt").unwrap().to_string();
            broker.send(format!("RECEIPT\nreceipt-id:{receipt}\n\n\0"));
        };
        let (result, ()) = tokio::join!(close, ack);
        result.unwrap();

        assert!(link.is_closed());
        assert!(closed.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_after_disconnect_timeout() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;

        // Broker never answers the DISCONNECT.
        link.close().await.unwrap();
        assert!(link.is_closed());
        broker.expect(Command::Disconnect).await;
    }

    #[tokio::test]
    async fn close_twice_is_ok() {
        let (connector, mut broker, _closed) = pair();
        let link = open_link(&connector, &mut broker).await;
        drop(broker);
        link.closed().await;
        link.close().await.unwrap();
        link.close().await.unwrap();
    }
}
