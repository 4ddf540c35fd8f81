//! WebSocket transport.
//!
//! One connection per transport. The socket is owned by a single tokio task
//! spawned on the runtime handle given at construction. That task never
//! touches client state: everything it learns (open, frames, close) is pushed
//! onto an unbounded queue which [`Transport::poll`] drains on the simulation
//! thread, once per tick. Connection state therefore only changes during a
//! poll.
//!
//! Every connection attempt gets a generation number; queue items from a
//! superseded attempt are dropped on drain.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use sync_shared::{config::SyncConfig, wire::Envelope};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the (single) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Text-frame transport used by the session layer.
pub trait Transport: Send {
    /// Opens a connection and sends `hello` once it is up. No-op while
    /// connecting or open. Failures fall into the reconnect policy.
    fn connect(&mut self, url: &str);

    /// Best-effort send. Dropped (and logged) unless the connection is open.
    fn send(&mut self, text: String);

    /// Applies queued network events, fires a due reconnect, and returns the
    /// inbound frames in arrival order.
    fn poll(&mut self, now: Instant) -> Vec<String>;

    /// Disables auto-reconnect and closes the connection gracefully.
    /// Idempotent.
    fn disconnect(&mut self);

    fn state(&self) -> ConnectionState;

    fn set_auto_reconnect(&mut self, enabled: bool);

    /// Number of connection attempts made so far, reconnects included.
    fn connect_attempts(&self) -> u64;

    fn url(&self) -> String;
}

/// Fixed-delay reconnect timer. No backoff growth, no attempt cap.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    delay: Duration,
    due: Option<Instant>,
}

impl ReconnectSchedule {
    pub fn new(delay: Duration) -> Self {
        Self { delay, due: None }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arms the timer at `now + delay` unless it is already armed.
    pub fn arm(&mut self, now: Instant) {
        if self.due.is_none() {
            self.due = Some(now + self.delay);
        }
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    pub fn due_at(&self) -> Option<Instant> {
        self.due
    }

    /// Returns true (and disarms) once `now` has reached the deadline.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
enum Signal {
    Opened,
    Frame(String),
    Closed(CloseCause),
}

#[derive(Debug)]
enum CloseCause {
    /// We asked for it.
    Local,
    /// Server sent a close frame or the stream ended.
    Server,
    /// Connect or IO error.
    Failed(String),
}

#[derive(Debug)]
struct Inbound {
    generation: u64,
    signal: Signal,
}

/// [`Transport`] over `tokio-tungstenite`.
pub struct WsTransport {
    handle: Handle,
    url: String,
    game: String,
    close_timeout: Duration,

    state: ConnectionState,
    auto_reconnect: bool,
    reconnect: ReconnectSchedule,
    generation: u64,
    attempts: u64,

    cancel: Option<CancellationToken>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
}

impl WsTransport {
    pub fn new(handle: Handle, cfg: &SyncConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            url: cfg.server_url.clone(),
            game: cfg.game.clone(),
            close_timeout: cfg.close_timeout(),
            state: ConnectionState::Closed,
            auto_reconnect: cfg.auto_reconnect,
            reconnect: ReconnectSchedule::new(cfg.reconnect_delay()),
            generation: 0,
            attempts: 0,
            cancel: None,
            outbound: None,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Pending reconnect deadline, if any.
    pub fn reconnect_due(&self) -> Option<Instant> {
        self.reconnect.due_at()
    }

    fn on_closed(&mut self, cause: CloseCause, now: Instant) {
        self.cancel = None;
        self.outbound = None;
        self.state = ConnectionState::Closed;
        match cause {
            CloseCause::Local => info!(url = %self.url, "Connection closed"),
            CloseCause::Server => {
                warn!(url = %self.url, "Server closed the connection");
                self.arm_reconnect(now);
            }
            CloseCause::Failed(e) => {
                error!(url = %self.url, error = %e, "Connection failed");
                self.arm_reconnect(now);
            }
        }
    }

    fn arm_reconnect(&mut self, now: Instant) {
        if self.auto_reconnect {
            self.reconnect.arm(now);
            debug!(delay_ms = self.reconnect.delay().as_millis() as u64, "Reconnect scheduled");
        }
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, url: &str) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            debug!(state = ?self.state, "Connect ignored");
            return;
        }
        self.url = url.to_string();
        self.generation += 1;
        self.attempts += 1;
        self.reconnect.cancel();
        self.state = ConnectionState::Connecting;
        info!(url = %self.url, attempt = self.attempts, "Connecting");

        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            url: self.url.clone(),
            hello: Envelope::Hello {
                game: self.game.clone(),
            }
            .encode(),
            generation: self.generation,
            close_timeout: self.close_timeout,
            cancel: cancel.clone(),
            outbound: out_rx,
            inbound: self.inbound_tx.clone(),
        };
        self.handle.spawn(task.run());
        self.cancel = Some(cancel);
        self.outbound = Some(out_tx);
    }

    fn send(&mut self, text: String) {
        if self.state != ConnectionState::Open {
            warn!(state = ?self.state, "Dropping send; connection not open");
            return;
        }
        let Some(tx) = &self.outbound else {
            return;
        };
        if tx.send(text).is_err() {
            warn!("Dropping send; connection task has exited");
        }
    }

    fn poll(&mut self, now: Instant) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(Inbound { generation, signal }) = self.inbound_rx.try_recv() {
            if generation != self.generation {
                debug!(generation, current = self.generation, "Dropping stale connection event");
                continue;
            }
            match signal {
                Signal::Opened => {
                    info!(url = %self.url, "Connection open");
                    self.state = ConnectionState::Open;
                }
                Signal::Frame(text) => frames.push(text),
                Signal::Closed(cause) => self.on_closed(cause, now),
            }
        }

        if self.auto_reconnect && self.state == ConnectionState::Closed && self.reconnect.fire(now) {
            let url = self.url.clone();
            self.connect(&url);
        }
        frames
    }

    fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.reconnect.cancel();
        self.outbound = None;
        if let Some(cancel) = self.cancel.take() {
            info!(url = %self.url, "Disconnecting");
            cancel.cancel();
            self.state = ConnectionState::Closing;
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        if !enabled {
            self.reconnect.cancel();
        }
    }

    fn connect_attempts(&self) -> u64 {
        self.attempts
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// State moved into the socket task.
struct ConnectionTask {
    url: String,
    hello: String,
    generation: u64,
    close_timeout: Duration,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl ConnectionTask {
    async fn run(self) {
        let generation = self.generation;
        let inbound = self.inbound.clone();
        let cause = match self.drive().await {
            Ok(cause) => cause,
            Err(e) => CloseCause::Failed(format!("{e:#}")),
        };
        let _ = inbound.send(Inbound {
            generation,
            signal: Signal::Closed(cause),
        });
    }

    fn emit(&self, signal: Signal) {
        let _ = self.inbound.send(Inbound {
            generation: self.generation,
            signal,
        });
    }

    async fn drive(mut self) -> anyhow::Result<CloseCause> {
        let (ws, _) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(CloseCause::Local),
            res = connect_async(self.url.as_str()) => {
                res.with_context(|| format!("websocket connect {}", self.url))?
            }
        };
        let (mut sink, mut stream) = ws.split();
        sink.send(Message::Text(self.hello.clone()))
            .await
            .context("send hello")?;
        self.emit(Signal::Opened);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                out = self.outbound.recv() => match out {
                    Some(text) => sink.send(Message::Text(text)).await.context("send frame")?,
                    None => break,
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.emit(Signal::Frame(text)),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.emit(Signal::Frame(text)),
                        Err(e) => warn!(error = %e, "Dropping binary frame with invalid UTF-8"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Close frame received");
                        let _ = tokio::time::timeout(self.close_timeout, sink.close()).await;
                        return Ok(CloseCause::Server);
                    }
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("websocket receive"),
                    None => return Ok(CloseCause::Server),
                },
            }
        }

        let closing = async {
            let _ = sink.close().await;
            while let Some(Ok(_)) = stream.next().await {}
        };
        if tokio::time::timeout(self.close_timeout, closing).await.is_err() {
            debug!(url = %self.url, "Close handshake timed out");
        }
        Ok(CloseCause::Local)
    }
}

/// In-memory [`Transport`] for driving sessions without sockets.
///
/// Clones share one wire: a test keeps a clone as the "server side" to push
/// inbound frames, inspect what was sent and simulate a lost connection.
/// Connects succeed immediately and send `hello` like the real transport.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    wire: Arc<Mutex<MemoryWire>>,
}

#[derive(Debug)]
struct MemoryWire {
    url: String,
    game: String,
    state: ConnectionState,
    auto_reconnect: bool,
    reconnect: ReconnectSchedule,
    attempts: u64,
    inbound: VecDeque<String>,
    sent: Vec<String>,
    drop_pending: bool,
}

impl MemoryTransport {
    pub fn new(game: &str, reconnect_delay: Duration) -> Self {
        Self {
            wire: Arc::new(Mutex::new(MemoryWire {
                url: String::new(),
                game: game.to_string(),
                state: ConnectionState::Closed,
                auto_reconnect: true,
                reconnect: ReconnectSchedule::new(reconnect_delay),
                attempts: 0,
                inbound: VecDeque::new(),
                sent: Vec::new(),
                drop_pending: false,
            })),
        }
    }

    fn wire(&self) -> std::sync::MutexGuard<'_, MemoryWire> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a frame as if the server had sent it.
    pub fn push_frame(&self, frame: impl Into<String>) {
        self.wire().inbound.push_back(frame.into());
    }

    /// Takes every frame sent so far.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.wire().sent)
    }

    /// Simulates the server going away; applied on the next poll.
    pub fn drop_connection(&self) {
        self.wire().drop_pending = true;
    }
}

impl MemoryWire {
    fn open(&mut self, url: &str) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            return;
        }
        self.url = url.to_string();
        self.attempts += 1;
        self.reconnect.cancel();
        self.state = ConnectionState::Open;
        let hello = Envelope::Hello {
            game: self.game.clone(),
        }
        .encode();
        self.sent.push(hello);
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, url: &str) {
        self.wire().open(url);
    }

    fn send(&mut self, text: String) {
        let mut wire = self.wire();
        if wire.state == ConnectionState::Open {
            wire.sent.push(text);
        } else {
            warn!(state = ?wire.state, "Dropping send; connection not open");
        }
    }

    fn poll(&mut self, now: Instant) -> Vec<String> {
        let mut wire = self.wire();
        if std::mem::take(&mut wire.drop_pending) && wire.state == ConnectionState::Open {
            wire.state = ConnectionState::Closed;
            if wire.auto_reconnect {
                wire.reconnect.arm(now);
            }
        }
        let frames = if wire.state == ConnectionState::Open {
            wire.inbound.drain(..).collect()
        } else {
            Vec::new()
        };
        if wire.auto_reconnect && wire.state == ConnectionState::Closed && wire.reconnect.fire(now) {
            let url = wire.url.clone();
            wire.open(&url);
        }
        frames
    }

    fn disconnect(&mut self) {
        let mut wire = self.wire();
        wire.auto_reconnect = false;
        wire.reconnect.cancel();
        wire.state = ConnectionState::Closed;
    }

    fn state(&self) -> ConnectionState {
        self.wire().state
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        let mut wire = self.wire();
        wire.auto_reconnect = enabled;
        if !enabled {
            wire.reconnect.cancel();
        }
    }

    fn connect_attempts(&self) -> u64 {
        self.wire().attempts
    }

    fn url(&self) -> String {
        self.wire().url.clone()
    }
}
