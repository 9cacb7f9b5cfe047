//! WebSocket connection hub.
//!
//! The hub multiplexes long-lived connections keyed by (user, platform):
//! at most one live line per key, newer connections evict older ones. Inbound
//! binary frames surface on a messages channel; registrations,
//! unregistrations and per-line faults surface on their own channels, and
//! consumers drive application logic from those four streams.
//!
//! All background work — per-line readers and writers, the idle sweep, the
//! registrar and unregistrar, fan-out pushes — runs on one bounded worker
//! pool. The registrar is the sole writer of map inserts and the unregistrar
//! the sole writer of map removals, which keeps the map and the live count
//! from ever disagreeing about who owns a key.

mod line;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::buffer::BufferPool;
use crate::platform::Platform;
use crate::pool::{PoolError, WorkerPool};

use line::{reader_task, writer_task, CloseReason, Line};

/// Inbound message queue depth, hub-wide.
const MESSAGE_CHANNEL_CAPACITY: usize = 4096;

/// Depth of the registration, unregistration and error channels.
const EVENT_CHANNEL_CAPACITY: usize = 2048;

/// Read buffers start at one frame's worth of typical payload.
const READ_BUFFER_CAPACITY: usize = 2048;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is closed")]
    Closed,

    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("unspecified platform cannot hold a connection")]
    UnspecifiedPlatform,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Transport-level fault that closed a line.
#[derive(Debug, Error)]
pub enum LineFault {
    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("websocket error: {0}")]
    Io(#[from] axum::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// One inbound binary frame from a live line.
#[derive(Debug)]
pub struct HubMessage {
    pub user_id: String,
    pub platform: Platform,
    pub data: Vec<u8>,
}

/// A line entering or leaving the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub user_id: String,
    pub platform: Platform,
}

/// A fault that closed a line. The hub itself keeps running.
#[derive(Debug)]
pub struct LineError {
    pub user_id: String,
    pub platform: Platform,
    pub error: LineFault,
}

/// Identity of a live session slot: one user on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: String,
    pub platform: Platform,
}

/// The hub's read-only event streams, handed out once at construction.
pub struct HubEvents {
    pub messages: mpsc::Receiver<HubMessage>,
    pub registrations: mpsc::Receiver<LineEvent>,
    pub unregistrations: mpsc::Receiver<LineEvent>,
    pub errors: mpsc::Receiver<LineError>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Subprotocols offered during the WebSocket handshake.
    pub subprotocols: Vec<String>,
    /// How often the idle sweep scans for dead lines. Clamped to >= 1 s.
    pub live_check_duration: Duration,
    /// A line with no inbound traffic or ping for this long is swept closed.
    pub conn_max_idle: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            subprotocols: vec!["niu-v1".to_string()],
            live_check_duration: Duration::from_secs(120),
            conn_max_idle: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Hub {
    pub(crate) config: HubConfig,
    lines: DashMap<ConnectionKey, Arc<Line>>,
    live_count: AtomicI32,
    next_line_id: AtomicU64,
    pool: Arc<WorkerPool>,
    pub(crate) read_buffers: BufferPool,

    // Senders for the consumer-facing channels. Taken on close so the
    // streams end once the last line has drained.
    message_tx: Mutex<Option<mpsc::Sender<HubMessage>>>,
    error_tx: Mutex<Option<mpsc::Sender<LineError>>>,

    // Internal flow: lines announce themselves here; the registrar and
    // unregistrar do the map and count bookkeeping.
    registered_tx: mpsc::Sender<Arc<Line>>,
    pub(crate) unregistered_tx: mpsc::Sender<Arc<Line>>,

    sweep_stop: watch::Sender<bool>,
    drain_stop: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Hub {
    /// Builds the hub and spawns its background tasks (idle sweep, registrar,
    /// unregistrar) on the given pool. Returns the hub together with its
    /// event streams.
    pub fn new(
        mut config: HubConfig,
        pool: Arc<WorkerPool>,
    ) -> Result<(Arc<Hub>, HubEvents), HubError> {
        if config.live_check_duration < Duration::from_secs(1) {
            config.live_check_duration = Duration::from_secs(1);
        }

        let (message_tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (registration_tx, registrations) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (unregistration_tx, unregistrations) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (registered_tx, registered_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (unregistered_tx, unregistered_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (sweep_stop, sweep_stop_rx) = watch::channel(false);
        let (drain_stop, drain_stop_rx) = watch::channel(false);

        let hub = Arc::new(Hub {
            config,
            lines: DashMap::new(),
            live_count: AtomicI32::new(0),
            next_line_id: AtomicU64::new(1),
            pool,
            read_buffers: BufferPool::new(64, READ_BUFFER_CAPACITY),
            message_tx: Mutex::new(Some(message_tx)),
            error_tx: Mutex::new(Some(error_tx)),
            registered_tx,
            unregistered_tx,
            sweep_stop,
            drain_stop,
            closed: AtomicBool::new(false),
        });

        hub.pool.submit(idle_sweep(hub.clone(), sweep_stop_rx))?;
        hub.pool.submit(registrar(
            hub.clone(),
            registered_rx,
            registration_tx,
            drain_stop_rx.clone(),
        ))?;
        hub.pool.submit(unregistrar(
            hub.clone(),
            unregistered_rx,
            unregistration_tx,
            drain_stop_rx,
        ))?;

        Ok((
            hub,
            HubEvents { messages, registrations, unregistrations, errors },
        ))
    }

    /// Completes the WebSocket handshake and installs a line for
    /// (user, platform), evicting any line already holding that key.
    pub fn upgrade(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        platform: Platform,
        ws: WebSocketUpgrade,
    ) -> Result<Response, HubError> {
        let user_id = user_id.into();
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        if user_id.is_empty() {
            return Err(HubError::EmptyUserId);
        }
        if platform == Platform::Unspecified {
            return Err(HubError::UnspecifiedPlatform);
        }

        let ws = if self.config.subprotocols.is_empty() {
            ws
        } else {
            ws.protocols(self.config.subprotocols.clone())
        };

        let hub = self.clone();
        Ok(ws.on_upgrade(move |socket| hub.attach(user_id, platform, socket)))
    }

    async fn attach(self: Arc<Self>, user_id: String, platform: Platform, socket: WebSocket) {
        let key = ConnectionKey { user_id: user_id.clone(), platform };

        // Newer connections win. The blocking send means eviction is at
        // least underway before the replacement announces itself.
        let existing = self.lines.get(&key).map(|entry| entry.value().clone());
        if let Some(old) = existing {
            let _ = old.close_tx.send(CloseReason::Requested).await;
        }

        let (message_tx, error_tx) = {
            let message_tx = self.message_tx.lock().expect("hub message sender lock").clone();
            let error_tx = self.error_tx.lock().expect("hub error sender lock").clone();
            match (message_tx, error_tx) {
                (Some(message_tx), Some(error_tx)) => (message_tx, error_tx),
                // Shut down while this upgrade was in flight.
                _ => return,
            }
        };

        let (write_tx, write_rx) = mpsc::channel(line::OUTBOUND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(line::CLOSE_QUEUE_CAPACITY);
        let line = Arc::new(Line::new(
            self.next_line_id.fetch_add(1, Ordering::Relaxed),
            user_id,
            platform,
            write_tx,
            close_tx,
        ));

        let (sink, stream) = socket.split();

        // Writer first: it owns teardown, so a half-submitted pair can still
        // shut down cleanly.
        if let Err(err) = self.pool.submit(writer_task(
            self.clone(),
            line.clone(),
            sink,
            write_rx,
            close_rx,
            error_tx.clone(),
        )) {
            tracing::warn!(
                user_id = %line.user_id,
                platform = %line.platform,
                error = %err,
                "worker pool refused connection"
            );
            let _ = error_tx.try_send(LineError {
                user_id: line.user_id.clone(),
                platform,
                error: LineFault::Pool(err),
            });
            // Dropping both socket halves closes the connection.
            return;
        }

        if let Err(err) = self.pool.submit(reader_task(
            self.clone(),
            line.clone(),
            stream,
            message_tx,
        )) {
            tracing::warn!(
                user_id = %line.user_id,
                platform = %line.platform,
                error = %err,
                "worker pool refused connection"
            );
            let _ = error_tx.try_send(LineError {
                user_id: line.user_id.clone(),
                platform,
                error: LineFault::Pool(err),
            });
            line.signal_close();
            return;
        }

        let _ = self.registered_tx.send(line).await;
    }

    /// Queues `data` as a binary frame to every live line of every listed
    /// user, across all platforms. The fan-out runs on the worker pool.
    pub fn push_message(&self, user_ids: &[String], data: Bytes) {
        if user_ids.is_empty() || data.is_empty() {
            return;
        }

        let mut targets = Vec::new();
        for user_id in user_ids {
            for platform in Platform::ALL {
                let key = ConnectionKey { user_id: user_id.clone(), platform };
                if let Some(entry) = self.lines.get(&key) {
                    targets.push(entry.value().write_tx.clone());
                }
            }
        }
        self.fan_out(targets, data);
    }

    /// Queues `data` as a binary frame to every live line.
    pub fn broadcast(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let targets: Vec<_> = self
            .lines
            .iter()
            .map(|entry| entry.value().write_tx.clone())
            .collect();
        self.fan_out(targets, data);
    }

    fn fan_out(&self, targets: Vec<mpsc::Sender<axum::extract::ws::Message>>, data: Bytes) {
        if targets.is_empty() {
            return;
        }
        let submitted = self.pool.submit(async move {
            for tx in targets {
                // A send to a line mid-teardown just fails; the line is gone.
                let _ = tx.send(axum::extract::ws::Message::Binary(data.clone())).await;
            }
        });
        if let Err(err) = submitted {
            tracing::warn!(error = %err, "worker pool refused fan-out");
        }
    }

    /// Closes the line for (user, platform). `Platform::Unspecified` closes
    /// every platform the user has live.
    pub fn close_line(&self, user_id: &str, platform: Platform) {
        if user_id.is_empty() {
            return;
        }
        if platform == Platform::Unspecified {
            for p in Platform::ALL {
                self.signal_key(user_id, p);
            }
        } else {
            self.signal_key(user_id, platform);
        }
    }

    /// Closes every platform of the user except `keep`.
    pub fn close_line_except(&self, user_id: &str, keep: Platform) {
        if user_id.is_empty() {
            return;
        }
        for p in Platform::ALL {
            if p != keep {
                self.signal_key(user_id, p);
            }
        }
    }

    fn signal_key(&self, user_id: &str, platform: Platform) {
        let key = ConnectionKey { user_id: user_id.to_string(), platform };
        if let Some(entry) = self.lines.get(&key) {
            entry.value().signal_close();
        }
    }

    /// Number of lines currently registered.
    pub fn live_count(&self) -> i32 {
        self.live_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shuts the hub down: stops the idle sweep, signals close to every
    /// line, gives in-flight teardown `grace` to drain, then stops the
    /// bookkeeping tasks and releases the event channels. Idempotent.
    pub async fn close(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.sweep_stop.send(true);
        for entry in self.lines.iter() {
            entry.value().signal_close();
        }

        tokio::time::sleep(grace).await;

        let _ = self.drain_stop.send(true);
        // The message and error streams end once the remaining line tasks
        // drop their clones of these senders.
        *self.message_tx.lock().expect("hub message sender lock") = None;
        *self.error_tx.lock().expect("hub error sender lock") = None;

        tracing::info!(remaining = self.lines.len(), "hub closed");
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Scans for lines whose last activity is older than the idle budget and
/// signals them closed.
async fn idle_sweep(hub: Arc<Hub>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(hub.config.live_check_duration);
    // Skip the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let max_idle = hub.config.conn_max_idle.as_secs() as i64;
                let now = unix_now();
                let stale: Vec<Arc<Line>> = hub
                    .lines
                    .iter()
                    .filter(|entry| now - entry.value().idle_since() > max_idle)
                    .map(|entry| entry.value().clone())
                    .collect();
                for line in stale {
                    tracing::debug!(
                        user_id = %line.user_id,
                        platform = %line.platform,
                        "idle line swept"
                    );
                    line.signal_close();
                }
            }
            _ = stop.changed() => return,
        }
    }
}

/// Sole writer of map inserts: stores each announced line under its key,
/// bumps the live count, and publishes the registration event.
async fn registrar(
    hub: Arc<Hub>,
    mut registered_rx: mpsc::Receiver<Arc<Line>>,
    registration_tx: mpsc::Sender<LineEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            announced = registered_rx.recv() => {
                let Some(line) = announced else { return };
                let key = ConnectionKey {
                    user_id: line.user_id.clone(),
                    platform: line.platform,
                };
                match hub.lines.insert(key, line.clone()) {
                    // An eviction that had not finished by the time the
                    // replacement registered: the map size is unchanged and
                    // the displaced line still gets pushed out.
                    Some(displaced) => displaced.signal_close(),
                    None => {
                        hub.live_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tracing::debug!(
                    user_id = %line.user_id,
                    platform = %line.platform,
                    "line registered"
                );
                let _ = registration_tx.try_send(LineEvent {
                    user_id: line.user_id.clone(),
                    platform: line.platform,
                });
            }
            _ = stop.changed() => return,
        }
    }
}

/// Sole writer of map removals. Removal happens before the line's queues
/// wind down, and only if the key still belongs to this line — a newer
/// connection may have taken it over.
async fn unregistrar(
    hub: Arc<Hub>,
    mut unregistered_rx: mpsc::Receiver<Arc<Line>>,
    unregistration_tx: mpsc::Sender<LineEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            departed = unregistered_rx.recv() => {
                let Some(line) = departed else { return };
                let key = ConnectionKey {
                    user_id: line.user_id.clone(),
                    platform: line.platform,
                };
                let removed = hub
                    .lines
                    .remove_if(&key, |_, current| current.id == line.id)
                    .is_some();
                if removed {
                    hub.live_count.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!(
                    user_id = %line.user_id,
                    platform = %line.platform,
                    "line unregistered"
                );
                let _ = unregistration_tx.try_send(LineEvent {
                    user_id: line.user_id.clone(),
                    platform: line.platform,
                });
            }
            _ = stop.changed() => return,
        }
    }
}
