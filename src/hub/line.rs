//! One live WebSocket connection.
//!
//! Each line runs two cooperative tasks on the hub's worker pool: a reader
//! that drives the socket's inbound half and a writer that owns the outbound
//! half. All teardown funnels through the writer, which is the only place
//! the close path runs; the reader (and the hub, for evictions and sweeps)
//! merely send it a close reason. That single-closer rule is what makes the
//! close path run at most once.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::platform::Platform;

use super::{unix_now, Hub, HubMessage, LineError, LineFault};

/// Outbound frame queue depth per connection.
pub(super) const OUTBOUND_QUEUE_CAPACITY: usize = 2048;

/// Close-signal queue depth. Signals are idempotent; a full queue means a
/// close is already on its way.
pub(super) const CLOSE_QUEUE_CAPACITY: usize = 8;

/// Why a line is going down. Determines whether a close control frame is
/// sent (so well-behaved clients stop reconnecting) and what gets reported.
#[derive(Debug)]
pub(super) enum CloseReason {
    /// Eviction, idle sweep, `close_line`, or hub shutdown.
    Requested,
    /// The client initiated the close or went away.
    ClientClose,
    /// Text frames violate the binary-only policy.
    TextFrame,
    /// Transport fault, reported on the error channel.
    Fault(LineFault),
}

pub(crate) struct Line {
    pub(super) id: u64,
    pub(super) user_id: String,
    pub(super) platform: Platform,
    /// Unix seconds of the last inbound frame or ping.
    pub(super) last_active: AtomicI64,
    pub(super) write_tx: mpsc::Sender<Message>,
    pub(super) close_tx: mpsc::Sender<CloseReason>,
    /// Set once by the close path.
    pub(super) closed: AtomicBool,
}

impl Line {
    pub(super) fn new(
        id: u64,
        user_id: String,
        platform: Platform,
        write_tx: mpsc::Sender<Message>,
        close_tx: mpsc::Sender<CloseReason>,
    ) -> Line {
        Line {
            id,
            user_id,
            platform,
            last_active: AtomicI64::new(unix_now()),
            write_tx,
            close_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub(super) fn stamp_active(&self) {
        self.last_active.store(unix_now(), Ordering::Relaxed);
    }

    pub(super) fn idle_since(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Asks the writer to shut this line down with a close control frame.
    /// Safe to call any number of times, from anywhere.
    pub(super) fn signal_close(&self) {
        let _ = self.close_tx.try_send(CloseReason::Requested);
    }

    fn report(&self, reason: CloseReason) {
        let _ = self.close_tx.try_send(reason);
    }
}

/// Inbound half: reads frames under the read deadline and feeds the hub's
/// message channel. Every exit path hands a close reason to the writer.
pub(super) async fn reader_task(
    hub: Arc<Hub>,
    line: Arc<Line>,
    mut stream: SplitStream<WebSocket>,
    message_tx: mpsc::Sender<HubMessage>,
) {
    loop {
        let frame = match timeout(hub.config.read_timeout, stream.next()).await {
            Err(_) => {
                line.report(CloseReason::Fault(LineFault::ReadTimeout));
                return;
            }
            Ok(None) => {
                line.report(CloseReason::ClientClose);
                return;
            }
            Ok(Some(Err(err))) => {
                line.report(CloseReason::Fault(LineFault::Io(err)));
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Binary(data) => {
                let mut buf = hub.read_buffers.get();
                buf.extend_from_slice(&data);
                line.stamp_active();
                let msg = HubMessage {
                    user_id: line.user_id.clone(),
                    platform: line.platform,
                    data: buf,
                };
                if message_tx.send(msg).await.is_err() {
                    // Hub shut down underneath us.
                    line.report(CloseReason::Requested);
                    return;
                }
            }
            Message::Ping(payload) => {
                // Pings refresh liveness; the pong goes out via the writer
                // so it respects the write deadline.
                line.stamp_active();
                let _ = line.write_tx.try_send(Message::Pong(payload));
            }
            Message::Pong(_) => {
                line.stamp_active();
            }
            Message::Text(_) => {
                line.report(CloseReason::TextFrame);
                return;
            }
            Message::Close(_) => {
                line.report(CloseReason::ClientClose);
                return;
            }
        }
    }
}

/// Outbound half: owns the sink, selects between the outbound queue and the
/// close signal, and runs the (single) close path on the way out.
pub(super) async fn writer_task(
    hub: Arc<Hub>,
    line: Arc<Line>,
    mut sink: SplitSink<WebSocket, Message>,
    mut write_rx: mpsc::Receiver<Message>,
    mut close_rx: mpsc::Receiver<CloseReason>,
    error_tx: mpsc::Sender<LineError>,
) {
    let fault = loop {
        tokio::select! {
            reason = close_rx.recv() => {
                match reason {
                    Some(CloseReason::Requested) | Some(CloseReason::TextFrame) => {
                        send_close_frame(&hub, &mut sink).await;
                        break None;
                    }
                    Some(CloseReason::ClientClose) | None => break None,
                    Some(CloseReason::Fault(fault)) => break Some(fault),
                }
            }
            msg = write_rx.recv() => {
                let Some(msg) = msg else { break None };
                match timeout(hub.config.write_timeout, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => break Some(LineFault::Io(err)),
                    Err(_) => break Some(LineFault::WriteTimeout),
                }
            }
        }
    };

    finish(&hub, &line, fault, error_tx).await;
}

/// A close control frame (normal closure) tells clients this was deliberate,
/// otherwise they tend to reconnect in a loop.
async fn send_close_frame(hub: &Hub, sink: &mut SplitSink<WebSocket, Message>) {
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }));
    let _ = timeout(hub.config.write_timeout, sink.send(frame)).await;
}

/// The close path. Runs at most once per line: reports the fault, then hands
/// the line to the unregistrar, which removes it from the map before the
/// queues wind down.
async fn finish(
    hub: &Arc<Hub>,
    line: &Arc<Line>,
    fault: Option<LineFault>,
    error_tx: mpsc::Sender<LineError>,
) {
    if line.closed.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Some(fault) = fault {
        tracing::warn!(
            user_id = %line.user_id,
            platform = %line.platform,
            error = %fault,
            "line closed with error"
        );
        let _ = error_tx.try_send(LineError {
            user_id: line.user_id.clone(),
            platform: line.platform,
            error: fault,
        });
    }

    let _ = hub.unregistered_tx.send(line.clone()).await;
}
