//! Per-socket connection handler.
//!
//! One handler per accepted worker socket. The handler owns both halves of
//! the stream: a reader loop that routes inbound messages, and a writer task
//! that drains a bounded outbox. Nothing else ever touches the socket, and
//! no lock is held across I/O; the handler talks to the registry through its
//! atomic ops and to the scheduler through its event channel.

use crate::metrics::{ClusterGauges, METRICS};
use crate::registry::DeviceRegistry;
use crate::scheduler::{DeviceDownReason, SchedulerEvent};
use chrono::Utc;
use salvage_protocol::{
    ClusterStatusPayload, DeviceId, Envelope, ErrorPayload, FrameCodec, HeartbeatAck,
    HeartbeatPayload, MessageType, ProtocolError, RegisterAck, RegisterPayload, TaskResultPayload,
    TaskStartedPayload,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Shared context handed to every connection task.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub registry: Arc<DeviceRegistry>,
    pub events: mpsc::Sender<SchedulerEvent>,
    pub gauges: Arc<ClusterGauges>,
    pub codec: FrameCodec,
    pub handshake_timeout: Duration,
    pub outbox_capacity: usize,
    pub coordinator_id: String,
}

#[derive(Debug, Error)]
pub enum PostError {
    #[error("connection outbox full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Cheap, cloneable reference to a live connection. Published into the
/// registry as the device's handle; posting is non-blocking.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: u64,
    peer: SocketAddr,
    outbox: mpsc::Sender<Envelope>,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        conn_id: u64,
        peer: SocketAddr,
        outbox: mpsc::Sender<Envelope>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            conn_id,
            peer,
            outbox,
            shutdown,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Enqueue an outbound message without blocking. A full outbox is a
    /// write stall: the connection is asked to close and the caller treats
    /// the post as failed so in-flight work gets reassigned.
    pub fn post(&self, envelope: Envelope) -> Result<(), PostError> {
        match self.outbox.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.request_close();
                Err(PostError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(PostError::Closed),
        }
    }

    /// Ask the handler to terminate. Idempotent; safe from any task.
    pub fn request_close(&self) {
        self.shutdown.notify_one();
    }
}

#[derive(Debug, Error)]
enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reads newline-delimited frames with the codec's size cap enforced while
/// reading, not after.
struct FrameReader {
    inner: BufReader<OwnedReadHalf>,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(read_half: OwnedReadHalf, codec: FrameCodec) -> Self {
        Self {
            inner: BufReader::new(read_half),
            codec,
            buf: Vec::new(),
        }
    }

    /// Next envelope, or None on a clean disconnect.
    ///
    /// Cancel safe: a read raced out of a `select!` leaves its partial line
    /// in `buf`, and the next call picks up where it left off.
    async fn next_frame(&mut self) -> Result<Option<Envelope>, FrameError> {
        let max = self.codec.max_frame();
        loop {
            let budget = (max + 1).saturating_sub(self.buf.len());
            if budget == 0 {
                let size = self.buf.len();
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge { size, max }.into());
            }
            let mut limited = (&mut self.inner).take(budget as u64);
            let n = limited.read_until(b'\n', &mut self.buf).await?;
            if self.buf.last() == Some(&b'\n') {
                let frame = std::mem::take(&mut self.buf);
                if frame.iter().all(|b| *b == b'\n' || *b == b'\r') {
                    continue; // tolerate blank keep-alive lines
                }
                return Ok(Some(self.codec.decode(&frame)?));
            }
            if n == 0 {
                // EOF: clean when nothing buffered, mid-frame otherwise;
                // either way the connection is over.
                self.buf.clear();
                return Ok(None);
            }
            // No newline yet: the budget ran out (caught next iteration) or
            // the stream stalled mid-line (EOF surfaces as n == 0).
        }
    }
}

/// Drive one accepted socket to completion.
pub(crate) async fn run_connection(ctx: ConnectionContext, stream: TcpStream, peer: SocketAddr) {
    METRICS.inc_connections_accepted();
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, ctx.codec);

    let (outbox_tx, outbox_rx) = mpsc::channel(ctx.outbox_capacity);
    let shutdown = Arc::new(Notify::new());
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let handle = ConnectionHandle::new(conn_id, peer, outbox_tx.clone(), shutdown.clone());
    let writer = tokio::spawn(write_loop(write_half, outbox_rx, ctx.codec));

    let device_id = match handshake(&mut reader, &ctx, &handle, peer).await {
        Ok(device_id) => device_id,
        Err(reason) => {
            debug!("connection from {peer} rejected: {reason}");
            send_error(&ctx, &handle, "handshake_failed", &reason);
            drop(handle);
            drop(outbox_tx);
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
            return;
        }
    };

    info!("device {device_id} connected from {peer}");
    let close_reason = read_loop(&mut reader, &ctx, &handle, &device_id, &shutdown).await;

    // Only the currently attached handle may flip the device offline; a
    // superseding connection leaves this detach as a no-op.
    if ctx.registry.detach(&device_id, conn_id) {
        let _ = ctx
            .events
            .send(SchedulerEvent::DeviceDown {
                device_id: device_id.clone(),
                reason: DeviceDownReason::ConnectionClosed,
            })
            .await;
    }
    drop(handle);
    drop(outbox_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    info!("device {device_id} disconnected ({close_reason})");
}

/// A connection must present a valid `register` within the handshake window.
async fn handshake(
    reader: &mut FrameReader,
    ctx: &ConnectionContext,
    handle: &ConnectionHandle,
    peer: SocketAddr,
) -> Result<DeviceId, String> {
    let frame = tokio::time::timeout(ctx.handshake_timeout, reader.next_frame())
        .await
        .map_err(|_| "no register within the handshake timeout".to_string())?;
    let envelope = match frame {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return Err("disconnected during handshake".to_string()),
        Err(err) => {
            METRICS.inc_protocol_errors();
            return Err(format!("invalid frame during handshake: {err}"));
        }
    };
    if envelope.message_type != MessageType::Register {
        METRICS.inc_protocol_errors();
        return Err(format!(
            "expected register, got {}",
            envelope.message_type
        ));
    }
    let mut profile: RegisterPayload = envelope.decode_data().map_err(|err| {
        METRICS.inc_protocol_errors();
        format!("{err}")
    })?;
    if profile.device_id.is_empty() {
        profile.device_id = DeviceId::generate();
    }
    let device_id = profile.device_id.clone();

    let (was_new, evicted) = ctx.registry.register(profile, Some(peer), handle.clone());
    METRICS.inc_devices_registered();
    if let Some(old) = evicted {
        warn!(
            "device {device_id} re-registered from {peer}; closing previous connection from {}",
            old.peer()
        );
        old.request_close();
        // In-flight tasks sent over the superseded socket are gone with it.
        let _ = ctx
            .events
            .send(SchedulerEvent::DeviceDown {
                device_id: device_id.clone(),
                reason: DeviceDownReason::Superseded,
            })
            .await;
    }
    if was_new {
        info!("device {device_id} joined the cluster");
    }

    let ack = RegisterAck {
        accepted: true,
        reason: None,
        assigned_device_id: device_id.clone(),
    };
    post_reply(ctx, handle, MessageType::RegisterAck, &ack, envelope.message_id);

    let _ = ctx
        .events
        .send(SchedulerEvent::DeviceUp(device_id.clone()))
        .await;
    Ok(device_id)
}

async fn read_loop(
    reader: &mut FrameReader,
    ctx: &ConnectionContext,
    handle: &ConnectionHandle,
    device_id: &DeviceId,
    shutdown: &Notify,
) -> &'static str {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.notified() => return "close requested",
            frame = reader.next_frame() => match frame {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return "peer disconnected",
                Err(err) => {
                    METRICS.inc_protocol_errors();
                    warn!("protocol violation from {device_id}: {err}");
                    send_error(ctx, handle, "protocol_error", &err.to_string());
                    return "protocol error";
                }
            },
        };

        METRICS.inc_messages_received();
        ctx.registry.touch_seen(device_id);

        match envelope.message_type {
            MessageType::Heartbeat => {
                let heartbeat: HeartbeatPayload = match envelope.decode_data() {
                    Ok(heartbeat) => heartbeat,
                    Err(err) => {
                        METRICS.inc_protocol_errors();
                        warn!("bad heartbeat from {device_id}: {err}");
                        send_error(ctx, handle, "protocol_error", &err.to_string());
                        return "protocol error";
                    }
                };
                ctx.registry.touch(device_id, &heartbeat);
                let ack = HeartbeatAck {
                    server_time: Utc::now(),
                    pending_task_hint: ctx.gauges.tasks_queued().min(u32::MAX as u64) as u32,
                };
                post_reply(ctx, handle, MessageType::HeartbeatAck, &ack, envelope.message_id);
            }
            MessageType::TaskResult => {
                let payload: TaskResultPayload = match envelope.decode_data() {
                    Ok(payload) => payload,
                    Err(err) => {
                        METRICS.inc_protocol_errors();
                        warn!("bad task_result from {device_id}: {err}");
                        send_error(ctx, handle, "protocol_error", &err.to_string());
                        return "protocol error";
                    }
                };
                let event = SchedulerEvent::TaskResult {
                    device_id: device_id.clone(),
                    payload,
                };
                if ctx.events.send(event).await.is_err() {
                    return "coordinator shutting down";
                }
            }
            MessageType::StatusReply => {
                // Contents are diagnostic; the one schema we act on is the
                // assignment ack.
                if let Ok(TaskStartedPayload { task_id }) = envelope.decode_data() {
                    let event = SchedulerEvent::TaskStarted {
                        device_id: device_id.clone(),
                        task_id,
                    };
                    if ctx.events.send(event).await.is_err() {
                        return "coordinator shutting down";
                    }
                } else {
                    debug!("status_reply from {device_id}: {}", envelope.data);
                }
            }
            MessageType::StatusQuery => {
                let status = ClusterStatusPayload {
                    server_time: Utc::now(),
                    devices_online: ctx.gauges.devices_online(),
                    tasks_queued: ctx.gauges.tasks_queued(),
                    tasks_in_flight: ctx.gauges.tasks_in_flight(),
                };
                post_reply(ctx, handle, MessageType::StatusReply, &status, envelope.message_id);
            }
            MessageType::Register => {
                // Metadata refresh over the same socket.
                match envelope.decode_data::<RegisterPayload>() {
                    Ok(mut profile) => {
                        profile.device_id = device_id.clone();
                        let (_, evicted) =
                            ctx.registry
                                .register(profile, Some(handle.peer()), handle.clone());
                        debug_assert!(evicted.is_none());
                        let ack = RegisterAck {
                            accepted: true,
                            reason: None,
                            assigned_device_id: device_id.clone(),
                        };
                        post_reply(ctx, handle, MessageType::RegisterAck, &ack, envelope.message_id);
                    }
                    Err(err) => {
                        METRICS.inc_protocol_errors();
                        warn!("bad re-register from {device_id}: {err}");
                        send_error(ctx, handle, "protocol_error", &err.to_string());
                        return "protocol error";
                    }
                }
            }
            MessageType::Error => {
                if let Ok(err) = envelope.decode_data::<ErrorPayload>() {
                    warn!("error from {device_id}: {} ({})", err.message, err.code);
                } else {
                    warn!("error from {device_id}: {}", envelope.data);
                }
            }
            other => {
                warn!("unexpected {other} from {device_id}, ignoring");
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Envelope>,
    codec: FrameCodec,
) {
    while let Some(envelope) = outbox.recv().await {
        let frame = match codec.encode(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping unencodable outbound frame: {err}");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&frame).await {
            debug!("write failed: {err}");
            break;
        }
        METRICS.inc_messages_sent();
    }
    let _ = write_half.shutdown().await;
}

fn post_reply(
    ctx: &ConnectionContext,
    handle: &ConnectionHandle,
    message_type: MessageType,
    data: &impl Serialize,
    correlate_to: Option<String>,
) {
    let envelope = match Envelope::new(message_type, ctx.coordinator_id.as_str(), data) {
        Ok(envelope) => match correlate_to {
            Some(message_id) => envelope.with_message_id(message_id),
            None => envelope,
        },
        Err(err) => {
            warn!("failed to encode {message_type}: {err}");
            return;
        }
    };
    if let Err(err) = handle.post(envelope) {
        debug!("failed to post {message_type}: {err}");
    }
}

fn send_error(ctx: &ConnectionContext, handle: &ConnectionHandle, code: &str, message: &str) {
    let payload = ErrorPayload {
        code: code.to_string(),
        message: message.to_string(),
    };
    post_reply(ctx, handle, MessageType::Error, &payload, None);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Handle wired to an in-memory channel, for exercising registry and
    /// scheduler logic without sockets.
    pub(crate) fn loopback_handle(conn_id: u64) -> (ConnectionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = ConnectionHandle::new(
            conn_id,
            "127.0.0.1:0".parse().unwrap(),
            tx,
            Arc::new(Notify::new()),
        );
        (handle, rx)
    }
}
