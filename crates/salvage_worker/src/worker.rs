//! Worker Node
//!
//! Design notes:
//! - One TCP connection to the coordinator, owned by this task: single
//!   reader here, single writer task draining a bounded channel.
//! - Handlers execute on blocking threads, bounded by the advertised
//!   max_concurrent_tasks; the reader never blocks on task work.
//! - Heartbeats ride a timer in the same select loop.

use crate::handlers::HandlerRegistry;
use anyhow::{bail, Context, Result};
use salvage_protocol::{
    DeviceCapabilities, DeviceId, Envelope, ErrorPayload, FrameCodec, HeartbeatPayload,
    MessageType, Platform, ProtocolError, RegisterAck, RegisterPayload, TaskAssignPayload,
    TaskError, TaskOutcome, TaskResultPayload, TaskStartedPayload,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Worker configuration (plain data).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coordinator_addr: String,
    pub device_id: String,
    pub role: String,
    pub capabilities: DeviceCapabilities,
    pub max_concurrent_tasks: u32,
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn new(coordinator_addr: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            coordinator_addr: coordinator_addr.into(),
            device_id: device_id.into(),
            role: "worker".to_string(),
            capabilities: DeviceCapabilities {
                cpu_cores: std::thread::available_parallelism()
                    .map(|n| n.get() as u32)
                    .unwrap_or(1),
                memory_gb: 1.0,
                storage_gb: 1.0,
                has_gpu: false,
                has_internet: false,
                tags: Default::default(),
            },
            max_concurrent_tasks: 2,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Connected worker with a completed registration handshake.
pub struct Worker {
    config: WorkerConfig,
    device_id: DeviceId,
    reader: FrameReader,
    outbound: mpsc::Sender<Envelope>,
    handlers: Arc<HandlerRegistry>,
    active_tasks: Arc<AtomicU32>,
    started: Instant,
}

impl Worker {
    /// Connect, register, and wait for the coordinator's ack.
    pub async fn connect(config: WorkerConfig, handlers: HandlerRegistry) -> Result<Self> {
        if handlers.is_empty() {
            bail!("refusing to register with no task handlers");
        }
        let stream = TcpStream::connect(&config.coordinator_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", config.coordinator_addr))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let codec = FrameCodec::default();
        let mut reader = FrameReader::new(read_half, codec);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        tokio::spawn(write_loop(write_half, outbound_rx, codec));

        info!("connected to coordinator at {}", config.coordinator_addr);

        let register = RegisterPayload {
            device_id: DeviceId::new(config.device_id.clone()),
            role: config.role.clone(),
            platform: Platform::current(),
            architecture: std::env::consts::ARCH.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: config.capabilities.clone(),
            supported_task_types: handlers.task_types(),
            max_concurrent_tasks: config.max_concurrent_tasks,
        };
        let envelope = Envelope::new(MessageType::Register, config.device_id.as_str(), &register)?;
        outbound
            .send(envelope)
            .await
            .context("Failed to send register")?;

        let ack = wait_for_ack(&mut reader).await?;
        if !ack.accepted {
            bail!(
                "registration rejected: {}",
                ack.reason.unwrap_or_else(|| "no reason given".to_string())
            );
        }
        let device_id = ack.assigned_device_id;
        info!("registered as {device_id}");

        Ok(Self {
            config,
            device_id,
            reader,
            outbound,
            handlers: Arc::new(handlers),
            active_tasks: Arc::new(AtomicU32::new(0)),
            started: Instant::now(),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Main event loop: heartbeats out, assignments in. Returns when the
    /// coordinator closes the connection.
    pub async fn run(mut self) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let capacity = Arc::new(Semaphore::new(self.config.max_concurrent_tasks as usize));

        info!("entering event loop");
        loop {
            // None = heartbeat tick; the frame future is cancel safe.
            let wake = tokio::select! {
                _ = heartbeat.tick() => None,
                frame = self.reader.next_frame() => Some(frame),
            };
            match wake {
                None => self.send_heartbeat().await?,
                Some(Ok(Some(envelope))) => self.handle_message(envelope, &capacity).await?,
                Some(Ok(None)) => {
                    info!("coordinator closed the connection");
                    return Ok(());
                }
                Some(Err(err)) => {
                    error!("read error: {err}");
                    return Err(err);
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let active = self.active_tasks.load(Ordering::Relaxed);
        // Load proxy until real sampling exists: fraction of task slots in use.
        let busy_fraction = if self.config.max_concurrent_tasks == 0 {
            0.0
        } else {
            active as f64 / self.config.max_concurrent_tasks as f64
        };
        let heartbeat = HeartbeatPayload {
            cpu_percent: (busy_fraction * 100.0).min(100.0),
            memory_percent: 0.0,
            active_tasks: active,
            uptime_seconds: self.started.elapsed().as_secs(),
        };
        let envelope = Envelope::new(
            MessageType::Heartbeat,
            self.device_id.as_str(),
            &heartbeat,
        )?;
        self.outbound
            .send(envelope)
            .await
            .context("Failed to send heartbeat")?;
        Ok(())
    }

    async fn handle_message(
        &mut self,
        envelope: Envelope,
        capacity: &Arc<Semaphore>,
    ) -> Result<()> {
        match envelope.message_type {
            MessageType::TaskAssign => {
                let assign: TaskAssignPayload = match envelope.decode_data() {
                    Ok(assign) => assign,
                    Err(err) => {
                        warn!("undecodable task_assign: {err}");
                        self.send_error("protocol_error", &err.to_string()).await;
                        return Ok(());
                    }
                };
                self.start_task(assign, envelope.message_id, capacity).await;
            }
            MessageType::TaskCancel => {
                // Cooperative only: running handlers are not preempted.
                warn!(
                    "cancel requested for task {}, letting the current attempt finish",
                    envelope
                        .data
                        .get("task_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?")
                );
            }
            MessageType::HeartbeatAck => {
                debug!("heartbeat acked");
            }
            MessageType::RegisterAck => {
                debug!("duplicate register_ack ignored");
            }
            MessageType::StatusReply => {
                debug!("status_reply: {}", envelope.data);
            }
            MessageType::Error => {
                if let Ok(err) = envelope.decode_data::<ErrorPayload>() {
                    warn!("coordinator error: {} ({})", err.message, err.code);
                }
            }
            other => {
                warn!("unhandled message type {other}");
            }
        }
        Ok(())
    }

    /// Ack the assignment, then execute on a blocking thread and report the
    /// receipt through the writer channel.
    async fn start_task(
        &self,
        assign: TaskAssignPayload,
        assign_message_id: Option<String>,
        capacity: &Arc<Semaphore>,
    ) {
        info!(
            "task {} assigned ({}, attempt {})",
            assign.task_id, assign.task_type, assign.attempt
        );

        let ack = TaskStartedPayload {
            task_id: assign.task_id.clone(),
        };
        match Envelope::new(MessageType::StatusReply, self.device_id.as_str(), &ack) {
            Ok(envelope) => {
                let envelope = match assign_message_id {
                    Some(message_id) => envelope.with_message_id(message_id),
                    None => envelope,
                };
                let _ = self.outbound.send(envelope).await;
            }
            Err(err) => warn!("failed to encode assignment ack: {err}"),
        }

        let permit = match capacity.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // The coordinator respects the advertised cap; hitting this
                // means our accounting drifted. Fail transient so the task
                // lands elsewhere.
                warn!("task {} rejected: at capacity", assign.task_id);
                self.post_result(failure_result(
                    &assign,
                    TaskError {
                        code: "capacity".to_string(),
                        message: "worker at capacity".to_string(),
                        retryable: true,
                    },
                    0.0,
                ))
                .await;
                return;
            }
        };

        let Some(handler) = self.handlers.get(&assign.task_type) else {
            warn!("no handler for task type '{}'", assign.task_type);
            self.post_result(failure_result(
                &assign,
                TaskError {
                    code: "unsupported_task_type".to_string(),
                    message: format!("no handler for '{}'", assign.task_type),
                    retryable: false,
                },
                0.0,
            ))
            .await;
            return;
        };

        let outbound = self.outbound.clone();
        let device_id = self.device_id.clone();
        let active = self.active_tasks.clone();
        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let payload = assign.payload.clone();
            let outcome =
                tokio::task::spawn_blocking(move || handler.run(&payload)).await;
            let elapsed = started.elapsed().as_secs_f64();
            active.fetch_sub(1, Ordering::Relaxed);

            let result = match outcome {
                Ok(Ok(value)) => TaskResultPayload {
                    task_id: assign.task_id.clone(),
                    status: TaskOutcome::Success,
                    result: Some(value),
                    error: None,
                    execution_time_seconds: elapsed,
                },
                Ok(Err(err)) => failure_result(
                    &assign,
                    TaskError {
                        code: err.code,
                        message: err.message,
                        retryable: err.retryable,
                    },
                    elapsed,
                ),
                Err(join_err) => failure_result(
                    &assign,
                    TaskError {
                        code: "handler_panic".to_string(),
                        message: join_err.to_string(),
                        retryable: false,
                    },
                    elapsed,
                ),
            };

            info!(
                "task {} finished in {elapsed:.3}s ({})",
                assign.task_id,
                if result.status.is_success() { "success" } else { "failure" }
            );
            match Envelope::new(MessageType::TaskResult, device_id.as_str(), &result) {
                Ok(envelope) => {
                    let _ = outbound.send(envelope).await;
                }
                Err(err) => warn!("failed to encode task_result: {err}"),
            }
        });
    }

    async fn post_result(&self, result: TaskResultPayload) {
        match Envelope::new(MessageType::TaskResult, self.device_id.as_str(), &result) {
            Ok(envelope) => {
                let _ = self.outbound.send(envelope).await;
            }
            Err(err) => warn!("failed to encode task_result: {err}"),
        }
    }

    async fn send_error(&self, code: &str, message: &str) {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        if let Ok(envelope) =
            Envelope::new(MessageType::Error, self.device_id.as_str(), &payload)
        {
            let _ = self.outbound.send(envelope).await;
        }
    }
}

fn failure_result(
    assign: &TaskAssignPayload,
    error: TaskError,
    elapsed: f64,
) -> TaskResultPayload {
    TaskResultPayload {
        task_id: assign.task_id.clone(),
        status: TaskOutcome::Failure,
        result: None,
        error: Some(error),
        execution_time_seconds: elapsed,
    }
}

async fn wait_for_ack(reader: &mut FrameReader) -> Result<RegisterAck> {
    let deadline = tokio::time::sleep(REGISTER_ACK_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => bail!("timed out waiting for register_ack"),
            frame = reader.next_frame() => {
                match frame? {
                    None => bail!("coordinator closed the connection during registration"),
                    Some(envelope) if envelope.message_type == MessageType::RegisterAck => {
                        return Ok(envelope.decode_data()?);
                    }
                    Some(envelope) => {
                        debug!("ignoring {} before register_ack", envelope.message_type);
                    }
                }
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Envelope>,
    codec: FrameCodec,
) {
    while let Some(envelope) = outbound.recv().await {
        let frame = match codec.encode(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping unencodable frame: {err}");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&frame).await {
            debug!("write failed: {err}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Newline-delimited frame reader with the codec's size cap.
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

    /// Cancel safe: a read raced out of a `select!` leaves its partial line
    /// in `buf`, and the next call picks up where it left off.
    async fn next_frame(&mut self) -> Result<Option<Envelope>> {
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
                    continue;
                }
                return Ok(Some(self.codec.decode(&frame)?));
            }
            if n == 0 {
                self.buf.clear();
                return Ok(None);
            }
        }
    }
}
