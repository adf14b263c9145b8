//! Primary coordinator - owns the store and supervises worker processes.
//!
//! Flow:
//! 1. Spawn one worker per port `base_port+1 ..= base_port+N`
//! 2. Wait for every worker's Ready
//! 3. Start the round-robin balancer on `base_port`
//! 4. Run the event loop: answer intents, respawn exited workers on their port
//! 5. On shutdown: stop the balancer, terminate workers, don't respawn
//!
//! All mutation happens on the event loop task. Reader tasks (one per worker)
//! and exit watchers only forward [`WorkerEvent`]s to it.

mod registry;
mod slot;
mod spawner;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ProtocolError, Reply, WorkerMessage};
use crate::store::{Controller, PayloadSchema};
use crate::transport::balancer::{Balancer, RoundRobin};
use crate::transport::http::{ServerConfig, bind, serve_listener};

pub use registry::ActiveWorkers;
pub use slot::{SlotState, TransitionError, WorkerSlot};
pub use spawner::{ProcessSpawner, SpawnError, WorkerSpawnConfig, WorkerSpawner};

/// How long a worker gets between SIGTERM and SIGKILL.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

type ReplyWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<Reply>>;

/// Worker count derived from host parallelism: one core is left to the
/// primary, but there is always at least one worker.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

pub struct PrimaryConfig {
    pub hostname: String,
    pub base_port: u16,
    pub num_workers: usize,
    pub payload: PayloadSchema,
    pub setup_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl PrimaryConfig {
    pub fn new(hostname: impl Into<String>, base_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            base_port,
            num_workers: default_worker_count(),
            payload: PayloadSchema::default(),
            setup_timeout: Duration::from_secs(30),
            spawner: Arc::new(ProcessSpawner),
        }
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    pub fn with_payload(mut self, payload: PayloadSchema) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Ports assigned to workers, in balancer rotation order.
    pub fn worker_ports(&self) -> Result<Vec<u16>, PrimaryError> {
        if self.num_workers == 0 {
            return Err(PrimaryError::NoWorkers);
        }
        (1..=self.num_workers)
            .map(|i| {
                u16::try_from(i)
                    .ok()
                    .and_then(|i| self.base_port.checked_add(i))
                    .ok_or(PrimaryError::PortRange {
                        base: self.base_port,
                        count: self.num_workers,
                    })
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrimaryError {
    #[error("failed to spawn worker on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: SpawnError,
    },
    #[error("worker on port {port} was spawned without a {pipe} pipe")]
    MissingPipe { port: u16, pipe: &'static str },
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("{count} workers above base port {base} exceed the port range")]
    PortRange { base: u16, count: usize },
    #[error("workers not ready after {0:?}")]
    SetupTimeout(Duration),
    #[error("balancer failed: {0:#}")]
    Balancer(anyhow::Error),
}

/// Events forwarded to the primary event loop.
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        pid: u32,
        message: Result<WorkerMessage, ProtocolError>,
    },
    Exited {
        pid: u32,
        code: Option<i32>,
    },
}

/// Everything the primary owns: the controller, the registry, the slots and
/// the reply side of every worker channel.
pub struct PrimaryState {
    hostname: String,
    controller: Controller,
    registry: ActiveWorkers,
    slots: BTreeMap<u16, WorkerSlot>,
    channels: HashMap<u32, ReplyWriter>,
    spawner: Arc<dyn WorkerSpawner>,
    events_tx: mpsc::Sender<WorkerEvent>,
    workers_token: CancellationToken,
    slots_tx: watch::Sender<Vec<WorkerSlot>>,
}

impl PrimaryState {
    /// `workers_token` terminates every worker when cancelled.
    pub fn new(
        config: &PrimaryConfig,
        workers_token: CancellationToken,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (slots_tx, _) = watch::channel(Vec::new());
        let state = Self {
            hostname: config.hostname.clone(),
            controller: Controller::new(config.payload),
            registry: ActiveWorkers::new(),
            slots: BTreeMap::new(),
            channels: HashMap::new(),
            spawner: Arc::clone(&config.spawner),
            events_tx,
            workers_token,
            slots_tx,
        };
        (state, events_rx)
    }

    pub fn registry(&self) -> &ActiveWorkers {
        &self.registry
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn slot(&self, port: u16) -> Option<&WorkerSlot> {
        self.slots.get(&port)
    }

    /// Watch slot snapshots (published after every lifecycle change).
    pub fn subscribe(&self) -> watch::Receiver<Vec<WorkerSlot>> {
        self.slots_tx.subscribe()
    }

    /// True once no slot is waiting on a worker to start.
    pub fn settled(&self) -> bool {
        self.slots
            .values()
            .all(|s| matches!(s.state, SlotState::Running { .. } | SlotState::Abandoned))
    }

    fn stopping(&self) -> bool {
        self.workers_token.is_cancelled()
    }

    fn publish(&self) {
        self.slots_tx
            .send_replace(self.slots.values().cloned().collect());
    }

    /// Spawn the initial worker for `port`.
    pub fn spawn_worker(&mut self, port: u16) -> Result<Option<u32>, PrimaryError> {
        let slot = match self.spawn_process(port)? {
            Some(pid) => WorkerSlot::spawned(port, pid),
            None => WorkerSlot::abandoned(port),
        };
        self.slots.insert(port, slot);
        self.publish();
        Ok(self.registry.pid_on(port))
    }

    fn spawn_process(&mut self, port: u16) -> Result<Option<u32>, PrimaryError> {
        let spawn_config = WorkerSpawnConfig {
            hostname: self.hostname.clone(),
            port,
        };
        let mut child = self
            .spawner
            .spawn(&spawn_config)
            .map_err(|source| PrimaryError::Spawn { port, source })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(PrimaryError::MissingPipe { port, pipe: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(PrimaryError::MissingPipe { port, pipe: "stdout" })?;

        let Some(pid) = child.id() else {
            tracing::error!(port, "Can't determine pid of newly spawned worker");
            return Ok(None);
        };

        self.attach(pid, port, stdout, stdin);
        tokio::spawn(watch_exit(
            child,
            pid,
            self.events_tx.clone(),
            self.workers_token.clone(),
        ));

        tracing::info!(pid, port, "Spawned worker");
        Ok(Some(pid))
    }

    /// Register a worker channel: intents are read from `reader`, replies are
    /// written to `writer`.
    pub fn attach<R, W>(&mut self, pid: u32, port: u16, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.registry.register(pid, port);

        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        self.channels
            .insert(pid, FramedWrite::new(writer, JsonCodec::new()));

        let reader = FramedRead::new(reader, JsonCodec::<WorkerMessage>::new());
        tokio::spawn(read_worker(pid, reader, self.events_tx.clone()));
    }

    pub async fn handle_event(&mut self, event: WorkerEvent) -> Result<(), PrimaryError> {
        match event {
            WorkerEvent::Message { pid, message } => {
                self.on_message(pid, message).await;
                Ok(())
            }
            WorkerEvent::Exited { pid, code } => self.on_exit(pid, code),
        }
    }

    async fn on_message(&mut self, pid: u32, message: Result<WorkerMessage, ProtocolError>) {
        match message {
            Ok(WorkerMessage::Ready { port }) => {
                let Some(assigned) = self.registry.port_of(pid) else {
                    tracing::warn!(pid, port, "Ready from unregistered worker");
                    return;
                };
                if assigned != port {
                    tracing::warn!(pid, port, assigned, "Worker reported unexpected port");
                }
                self.transition(assigned, |slot| slot.on_ready(pid));
                tracing::info!(pid, port = assigned, "Worker ready");
                self.publish();
            }
            Ok(WorkerMessage::Intent(intent)) => {
                let op = intent.op;
                let reply = self.controller.handle(intent);
                tracing::debug!(pid, %op, status = reply.status(), "Answering intent");
                self.send_reply(pid, reply).await;
            }
            Err(e) => {
                // No reply: the worker's pending request stays open.
                tracing::error!(pid, error = %e, "Dropping malformed worker message");
            }
        }
    }

    async fn send_reply(&mut self, pid: u32, reply: Reply) {
        let Some(writer) = self.channels.get_mut(&pid) else {
            tracing::warn!(pid, "No channel for worker, reply dropped");
            return;
        };
        if let Err(e) = writer.send(reply).await {
            tracing::error!(pid, error = %e, "Failed to send reply to worker");
        }
    }

    fn on_exit(&mut self, pid: u32, code: Option<i32>) -> Result<(), PrimaryError> {
        self.channels.remove(&pid);

        let Some(port) = self.registry.take(pid) else {
            tracing::error!(pid, "Can't determine port of exited worker, abandoning recovery");
            return Ok(());
        };

        self.transition(port, |slot| slot.on_exit(pid, code));
        if self.stopping() {
            tracing::info!(pid, port, ?code, "Worker stopped");
            self.publish();
            return Ok(());
        }

        tracing::warn!(pid, port, ?code, "Worker exited, respawning");
        self.transition(port, WorkerSlot::begin_respawn);
        self.publish();

        match self.spawn_process(port)? {
            Some(new_pid) => {
                self.transition(port, |slot| slot.on_respawned(new_pid));
            }
            None => {
                tracing::error!(port, "Replacement worker untracked, port abandoned");
                if let Some(slot) = self.slots.get_mut(&port) {
                    slot.abandon();
                }
            }
        }
        self.publish();
        Ok(())
    }

    fn transition(
        &mut self,
        port: u16,
        apply: impl FnOnce(&mut WorkerSlot) -> Result<(), TransitionError>,
    ) {
        match self.slots.get_mut(&port) {
            Some(slot) => {
                if let Err(e) = apply(slot) {
                    tracing::warn!(error = %e, "Ignoring slot transition");
                }
            }
            None => tracing::debug!(port, "No slot tracked for port"),
        }
    }

    /// Terminate all workers and wait (bounded) for their exits.
    pub async fn stop(&mut self, events: &mut mpsc::Receiver<WorkerEvent>) {
        self.workers_token.cancel();
        let drain = async {
            while !self.registry.is_empty() {
                match events.recv().await {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            tracing::warn!(error = %e, "Error while stopping workers");
                        }
                    }
                    None => break,
                }
            }
        };
        if tokio::time::timeout(WORKER_STOP_GRACE * 2, drain).await.is_err() {
            let remaining: Vec<u32> = self.registry.pids().collect();
            tracing::warn!(?remaining, "Workers did not stop in time");
        }
    }
}

/// Run the primary until `shutdown` is cancelled.
///
/// Spawn failures are fatal and returned; the caller should exit non-zero.
pub async fn run_primary(
    config: PrimaryConfig,
    shutdown: CancellationToken,
) -> Result<(), PrimaryError> {
    let ports = config.worker_ports()?;
    let rotation = RoundRobin::new(ports.clone()).ok_or(PrimaryError::NoWorkers)?;
    let balancer = Balancer::new(config.hostname.clone(), rotation)
        .map_err(|e| PrimaryError::Balancer(e.into()))?;
    let (mut state, mut events) = PrimaryState::new(&config, shutdown.child_token());

    tracing::info!(
        num_workers = ports.len(),
        base_port = config.base_port,
        "Starting workers"
    );
    for port in &ports {
        if let Err(e) = state.spawn_worker(*port) {
            state.stop(&mut events).await;
            return Err(e);
        }
    }

    let ready = tokio::time::timeout(config.setup_timeout, async {
        while !state.settled() {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            state.handle_event(event).await?;
        }
        Ok::<(), PrimaryError>(())
    })
    .await;
    let ready = match ready {
        Ok(result) => result,
        Err(_) => Err(PrimaryError::SetupTimeout(config.setup_timeout)),
    };
    if let Err(e) = ready {
        state.stop(&mut events).await;
        return Err(e);
    }
    if shutdown.is_cancelled() {
        state.stop(&mut events).await;
        return Ok(());
    }

    let listener = match bind(&ServerConfig::new(&config.hostname, config.base_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            state.stop(&mut events).await;
            return Err(PrimaryError::Balancer(e.into()));
        }
    };
    let mut balancer_task = tokio::spawn(serve_listener(
        listener,
        Arc::new(balancer).routes(),
        shutdown.clone(),
    ));
    tracing::info!("Cluster is fully operational and ready to receive requests");

    let mut result = Ok(());
    let mut balancer_running = true;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Shutting down primary");
                break;
            }
            joined = &mut balancer_task => {
                balancer_running = false;
                result = match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(PrimaryError::Balancer(e)),
                    Err(e) => Err(PrimaryError::Balancer(anyhow::anyhow!("balancer task failed: {e}"))),
                };
                break;
            }
            Some(event) = events.recv() => {
                if let Err(e) = state.handle_event(event).await {
                    tracing::error!(error = %e, "Fatal error in primary");
                    result = Err(e);
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    if balancer_running {
        match balancer_task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "Balancer exited with error"),
            Err(e) => tracing::warn!(error = %e, "Balancer task failed"),
            Ok(Ok(())) => {}
        }
    }
    state.stop(&mut events).await;
    tracing::info!("Primary exiting");
    result
}

async fn read_worker<R: AsyncRead + Unpin>(
    pid: u32,
    mut reader: FramedRead<R, JsonCodec<WorkerMessage>>,
    events: mpsc::Sender<WorkerEvent>,
) {
    loop {
        match reader.next().await {
            Some(Ok(message)) => {
                if events
                    .send(WorkerEvent::Message { pid, message })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::error!(pid, error = %e, "Worker channel error");
                break;
            }
            None => break,
        }
    }
    tracing::debug!(pid, "Worker reader task exiting");
}

async fn watch_exit(
    mut child: Child,
    pid: u32,
    events: mpsc::Sender<WorkerEvent>,
    stop: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop.cancelled() => terminate(&mut child, pid).await,
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to wait for worker");
            None
        }
    };
    let _ = events.send(WorkerEvent::Exited { pid, code }).await;
}

async fn terminate(child: &mut Child, pid: u32) -> std::io::Result<std::process::ExitStatus> {
    send_sigterm(pid);
    match tokio::time::timeout(WORKER_STOP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid, "Worker ignored SIGTERM, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
