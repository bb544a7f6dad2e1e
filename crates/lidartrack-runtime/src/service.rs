//! Task wiring for one sensor.
//!
//! ```text
//! UDP socket ──► packet queue ──► parser + assembler ──► frame queue ──► orchestrator ──► snapshot
//! ```
//!
//! Every task watches the same [`ShutdownSignal`].  On shutdown the socket
//! task stops reading, the assembler drains queued packets and flushes its
//! open frame, and the orchestrator finishes the frame in hand.  Tasks still
//! running after the grace period are aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lidartrack_middleware::ingest::{run_assembler, run_udp_receiver};
use lidartrack_middleware::{
    AssemblerConfig, EventBus, FrameAssembler, IngestStats, Packet, PacketParser, bounded,
};
use lidartrack_perception::pose::PoseRegistry;
use lidartrack_types::{ConfigError, Frame, LidarError, NANOS_PER_SEC};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::orchestrator::{FrameOrchestrator, OrchestratorConfig};
use crate::snapshot::SnapshotReader;

/// The socket counts as active while a datagram arrived within this window.
const UDP_ACTIVE_WINDOW_NS: i64 = 2 * NANOS_PER_SEC;

// ─────────────────────────────────────────────────────────────────────────────
// Shutdown
// ─────────────────────────────────────────────────────────────────────────────

/// One-shot, cloneable shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(Arc<watch::Sender<bool>>);

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Idempotent; safe to call from a signal handler thread.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub udp_bind: SocketAddr,
    pub packet_queue: usize,
    pub frame_queue: usize,
    pub assembler: AssemblerConfig,
    pub orchestrator: OrchestratorConfig,
    pub shutdown_grace: Duration,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_queue == 0 {
            return Err(ConfigError::invalid("udp.packet_queue", "must be at least 1"));
        }
        if self.frame_queue == 0 {
            return Err(ConfigError::invalid("udp.frame_queue", "must be at least 1"));
        }
        self.assembler.validate()?;
        self.orchestrator.validate()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineService
// ─────────────────────────────────────────────────────────────────────────────

/// The running ingest and perception tasks of one sensor.
pub struct PipelineService {
    local_addr: SocketAddr,
    reader: SnapshotReader,
    shutdown: ShutdownSignal,
    grace: Duration,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineService {
    /// Validate, bind the socket and spawn every task.  Must be called
    /// inside a Tokio runtime.
    pub async fn start(
        config: ServiceConfig,
        registry: Arc<PoseRegistry>,
        parser: Arc<dyn PacketParser>,
        bus: EventBus,
        shutdown: ShutdownSignal,
    ) -> Result<Self, LidarError> {
        config.validate()?;
        let assembler = FrameAssembler::new(config.assembler.clone())?;
        let orchestrator = FrameOrchestrator::new(config.orchestrator.clone(), registry, bus)?;

        let socket = UdpSocket::bind(config.udp_bind)
            .await
            .map_err(|e| LidarError::Transport(format!("bind {}: {e}", config.udp_bind)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| LidarError::Transport(e.to_string()))?;

        let (packet_tx, packet_rx) = bounded::<Packet>(config.packet_queue);
        let (frame_tx, frame_rx) = bounded::<Frame>(config.frame_queue);
        let stats = Arc::new(IngestStats::new(packet_tx.counter(), frame_tx.counter()));
        let reader = SnapshotReader::new(orchestrator.subscribe(), Arc::clone(&stats), UDP_ACTIVE_WINDOW_NS);

        let receiver = tokio::spawn(run_udp_receiver(
            socket,
            packet_tx,
            Arc::clone(&stats),
            shutdown.subscribe(),
        ));
        let assembly = tokio::spawn(run_assembler(
            packet_rx,
            parser,
            assembler,
            frame_tx,
            stats,
            shutdown.subscribe(),
        ));
        let stop = shutdown.subscribe();
        let perception = tokio::spawn(async move {
            orchestrator.run(frame_rx, stop).await;
        });

        info!(
            addr = %local_addr,
            sensor_id = %config.orchestrator.sensor_id,
            packet_queue = config.packet_queue,
            frame_queue = config.frame_queue,
            "pipeline service started"
        );
        Ok(Self {
            local_addr,
            reader,
            shutdown,
            grace: config.shutdown_grace,
            tasks: vec![("udp", receiver), ("assembler", assembly), ("orchestrator", perception)],
        })
    }

    /// Address the UDP socket actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Trigger shutdown and wait up to the grace period for each task.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        let deadline = tokio::time::Instant::now() + self.grace;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = name, grace_ms = self.grace.as_millis() as u64, "grace period elapsed, aborting task");
                    handle.abort();
                }
            }
        }
        info!("pipeline service stopped");
    }
}
