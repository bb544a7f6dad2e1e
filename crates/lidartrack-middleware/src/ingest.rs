//! Ingest tasks: socket → packet queue → parser/assembler → frame queue.
//!
//! The socket task only moves bytes; it never parses and never waits on the
//! packet queue.  The assembly task parses each datagram, cuts the point
//! stream into frames and hands them to the orchestrator through the frame
//! queue.  Both stop on the shared shutdown signal; the assembly task first
//! drains what is already queued and flushes the open frame.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use lidartrack_types::{Frame, UnixNanos};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::assembler::FrameAssembler;
use crate::parser::PacketParser;
use crate::queue::{DropReceiver, DropSender, PushOutcome};
use crate::stats::{IngestStats, now_ns};

/// Largest datagram accepted from the socket.
const MAX_DATAGRAM: usize = 65_535;

/// One raw datagram and its arrival time.
#[derive(Debug, Clone)]
pub struct Packet {
    pub received_ns: UnixNanos,
    pub bytes: Vec<u8>,
}

/// Source of assembled frames for the orchestrator.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame in assembly order; `None` when the source is exhausted.
    async fn next_frame(&mut self) -> Option<Frame>;
}

#[async_trait]
impl FrameSource for DropReceiver<Frame> {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.pop().await
    }
}

/// Pre-assembled frames, for replays and tests.
#[derive(Debug, Default)]
pub struct ReplaySource {
    frames: VecDeque<Frame>,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }
}

/// Read datagrams until shutdown, pushing each onto `packets`.
pub async fn run_udp_receiver(
    socket: UdpSocket,
    packets: DropSender<Packet>,
    stats: Arc<IngestStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = socket.local_addr().ok();
    info!(addr = ?local, "udp receiver started");
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut dropped_logged = 0u64;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, _peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "udp receive failed");
                        continue;
                    }
                };
                let at = now_ns();
                stats.record_packet(at);
                let packet = Packet { received_ns: at, bytes: buf[..len].to_vec() };
                match packets.push(packet) {
                    PushOutcome::Accepted => {}
                    PushOutcome::Dropped => {
                        let dropped = packets.counter().get();
                        if dropped == 1 || dropped >= dropped_logged + 1000 {
                            warn!(dropped, "packet queue full, shedding datagrams");
                            dropped_logged = dropped;
                        }
                    }
                    PushOutcome::Closed => break,
                }
            }
        }
    }
    info!("udp receiver stopped");
}

/// Parse packets and assemble frames until shutdown or until the packet
/// queue closes.
pub async fn run_assembler(
    mut packets: DropReceiver<Packet>,
    parser: Arc<dyn PacketParser>,
    mut assembler: FrameAssembler,
    frames: DropSender<Frame>,
    stats: Arc<IngestStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    // Stop accepting, then drain what already arrived.
                    packets.close();
                    while let Some(p) = packets.try_pop() {
                        ingest_packet(&p, parser.as_ref(), &mut assembler, &frames, &stats);
                    }
                    break;
                }
                continue;
            }
            packet = packets.pop() => packet,
        };
        match packet {
            Some(p) => ingest_packet(&p, parser.as_ref(), &mut assembler, &frames, &stats),
            None => break,
        }
    }
    if let Some(frame) = assembler.flush() {
        emit(frame, &frames, &stats);
    }
    info!("frame assembler stopped");
}

fn ingest_packet(
    packet: &Packet,
    parser: &dyn PacketParser,
    assembler: &mut FrameAssembler,
    frames: &DropSender<Frame>,
    stats: &IngestStats,
) {
    match parser.parse(&packet.bytes) {
        Ok(points) => {
            for frame in assembler.push_all(points) {
                emit(frame, frames, stats);
            }
        }
        Err(e) => {
            let malformed = stats.record_malformed();
            if malformed == 1 || malformed % 1000 == 0 {
                warn!(error = %e, malformed, bytes = packet.bytes.len(), "discarding malformed packet");
            }
        }
    }
}

fn emit(frame: Frame, frames: &DropSender<Frame>, stats: &IngestStats) {
    let sequence = frame.sequence;
    let points = frame.points.len();
    stats.record_frame();
    match frames.push(frame) {
        PushOutcome::Accepted => debug!(sequence, points, "frame assembled"),
        PushOutcome::Dropped => warn!(sequence, dropped = frames.counter().get(), "frame queue full, frame dropped"),
        PushOutcome::Closed => debug!(sequence, "frame queue closed"),
    }
}
