//! `lidartrack-middleware` – plumbing between the socket and the pipeline.
//!
//! Moves data between tasks without caring what it means.
//!
//! # Modules
//!
//! - [`queue`] – bounded queues that drop and count on overflow.
//! - [`stats`] – lock-free ingest counters.
//! - [`parser`] – [`PacketParser`] boundary and the raw record format.
//! - [`assembler`] – [`FrameAssembler`]: time-window or spin-wrap framing.
//! - [`ingest`] – the socket and assembly tasks, and the [`FrameSource`]
//!   seam the orchestrator reads from.
//! - [`bus`] – topic-based broadcast of pipeline events.

pub mod assembler;
pub mod bus;
pub mod ingest;
pub mod parser;
pub mod queue;
pub mod stats;

pub use assembler::{AssemblerConfig, AssemblyMode, FrameAssembler};
pub use bus::{EventBus, EventPayload, PipelineEvent, Topic};
pub use ingest::{FrameSource, Packet, ReplaySource};
pub use parser::{PacketParser, ParseError, RawPointParser};
pub use queue::{DropCounter, DropReceiver, DropSender, bounded};
pub use stats::IngestStats;
