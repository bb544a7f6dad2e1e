//! `lidartrack-runtime` – runs the perception pipeline for one sensor.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`FrameOrchestrator`]: background, clustering,
//!   transform and tracking for each assembled frame, in order.
//! - [`snapshot`] – [`PipelineSnapshot`] and the [`SnapshotReader`] the
//!   monitoring boundary reads from.  Snapshots are replaced whole after each
//!   frame, so a reader never observes a half-updated pipeline.
//! - [`service`] – [`PipelineService`]: binds the socket, spawns the ingest
//!   and perception tasks, and stops them on the shared [`ShutdownSignal`].
//! - [`telemetry`] – [`init_tracing`]: the process-wide subscriber with an
//!   optional OTLP exporter.

pub mod orchestrator;
pub mod service;
pub mod snapshot;
pub mod telemetry;

#[cfg(test)]
mod scenario;

pub use orchestrator::{FrameOrchestrator, FrameOutcome, OrchestratorConfig};
pub use service::{PipelineService, ServiceConfig, ShutdownSignal};
pub use snapshot::{CountersReport, PipelineSnapshot, SnapshotReader};
pub use telemetry::{LogFormat, TelemetryResource, TracerProviderGuard, init_tracing};
