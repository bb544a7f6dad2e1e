//! `lidartrack-perception` – from raw returns to world-frame detections.
//!
//! Everything in this crate runs synchronously inside one frame pass of the
//! orchestrator; nothing here spawns tasks or blocks.
//!
//! # Modules
//!
//! - [`background`] – [`BackgroundGrid`][background::BackgroundGrid]: adaptive
//!   per-(ring, azimuth-bin) range model that labels each point foreground or
//!   background in the sensor's own angular coordinates.
//! - [`cluster`] – [`Clusterer`][cluster::Clusterer]: grid-accelerated
//!   eps/minPts chaining of foreground points into
//!   [`SensorCluster`][cluster::SensorCluster]s.
//! - [`pose`] – [`PoseRegistry`][pose::PoseRegistry]: per-sensor rigid
//!   transforms into the site frame, hot-swappable at runtime.
//! - [`transform`] – [`WorldTransformer`][transform::WorldTransformer]: applies
//!   the registered pose to sensor clusters and stamps the pose identifier.

pub mod background;
pub mod cluster;
pub mod pose;
pub mod transform;
