//! `lidartrack-monitor` – read-only JSON view of a running pipeline.
//!
//! An `axum` router serving `GET` requests (default port `8080`) from the
//! latest published snapshot.  Handlers never touch the background grid or
//! the live track set; they clone an `Arc` and serialise it.
//!
//! | Route | Body |
//! |---|---|
//! | `/api/lidar/health` | socket liveness, frame rate, frozen bins, live tracks |
//! | `/api/lidar/foreground` | foreground/background point counters |
//! | `/api/lidar/tracks` | latest state of every live track |
//! | `/api/lidar/tracks/{id}/history?stride=N` | observation history, every N-th record plus the last |
//! | `/api/lidar/clusters` | world clusters of the last few frames |
//! | `/api/lidar/counters` | pipeline and ingest counters |
//!
//! Unknown routes and unknown tracks answer `404`, any other method on a
//! known route `405`; both carry `{"error": "..."}`.
//!
//! ```rust,no_run
//! # async fn demo(reader: lidartrack_runtime::SnapshotReader) {
//! use lidartrack_monitor::MonitorServer;
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! MonitorServer::new(reader).with_port(9090).run(shutdown).await.unwrap();
//! # }
//! ```

pub mod server;

pub use server::{DEFAULT_PORT, MonitorError, MonitorServer, downsample, router, serve, stride};
