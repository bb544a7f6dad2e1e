//! `lidartrack-tracking` – multi-object tracking in the site frame.
//!
//! # Modules
//!
//! - [`kalman`] – [`CvFilter`][kalman::CvFilter]: linear constant-velocity
//!   Kalman filter over `[x, y, vx, vy]`.
//! - [`association`] – greedy, gated, mutually exclusive track↔cluster
//!   assignment.
//! - [`tracker`] – [`Tracker`][tracker::Tracker]: predict, associate, update,
//!   birth and retirement once per frame.

pub mod association;
pub mod kalman;
pub mod tracker;
