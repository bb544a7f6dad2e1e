//! Startup configuration – `~/.lidartrack/config.toml` or `--config <path>`.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! `LIDARTRACK_*` environment variables are applied after the file is read.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lidartrack_middleware::AssemblerConfig;
use lidartrack_perception::background::BackgroundConfig;
use lidartrack_perception::cluster::ClusterConfig;
use lidartrack_perception::pose::PoseSpec;
use lidartrack_runtime::{OrchestratorConfig, ServiceConfig};
use lidartrack_tracking::tracker::TrackerConfig;
use lidartrack_types::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_udp_bind")]
    pub bind: String,
    #[serde(default = "default_packet_queue")]
    pub packet_queue: usize,
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: default_udp_bind(),
            packet_queue: default_packet_queue(),
            frame_queue: default_frame_queue(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Frames of world clusters kept for `/api/lidar/clusters`.
    #[serde(default = "default_recent_cluster_frames")]
    pub recent_cluster_frames: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_http_port(),
            recent_cluster_frames: default_recent_cluster_frames(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_sensor_id")]
    pub sensor_id: String,
    /// Site frame every pose must map into.
    #[serde(default = "default_world_frame")]
    pub world_frame: String,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub assembler: AssemblerConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub poses: Vec<PoseSpec>,
}

fn default_sensor_id() -> String {
    "lidar-01".to_string()
}
fn default_world_frame() -> String {
    "site".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    1_000
}
fn default_udp_bind() -> String {
    "0.0.0.0:2368".to_string()
}
fn default_packet_queue() -> usize {
    1024
}
fn default_frame_queue() -> usize {
    8
}
fn default_true() -> bool {
    true
}
fn default_http_port() -> u16 {
    8080
}
fn default_recent_cluster_frames() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor_id: default_sensor_id(),
            world_frame: default_world_frame(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            udp: UdpConfig::default(),
            assembler: AssemblerConfig::default(),
            background: BackgroundConfig::default(),
            cluster: ClusterConfig::default(),
            tracker: TrackerConfig::default(),
            monitor: MonitorConfig::default(),
            poses: Vec::new(),
        }
    }
}

impl Config {
    /// Check every section.  The first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service_config()?.validate()?;
        for pose in &self.poses {
            if pose.world_frame != self.world_frame {
                return Err(ConfigError::invalid(
                    "poses.world_frame",
                    format!(
                        "pose `{}` maps into `{}`, expected `{}`",
                        pose.id, pose.world_frame, self.world_frame
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Runtime wiring derived from this configuration.
    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        let udp_bind: SocketAddr = self
            .udp
            .bind
            .parse()
            .map_err(|e| ConfigError::invalid("udp.bind", format!("`{}`: {e}", self.udp.bind)))?;
        Ok(ServiceConfig {
            udp_bind,
            packet_queue: self.udp.packet_queue,
            frame_queue: self.udp.frame_queue,
            assembler: self.assembler.clone(),
            orchestrator: OrchestratorConfig {
                sensor_id: self.sensor_id.clone(),
                background: self.background.clone(),
                cluster: self.cluster.clone(),
                tracker: self.tracker.clone(),
                recent_cluster_frames: self.monitor.recent_cluster_frames,
            },
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        })
    }
}

/// `~/.lidartrack/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lidartrack").join("config.toml")
}

/// Read `path` (defaults when it does not exist), then apply environment
/// overrides.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| ConfigError::File(format!("parse {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// | Variable | Field |
/// |---|---|
/// | `LIDARTRACK_SENSOR_ID` | `sensor_id` |
/// | `LIDARTRACK_UDP_BIND` | `udp.bind` |
/// | `LIDARTRACK_HTTP_PORT` | `monitor.port` |
///
/// Unparsable values are ignored.  `LIDARTRACK_LOG_FORMAT` is read by the
/// tracing setup.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("LIDARTRACK_SENSOR_ID")
        && !v.trim().is_empty()
    {
        cfg.sensor_id = v;
    }
    if let Ok(v) = std::env::var("LIDARTRACK_UDP_BIND")
        && v.parse::<SocketAddr>().is_ok()
    {
        cfg.udp.bind = v;
    }
    if let Ok(v) = std::env::var("LIDARTRACK_HTTP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.monitor.port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lidartrack_middleware::AssemblyMode;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.udp.packet_queue, 1024);
        assert_eq!(cfg.udp.frame_queue, 8);
        assert_eq!(cfg.monitor.port, 8080);
        assert_eq!(cfg.shutdown_grace_ms, 1000);
        assert_eq!(cfg.cluster.min_pts, 12);
        assert!((cfg.tracker.gate_mahalanobis_sq - 9.21).abs() < 1e-12);
        assert_eq!(cfg.assembler.mode, AssemblyMode::TimeWindow);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.world_frame, "site");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
sensor_id = "north-gate"

[cluster]
eps_m = 0.8

[assembler]
mode = "spin_wrap"

[[poses]]
id = "survey-2024"
sensor_id = "north-gate"
translation = [1.0, 2.0, 3.5]
rotation_deg = [0.0, 0.0, 90.0]
"#,
        )
        .unwrap();
        assert_eq!(cfg.sensor_id, "north-gate");
        assert!((cfg.cluster.eps_m - 0.8).abs() < 1e-6);
        assert_eq!(cfg.cluster.min_pts, 12);
        assert_eq!(cfg.assembler.mode, AssemblyMode::SpinWrap);
        assert_eq!(cfg.poses.len(), 1);
        assert_eq!(cfg.poses[0].world_frame, "site");
        cfg.validate().unwrap();
    }

    #[test]
    fn malformed_file_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "sensor_id = [not toml");
        assert!(matches!(load_from(&path), Err(ConfigError::File(_))));
    }

    #[test]
    fn oversized_grid_is_rejected() {
        let cfg = Config {
            background: BackgroundConfig {
                rings: 4096,
                azimuth_bin_deg: 0.05,
                ..BackgroundConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::GridTooLarge { .. })));
    }

    #[test]
    fn bad_bind_and_foreign_pose_frame_rejected() {
        let mut cfg = Config::default();
        cfg.udp.bind = "not-an-addr".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "udp.bind", .. })));

        let mut cfg = Config::default();
        cfg.poses.push(PoseSpec {
            id: "p".into(),
            sensor_id: "lidar-01".into(),
            world_frame: "elsewhere".into(),
            ..PoseSpec::default()
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "poses.world_frame", .. })));
    }

    #[test]
    fn config_path_points_to_lidartrack_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.ends_with(".lidartrack/config.toml"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: the only test in this crate touching these variables.
        unsafe {
            std::env::set_var("LIDARTRACK_SENSOR_ID", "east-gate");
            std::env::set_var("LIDARTRACK_UDP_BIND", "127.0.0.1:2370");
            std::env::set_var("LIDARTRACK_HTTP_PORT", "not-a-port");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sensor_id, "east-gate");
        assert_eq!(cfg.udp.bind, "127.0.0.1:2370");
        assert_eq!(cfg.monitor.port, 8080);

        unsafe { std::env::set_var("LIDARTRACK_HTTP_PORT", "9191") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.monitor.port, 9191);
        unsafe {
            std::env::remove_var("LIDARTRACK_SENSOR_ID");
            std::env::remove_var("LIDARTRACK_UDP_BIND");
            std::env::remove_var("LIDARTRACK_HTTP_PORT");
        }
    }
}
