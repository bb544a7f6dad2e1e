//! `lidartrack` – roadside LiDAR perception service.
//!
//! 1. Loads `--config <path>` (or `~/.lidartrack/config.toml`) and applies
//!    `LIDARTRACK_*` overrides.  Any invalid tunable aborts before the socket
//!    is opened.
//! 2. Seeds the pose registry from `[[poses]]`.
//! 3. Starts UDP ingest, the frame pipeline and the monitoring endpoint.
//! 4. On Ctrl-C, stops every task within the configured grace period.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use lidartrack_middleware::{EventBus, EventPayload, RawPointParser, Topic};
use lidartrack_monitor::MonitorServer;
use lidartrack_perception::pose::PoseRegistry;
use lidartrack_runtime::{PipelineService, ShutdownSignal, TelemetryResource, init_tracing};
use lidartrack_types::nanos_to_secs;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lidartrack", version, about = "Roadside LiDAR detection and tracking")]
struct Cli {
    /// Configuration file (default: ~/.lidartrack/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    print_banner();

    let path = cli.config.unwrap_or_else(config::config_path);
    let cfg = match config::load_from(&path).and_then(|cfg| cfg.validate().map(|()| cfg)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red().bold());
            return ExitCode::from(2);
        }
    };
    let _telemetry = init_tracing(&TelemetryResource::new(&cfg.sensor_id, &cfg.world_frame));
    println!("  Config loaded from {}", path.display().to_string().bold());

    let registry = match PoseRegistry::from_specs(&cfg.poses) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("{}: {e}", "Pose error".red().bold());
            return ExitCode::from(2);
        }
    };
    if registry.current(&cfg.sensor_id).is_none() {
        warn!(sensor_id = %cfg.sensor_id, "no pose configured; no tracks are produced until one is added");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Runtime error".red().bold());
            return ExitCode::FAILURE;
        }
    };

    let shutdown = ShutdownSignal::new();
    let on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – draining pipeline …".yellow().bold());
        on_signal.trigger();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with SIGKILL");
    }

    match runtime.block_on(run(cfg, registry, shutdown)) {
        Ok(()) => {
            println!("{}", "  ✓ lidartrack stopped.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "service failed");
            eprintln!("{}: {e}", "Fatal".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(
    cfg: config::Config,
    registry: Arc<PoseRegistry>,
    shutdown: ShutdownSignal,
) -> Result<(), lidartrack_types::LidarError> {
    let bus = EventBus::default();
    let mut finished = bus.subscribe_to(Topic::Tracks);

    let service = PipelineService::start(
        cfg.service_config()?,
        registry,
        Arc::new(RawPointParser),
        bus,
        shutdown.clone(),
    )
    .await?;
    println!("  UDP ingest on {}", service.local_addr().to_string().bold());

    let monitor = cfg.monitor.enabled.then(|| {
        println!(
            "  Monitoring on {}",
            format!("http://localhost:{}/api/lidar/health", cfg.monitor.port).bold()
        );
        tokio::spawn(
            MonitorServer::new(service.reader())
                .with_port(cfg.monitor.port)
                .run(shutdown.subscribe()),
        )
    });

    let logger = tokio::spawn(async move {
        while let Some(event) = finished.recv().await {
            if let EventPayload::TrackFinished(track) = event.payload {
                info!(
                    track_id = %track.track_id,
                    observations = track.observation_count,
                    avg_speed_mps = track.avg_speed_mps,
                    duration_s = nanos_to_secs(track.last_seen_ns - track.first_seen_ns),
                    "track finished"
                );
            }
        }
    });

    let mut stop = shutdown.subscribe();
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            break;
        }
    }

    let grace = Duration::from_millis(cfg.shutdown_grace_ms);
    service.shutdown().await;
    if let Some(monitor) = monitor {
        match tokio::time::timeout(grace, monitor).await {
            Ok(Ok(Err(e))) => warn!(error = %e, "monitor stopped with error"),
            Err(_) => warn!("monitor did not stop within the grace period"),
            _ => {}
        }
    }
    logger.abort();
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", r#"   __   _     __           __                  __  "#.bold().cyan());
    println!("{}", r#"  / /  (_)___/ /__ _____  / /________ _ ____  / /__"#.bold().cyan());
    println!("{}", r#" / /__/ / __  / _ `/ __/ / __/ __/ _ `// __/ /  '_/"#.bold().cyan());
    println!("{}", r#"/____/_/\_,_/\_,_/_/    \__/_/  \_,_/ \__/ /_/\_\ "#.bold().cyan());
    println!();
    println!("  {} {}", "lidartrack".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Roadside LiDAR detection and tracking");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_args_means_default_path() {
        let cli = Cli::try_parse_from(["lidartrack"]).unwrap();
        assert_eq!(cli.config, None);
    }

    #[test]
    fn config_flag_forms() {
        for argv in [
            vec!["lidartrack", "--config", "/etc/lt.toml"],
            vec!["lidartrack", "--config=/etc/lt.toml"],
            vec!["lidartrack", "-c", "/etc/lt.toml"],
        ] {
            let cli = Cli::try_parse_from(argv.iter().copied()).unwrap();
            assert_eq!(cli.config, Some(PathBuf::from("/etc/lt.toml")), "{argv:?}");
        }
    }

    #[test]
    fn bad_args_rejected() {
        assert!(Cli::try_parse_from(["lidartrack", "--config"]).is_err());
        assert!(Cli::try_parse_from(["lidartrack", "--verbose"]).is_err());
    }
}
