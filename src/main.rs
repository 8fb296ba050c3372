mod backup;
mod config;
mod database;
mod error;
mod log;
mod notify;
mod upload;

use backup::{BackupJob, Services};
use chrono::Utc;
use error::{BackupError, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

fn parse_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config_file = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| {
                    BackupError::Config("--config requires a path".to_string())
                })?;
                config_file = Some(PathBuf::from(path));
            }
            other => match other.strip_prefix("--config=") {
                Some(path) => config_file = Some(PathBuf::from(path)),
                None => {
                    return Err(BackupError::Config(format!("unknown argument '{}'", other)))
                }
            },
        }
    }
    Ok(config_file)
}

fn load_config() -> Result<config::BackupConfig> {
    let config_file = parse_args()?;
    let params = config::load_params(config_file.as_deref())?;
    config::from_params(&params)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Nothing is locked, written or sent before the configuration is valid.
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::init(None, "");
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let job = BackupJob::new(&config, Utc::now());
    let log_file = log::init(Some(&config.log_dir), &job.base_name);
    info!(
        "SQL backup starting for database '{}' at {}",
        job.database,
        job.started_at.to_rfc3339()
    );
    info!("Configuration: {:?}", config);

    let shutdown = Arc::new(Notify::new());
    let signal_count = Arc::new(AtomicUsize::new(0));
    let handler_shutdown = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let count = signal_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            eprintln!("\nShutdown signal received, cleaning up. Signal again to force exit...");
            handler_shutdown.notify_one();
        } else {
            eprintln!("\nForce exiting...");
            std::process::exit(130);
        }
    }) {
        warn!("Cannot install signal handler: {}", e);
    }

    let services = match Services::from_config(&config).await {
        Ok(services) => services,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let report = backup::run(&config, &services, job, shutdown, log_file).await;
    let elapsed = report.duration.as_secs_f64();
    match &report.outcome {
        Ok(_) => info!("Backup of '{}' finished in {:.1}s", report.database, elapsed),
        Err(e) => error!(
            "Backup of '{}' failed after {:.1}s: {}",
            report.database, elapsed, e
        ),
    }
    ExitCode::from(report.exit_code())
}
