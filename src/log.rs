use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. With a log directory, every line is also
/// appended to `<dir>/<run_name>.log`; the path of that file is returned.
pub fn init(log_dir: Option<&Path>, run_name: &str) -> Option<PathBuf> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut open_error = None;
    let file = log_dir.and_then(|dir| match open_log_file(dir, run_name) {
        Ok(opened) => Some(opened),
        Err(e) => {
            open_error = Some((dir.to_path_buf(), e));
            None
        }
    });
    let log_path = file.as_ref().map(|(path, _)| path.clone());
    let file_layer = file.map(|(_, handle)| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(handle))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    if let Some((dir, e)) = open_error {
        warn!("Cannot write logs to {}: {}; logging to console only", dir.display(), e);
    }
    log_path
}

fn open_log_file(dir: &Path, run_name: &str) -> std::io::Result<(PathBuf, fs::File)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.log", run_name));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}
