use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SQL_SUFFIX: &str = ".sql";
pub const GZIP_SUFFIX: &str = ".gz";
pub const AGE_SUFFIX: &str = ".age";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    RawDump,
    Compressed,
    Encrypted,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::RawDump => write!(f, "raw dump"),
            ArtifactKind::Compressed => write!(f, "compressed"),
            ArtifactKind::Encrypted => write!(f, "encrypted"),
        }
    }
}

/// The backup file at one stage of the pipeline. Transform stages consume an
/// `Artifact` and hand back the next one, so only one is ever current.
#[derive(Debug, PartialEq, Eq)]
pub struct Artifact {
    path: PathBuf,
    kind: ArtifactKind,
    size: u64,
}

impl Artifact {
    pub fn new(path: PathBuf, kind: ArtifactKind, size: u64) -> Self {
        Self { path, kind, size }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// `<prefix>_<database>_<YYYYmmdd_HHMMSS>`, shared by the dump file, every
/// derived artifact, the remote key and the run's log file.
pub fn base_name(prefix: &str, database: &str, started_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        database,
        started_at.format("%Y%m%d_%H%M%S")
    )
}

/// Scratch directory for one job. Every local path the job may write is
/// registered here first so the finalizer can remove whatever is left.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    tracked: Vec<PathBuf>,
}

impl Workspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tracked: Vec::new(),
        }
    }

    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Registers `file_name` inside the workspace and returns its full path.
    pub fn track(&mut self, file_name: &str) -> PathBuf {
        let path = self.dir.join(file_name);
        if !self.tracked.contains(&path) {
            self.tracked.push(path.clone());
        }
        path
    }

    /// Deletes every tracked file still on disk. Safe to call repeatedly.
    pub fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for path in &self.tracked {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Removed {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }
}

/// Removes the artifact a transform stage just replaced.
pub(crate) fn discard(previous: Artifact) {
    if let Err(e) = fs::remove_file(&previous.path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(
                "Could not remove superseded {} artifact {}: {}",
                previous.kind,
                previous.path.display(),
                e
            );
        }
    }
}
