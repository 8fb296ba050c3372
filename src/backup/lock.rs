use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Contents of a lock file: the owning process and when it took the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMarker {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

impl LockMarker {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            created_at: Utc::now(),
        }
    }

    fn render(&self) -> String {
        format!("{}\n{}\n", self.pid, self.created_at.to_rfc3339())
    }

    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let created_at = lines
            .next()
            .and_then(|l| DateTime::parse_from_rfc3339(l.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        Some(Self { pid, created_at })
    }
}

pub fn lock_path(dir: &Path, database: &str) -> PathBuf {
    let safe: String = database
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.backup.lock", safe))
}

/// Held for the lifetime of a job; the marker file is removed on `release`
/// or, failing that, on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    marker: LockMarker,
    released: bool,
}

impl LockGuard {
    pub fn acquire(dir: &Path, database: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            BackupError::Lock(format!("cannot create lock directory {}: {}", dir.display(), e))
        })?;
        let path = lock_path(dir, database);
        let marker = LockMarker::current();

        // One retry: the first failed link may be against a stale marker.
        for _ in 0..2 {
            match publish(&path, &marker) {
                Ok(()) => {
                    info!(pid = marker.pid, "Acquired lock {}", path.display());
                    return Ok(Self {
                        path,
                        marker,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(BackupError::Lock(format!(
                        "cannot create {}: {}",
                        path.display(),
                        e
                    )))
                }
            }

            let contents = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BackupError::Lock(format!(
                        "cannot read {}: {}",
                        path.display(),
                        e
                    )))
                }
            };

            match LockMarker::parse(&contents) {
                Some(existing) if process_alive(existing.pid) => {
                    return Err(BackupError::AlreadyRunning {
                        database: database.to_string(),
                        pid: existing.pid,
                    });
                }
                Some(existing) => warn!(
                    pid = existing.pid,
                    "Discarding stale lock {} created at {}",
                    path.display(),
                    existing.created_at
                ),
                None => warn!("Discarding unreadable lock {}", path.display()),
            }
            remove_if_unchanged(&path, &contents)?;
        }

        Err(BackupError::Lock(format!(
            "lock {} was re-created by another process",
            path.display()
        )))
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> Result<()> {
        // Never delete a marker that another run has since put in place.
        match fs::read_to_string(&self.path) {
            Ok(contents) if LockMarker::parse(&contents).as_ref() != Some(&self.marker) => {
                warn!("Lock {} is no longer ours, leaving it", self.path.display());
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            _ => {}
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released lock {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Lock(format!(
                "cannot remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove() {
                warn!("{}", e);
            }
        }
    }
}

/// Writes the marker to a private temp file and hard-links it into place, so
/// the lock appears atomically and is never observed half-written.
fn publish(path: &Path, marker: &LockMarker) -> io::Result<()> {
    let tmp = path.with_extension(format!("lock.{}.tmp", marker.pid));
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(marker.render().as_bytes())?;
        file.sync_all()?;
        fs::hard_link(&tmp, path)
    })();
    let _ = fs::remove_file(&tmp);
    result
}

/// Moves the marker aside with a single rename, then checks what was moved.
/// A live marker that replaced the stale one in the meantime is linked back
/// instead of being deleted.
fn remove_if_unchanged(path: &Path, expected: &str) -> Result<()> {
    let parked = path.with_extension(format!("lock.stale.{}", std::process::id()));
    match fs::rename(path, &parked) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(BackupError::Lock(format!(
                "cannot move stale lock {}: {}",
                path.display(),
                e
            )))
        }
    }

    let moved = fs::read_to_string(&parked).unwrap_or_default();
    if moved == expected {
        let _ = fs::remove_file(&parked);
        return Ok(());
    }

    debug!("Lock {} changed owner while being replaced", path.display());
    let restored = fs::hard_link(&parked, path);
    let _ = fs::remove_file(&parked);
    restored.map_err(|e| {
        BackupError::Lock(format!(
            "lock {} changed hands during stale removal: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the existence and permission checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
