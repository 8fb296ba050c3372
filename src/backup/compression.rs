use super::artifact::{discard, Artifact, ArtifactKind, Workspace, GZIP_SUFFIX};
use crate::error::{BackupError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Set when the future driving a blocking gzip task is dropped. The task
/// checks it between chunks and deletes its own output once it sees it, so
/// nothing it writes outlives a cancelled job.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn ensure_running(cancelled: &AtomicBool) -> io::Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        Err(io::Error::new(io::ErrorKind::Interrupted, "compression cancelled"))
    } else {
        Ok(())
    }
}

/// Gzips the current raw dump into `<name>.gz`. The raw file is removed only
/// once the compressed copy has been written and decodes back to the same
/// number of bytes.
pub async fn compress(artifact: Artifact, workspace: &mut Workspace) -> Result<Artifact> {
    if artifact.kind() != ArtifactKind::RawDump {
        return Err(BackupError::Compression(format!(
            "cannot compress a {} artifact",
            artifact.kind()
        )));
    }

    let dest = workspace.track(&format!("{}{}", artifact.file_name(), GZIP_SUFFIX));
    info!("Compressing {} to {}", artifact.path().display(), dest.display());

    let source = artifact.path().to_path_buf();
    let expected = artifact.size();
    let target = dest.clone();
    let cancelled = Arc::new(AtomicBool::new(false));
    let _cancel = CancelOnDrop(cancelled.clone());
    let size = tokio::task::spawn_blocking(move || gzip_verified(&source, &target, expected, &cancelled))
        .await
        .map_err(|e| BackupError::Compression(format!("compression task failed: {}", e)))?
        .map_err(|e| BackupError::Compression(e.to_string()))?;

    info!(
        "Compression complete: {} -> {} bytes ({:.1}%)",
        artifact.size(),
        size,
        ratio(size, artifact.size())
    );
    discard(artifact);
    Ok(Artifact::new(dest, ArtifactKind::Compressed, size))
}

/// Compresses and verifies `source` into `target`. On any failure, including
/// cancellation, `target` is removed before returning.
fn gzip_verified(
    source: &Path,
    target: &Path,
    expected: u64,
    cancelled: &AtomicBool,
) -> io::Result<u64> {
    let result = compress_to_gzip(source, target, cancelled).and_then(|size| {
        verify_gzip(target, expected)?;
        ensure_running(cancelled)?;
        Ok(size)
    });
    if result.is_err() {
        let _ = fs::remove_file(target);
    }
    result
}

fn compress_to_gzip(source_path: &Path, dest_path: &Path, cancelled: &AtomicBool) -> io::Result<u64> {
    ensure_running(cancelled)?;
    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let dest_file = File::create(dest_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(dest_file), flate2::Compression::new(6));
    let mut reader = BufReader::new(File::open(source_path)?);
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        ensure_running(cancelled)?;
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        encoder.write_all(&buffer[..bytes_read])?;
    }

    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    let dest_size = fs::metadata(dest_path)?.len();
    debug!("Gzip written: {} bytes", dest_size);
    Ok(dest_size)
}

/// Decodes the whole archive and checks it inflates to `expected` bytes.
fn verify_gzip(path: &Path, expected: u64) -> io::Result<()> {
    let size = fs::metadata(path)?.len();
    if size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is empty", path.display()),
        ));
    }

    let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let decoded = io::copy(&mut decoder, &mut io::sink())?;
    if decoded != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} decodes to {} bytes, expected {}",
                path.display(),
                decoded,
                expected
            ),
        ));
    }
    Ok(())
}

pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let file = File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub async fn sha256_of(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || calculate_sha256(&path))
        .await
        .map_err(|e| BackupError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn ratio(compressed: u64, original: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        compressed as f64 / original as f64 * 100.0
    }
}
