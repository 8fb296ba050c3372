use super::artifact::{Artifact, ArtifactKind};
use crate::config::IntegrityConfig;
use crate::error::{BackupError, Result};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;

/// Rejects a dump that is implausibly small or never emitted a table
/// definition.
pub async fn check_dump(artifact: &Artifact, rules: &IntegrityConfig) -> Result<()> {
    if artifact.kind() != ArtifactKind::RawDump {
        return Err(BackupError::Integrity(format!(
            "expected a raw dump, got a {} artifact",
            artifact.kind()
        )));
    }

    let on_disk = tokio::fs::metadata(artifact.path()).await?.len();
    if on_disk < rules.min_size_bytes {
        return Err(BackupError::Integrity(format!(
            "{} is {} bytes, below the {} byte minimum",
            artifact.file_name(),
            on_disk,
            rules.min_size_bytes
        )));
    }

    if !contains_marker(artifact, rules.marker.as_bytes()).await? {
        return Err(BackupError::Integrity(format!(
            "{} does not contain '{}'",
            artifact.file_name(),
            rules.marker
        )));
    }

    info!(
        "Dump passed integrity checks ({} bytes, marker '{}' present)",
        on_disk, rules.marker
    );
    Ok(())
}

async fn contains_marker(artifact: &Artifact, marker: &[u8]) -> Result<bool> {
    if marker.is_empty() {
        return Ok(true);
    }

    let mut file = File::open(artifact.path()).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    // Carries the tail of the previous read so a marker split across two
    // reads is still found.
    let mut window: Vec<u8> = Vec::with_capacity(buffer.len() + marker.len());

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            return Ok(false);
        }
        window.extend_from_slice(&buffer[..bytes_read]);
        if window.windows(marker.len()).any(|w| w == marker) {
            return Ok(true);
        }
        let keep = marker.len().saturating_sub(1).min(window.len());
        window.drain(..window.len() - keep);
    }
}
