use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Runs a trivial query; any failure is a connectivity error.
    async fn test_connection(&self) -> Result<()>;
    /// Approximate dataset size in megabytes, if the server can tell.
    async fn estimate_size_mb(&self) -> Result<Option<f64>>;
    /// Writes a consistent logical snapshot to `dest`, returning bytes written.
    async fn dump_to(&self, dest: &Path, progress: &mut DumpProgress) -> Result<u64>;
    fn engine_name(&self) -> &'static str;
}

/// Logs dump progress in ten percent steps against a size estimate. Purely
/// observational; without an estimate it stays silent.
#[derive(Debug)]
pub struct DumpProgress {
    expected_bytes: Option<u64>,
    next_step: u64,
}

impl DumpProgress {
    pub fn new(estimate_mb: Option<f64>) -> Self {
        let expected_bytes = estimate_mb
            .filter(|mb| mb.is_finite() && *mb > 0.0)
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
            .filter(|bytes| *bytes > 0);
        Self {
            expected_bytes,
            next_step: 10,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected_bytes.is_some()
    }

    /// Returns the percentage logged by this call, if any.
    pub fn advance(&mut self, written: u64) -> Option<u64> {
        let expected = self.expected_bytes?;
        let percent = written.saturating_mul(100) / expected;
        if self.next_step > 90 || percent < self.next_step {
            return None;
        }
        let step = (percent / 10 * 10).min(90);
        self.next_step = step + 10;
        info!(
            "Dump progress: ~{}% ({:.1} MB)",
            step,
            written as f64 / 1024.0 / 1024.0
        );
        Some(step)
    }
}
