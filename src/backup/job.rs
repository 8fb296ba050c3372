use crate::backup::artifact::{base_name, Artifact, ArtifactKind, Workspace, SQL_SUFFIX};
use crate::backup::compression::{compress, sha256_of};
use crate::backup::encryption::AgeEncryptor;
use crate::backup::lock::LockGuard;
use crate::backup::verify::check_dump;
use crate::config::{BackupConfig, Compression, Encryption};
use crate::database::{create_driver, DatabaseDriver, DumpProgress};
use crate::error::{BackupError, Result};
use crate::notify::{NotificationEvent, Notifier, Status, WebhookNotifier};
use crate::upload::{confirm, upload_with_retry, ObjectStore, RemoteLocation, S3Store};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// External collaborators a job talks to.
pub struct Services {
    pub database: Box<dyn DatabaseDriver>,
    pub store: Box<dyn ObjectStore>,
    pub notifier: Option<Box<dyn Notifier>>,
}

impl Services {
    /// Builds clients only; no connection is opened here.
    pub async fn from_config(config: &BackupConfig) -> Result<Self> {
        let notifier: Option<Box<dyn Notifier>> = match &config.notifications {
            Some(n) => Some(Box::new(WebhookNotifier::new(n)?)),
            None => None,
        };
        Ok(Self {
            database: create_driver(config),
            store: Box::new(S3Store::new(&config.storage).await),
            notifier,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Locking,
    Dumping,
    Verifying,
    Compressing,
    Encrypting,
    Uploading,
    ConfirmingUpload,
    Succeeded,
    Failed,
    Finalized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Locking => "locking",
            Stage::Dumping => "dumping",
            Stage::Verifying => "verifying",
            Stage::Compressing => "compressing",
            Stage::Encrypting => "encrypting",
            Stage::Uploading => "uploading",
            Stage::ConfirmingUpload => "confirming upload",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
            Stage::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

/// Identity of one run. Lives for the process and is never persisted.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub database: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub base_name: String,
}

impl BackupJob {
    pub fn new(config: &BackupConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            database: config.database.name.clone(),
            host: config.database.host.clone(),
            started_at,
            base_name: base_name(&config.filename_prefix, &config.database.name, started_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub artifact_name: String,
    pub size: u64,
    pub sha256: String,
    pub location: RemoteLocation,
    pub upload_attempts: u32,
}

#[derive(Debug)]
pub struct JobReport {
    pub database: String,
    pub outcome: Result<BackupSummary>,
    pub duration: Duration,
    pub final_stage: Stage,
}

impl JobReport {
    pub fn exit_code(&self) -> u8 {
        match &self.outcome {
            Ok(_) => 0,
            Err(e) => e.exit_code(),
        }
    }
}

struct JobRunner<'a> {
    config: &'a BackupConfig,
    services: &'a Services,
    job: BackupJob,
    workspace: Workspace,
    lock: Option<LockGuard>,
    stage: Stage,
    started: Instant,
    log_file: Option<PathBuf>,
}

/// Runs one backup to completion. Whatever happens, including a shutdown
/// signal, the job passes through `finalize` exactly once.
pub async fn run(
    config: &BackupConfig,
    services: &Services,
    job: BackupJob,
    shutdown: Arc<Notify>,
    log_file: Option<PathBuf>,
) -> JobReport {
    let mut runner = JobRunner {
        config,
        services,
        job,
        workspace: Workspace::new(config.work_dir.clone()),
        lock: None,
        stage: Stage::Validating,
        started: Instant::now(),
        log_file,
    };

    let outcome = tokio::select! {
        result = runner.execute() => result,
        _ = shutdown.notified() => Err(BackupError::Interrupted),
    };
    if matches!(outcome, Err(BackupError::Interrupted)) {
        warn!("Shutdown requested while {}, cleaning up", runner.stage);
    }

    runner.finalize(outcome).await
}

impl<'a> JobRunner<'a> {
    fn enter(&mut self, stage: Stage) {
        info!("Stage: {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    async fn execute(&mut self) -> Result<BackupSummary> {
        let config = self.config;
        let services = self.services;
        info!(
            "Starting backup of '{}' on {} as {}",
            self.job.database, self.job.host, self.job.base_name
        );

        self.enter(Stage::Locking);
        self.lock = Some(LockGuard::acquire(&config.lock_dir, &self.job.database)?);

        self.enter(Stage::Dumping);
        let artifact = self.dump().await?;

        self.enter(Stage::Verifying);
        check_dump(&artifact, &config.integrity).await?;

        let artifact = match config.compression {
            Compression::Gzip => {
                self.enter(Stage::Compressing);
                compress(artifact, &mut self.workspace).await?
            }
            Compression::None => artifact,
        };

        let artifact = match &config.encryption {
            Encryption::Age {
                program,
                recipients,
            } => {
                self.enter(Stage::Encrypting);
                AgeEncryptor::new(program.clone(), recipients.clone())
                    .encrypt(artifact, &mut self.workspace)
                    .await?
            }
            Encryption::None => artifact,
        };

        let sha256 = sha256_of(artifact.path().to_path_buf()).await?;
        let location = RemoteLocation::new(
            &config.storage.bucket,
            config.storage.path_prefix.as_deref(),
            &artifact.file_name(),
        );

        self.enter(Stage::Uploading);
        let store = services.store.as_ref();
        let upload_attempts = upload_with_retry(store, &artifact, &location, &config.upload).await?;

        self.enter(Stage::ConfirmingUpload);
        confirm(store, &artifact, &location).await?;

        Ok(BackupSummary {
            artifact_name: artifact.file_name(),
            size: artifact.size(),
            sha256,
            location,
            upload_attempts,
        })
    }

    async fn dump(&mut self) -> Result<Artifact> {
        let services = self.services;
        let database = services.database.as_ref();

        database.test_connection().await.map_err(|e| match e {
            BackupError::Connectivity(_) => e,
            other => BackupError::Connectivity(other.to_string()),
        })?;

        let estimate = database.estimate_size_mb().await.unwrap_or_else(|e| {
            warn!("Size estimation failed: {}", e);
            None
        });
        let mut progress = DumpProgress::new(estimate);
        match estimate {
            Some(mb) if progress.is_enabled() => info!("Estimated database size: {:.2} MB", mb),
            _ => info!("No usable size estimate, progress display disabled"),
        }

        self.workspace.prepare()?;
        let path = self
            .workspace
            .track(&format!("{}{}", self.job.base_name, SQL_SUFFIX));

        let timeout = self.config.dump.timeout;
        info!(
            "Dumping {} ({}) to {}",
            self.job.database,
            database.engine_name(),
            path.display()
        );
        let size = tokio::time::timeout(timeout, database.dump_to(&path, &mut progress))
            .await
            .map_err(|_| BackupError::DumpTimeout(timeout))??;

        info!("Dump finished: {:.2} MB", size as f64 / 1024.0 / 1024.0);
        Ok(Artifact::new(path, ArtifactKind::RawDump, size))
    }

    async fn finalize(mut self, outcome: Result<BackupSummary>) -> JobReport {
        let last_stage = self.stage;
        match &outcome {
            Ok(_) => self.enter(Stage::Succeeded),
            Err(e) => {
                error!(
                    stage = e.stage(),
                    kind = e.kind(),
                    "Backup failed while {}: {}",
                    last_stage,
                    e
                );
                self.enter(Stage::Failed);
            }
        }

        let removed = self.workspace.cleanup();
        debug!("Removed {} local file(s)", removed);
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                warn!("{}", e);
            }
        }

        let duration = self.started.elapsed();
        self.notify(&outcome, duration).await;

        match &outcome {
            Ok(summary) => info!(
                "Backup completed in {:.1}s: {} ({:.2} MB, sha256 {}) -> {}",
                duration.as_secs_f64(),
                summary.artifact_name,
                summary.size as f64 / 1024.0 / 1024.0,
                summary.sha256,
                summary.location
            ),
            Err(_) => info!("Backup aborted after {:.1}s", duration.as_secs_f64()),
        }
        self.enter(Stage::Finalized);

        JobReport {
            database: self.job.database.clone(),
            outcome,
            duration,
            final_stage: self.stage,
        }
    }

    async fn notify(&self, outcome: &Result<BackupSummary>, duration: Duration) {
        let Some(notifier) = &self.services.notifier else {
            return;
        };
        let duration_secs = duration.as_secs();

        let event = match outcome {
            Ok(summary) => {
                let on_success = self
                    .config
                    .notifications
                    .as_ref()
                    .map_or(false, |n| n.notify_on_success);
                if !on_success {
                    debug!("Success notifications are disabled");
                    return;
                }
                let mut event = NotificationEvent::new(
                    Status::Success,
                    &self.job.database,
                    format!(
                        "Backup of {} completed: {}",
                        self.job.database, summary.artifact_name
                    ),
                    duration_secs,
                );
                event.artifact = Some(summary.artifact_name.clone());
                event.size_bytes = Some(summary.size);
                event.sha256 = Some(summary.sha256.clone());
                event.location = Some(summary.location.to_string());
                event
            }
            Err(e) => {
                let mut event = NotificationEvent::new(
                    Status::Failure,
                    &self.job.database,
                    format!("Backup of {} failed: {}", self.job.database, e),
                    duration_secs,
                );
                event.error_kind = Some(e.kind().to_string());
                event.stage = Some(e.stage().to_string());
                event.log_file = self.log_file.as_ref().map(|p| p.display().to_string());
                event
            }
        };

        match notifier.send(&event).await {
            Ok(()) => info!("Sent {:?} notification via {}", event.status, notifier.name()),
            Err(e) => warn!("Failed to send {} notification: {}", notifier.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::lock::lock_path;
    use crate::config::{base_params, from_params, Params};
    use crate::upload::tests::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const GOOD_DUMP: &str = "-- MySQL dump\nCREATE TABLE `orders` (`id` int NOT NULL);\n";

    struct FakeDatabase {
        contents: Vec<u8>,
        reachable: bool,
        stall: Option<Duration>,
    }

    impl FakeDatabase {
        fn dumping(contents: &[u8]) -> Self {
            Self {
                contents: contents.to_vec(),
                reachable: true,
                stall: None,
            }
        }
    }

    #[async_trait]
    impl DatabaseDriver for FakeDatabase {
        async fn test_connection(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(BackupError::Connectivity("connection refused".to_string()))
            }
        }

        async fn estimate_size_mb(&self) -> Result<Option<f64>> {
            Ok(None)
        }

        async fn dump_to(&self, dest: &Path, _progress: &mut DumpProgress) -> Result<u64> {
            std::fs::write(dest, &self.contents)?;
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            Ok(self.contents.len() as u64)
        }

        fn engine_name(&self) -> &'static str {
            "fake"
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        events: Arc<Mutex<Vec<NotificationEvent>>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<NotificationEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, event: &NotificationEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct Harness {
        _root: TempDir,
        config: BackupConfig,
        store: MemoryStore,
        notifier: RecordingNotifier,
    }

    impl Harness {
        fn new(extra: &[(&str, &str)]) -> Self {
            let root = tempdir().unwrap();
            let mut params: Params = base_params();
            let dirs = [
                ("BACKUP_WORK_DIR", root.path().join("work")),
                ("LOCK_DIR", root.path().join("locks")),
                ("LOG_DIR", root.path().join("logs")),
            ];
            for (key, dir) in dirs {
                params.insert(key.to_string(), dir.display().to_string());
            }
            params.insert("UPLOAD_RETRY_DELAY_SECS".to_string(), "0".to_string());
            params.insert("MIN_DUMP_SIZE_BYTES".to_string(), "16".to_string());
            params.insert("NOTIFY_ENABLED".to_string(), "true".to_string());
            params.insert(
                "NOTIFY_WEBHOOK_URL".to_string(),
                "https://hooks.example.com/T0/B0".to_string(),
            );
            for (k, v) in extra {
                params.insert(k.to_string(), v.to_string());
            }
            std::fs::create_dir_all(root.path().join("locks")).unwrap();

            Self {
                config: from_params(&params).unwrap(),
                _root: root,
                store: MemoryStore::default(),
                notifier: RecordingNotifier::default(),
            }
        }

        fn job(&self) -> BackupJob {
            BackupJob::new(&self.config, Utc.with_ymd_and_hms(2024, 3, 1, 2, 30, 0).unwrap())
        }

        async fn run_with(&self, database: FakeDatabase, shutdown: Arc<Notify>) -> JobReport {
            let services = Services {
                database: Box::new(database),
                store: Box::new(self.store.clone()),
                notifier: Some(Box::new(self.notifier.clone())),
            };
            run(&self.config, &services, self.job(), shutdown, None).await
        }

        async fn run(&self, database: FakeDatabase) -> JobReport {
            self.run_with(database, Arc::new(Notify::new())).await
        }

        fn leftover_files(&self) -> usize {
            match std::fs::read_dir(&self.config.work_dir) {
                Ok(entries) => entries.count(),
                Err(_) => 0,
            }
        }

        fn lock_held(&self) -> bool {
            lock_path(&self.config.lock_dir, &self.config.database.name).exists()
        }
    }

    #[tokio::test]
    async fn test_plain_backup_uploads_sql_file() {
        let harness = Harness::new(&[]);
        let report = harness.run(FakeDatabase::dumping(GOOD_DUMP.as_bytes())).await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.final_stage, Stage::Finalized);
        let summary = report.outcome.unwrap();
        assert_eq!(summary.artifact_name, "backup_shop_20240301_023000.sql");
        assert_eq!(summary.location.to_string(), "backups/backup_shop_20240301_023000.sql");
        assert_eq!(summary.size, GOOD_DUMP.len() as u64);
        assert_eq!(summary.upload_attempts, 1);

        assert_eq!(harness.store.put_count(), 1);
        assert_eq!(harness.leftover_files(), 0);
        assert!(!harness.lock_held());
        // NOTIFY_ON_SUCCESS defaults to off
        assert!(harness.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_compressed_backup_reports_success() {
        let harness = Harness::new(&[
            ("COMPRESSION", "gzip"),
            ("NOTIFY_ON_SUCCESS", "true"),
            ("S3_PATH_PREFIX", "nightly/"),
        ]);
        let dump = GOOD_DUMP.repeat(100);
        let report = harness.run(FakeDatabase::dumping(dump.as_bytes())).await;

        let summary = report.outcome.unwrap();
        assert_eq!(summary.artifact_name, "backup_shop_20240301_023000.sql.gz");
        assert_eq!(summary.location.key, "nightly/backup_shop_20240301_023000.sql.gz");
        assert!(summary.size < dump.len() as u64);
        assert_eq!(summary.sha256.len(), 64);
        assert_eq!(harness.leftover_files(), 0);

        let events = harness.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Status::Success);
        assert_eq!(events[0].sha256.as_deref(), Some(summary.sha256.as_str()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encrypted_backup_has_age_suffix() {
        use std::os::unix::fs::PermissionsExt;

        let tools = tempdir().unwrap();
        let script = tools.path().join("fake-age");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             while [ $# -gt 1 ]; do\n\
               case \"$1\" in\n\
                 -o) out=\"$2\"; shift 2 ;;\n\
                 *) shift ;;\n\
               esac\n\
             done\n\
             { printf 'age-encryption.org/v1\\n'; cat \"$1\"; } > \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let program = script.display().to_string();
        let harness = Harness::new(&[
            ("COMPRESSION", "gzip"),
            ("ENCRYPTION", "age"),
            ("AGE_RECIPIENT", "age1example"),
            ("AGE_BIN", program.as_str()),
        ]);
        let report = harness.run(FakeDatabase::dumping(GOOD_DUMP.as_bytes())).await;

        let summary = report.outcome.unwrap();
        assert_eq!(summary.artifact_name, "backup_shop_20240301_023000.sql.gz.age");
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn test_failed_integrity_check_never_uploads() {
        let harness = Harness::new(&[("COMPRESSION", "gzip")]);
        let report = harness.run(FakeDatabase::dumping(b"-- empty dump\n")).await;

        assert_eq!(report.exit_code(), 7);
        assert!(matches!(report.outcome, Err(BackupError::Integrity(_))));
        assert_eq!(harness.store.put_count(), 0);
        assert_eq!(harness.leftover_files(), 0);
        assert!(!harness.lock_held());

        let events = harness.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Status::Failure);
        assert_eq!(events[0].stage.as_deref(), Some("verify"));
        assert_eq!(events[0].error_kind.as_deref(), Some("IntegrityError"));
    }

    #[tokio::test]
    async fn test_unreachable_database_fails_before_dump() {
        let harness = Harness::new(&[]);
        let database = FakeDatabase {
            reachable: false,
            ..FakeDatabase::dumping(GOOD_DUMP.as_bytes())
        };
        let report = harness.run(database).await;

        assert_eq!(report.exit_code(), 4);
        assert_eq!(harness.leftover_files(), 0);
        assert!(!harness.lock_held());
        assert_eq!(harness.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_recovers_after_transient_failures() {
        let mut harness = Harness::new(&[]);
        harness.store = MemoryStore::failing(2);
        let report = harness.run(FakeDatabase::dumping(GOOD_DUMP.as_bytes())).await;

        assert_eq!(report.outcome.unwrap().upload_attempts, 3);
        assert_eq!(harness.store.put_count(), 3);
        assert!(harness.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_upload_sends_one_failure() {
        let mut harness = Harness::new(&[]);
        harness.store = MemoryStore::failing(10);
        let report = harness.run(FakeDatabase::dumping(GOOD_DUMP.as_bytes())).await;

        assert_eq!(report.exit_code(), 9);
        assert_eq!(harness.store.put_count(), 3);
        assert_eq!(harness.leftover_files(), 0);

        let events = harness.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Status::Failure);
        assert!(events[0].message.contains("3 attempt"));
    }

    #[tokio::test]
    async fn test_unconfirmed_upload_is_a_failure() {
        let mut harness = Harness::new(&[]);
        harness.store = MemoryStore {
            drop_objects: true,
            ..MemoryStore::default()
        };
        let report = harness.run(FakeDatabase::dumping(GOOD_DUMP.as_bytes())).await;

        assert_eq!(report.exit_code(), 10);
        assert_eq!(harness.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_running_job_blocks_second_run() {
        let harness = Harness::new(&[]);
        let path = lock_path(&harness.config.lock_dir, "shop");
        let marker = format!("{}\n{}\n", std::process::id(), Utc::now().to_rfc3339());
        std::fs::write(&path, &marker).unwrap();

        let report = harness.run(FakeDatabase::dumping(GOOD_DUMP.as_bytes())).await;

        assert_eq!(report.exit_code(), 3);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), marker);
        assert_eq!(harness.store.put_count(), 0);
        assert_eq!(harness.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_dump_timeout_cleans_partial_file() {
        let mut harness = Harness::new(&[]);
        harness.config.dump.timeout = Duration::from_millis(50);
        let database = FakeDatabase {
            stall: Some(Duration::from_secs(30)),
            ..FakeDatabase::dumping(GOOD_DUMP.as_bytes())
        };
        let report = harness.run(database).await;

        assert_eq!(report.exit_code(), 6);
        assert_eq!(harness.leftover_files(), 0);
        assert!(!harness.lock_held());
    }

    #[tokio::test]
    async fn test_shutdown_signal_finalizes_job() {
        let harness = Harness::new(&[]);
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        let database = FakeDatabase {
            stall: Some(Duration::from_secs(30)),
            ..FakeDatabase::dumping(GOOD_DUMP.as_bytes())
        };
        let report = harness.run_with(database, shutdown).await;

        assert_eq!(report.exit_code(), 130);
        assert_eq!(report.final_stage, Stage::Finalized);
        assert_eq!(harness.leftover_files(), 0);
        assert!(!harness.lock_held());
        assert_eq!(harness.notifier.events().len(), 1);
    }

    fn noisy_dump(len: usize) -> Vec<u8> {
        let mut contents = GOOD_DUMP.as_bytes().to_vec();
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        contents.extend((0..len).map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        }));
        contents
    }

    #[test]
    fn test_shutdown_during_compression_leaves_no_files() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(1)
            .build()
            .unwrap();

        runtime.block_on(async {
            let harness = Harness::new(&[("COMPRESSION", "gzip")]);
            let shutdown = Arc::new(Notify::new());

            let gzip_path = harness
                .config
                .work_dir
                .join("backup_shop_20240301_023000.sql.gz");
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                while !gzip_path.exists() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                trigger.notify_one();
            });

            let database = FakeDatabase::dumping(&noisy_dump(24 * 1024 * 1024));
            let report = harness.run_with(database, shutdown).await;
            // Queued behind the abandoned gzip task on the only blocking thread.
            tokio::task::spawn_blocking(|| ()).await.unwrap();

            assert!(matches!(report.outcome, Err(BackupError::Interrupted)));
            assert_eq!(harness.leftover_files(), 0);
            assert!(!harness.lock_held());
            assert_eq!(harness.store.put_count(), 0);
        });
    }
}
