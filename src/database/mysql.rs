use super::driver::{DatabaseDriver, DumpProgress};
use crate::config::{DatabaseConfig, DumpConfig};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot options used unless `MYSQLDUMP_OPTIONS` overrides them: one
/// REPEATABLE READ transaction, rows streamed, no table locks.
const DEFAULT_DUMP_OPTIONS: [&str; 5] = [
    "--single-transaction",
    "--quick",
    "--lock-tables=false",
    "--routines",
    "--triggers",
];

pub struct MysqlDriver {
    pool: Pool,
    config: DatabaseConfig,
    dump: DumpConfig,
}

impl MysqlDriver {
    pub fn new(config: &DatabaseConfig, dump: &DumpConfig) -> Self {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port)
            .user(Some(&config.username))
            .pass(Some(&config.password))
            .db_name(Some(&config.name))
            .into();

        let pool = Pool::new(opts);

        Self {
            pool,
            config: config.clone(),
            dump: dump.clone(),
        }
    }

    async fn get_conn(&self) -> Result<Conn> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.pool.get_conn()).await {
            Ok(conn) => conn.map_err(BackupError::from),
            Err(_) => Err(BackupError::Connectivity(format!(
                "no connection to {}:{} within {} seconds",
                self.config.host,
                self.config.port,
                CONNECT_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Arguments passed to mysqldump. The password is not among them; it is
/// handed over in `MYSQL_PWD` instead.
pub fn dump_args(config: &DatabaseConfig, dump: &DumpConfig) -> Vec<String> {
    let mut args = vec![
        format!("--host={}", config.host),
        format!("--port={}", config.port),
        format!("--user={}", config.username),
    ];
    match &dump.options {
        Some(raw) => args.extend(raw.split_whitespace().map(str::to_string)),
        None => args.extend(DEFAULT_DUMP_OPTIONS.iter().map(|o| o.to_string())),
    }
    args.push(config.name.clone());
    args
}

#[async_trait]
impl DatabaseDriver for MysqlDriver {
    async fn test_connection(&self) -> Result<()> {
        info!("Testing MySQL connection to {}:{}", self.config.host, self.config.port);
        let mut conn = self.get_conn().await?;
        let _: Option<(i32,)> = conn.query_first("SELECT 1").await?;
        info!("MySQL connection successful");
        Ok(())
    }

    async fn estimate_size_mb(&self) -> Result<Option<f64>> {
        let mut conn = self.get_conn().await?;
        let size: Option<Option<f64>> = conn
            .exec_first(
                "SELECT ROUND(SUM(data_length + index_length) / 1024 / 1024, 2) \
                 FROM information_schema.TABLES WHERE table_schema = ?",
                (self.config.name.clone(),),
            )
            .await?;
        Ok(size.flatten())
    }

    async fn dump_to(&self, dest: &Path, progress: &mut DumpProgress) -> Result<u64> {
        let program = which(&self.dump.program).map_err(|_| {
            BackupError::Dump(format!(
                "{} executable not found in PATH. Please ensure MySQL client tools are installed.",
                self.dump.program
            ))
        })?;
        debug!("Found mysqldump executable at: {}", program.display());

        let mut child = Command::new(&program)
            .args(dump_args(&self.config, &self.dump))
            .env("MYSQL_PWD", &self.config.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::Dump(format!("failed to start {}: {}", program.display(), e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::Dump("mysqldump stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        // Created synchronously: a cancelled dump must not create the file
        // after the job has already cleaned up.
        let file = tokio::fs::File::from_std(std::fs::File::create(dest)?);
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; 64 * 1024];
        let mut written: u64 = 0;

        loop {
            let bytes_read = stdout.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            writer.write_all(&buffer[..bytes_read]).await?;
            written += bytes_read as u64;
            progress.advance(written);
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::Dump(format!(
                "mysqldump for {} failed with {}: {}",
                self.config.name,
                status,
                stderr.trim()
            )));
        }
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!("mysqldump: {}", line);
        }

        info!("Completed dump of database {}: {} bytes", self.config.name, written);
        Ok(written)
    }

    fn engine_name(&self) -> &'static str {
        "MySQL"
    }
}
