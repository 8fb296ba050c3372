mod driver;
mod mysql;

pub use driver::{DatabaseDriver, DumpProgress};

use crate::config::BackupConfig;

pub fn create_driver(config: &BackupConfig) -> Box<dyn DatabaseDriver> {
    Box::new(mysql::MysqlDriver::new(&config.database, &config.dump))
}
