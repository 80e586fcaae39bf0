use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::storage::job_pool::DEFAULT_POOL_SIZE;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    /// Durable root; uploads end up in `<uploads_dir>/<user_id>/<dirname>`.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
    /// Where the HTTP layer saves incoming multipart files.
    #[serde(default = "default_uploads_temp_dir")]
    pub uploads_temp_dir: String,
    /// Public URL prefix under which `uploads_dir` is served.
    #[serde(default = "default_public_uploads_url")]
    pub public_uploads_url: String,
    #[serde(default = "default_job_pool_size")]
    pub job_pool_size: usize,
    #[serde(default = "default_relocation_queue_capacity")]
    pub relocation_queue_capacity: usize,
    #[serde(default = "default_relocation_grace_ms")]
    pub relocation_grace_ms: u64,
    /// How long running workers get to wind down on shutdown.
    #[serde(default = "default_worker_shutdown_grace_ms")]
    pub worker_shutdown_grace_ms: u64,
}

fn default_uploads_dir() -> String {
    "./uploads".to_string()
}

fn default_uploads_temp_dir() -> String {
    "/var/uploads".to_string()
}

fn default_public_uploads_url() -> String {
    "/uploads".to_string()
}

fn default_job_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_relocation_queue_capacity() -> usize {
    64
}

fn default_relocation_grace_ms() -> u64 {
    1_000
}

fn default_worker_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "jobs".to_string(),
            surrealdb_database: "jobs".to_string(),
            uploads_dir: default_uploads_dir(),
            uploads_temp_dir: default_uploads_temp_dir(),
            public_uploads_url: default_public_uploads_url(),
            job_pool_size: default_job_pool_size(),
            relocation_queue_capacity: default_relocation_queue_capacity(),
            relocation_grace_ms: default_relocation_grace_ms(),
            worker_shutdown_grace_ms: default_worker_shutdown_grace_ms(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_defaults_fill_optional_values() {
        let source = r#"
            surrealdb_address = "ws://localhost:8000"
            surrealdb_username = "root"
            surrealdb_password = "root"
            surrealdb_namespace = "ns"
            surrealdb_database = "db"
        "#;

        let config: AppConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .expect("build config")
            .try_deserialize()
            .expect("deserialize config");

        assert_eq!(config.surrealdb_address, "ws://localhost:8000");
        assert_eq!(config.uploads_temp_dir, "/var/uploads");
        assert_eq!(config.uploads_dir, "./uploads");
        assert_eq!(config.public_uploads_url, "/uploads");
        assert_eq!(config.job_pool_size, 16);
        assert_eq!(config.relocation_queue_capacity, 64);
        assert_eq!(config.relocation_grace_ms, 1_000);
        assert_eq!(config.worker_shutdown_grace_ms, 5_000);
    }

    #[test]
    fn test_missing_database_settings_fail() {
        let result = Config::builder()
            .add_source(File::from_str("uploads_dir = \"/srv\"", FileFormat::Toml))
            .build()
            .expect("build config")
            .try_deserialize::<AppConfig>();

        assert!(result.is_err());
    }
}
