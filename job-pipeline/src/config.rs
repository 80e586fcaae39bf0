use std::{path::PathBuf, time::Duration};

use common::utils::config::AppConfig;

/// Runtime knobs for the job service, derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct JobPipelineConfig {
    pub uploads_dir: PathBuf,
    pub uploads_temp_dir: PathBuf,
    pub public_uploads_url: String,
    pub pool_size: usize,
    pub relocation_queue_capacity: usize,
    pub relocation_grace: Duration,
    /// How long running workers get to wind down on shutdown.
    pub worker_shutdown_grace: Duration,
}

impl From<&AppConfig> for JobPipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            uploads_dir: PathBuf::from(&config.uploads_dir),
            uploads_temp_dir: PathBuf::from(&config.uploads_temp_dir),
            public_uploads_url: config.public_uploads_url.clone(),
            pool_size: config.job_pool_size,
            relocation_queue_capacity: config.relocation_queue_capacity.max(1),
            relocation_grace: Duration::from_millis(config.relocation_grace_ms),
            worker_shutdown_grace: Duration::from_millis(config.worker_shutdown_grace_ms),
        }
    }
}

impl Default for JobPipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_graces_are_independent() {
        let app = AppConfig {
            relocation_grace_ms: 250,
            worker_shutdown_grace_ms: 4_000,
            relocation_queue_capacity: 0,
            ..Default::default()
        };

        let config = JobPipelineConfig::from(&app);
        assert_eq!(config.relocation_grace, Duration::from_millis(250));
        assert_eq!(config.worker_shutdown_grace, Duration::from_millis(4_000));
        assert_eq!(config.relocation_queue_capacity, 1);
    }
}
