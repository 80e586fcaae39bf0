use common::{
    storage::db::SurrealDbClient,
    utils::config::{get_config, AppConfig},
};
use job_pipeline::{JobPipelineConfig, JobService};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

async fn build_service(
    config: &AppConfig,
    db: Arc<SurrealDbClient>,
) -> Result<JobService, Box<dyn std::error::Error>> {
    // Ensure db is initialized
    db.ensure_initialized().await?;

    let pipeline_config = JobPipelineConfig::from(config);
    tokio::fs::create_dir_all(&pipeline_config.uploads_dir).await?;
    tokio::fs::create_dir_all(&pipeline_config.uploads_temp_dir).await?;

    Ok(JobService::new(db, pipeline_config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    let service = build_service(&config, db).await?;
    info!(
        uploads_dir = %config.uploads_dir,
        pool_size = config.job_pool_size,
        "Job service ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutdown signal received");
    service.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let data_dir = tempfile::tempdir().expect("temp dir");
        let config = AppConfig {
            uploads_dir: data_dir.path().join("uploads").to_string_lossy().into_owned(),
            uploads_temp_dir: data_dir.path().join("tmp").to_string_lossy().into_owned(),
            ..Default::default()
        };

        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("failed to start in-memory surrealdb"),
        );

        let service = build_service(&config, db)
            .await
            .expect("failed to build job service");
        assert!(data_dir.path().join("uploads").is_dir());
        assert!(data_dir.path().join("tmp").is_dir());

        let jobs = service.list("smoke-user").await.expect("list jobs");
        assert!(jobs.is_empty());
        assert_eq!(service.active_jobs(), 0);
        assert_eq!(service.pooled_records(), config.job_pool_size);

        service.shutdown().await;
    }
}
