use std::{path::Path, sync::Arc};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        job_pool::{JobPool, PooledJob},
        types::job::{
            compute_next_state, Job, JobImage, JobTransition, JobType, JobView,
            MAX_APPEND_ATTEMPTS,
        },
    },
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::JobPipelineConfig,
    paths::{file_name_of, UploadPaths},
    registry::ActiveJobs,
    relocation::{RelocationQueue, RelocationRequest},
    transform::{ImageTransformer, RasterTransformer},
    worker::{self, WorkerContext},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigureJobRequest {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::MissingValues(field.to_string()))
}

/// Entry point for every job operation. Each call is scoped to an
/// authenticated user; jobs owned by someone else look exactly like missing
/// ones.
pub struct JobService {
    db: Arc<SurrealDbClient>,
    pool: Arc<JobPool>,
    registry: Arc<ActiveJobs>,
    relocation: RelocationQueue,
    worker: Arc<WorkerContext>,
    paths: Arc<UploadPaths>,
    config: JobPipelineConfig,
}

impl JobService {
    pub fn new(db: Arc<SurrealDbClient>, config: JobPipelineConfig) -> Self {
        Self::with_transformer(db, config, Arc::new(RasterTransformer))
    }

    /// Must be called from within a tokio runtime.
    pub fn with_transformer(
        db: Arc<SurrealDbClient>,
        config: JobPipelineConfig,
        transformer: Arc<dyn ImageTransformer>,
    ) -> Self {
        let paths = Arc::new(UploadPaths::new(
            config.uploads_dir.clone(),
            &config.public_uploads_url,
        ));
        let registry = Arc::new(ActiveJobs::new());
        let relocation = RelocationQueue::start(
            config.uploads_temp_dir.clone(),
            config.uploads_dir.clone(),
            config.relocation_queue_capacity,
            config.relocation_grace,
        );
        let worker = Arc::new(WorkerContext {
            db: Arc::clone(&db),
            transformer,
            paths: Arc::clone(&paths),
            registry: Arc::clone(&registry),
        });

        Self {
            db,
            pool: JobPool::new(config.pool_size),
            registry,
            relocation,
            worker,
            paths,
            config,
        }
    }

    async fn load(&self, user_id: &str, job_id: &str) -> Result<PooledJob, AppError> {
        let mut job = self.pool.acquire();
        job.fill(Job::find_by_id_and_owner(&self.db, job_id, user_id).await?);
        Ok(job)
    }

    async fn promote(&self, job: &mut PooledJob) -> Result<(), AppError> {
        if let Some(promoted) = Job::promote_if_ready(&self.db, &job.id).await? {
            job.fill(promoted);
        }
        Ok(())
    }

    /// Appends `originals` with a compare-and-set on `images_count`, reloading
    /// the record and retrying when another upload got there first.
    async fn append_with_retry(
        &self,
        job: &mut PooledJob,
        user_id: &str,
        originals: &[String],
        max_attempts: u32,
    ) -> Result<(), AppError> {
        for attempt in 1..=max_attempts {
            if !job.status.accepts_changes() {
                return Err(AppError::Validation(format!(
                    "Images cannot be added while {}",
                    job.status.as_str()
                )));
            }

            let expected_count = job.images_count;
            let images: Vec<JobImage> = (expected_count..)
                .zip(originals)
                .map(|(id, original)| JobImage::new(id, original.clone()))
                .collect();

            match Job::append_images(&self.db, &job.id, user_id, images, expected_count).await? {
                Some(updated) => {
                    job.fill(updated);
                    return Ok(());
                }
                None => {
                    warn!(attempt, "concurrent image upload detected; reloading job");
                    let job_id = job.id.clone();
                    job.fill(Job::find_by_id_and_owner(&self.db, &job_id, user_id).await?);
                }
            }
        }

        Err(AppError::InternalError(
            "Images could not be appended after repeated conflicts".into(),
        ))
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn create(
        &self,
        user_id: &str,
        request: CreateJobRequest,
    ) -> Result<JobView, AppError> {
        let name = required(request.name, "name")?;
        let job = Job::create_and_add_to_db(
            user_id.to_string(),
            name,
            request.description.unwrap_or_default(),
            &self.db,
        )
        .await?;

        info!(job_id = %job.id, "job created");
        Ok(JobView::from(&job))
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn update_details(
        &self,
        user_id: &str,
        job_id: &str,
        request: UpdateJobRequest,
    ) -> Result<JobView, AppError> {
        let name = required(request.name, "name")?;
        let mut job = self.load(user_id, job_id).await?;

        let updated = Job::update_details(
            &self.db,
            job_id,
            user_id,
            name,
            request.description.unwrap_or_default(),
        )
        .await?;
        job.fill(updated);

        Ok(JobView::from(&*job))
    }

    /// Sets the transform type, promoting the job to Ready when images are
    /// already attached.
    #[tracing::instrument(skip(self, request))]
    pub async fn configure(
        &self,
        user_id: &str,
        job_id: &str,
        request: ConfigureJobRequest,
    ) -> Result<JobView, AppError> {
        let job_type = JobType::from_request(&required(request.job_type, "type")?)?;
        let mut job = self.load(user_id, job_id).await?;

        if !job.status.accepts_changes() {
            return Err(AppError::Validation(format!(
                "Job cannot be configured while {}",
                job.status.as_str()
            )));
        }

        let updated = Job::update_type(&self.db, job_id, user_id, job_type).await?;
        job.fill(updated);
        self.promote(&mut job).await?;

        info!(job_type = job_type.as_str(), status = job.status.as_str(), "job configured");
        Ok(JobView::from(&*job))
    }

    /// Registers freshly uploaded files with the job and queues their move
    /// from temporary to durable storage.
    #[tracing::instrument(skip(self, file_paths), fields(files = file_paths.len()))]
    pub async fn attach_images<P: AsRef<Path>>(
        &self,
        user_id: &str,
        job_id: &str,
        file_paths: &[P],
        temp_dirname: &str,
    ) -> Result<JobView, AppError> {
        if file_paths.is_empty() {
            return Err(AppError::MissingValues("images".into()));
        }
        let relocation = RelocationRequest::new(user_id, temp_dirname)?;
        let originals = file_paths
            .iter()
            .map(|path| {
                let file_name = file_name_of(path.as_ref())?;
                self.paths.public_path(user_id, temp_dirname, &file_name)
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        let mut job = self.load(user_id, job_id).await?;
        // Claim the queue slot before touching the record so a full queue
        // leaves the job unchanged
        let permit = self.relocation.reserve()?;

        self.append_with_retry(&mut job, user_id, &originals, MAX_APPEND_ATTEMPTS)
            .await?;
        permit.send(relocation);
        self.promote(&mut job).await?;

        info!(
            images_count = job.images_count,
            status = job.status.as_str(),
            "images attached"
        );
        Ok(JobView::from(&*job))
    }

    /// Starts processing a Ready job on a background worker and returns
    /// without waiting for it.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, user_id: &str, job_id: &str) -> Result<JobView, AppError> {
        let mut job = self.load(user_id, job_id).await?;

        if self.registry.is_running(job_id) {
            return Err(AppError::Validation("Job is already running".into()));
        }
        compute_next_state(&job.status, JobTransition::Start)?;

        let token = CancellationToken::new();
        if !self.registry.start(job_id, token.clone()) {
            return Err(AppError::Validation("Job is already running".into()));
        }

        match Job::update_started(&self.db, job_id).await {
            Ok(Some(started)) => job.fill(started),
            Ok(None) => {
                self.registry.finish(job_id);
                return Err(AppError::Validation("Job is no longer ready".into()));
            }
            Err(err) => {
                self.registry.finish(job_id);
                return Err(err);
            }
        }

        let view = JobView::from(&*job);
        let handle = tokio::spawn(worker::run_job(Arc::clone(&self.worker), job, token));
        self.registry.attach(job_id, handle);

        info!(images = view.images_count, "job started");
        Ok(view)
    }

    /// Marks the job Stopped. A worker that is already running is not
    /// interrupted; it finishes its images and leaves the Stopped status in
    /// place.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, user_id: &str, job_id: &str) -> Result<JobView, AppError> {
        let mut job = self.load(user_id, job_id).await?;

        let stopped = Job::update_stopped(&self.db, job_id, user_id).await?;
        job.fill(stopped);

        info!(worker_running = self.registry.is_running(job_id), "job stopped");
        Ok(JobView::from(&*job))
    }

    pub async fn get(&self, user_id: &str, job_id: &str) -> Result<JobView, AppError> {
        let job = self.load(user_id, job_id).await?;
        Ok(JobView::from(&*job))
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<JobView>, AppError> {
        let jobs = Job::list_by_owner(&self.db, user_id).await?;
        Ok(jobs.iter().map(JobView::from).collect())
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.registry.is_running(job_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.registry.len()
    }

    pub fn pooled_records(&self) -> usize {
        self.pool.available()
    }

    /// Cancels running workers and drains the relocation queue.
    pub async fn shutdown(&self) {
        info!(active_jobs = self.registry.len(), "shutting down job service");
        self.registry
            .shutdown(self.config.worker_shutdown_grace)
            .await;
        self.relocation.shutdown().await;
    }
}
