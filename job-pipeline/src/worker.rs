use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        job_pool::PooledJob,
        types::job::{Job, JobImage, JobType},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    paths::{result_path, UploadPaths},
    registry::ActiveJobs,
    transform::ImageTransformer,
};

/// Everything a worker needs, shared by all workers of one service.
pub(crate) struct WorkerContext {
    pub db: Arc<SurrealDbClient>,
    pub transformer: Arc<dyn ImageTransformer>,
    pub paths: Arc<UploadPaths>,
    pub registry: Arc<ActiveJobs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerOutcome {
    Done,
    Incompleted { failed: usize },
    /// The job was stopped while images were being processed.
    StoppedMeanwhile,
    Cancelled,
}

/// Removes the job from the active set however the worker exits.
struct Deregister {
    registry: Arc<ActiveJobs>,
    job_id: String,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.finish(&self.job_id);
    }
}

#[tracing::instrument(
    skip_all,
    fields(job_id = %job.id, user_id = %job.user_id, job_type = job.job_type.as_str())
)]
pub(crate) async fn run_job(ctx: Arc<WorkerContext>, job: PooledJob, token: CancellationToken) {
    let _deregister = Deregister {
        registry: Arc::clone(&ctx.registry),
        job_id: job.id.clone(),
    };
    // Declared after the guard so the record is back in the pool before the
    // job leaves the active set
    let job = job;

    match process(&ctx, &job, &token).await {
        Ok(WorkerOutcome::Done) => info!(images = job.images.len(), "job done"),
        Ok(WorkerOutcome::Incompleted { failed }) => {
            warn!(images = job.images.len(), failed, "job finished with failed images");
        }
        Ok(WorkerOutcome::StoppedMeanwhile) => {
            info!("job was stopped while running; keeping stopped status");
        }
        Ok(WorkerOutcome::Cancelled) => warn!("worker cancelled by shutdown"),
        Err(err) => warn!(error = %err, "failed to record job completion"),
    }
}

async fn process(
    ctx: &WorkerContext,
    job: &Job,
    token: &CancellationToken,
) -> Result<WorkerOutcome, AppError> {
    let mut failed: usize = 0;

    for image in &job.images {
        if token.is_cancelled() {
            return Ok(WorkerOutcome::Cancelled);
        }

        let persisted = match process_image(ctx, job.job_type, image).await {
            Ok(result) => Job::update_image_result(&ctx.db, &job.id, image.id, result)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };

        if let Err(err) = persisted {
            failed = failed.saturating_add(1);
            warn!(image_id = image.id, original = %image.original, error = %err, "image failed");
        }
    }

    let finished = if failed == 0 {
        Job::update_ended(&ctx.db, &job.id).await?
    } else {
        Job::update_incompleted(&ctx.db, &job.id).await?
    };

    Ok(match (finished, failed) {
        (None, _) => WorkerOutcome::StoppedMeanwhile,
        (Some(_), 0) => WorkerOutcome::Done,
        (Some(_), failed) => WorkerOutcome::Incompleted { failed },
    })
}

async fn process_image(
    ctx: &WorkerContext,
    kind: JobType,
    image: &JobImage,
) -> Result<String, AppError> {
    let source = ctx.paths.durable_path(&image.original)?;
    let result = result_path(&image.original);
    let destination = ctx.paths.durable_path(&result)?;

    ctx.transformer.transform(kind, &source, &destination).await?;

    Ok(result)
}
