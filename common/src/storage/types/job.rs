use state_machines::state_machine;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::job_update::JobUpdate;

pub const JOB_ID_LEN: usize = 24;
pub const MAX_NAME_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 1024;
/// Upper bound on compare-and-set retries when appending images.
pub const MAX_APPEND_ATTEMPTS: u32 = 3;

const JOB_NOT_FOUND: &str = "Job not found";

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[default]
    None,
    Waiting,
    Ready,
    Running,
    Stopped,
    Incompleted,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::None => "None",
            JobStatus::Waiting => "Waiting",
            JobStatus::Ready => "Ready",
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Incompleted => "Incompleted",
            JobStatus::Done => "Done",
        }
    }

    /// Type and images may only change before the job has been started.
    pub fn accepts_changes(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Ready)
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum JobType {
    #[default]
    None,
    Grayscale,
    Shift,
    Clamp,
    RgbToHue,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::None => "None",
            JobType::Grayscale => "Grayscale",
            JobType::Shift => "Shift",
            JobType::Clamp => "Clamp",
            JobType::RgbToHue => "RgbToHue",
        }
    }

    /// Parses the wire name used by clients (`GRAYSCALE`, `SHIFT`, `CLAMP`,
    /// `RGB_TO_HUE`). `NONE` is not a selectable type.
    pub fn from_request(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GRAYSCALE" => Ok(JobType::Grayscale),
            "SHIFT" => Ok(JobType::Shift),
            "CLAMP" => Ok(JobType::Clamp),
            "RGB_TO_HUE" => Ok(JobType::RgbToHue),
            other => Err(AppError::Validation(format!("Unsupported job type: {other}"))),
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            JobType::None => "None",
            JobType::Grayscale => "GrayScale",
            JobType::Shift => "Shift",
            JobType::Clamp => "Clamp",
            JobType::RgbToHue => "RGB to HUE",
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JobImage {
    pub id: u32,
    pub original: String,
    #[serde(default)]
    pub result: String,
}

impl JobImage {
    pub fn new(id: u32, original: impl Into<String>) -> Self {
        Self {
            id,
            original: original.into(),
            result: String::new(),
        }
    }

    pub fn is_processed(&self) -> bool {
        !self.result.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Promote,
    Start,
    Complete,
    MarkIncomplete,
    Stop,
}

impl JobTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Promote => "promote",
            JobTransition::Start => "start",
            JobTransition::Complete => "complete",
            JobTransition::MarkIncomplete => "mark_incomplete",
            JobTransition::Stop => "stop",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Waiting,
        states: [Waiting, Ready, Running, Stopped, Incompleted, Done],
        events {
            promote {
                transition: { from: Waiting, to: Ready }
            }
            start {
                transition: { from: Ready, to: Running }
            }
            complete {
                transition: { from: Running, to: Done }
            }
            mark_incomplete {
                transition: { from: Running, to: Incompleted }
            }
            stop {
                transition: { from: Waiting, to: Stopped }
                transition: { from: Ready, to: Stopped }
                transition: { from: Running, to: Stopped }
            }
        }
    }

    pub(super) fn waiting() -> JobLifecycleMachine<(), Waiting> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn ready() -> JobLifecycleMachine<(), Ready> {
        waiting()
            .promote()
            .expect("promote transition from Waiting should exist")
    }

    pub(super) fn running() -> JobLifecycleMachine<(), Running> {
        ready()
            .start()
            .expect("start transition from Ready should exist")
    }
}

pub fn invalid_transition(status: &JobStatus, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

pub fn compute_next_state(status: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (status, event) {
        (JobStatus::Waiting, JobTransition::Promote) => waiting()
            .promote()
            .map(|_| JobStatus::Ready)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Ready, JobTransition::Start) => ready()
            .start()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Complete) => running()
            .complete()
            .map(|_| JobStatus::Done)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::MarkIncomplete) => running()
            .mark_incomplete()
            .map(|_| JobStatus::Incompleted)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Waiting, JobTransition::Stop) => waiting()
            .stop()
            .map(|_| JobStatus::Stopped)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Ready, JobTransition::Stop) => ready()
            .stop()
            .map(|_| JobStatus::Stopped)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Stop) => running()
            .stop()
            .map(|_| JobStatus::Stopped)
            .map_err(|_| invalid_transition(status, event)),
        // Stopping twice is a no-op
        (JobStatus::Stopped, JobTransition::Stop) => Ok(JobStatus::Stopped),
        _ => Err(invalid_transition(status, event)),
    }
}

/// Fresh 24 character lowercase hex identifier.
pub fn new_job_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(JOB_ID_LEN);
    id
}

pub fn is_valid_job_id(id: &str) -> bool {
    id.len() == JOB_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn validate_job_id(id: &str) -> Result<(), AppError> {
    if is_valid_job_id(id) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Malformed job id: {id}")))
    }
}

pub fn validate_details(name: &str, description: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::MissingValues("name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "Name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(AppError::Validation(format!(
            "Description exceeds {MAX_DESCRIPTION_LEN} bytes"
        )));
    }
    Ok(())
}

stored_object!(Job, "job", {
    user_id: String,
    name: String,
    description: String,
    status: JobStatus,
    job_type: JobType,
    images_count: u32,
    #[serde(default)]
    images: Vec<JobImage>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    started: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    stopped: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    ended: Option<chrono::DateTime<chrono::Utc>>
});

impl Job {
    pub fn new(user_id: String, name: String, description: String) -> Self {
        let now = Utc::now();

        Self {
            id: new_job_id(),
            user_id,
            name,
            description,
            status: JobStatus::Waiting,
            job_type: JobType::None,
            images_count: 0,
            images: Vec::new(),
            started: None,
            stopped: None,
            ended: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clears every field while keeping the image buffer's allocation.
    pub fn reset(&mut self) {
        let mut images = std::mem::take(&mut self.images);
        images.clear();
        *self = Job {
            images,
            ..Job::default()
        };
    }

    /// Overwrites this record with `other`, reusing the image buffer.
    pub fn load_from(&mut self, mut other: Job) {
        let mut images = std::mem::take(&mut self.images);
        images.clear();
        images.append(&mut other.images);
        *self = Job { images, ..other };
    }

    pub async fn create_and_add_to_db(
        user_id: String,
        name: String,
        description: String,
        db: &SurrealDbClient,
    ) -> Result<Job, AppError> {
        validate_details(&name, &description)?;
        let job = Self::new(user_id, name, description);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    /// Looks up a job with ownership folded into the query, so a foreign job
    /// and a missing one produce the same error.
    pub async fn find_by_id_and_owner(
        db: &SurrealDbClient,
        id: &str,
        user_id: &str,
    ) -> Result<Job, AppError> {
        validate_job_id(id)?;

        let mut result = db
            .client
            .query("SELECT * FROM type::thing($table, $id) WHERE user_id = $user_id")
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("user_id", user_id.to_string()))
            .await?;

        let job: Option<Job> = result.take(0)?;
        job.ok_or_else(|| AppError::NotFound(JOB_NOT_FOUND.into()))
    }

    pub async fn list_by_owner(db: &SurrealDbClient, user_id: &str) -> Result<Vec<Job>, AppError> {
        let jobs: Vec<Job> = db
            .client
            .query("SELECT * FROM type::table($table) WHERE user_id = $user_id ORDER BY created_at DESC")
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    pub async fn update_details(
        db: &SurrealDbClient,
        id: &str,
        user_id: &str,
        name: String,
        description: String,
    ) -> Result<Job, AppError> {
        validate_job_id(id)?;
        validate_details(&name, &description)?;

        JobUpdate::details(name, description)
            .apply(db, id, Some(user_id))
            .await?
            .ok_or_else(|| AppError::NotFound(JOB_NOT_FOUND.into()))
    }

    /// Sets the transform type. Only allowed while the job is Waiting or Ready.
    pub async fn update_type(
        db: &SurrealDbClient,
        id: &str,
        user_id: &str,
        job_type: JobType,
    ) -> Result<Job, AppError> {
        if job_type == JobType::None {
            return Err(AppError::Validation("Job type must be selected".into()));
        }

        match JobUpdate::job_type(job_type).apply(db, id, Some(user_id)).await? {
            Some(job) => Ok(job),
            None => {
                let current = Self::find_by_id_and_owner(db, id, user_id).await?;
                Err(AppError::Validation(format!(
                    "Job type cannot change while {}",
                    current.status.as_str()
                )))
            }
        }
    }

    pub async fn update_status(
        db: &SurrealDbClient,
        id: &str,
        status: JobStatus,
    ) -> Result<Job, AppError> {
        JobUpdate::status(status)
            .apply(db, id, None)
            .await?
            .ok_or_else(|| AppError::NotFound(JOB_NOT_FOUND.into()))
    }

    /// Appends `images` if the stored count still equals `expected_count`.
    ///
    /// `None` means another append won the race (or the job stopped accepting
    /// images); callers reload and retry with fresh ids.
    pub async fn append_images(
        db: &SurrealDbClient,
        id: &str,
        user_id: &str,
        images: Vec<JobImage>,
        expected_count: u32,
    ) -> Result<Option<Job>, AppError> {
        if images.is_empty() {
            return Err(AppError::MissingValues("images".into()));
        }

        JobUpdate::push_images(images, expected_count)
            .apply(db, id, Some(user_id))
            .await
    }

    pub async fn update_image_result(
        db: &SurrealDbClient,
        id: &str,
        image_id: u32,
        result: String,
    ) -> Result<Job, AppError> {
        JobUpdate::image_result(image_id, result)
            .apply(db, id, None)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Image {image_id} of job {id}")))
    }

    /// Ready -> Running. `None` when the job is no longer Ready.
    pub async fn update_started(db: &SurrealDbClient, id: &str) -> Result<Option<Job>, AppError> {
        debug_assert!(compute_next_state(&JobStatus::Ready, JobTransition::Start).is_ok());
        JobUpdate::Started.apply(db, id, None).await
    }

    pub async fn update_stopped(
        db: &SurrealDbClient,
        id: &str,
        user_id: &str,
    ) -> Result<Job, AppError> {
        let current = Self::find_by_id_and_owner(db, id, user_id).await?;
        compute_next_state(&current.status, JobTransition::Stop)?;

        match JobUpdate::Stopped.apply(db, id, Some(user_id)).await? {
            Some(job) => Ok(job),
            // Finished between the read and the write
            None => {
                let latest = Self::find_by_id_and_owner(db, id, user_id).await?;
                Err(invalid_transition(&latest.status, JobTransition::Stop))
            }
        }
    }

    /// Running -> Done. `None` when the job left Running meanwhile (stopped).
    pub async fn update_ended(db: &SurrealDbClient, id: &str) -> Result<Option<Job>, AppError> {
        debug_assert!(compute_next_state(&JobStatus::Running, JobTransition::Complete).is_ok());
        JobUpdate::Ended.apply(db, id, None).await
    }

    /// Running -> Incompleted. `None` when the job left Running meanwhile.
    pub async fn update_incompleted(
        db: &SurrealDbClient,
        id: &str,
    ) -> Result<Option<Job>, AppError> {
        debug_assert!(
            compute_next_state(&JobStatus::Running, JobTransition::MarkIncomplete).is_ok()
        );
        JobUpdate::Incompleted.apply(db, id, None).await
    }

    /// Waiting -> Ready, only once a type is chosen and at least one image is
    /// attached. Evaluated and written in one statement.
    pub async fn promote_if_ready(db: &SurrealDbClient, id: &str) -> Result<Option<Job>, AppError> {
        let promoted = JobUpdate::PromoteReady.apply(db, id, None).await?;
        if promoted.is_some() {
            tracing::info!(job_id = %id, "job promoted to ready");
        }
        Ok(promoted)
    }
}

/// What callers get to see of a job.
#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: JobStatus,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Human readable name of the transform, as shown to users.
    pub type_label: &'static str,
    pub images_count: u32,
    pub images: Vec<JobImage>,
    pub created: chrono::DateTime<chrono::Utc>,
    pub started: Option<chrono::DateTime<chrono::Utc>>,
    pub stopped: Option<chrono::DateTime<chrono::Utc>>,
    pub ended: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            description: job.description.clone(),
            status: job.status,
            job_type: job.job_type,
            type_label: job.job_type.display_label(),
            images_count: job.images_count,
            images: job.images.clone(),
            created: job.created_at,
            started: job.started,
            stopped: job.stopped,
            ended: job.ended,
        }
    }
}
