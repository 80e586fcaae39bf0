use serde_json::{json, Value};

use crate::{error::AppError, storage::db::SurrealDbClient};

use super::{
    job::{Job, JobImage, JobStatus, JobType},
    StoredObject,
};

/// A single partial mutation of a job document.
///
/// Every variant renders to a `SET` clause touching only the fields it owns,
/// plus the guard conditions that must hold for the write to apply. Nothing
/// here ever rewrites the whole document.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Details { name: String, description: String },
    Type(JobType),
    Status(JobStatus),
    PushImages {
        images: Vec<JobImage>,
        expected_count: u32,
    },
    ImageResult { image_id: u32, result: String },
    Started,
    Stopped,
    Ended,
    Incompleted,
    PromoteReady,
}

/// The SurrealQL pieces of a [`JobUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedUpdate {
    pub set_clause: String,
    pub conditions: Vec<String>,
    pub bindings: Vec<(&'static str, Value)>,
}

const MUTABLE_STATES: [JobStatus; 2] = [JobStatus::Waiting, JobStatus::Ready];
const STOPPABLE_STATES: [JobStatus; 4] = [
    JobStatus::Waiting,
    JobStatus::Ready,
    JobStatus::Running,
    JobStatus::Stopped,
];

fn status_list(states: &[JobStatus]) -> Value {
    Value::Array(states.iter().map(|s| json!(s.as_str())).collect())
}

impl JobUpdate {
    pub fn details(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Details {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn job_type(job_type: JobType) -> Self {
        Self::Type(job_type)
    }

    pub fn status(status: JobStatus) -> Self {
        Self::Status(status)
    }

    pub fn push_images(images: Vec<JobImage>, expected_count: u32) -> Self {
        Self::PushImages {
            images,
            expected_count,
        }
    }

    pub fn image_result(image_id: u32, result: impl Into<String>) -> Self {
        Self::ImageResult {
            image_id,
            result: result.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Details { .. } => "details",
            Self::Type(_) => "type",
            Self::Status(_) => "status",
            Self::PushImages { .. } => "push_images",
            Self::ImageResult { .. } => "image_result",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Ended => "ended",
            Self::Incompleted => "incompleted",
            Self::PromoteReady => "promote_ready",
        }
    }

    pub fn render(&self) -> Result<RenderedUpdate, AppError> {
        let rendered = match self {
            Self::Details { name, description } => RenderedUpdate {
                set_clause: "name = $name, description = $description".into(),
                conditions: Vec::new(),
                bindings: vec![("name", json!(name)), ("description", json!(description))],
            },
            Self::Type(job_type) => RenderedUpdate {
                set_clause: "job_type = $job_type".into(),
                conditions: vec!["status IN $mutable_states".into()],
                bindings: vec![
                    ("job_type", json!(job_type.as_str())),
                    ("mutable_states", status_list(&MUTABLE_STATES)),
                ],
            },
            Self::Status(status) => RenderedUpdate {
                set_clause: "status = $status".into(),
                conditions: Vec::new(),
                bindings: vec![("status", json!(status.as_str()))],
            },
            Self::PushImages {
                images,
                expected_count,
            } => {
                let count = u32::try_from(images.len()).map_err(|_| {
                    AppError::Validation("Too many images in a single upload".into())
                })?;
                RenderedUpdate {
                    set_clause: "images += $images, images_count += $count".into(),
                    conditions: vec![
                        "images_count = $expected_count".into(),
                        "status IN $mutable_states".into(),
                    ],
                    bindings: vec![
                        ("images", serde_json::to_value(images)?),
                        ("count", json!(count)),
                        ("expected_count", json!(expected_count)),
                        ("mutable_states", status_list(&MUTABLE_STATES)),
                    ],
                }
            }
            // Image ids are their position in the array, the guard double checks it
            Self::ImageResult { image_id, result } => RenderedUpdate {
                set_clause: format!("images[{image_id}].result = $result"),
                conditions: vec![format!("images[{image_id}].id = $image_id")],
                bindings: vec![("result", json!(result)), ("image_id", json!(image_id))],
            },
            Self::Started => RenderedUpdate {
                set_clause: "status = $next_status, started = time::now()".into(),
                conditions: vec!["status = $required_status".into()],
                bindings: vec![
                    ("next_status", json!(JobStatus::Running.as_str())),
                    ("required_status", json!(JobStatus::Ready.as_str())),
                ],
            },
            Self::Stopped => RenderedUpdate {
                set_clause: "status = $next_status, stopped = time::now()".into(),
                conditions: vec!["status IN $stoppable_states".into()],
                bindings: vec![
                    ("next_status", json!(JobStatus::Stopped.as_str())),
                    ("stoppable_states", status_list(&STOPPABLE_STATES)),
                ],
            },
            Self::Ended => RenderedUpdate {
                set_clause: "status = $next_status, ended = time::now()".into(),
                conditions: vec!["status = $required_status".into()],
                bindings: vec![
                    ("next_status", json!(JobStatus::Done.as_str())),
                    ("required_status", json!(JobStatus::Running.as_str())),
                ],
            },
            Self::Incompleted => RenderedUpdate {
                set_clause: "status = $next_status, ended = time::now()".into(),
                conditions: vec!["status = $required_status".into()],
                bindings: vec![
                    ("next_status", json!(JobStatus::Incompleted.as_str())),
                    ("required_status", json!(JobStatus::Running.as_str())),
                ],
            },
            Self::PromoteReady => RenderedUpdate {
                set_clause: "status = $next_status".into(),
                conditions: vec![
                    "status = $required_status".into(),
                    "job_type != $no_type".into(),
                    "images_count > 0".into(),
                ],
                bindings: vec![
                    ("next_status", json!(JobStatus::Ready.as_str())),
                    ("required_status", json!(JobStatus::Waiting.as_str())),
                    ("no_type", json!(JobType::None.as_str())),
                ],
            },
        };

        Ok(rendered)
    }

    /// Builds the full statement. `owner` adds an ownership guard so a job
    /// belonging to someone else is never touched.
    pub fn statement(
        &self,
        owner: Option<&str>,
    ) -> Result<(String, Vec<(&'static str, Value)>), AppError> {
        let RenderedUpdate {
            set_clause,
            mut conditions,
            mut bindings,
        } = self.render()?;

        if let Some(owner) = owner {
            conditions.insert(0, "user_id = $user_id".into());
            bindings.push(("user_id", json!(owner)));
        }

        let guard = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "UPDATE type::thing($table, $id) SET {set_clause}, updated_at = time::now(){guard} RETURN AFTER;"
        );

        Ok((query, bindings))
    }

    /// Executes the update against a single job.
    ///
    /// Returns `None` when the job does not exist, is not owned by `owner`, or
    /// one of the update's guards did not hold.
    pub async fn apply(
        &self,
        db: &SurrealDbClient,
        job_id: &str,
        owner: Option<&str>,
    ) -> Result<Option<Job>, AppError> {
        let (query, bindings) = self.statement(owner)?;

        let mut request = db
            .client
            .query(query)
            .bind(("table", Job::table_name()))
            .bind(("id", job_id.to_string()));
        for (key, value) in bindings {
            request = request.bind((key, value));
        }

        let updated: Option<Job> = request.await?.take(0)?;
        if updated.is_none() {
            tracing::debug!(%job_id, update = self.kind(), "job update matched no document");
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding<'a>(rendered: &'a RenderedUpdate, key: &str) -> Option<&'a Value> {
        rendered
            .bindings
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    #[test]
    fn test_details_only_sets_name_and_description() {
        let rendered = JobUpdate::details("renamed", "new text").render().expect("render");

        assert_eq!(rendered.set_clause, "name = $name, description = $description");
        assert!(rendered.conditions.is_empty());
        assert_eq!(binding(&rendered, "name"), Some(&json!("renamed")));
        assert_eq!(binding(&rendered, "description"), Some(&json!("new text")));
    }

    #[test]
    fn test_push_images_increments_and_appends_together() {
        let images = vec![
            JobImage::new(2, "/uploads/u/d/a.png"),
            JobImage::new(3, "/uploads/u/d/b.png"),
        ];
        let rendered = JobUpdate::push_images(images, 2).render().expect("render");

        assert_eq!(
            rendered.set_clause,
            "images += $images, images_count += $count"
        );
        assert!(rendered
            .conditions
            .contains(&"images_count = $expected_count".to_string()));
        assert_eq!(binding(&rendered, "count"), Some(&json!(2)));
        assert_eq!(binding(&rendered, "expected_count"), Some(&json!(2)));

        let pushed = binding(&rendered, "images").expect("images binding");
        assert_eq!(pushed[0]["id"], json!(2));
        assert_eq!(pushed[1]["original"], json!("/uploads/u/d/b.png"));
        assert_eq!(pushed[1]["result"], json!(""));
    }

    #[test]
    fn test_image_result_targets_single_entry() {
        let rendered = JobUpdate::image_result(4, "/uploads/u/d/e_result.png")
            .render()
            .expect("render");

        assert_eq!(rendered.set_clause, "images[4].result = $result");
        assert_eq!(rendered.conditions, vec!["images[4].id = $image_id".to_string()]);
        assert_eq!(binding(&rendered, "image_id"), Some(&json!(4)));
    }

    #[test]
    fn test_lifecycle_updates_are_guarded() {
        let started = JobUpdate::Started.render().expect("render");
        assert_eq!(binding(&started, "required_status"), Some(&json!("Ready")));
        assert_eq!(binding(&started, "next_status"), Some(&json!("Running")));
        assert!(started.set_clause.contains("started = time::now()"));

        let ended = JobUpdate::Ended.render().expect("render");
        assert_eq!(binding(&ended, "required_status"), Some(&json!("Running")));
        assert_eq!(binding(&ended, "next_status"), Some(&json!("Done")));

        let incompleted = JobUpdate::Incompleted.render().expect("render");
        assert_eq!(binding(&incompleted, "next_status"), Some(&json!("Incompleted")));
        assert!(incompleted.set_clause.contains("ended = time::now()"));

        let stopped = JobUpdate::Stopped.render().expect("render");
        assert!(stopped.set_clause.contains("stopped = time::now()"));
        assert_eq!(
            binding(&stopped, "stoppable_states"),
            Some(&json!(["Waiting", "Ready", "Running", "Stopped"]))
        );
    }

    #[test]
    fn test_promote_requires_type_and_images() {
        let rendered = JobUpdate::PromoteReady.render().expect("render");

        assert_eq!(rendered.set_clause, "status = $next_status");
        assert!(rendered.conditions.contains(&"job_type != $no_type".to_string()));
        assert!(rendered.conditions.contains(&"images_count > 0".to_string()));
        assert_eq!(binding(&rendered, "required_status"), Some(&json!("Waiting")));
    }

    #[test]
    fn test_statement_adds_owner_guard_first() {
        let (query, bindings) = JobUpdate::status(JobStatus::Ready)
            .statement(Some("user-1"))
            .expect("statement");

        assert_eq!(
            query,
            "UPDATE type::thing($table, $id) SET status = $status, updated_at = time::now() WHERE user_id = $user_id RETURN AFTER;"
        );
        assert!(bindings.contains(&("user_id", json!("user-1"))));

        let (query, _) = JobUpdate::status(JobStatus::Ready)
            .statement(None)
            .expect("statement");
        assert!(!query.contains("WHERE"));
    }
}
