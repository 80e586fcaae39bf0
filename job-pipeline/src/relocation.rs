use std::{
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use common::error::AppError;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::paths::validate_component;

/// A finished upload waiting to be moved out of temporary storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRequest {
    pub user_id: String,
    pub dirname: String,
}

impl RelocationRequest {
    pub fn new(user_id: impl Into<String>, dirname: impl Into<String>) -> Result<Self, AppError> {
        let request = Self {
            user_id: user_id.into(),
            dirname: dirname.into(),
        };
        validate_component(&request.user_id)?;
        validate_component(&request.dirname)?;
        Ok(request)
    }
}

/// A slot held in the relocation queue. Dropping it unused frees the slot.
pub struct RelocationPermit(mpsc::OwnedPermit<RelocationRequest>);

impl RelocationPermit {
    pub fn send(self, request: RelocationRequest) {
        debug!(user_id = %request.user_id, dirname = %request.dirname, "relocation queued");
        self.0.send(request);
    }
}

/// Bounded FIFO with a single consumer moving
/// `<temp_dir>/<dirname>` to `<uploads_dir>/<user_id>/<dirname>`.
pub struct RelocationQueue {
    sender: Mutex<Option<mpsc::Sender<RelocationRequest>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl RelocationQueue {
    /// Spawns the consumer task; must be called from within a tokio runtime.
    pub fn start(
        temp_dir: PathBuf,
        uploads_dir: PathBuf,
        capacity: usize,
        grace: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let consumer = tokio::spawn(consume(receiver, temp_dir, uploads_dir));

        Self {
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(Some(consumer)),
            grace,
        }
    }

    /// Claims a queue slot without waiting, so callers can check capacity
    /// before doing work that must be followed by a relocation.
    pub fn reserve(&self) -> Result<RelocationPermit, AppError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::InternalError("Relocation queue is shut down".into()))?;

        match sender.try_reserve_owned() {
            Ok(permit) => Ok(RelocationPermit(permit)),
            Err(TrySendError::Full(_)) => {
                warn!("relocation queue full");
                Err(AppError::QueueFull(
                    "Upload could not be queued for relocation".into(),
                ))
            }
            Err(TrySendError::Closed(_)) => Err(AppError::InternalError(
                "Relocation consumer has stopped".into(),
            )),
        }
    }

    /// Enqueues without waiting. A full queue is reported, not waited out.
    pub fn push(&self, request: RelocationRequest) -> Result<(), AppError> {
        self.reserve()?.send(request);
        Ok(())
    }

    /// Closes the queue and gives the in-flight move one grace period before
    /// aborting the consumer. Requests still queued at that point are lost.
    pub async fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut consumer) = consumer else {
            return;
        };

        if tokio::time::timeout(self.grace, &mut consumer).await.is_err() {
            warn!(grace = ?self.grace, "relocation consumer still busy; aborting");
            consumer.abort();
        } else {
            info!("relocation consumer stopped");
        }
    }
}

async fn consume(
    mut receiver: mpsc::Receiver<RelocationRequest>,
    temp_dir: PathBuf,
    uploads_dir: PathBuf,
) {
    while let Some(request) = receiver.recv().await {
        match relocate(&temp_dir, &uploads_dir, &request).await {
            Ok(target) => debug!(
                user_id = %request.user_id,
                target = %target.display(),
                "upload relocated"
            ),
            Err(err) => error!(
                user_id = %request.user_id,
                dirname = %request.dirname,
                error = %err,
                "failed to relocate upload"
            ),
        }
    }
}

pub async fn relocate(
    temp_dir: &Path,
    uploads_dir: &Path,
    request: &RelocationRequest,
) -> Result<PathBuf, AppError> {
    let source = temp_dir.join(&request.dirname);
    let user_dir = uploads_dir.join(&request.user_id);
    let target = user_dir.join(&request.dirname);

    tokio::fs::create_dir_all(&user_dir).await?;

    if let Err(err) = tokio::fs::rename(&source, &target).await {
        // Rename cannot cross filesystems; fall back to copying
        if !source.is_dir() {
            return Err(err.into());
        }
        debug!(error = %err, "rename failed, copying upload instead");
        let (from, to) = (source.clone(), target.clone());
        tokio::task::spawn_blocking(move || copy_dir(&from, &to)).await??;
        tokio::fs::remove_dir_all(&source).await?;
    }

    Ok(target)
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let destination = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_upload(temp_dir: &Path, dirname: &str, files: &[&str]) {
        let dir = temp_dir.join(dirname);
        std::fs::create_dir_all(&dir).expect("create upload dir");
        for file in files {
            std::fs::write(dir.join(file), b"pixels").expect("write upload");
        }
    }

    async fn wait_for(path: &Path) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("path never appeared");
    }

    #[test]
    fn test_request_rejects_traversal() {
        assert!(RelocationRequest::new("user", "batch").is_ok());
        assert!(matches!(
            RelocationRequest::new("user", "../etc"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            RelocationRequest::new("a/b", "batch"),
            Err(AppError::Validation(_))
        ));
        assert!(RelocationRequest::new("", "batch").is_err());
    }

    #[tokio::test]
    async fn test_relocate_moves_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let uploads = tempfile::tempdir().expect("tempdir");
        seed_upload(temp.path(), "batch-1", &["a.png", "b.png"]);

        let request = RelocationRequest::new("user-1", "batch-1").expect("request");
        let target = relocate(temp.path(), uploads.path(), &request)
            .await
            .expect("relocate");

        assert_eq!(target, uploads.path().join("user-1").join("batch-1"));
        assert!(target.join("a.png").exists());
        assert!(target.join("b.png").exists());
        assert!(!temp.path().join("batch-1").exists());
    }

    #[tokio::test]
    async fn test_relocate_missing_source_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let uploads = tempfile::tempdir().expect("tempdir");

        let request = RelocationRequest::new("user-1", "ghost").expect("request");
        let result = relocate(temp.path(), uploads.path(), &request).await;
        assert!(matches!(result, Err(AppError::Io(_))));
    }

    #[test]
    fn test_copy_dir_is_recursive() {
        let from = tempfile::tempdir().expect("tempdir");
        let to = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(from.path().join("nested")).expect("mkdir");
        std::fs::write(from.path().join("top.png"), b"1").expect("write");
        std::fs::write(from.path().join("nested").join("deep.png"), b"2").expect("write");

        let target = to.path().join("copy");
        copy_dir(from.path(), &target).expect("copy");

        assert!(target.join("top.png").exists());
        assert!(target.join("nested").join("deep.png").exists());
    }

    #[tokio::test]
    async fn test_queue_processes_in_order_and_survives_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let uploads = tempfile::tempdir().expect("tempdir");
        seed_upload(temp.path(), "first", &["a.png"]);
        seed_upload(temp.path(), "second", &["b.png"]);

        let queue = RelocationQueue::start(
            temp.path().to_path_buf(),
            uploads.path().to_path_buf(),
            8,
            Duration::from_secs(1),
        );

        queue
            .push(RelocationRequest::new("user-1", "missing").expect("request"))
            .expect("push");
        queue
            .push(RelocationRequest::new("user-1", "first").expect("request"))
            .expect("push");
        queue
            .push(RelocationRequest::new("user-2", "second").expect("request"))
            .expect("push");

        wait_for(&uploads.path().join("user-2").join("second").join("b.png")).await;
        assert!(uploads
            .path()
            .join("user-1")
            .join("first")
            .join("a.png")
            .exists());

        queue.shutdown().await;
        let after = queue.push(RelocationRequest::new("user-1", "late").expect("request"));
        assert!(matches!(after, Err(AppError::InternalError(_))));
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let (sender, _receiver) = mpsc::channel(1);
        let queue = RelocationQueue {
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(None),
            grace: Duration::from_millis(10),
        };

        queue
            .push(RelocationRequest::new("user", "one").expect("request"))
            .expect("first push fits");
        let second = queue.push(RelocationRequest::new("user", "two").expect("request"));

        assert!(matches!(second, Err(AppError::QueueFull(_))));
        assert_eq!(
            second.map_err(|err| err.code()).unwrap_err(),
            common::error::ErrorCode::ServerError
        );
    }

    #[tokio::test]
    async fn test_reserved_slot_is_returned_on_drop() {
        let (sender, mut receiver) = mpsc::channel(1);
        let queue = RelocationQueue {
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(None),
            grace: Duration::from_millis(10),
        };

        let permit = queue.reserve().expect("free slot");
        assert!(matches!(queue.reserve(), Err(AppError::QueueFull(_))));

        drop(permit);
        let permit = queue.reserve().expect("slot released");
        permit.send(RelocationRequest::new("user", "batch").expect("request"));

        let received = receiver.recv().await.expect("queued request");
        assert_eq!(received.dirname, "batch");
    }
}
