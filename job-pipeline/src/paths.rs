use std::path::{Component, Path, PathBuf};

use common::error::AppError;

const RESULT_SUFFIX: &str = "_result";

/// Maps between public upload URLs and files under the durable uploads root.
#[derive(Debug, Clone)]
pub struct UploadPaths {
    uploads_dir: PathBuf,
    public_prefix: String,
}

impl UploadPaths {
    pub fn new(uploads_dir: impl Into<PathBuf>, public_uploads_url: &str) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            public_prefix: public_uploads_url.trim_end_matches('/').to_string(),
        }
    }

    /// `<public_url>/<user_id>/<dirname>/<file_name>`
    pub fn public_path(
        &self,
        user_id: &str,
        dirname: &str,
        file_name: &str,
    ) -> Result<String, AppError> {
        validate_component(user_id)?;
        validate_component(dirname)?;
        validate_component(file_name)?;

        Ok(format!(
            "{}/{user_id}/{dirname}/{file_name}",
            self.public_prefix
        ))
    }

    /// Resolves a public path to its file on disk. Paths outside the public
    /// prefix, or with anything but plain segments after it, are rejected.
    pub fn durable_path(&self, public_path: &str) -> Result<PathBuf, AppError> {
        let relative = public_path
            .strip_prefix(self.public_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                AppError::Validation(format!("Path outside public uploads: {public_path}"))
            })?;

        let mut path = self.uploads_dir.clone();
        for segment in relative.split('/') {
            validate_component(segment)?;
            path.push(segment);
        }

        Ok(path)
    }
}

/// Output location for a processed image: `<stem>_result.<ext>` next to the
/// original.
pub fn result_path(original: &str) -> String {
    let (dir, file) = match original.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, original),
    };

    let renamed = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{RESULT_SUFFIX}.{ext}"),
        _ => format!("{file}{RESULT_SUFFIX}"),
    };

    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

/// Accepts exactly one normal path segment.
pub fn validate_component(segment: &str) -> Result<(), AppError> {
    let mut components = Path::new(segment).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if single_normal && !segment.contains(['/', '\\', '\0']) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid path segment: {segment:?}"
        )))
    }
}

/// File name part of a saved upload path.
pub fn file_name_of(path: &Path) -> Result<String, AppError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AppError::Validation(format!("Invalid upload path: {}", path.display())))?;
    validate_component(name)?;
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_and_durable_paths() {
        let paths = UploadPaths::new("/srv/uploads", "/uploads/");

        let public = paths
            .public_path("user-1", "batch-7", "cat.png")
            .expect("public path");
        assert_eq!(public, "/uploads/user-1/batch-7/cat.png");

        let durable = paths.durable_path(&public).expect("durable path");
        assert_eq!(durable, PathBuf::from("/srv/uploads/user-1/batch-7/cat.png"));
    }

    #[test]
    fn test_durable_path_rejects_escapes() {
        let paths = UploadPaths::new("/srv/uploads", "/uploads");

        for bad in [
            "/elsewhere/user/dir/cat.png",
            "/uploads/../etc/passwd",
            "/uploads/user/./cat.png",
            "/uploads//cat.png",
            "/uploadsx/user/cat.png",
            "/uploads",
        ] {
            assert!(
                matches!(paths.durable_path(bad), Err(AppError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_result_path_appends_suffix_to_stem() {
        assert_eq!(
            result_path("/uploads/u/d/photo.jpeg"),
            "/uploads/u/d/photo_result.jpeg"
        );
        assert_eq!(
            result_path("/uploads/u/d/archive.tar.gz"),
            "/uploads/u/d/archive.tar_result.gz"
        );
        assert_eq!(result_path("/uploads/u/d/noext"), "/uploads/u/d/noext_result");
        assert_eq!(result_path("/uploads/u/d/.hidden"), "/uploads/u/d/.hidden_result");
        assert_eq!(result_path("plain.png"), "plain_result.png");
    }

    #[test]
    fn test_validate_component() {
        assert!(validate_component("batch-1").is_ok());
        assert!(validate_component("image.png").is_ok());
        assert!(validate_component("").is_err());
        assert!(validate_component(".").is_err());
        assert!(validate_component("..").is_err());
        assert!(validate_component("a/b").is_err());
        assert!(validate_component("a\\b").is_err());
        assert!(validate_component("dir/").is_err());
        assert!(validate_component("/abs").is_err());
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(
            file_name_of(Path::new("/var/uploads/tmp123/cat.png")).expect("name"),
            "cat.png"
        );
        assert_eq!(file_name_of(Path::new("dog.jpg")).expect("name"), "dog.jpg");
        assert!(file_name_of(Path::new("/var/uploads/..")).is_err());
        assert!(file_name_of(Path::new("/")).is_err());
    }
}
