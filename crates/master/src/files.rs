// Path: crates/master/src/files.rs
//! The file-fetch seam.
//!
//! Minions request files over the request channel; the backend serving
//! them is pluggable. The built-in backend reads from a configured local
//! root and refuses anything that would escape it.

use async_trait::async_trait;
use herd_types::error::{CoreError, InternalError, UserError};
use std::path::{Component, Path, PathBuf};

/// A file source the master serves fetch requests from.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Reads one file by its path relative to the backend root.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CoreError>;
}

/// The built-in backend over a local directory.
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    /// A backend rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, CoreError> {
        let rel = Path::new(path);
        if rel.is_absolute() {
            return Err(UserError::InvalidTarget(format!("absolute path: {}", path)).into());
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(
                        UserError::InvalidTarget(format!("path escapes root: {}", path)).into(),
                    )
                }
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl FileBackend for LocalFiles {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CoreError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read(&resolved)
            .await
            .map_err(|e| InternalError::Io(format!("read {}: {}", resolved.display(), e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_within_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/app.toml"), b"x = 1").unwrap();

        let files = LocalFiles::new(dir.path());
        assert_eq!(files.fetch("conf/app.toml").await.unwrap(), b"x = 1");
    }

    #[tokio::test]
    async fn test_traversal_refused() {
        let dir = tempfile::tempdir().unwrap();
        let files = LocalFiles::new(dir.path());
        assert!(matches!(
            files.fetch("../etc/passwd").await,
            Err(CoreError::User(UserError::InvalidTarget(_)))
        ));
        assert!(matches!(
            files.fetch("/etc/passwd").await,
            Err(CoreError::User(UserError::InvalidTarget(_)))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = LocalFiles::new(dir.path());
        assert!(matches!(
            files.fetch("nope.txt").await,
            Err(CoreError::Internal(InternalError::Io(_)))
        ));
    }
}
