use std::path::{Component, Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::ExistenceCheck;
use sluice_core::types::Location;

/// Object storage backed by a directory: `<root>/<bucket>/<object>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an object. Bucket and object must stay inside the
    /// root: absolute paths and `..` are rejected.
    pub fn resolve(&self, location: &Location) -> Result<PathBuf> {
        for part in [&location.bucket, &location.object] {
            let relative = Path::new(part.as_str());
            let clean = !part.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !clean {
                return Err(SluiceError::Capability(format!(
                    "invalid object location '{}'",
                    location
                )));
            }
        }
        Ok(self.root.join(&location.bucket).join(&location.object))
    }
}

impl ExistenceCheck for LocalObjectStore {
    fn exists(&self, location: &Location) -> BoxFuture<'_, Result<bool>> {
        let path = self.resolve(location);
        Box::pin(async move {
            let path = path?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    debug!(path = %path.display(), "Object found");
                    Ok(meta.is_file())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(SluiceError::Capability(format!(
                    "cannot stat {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exists_after_object_lands() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let loc = Location::new("bkt", "data.csv");

        assert!(!store.exists(&loc).await.unwrap());

        std::fs::create_dir_all(dir.path().join("bkt")).unwrap();
        std::fs::write(dir.path().join("bkt/data.csv"), "a,b\n").unwrap();
        assert!(store.exists(&loc).await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_is_not_an_object() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bkt/folder")).unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(!store.exists(&Location::new("bkt", "folder")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let store = LocalObjectStore::new("/tmp/storage");
        let err = store
            .exists(&Location::new("bkt", "../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Capability(_)));
        assert!(store.resolve(&Location::new("/abs", "x")).is_err());
        assert_eq!(
            store.resolve(&Location::new("bkt", "dir/x.csv")).unwrap(),
            PathBuf::from("/tmp/storage/bkt/dir/x.csv")
        );
    }
}
