//! A blob store backed by a local directory.

use std::path::Component;

use futures::StreamExt as _;
use tokio::fs;
use tokio_stream::wrappers::ReadDirStream;

use crate::{image_ref::ImageData, prelude::*};

use super::{BlobError, BlobStore, StoredImage};

/// The folder that new uploads go into.
const UPLOAD_FOLDER: &str = "uploads";

/// Stores images as files under a root directory.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Use `root` as our storage directory. It will be created on the first
    /// upload.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .context("cannot find current directory")?
                .join(root)
        };
        Ok(Self { root })
    }

    /// Map an id to a path inside our root, rejecting anything that could
    /// escape it.
    fn path_for(&self, id: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(id);
        let is_safe = !id.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if is_safe {
            Ok(self.root.join(relative))
        } else {
            Err(BlobError::InvalidId(id.to_owned()))
        }
    }

    /// Convert a path inside our root back into an id.
    fn id_for(&self, path: &Path) -> Result<String> {
        let relative = path
            .strip_prefix(&self.root)
            .with_context(|| format!("{} is outside {}", path.display(), self.root.display()))?;
        let parts = relative
            .components()
            .map(|component| {
                component
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| anyhow!("non-UTF-8 file name: {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join("/"))
    }

    async fn describe_path(&self, id: &str, path: &Path) -> Result<StoredImage, BlobError> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(not_found(id)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(not_found(id));
            }
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("cannot read metadata for {}", path.display()))
                    .into());
            }
        };
        Ok(StoredImage {
            id: id.to_owned(),
            url: format!("file://{}", path.display()),
            format: path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase()),
            bytes: metadata.len(),
        })
    }

    /// Collect every file below `dir`.
    async fn walk(&self, dir: PathBuf, images: &mut Vec<StoredImage>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let read_dir = fs::read_dir(&dir)
                .await
                .with_context(|| format!("cannot list {}", dir.display()))?;
            let mut entries = ReadDirStream::new(read_dir);
            while let Some(entry) = entries.next().await {
                let entry = entry.with_context(|| format!("cannot list {}", dir.display()))?;
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let id = self.id_for(&path)?;
                    images.push(self.describe_path(&id, &path).await?);
                }
            }
        }
        Ok(())
    }
}

fn not_found(id: &str) -> BlobError {
    BlobError::NotFound { id: id.to_owned() }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, id: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found(id)),
            Err(err) => Err(anyhow::Error::from(err)
                .context(format!("cannot read {}", path.display()))
                .into()),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn describe(&self, id: &str) -> Result<StoredImage, BlobError> {
        let path = self.path_for(id)?;
        self.describe_path(id, &path).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn store(&self, path: &Path) -> Result<StoredImage, BlobError> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let image = ImageData::new(bytes);
        let extension = image.extension().unwrap_or("bin");
        let id = format!("{UPLOAD_FOLDER}/{}.{extension}", uuid::Uuid::new_v4());
        let dest = self.path_for(&id)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        fs::write(&dest, image.bytes())
            .await
            .with_context(|| format!("cannot write {}", dest.display()))?;
        debug!(%id, "Stored image");
        self.describe_path(&id, &dest).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, id: &str) -> Result<(), BlobError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found(id)),
            Err(err) => Err(anyhow::Error::from(err)
                .context(format!("cannot delete {}", path.display()))
                .into()),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self) -> Result<Vec<StoredImage>, BlobError> {
        let mut images = vec![];
        if fs::try_exists(&self.root)
            .await
            .with_context(|| format!("cannot access {}", self.root.display()))?
        {
            self.walk(self.root.clone(), &mut images).await?;
        }
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The first bytes of every PNG file.
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn png_file(dir: &Path) -> PathBuf {
        let path = dir.join("upload.tmp");
        std::fs::write(&path, PNG_MAGIC).unwrap();
        path
    }

    #[tokio::test]
    async fn store_fetch_list_delete() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path()).unwrap();
        assert!(store.list().await.unwrap().is_empty());

        let stored = store.store(&png_file(scratch.path())).await.unwrap();
        assert!(stored.id.starts_with("uploads/"));
        assert!(stored.id.ends_with(".png"));
        assert!(stored.url.starts_with("file://"));
        assert_eq!(stored.format.as_deref(), Some("png"));
        assert_eq!(stored.bytes, PNG_MAGIC.len() as u64);

        assert_eq!(store.fetch(&stored.id).await.unwrap(), PNG_MAGIC);
        assert_eq!(store.describe(&stored.id).await.unwrap(), stored);
        assert_eq!(store.list().await.unwrap(), vec![stored.clone()]);

        store.delete(&stored.id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.delete(&stored.id).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn listing_is_sorted_and_recursive() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("b/c")).unwrap();
        std::fs::write(root.path().join("b/c/d.png"), PNG_MAGIC).unwrap();
        std::fs::write(root.path().join("a.png"), PNG_MAGIC).unwrap();
        let store = FsBlobStore::new(root.path()).unwrap();

        let ids = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|image| image.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, ["a.png", "b/c/d.png"]);
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_root() {
        let root = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(root.path()).unwrap();
        for id in ["../secret.png", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.fetch(id).await, Err(BlobError::InvalidId(_))),
                "{id:?} should be rejected"
            );
        }
        assert!(matches!(
            store.fetch("missing.png").await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(matches!(
            store.describe("uploads").await,
            Err(BlobError::NotFound { .. })
        ));
    }
}
