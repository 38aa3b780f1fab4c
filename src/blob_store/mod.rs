//! Where uploaded images live.
//!
//! Image ids are slash-separated paths such as `uploads/3f2a.png`, so that
//! images can be grouped into folders.

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

pub mod fs;

/// Metadata about a stored image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct StoredImage {
    /// The image's id, which may contain `/`.
    pub id: String,

    /// A URL from which the image can be fetched.
    pub url: String,

    /// The image format, such as `png`, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Size in bytes.
    pub bytes: u64,
}

/// Errors reported by a [`BlobStore`].
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("no image with id {id:?}")]
    NotFound { id: String },

    #[error("invalid image id {0:?}")]
    InvalidId(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A store for image files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch an image's bytes.
    async fn fetch(&self, id: &str) -> Result<Vec<u8>, BlobError>;

    /// Look up an image's metadata.
    async fn describe(&self, id: &str) -> Result<StoredImage, BlobError>;

    /// Store a copy of the file at `path`, and return its metadata.
    async fn store(&self, path: &Path) -> Result<StoredImage, BlobError>;

    /// Delete an image.
    async fn delete(&self, id: &str) -> Result<(), BlobError>;

    /// List every stored image, sorted by id.
    async fn list(&self) -> Result<Vec<StoredImage>, BlobError>;
}

/// Convert an id typed on the command line to a store id. Ids may use `:`
/// instead of `/` as a folder separator, so that they're safe to use in URLs.
pub fn id_from_cli(id: &str) -> String {
    id.replace(':', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colons_become_folder_separators() {
        assert_eq!(id_from_cli("uploads:a.png"), "uploads/a.png");
        assert_eq!(id_from_cli("a:b:c.png"), "a/b/c.png");
        assert_eq!(id_from_cli("plain.png"), "plain.png");
    }
}
