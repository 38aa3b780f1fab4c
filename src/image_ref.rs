//! References to images, and the bytes they resolve to.

use std::{fmt, sync::Arc};

use crate::{data_url::decode_data_url, prelude::*};

/// Something we can turn into image bytes.
#[derive(Clone)]
pub enum ImageRef {
    /// Bytes we already have in memory.
    Bytes {
        /// Where the bytes came from, for logs and error messages.
        description: String,
        bytes: Arc<[u8]>,
    },

    /// A local file.
    Path(PathBuf),

    /// An `http://`, `https://`, `file://` or `data:` URL.
    Url(String),
}

impl ImageRef {
    /// Wrap in-memory bytes.
    pub fn from_bytes(description: impl Into<String>, bytes: Vec<u8>) -> Self {
        ImageRef::Bytes {
            description: description.into(),
            bytes: bytes.into(),
        }
    }

    /// Parse a command-line argument. Anything that doesn't look like a URL we
    /// understand is treated as a path.
    pub fn parse(s: &str) -> Self {
        let is_url = ["http://", "https://", "file://", "data:"]
            .iter()
            .any(|prefix| s.starts_with(prefix));
        if is_url {
            ImageRef::Url(s.to_owned())
        } else {
            ImageRef::Path(PathBuf::from(s))
        }
    }

    /// Load the image.
    #[instrument(level = "debug", skip_all, fields(image = %self))]
    pub async fn resolve(&self, client: &reqwest::Client) -> Result<ImageData> {
        match self {
            ImageRef::Bytes { bytes, .. } => Ok(ImageData::from_shared(bytes.clone())),
            ImageRef::Path(path) => read_file(path).await,
            ImageRef::Url(url) if url.starts_with("data:") => {
                let (mime_type, bytes) = decode_data_url(url)?;
                let mut image = ImageData::new(bytes);
                if image.mime_type.is_none() {
                    image.mime_type = mime_type;
                }
                Ok(image)
            }
            ImageRef::Url(url) if url.starts_with("file://") => {
                read_file(Path::new(&url["file://".len()..])).await
            }
            ImageRef::Url(url) => {
                let bytes = client
                    .get(url)
                    .send()
                    .await
                    .and_then(|resp| resp.error_for_status())
                    .with_context(|| format!("cannot fetch {url}"))?
                    .bytes()
                    .await
                    .with_context(|| format!("cannot read {url}"))?;
                Ok(ImageData::new(bytes.to_vec()))
            }
        }
    }
}

/// Read a local image file.
async fn read_file(path: &Path) -> Result<ImageData> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(ImageData::new(bytes))
}

impl From<PathBuf> for ImageRef {
    fn from(path: PathBuf) -> Self {
        ImageRef::Path(path)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Bytes { description, bytes } => {
                write!(f, "{} ({} bytes)", description, bytes.len())
            }
            ImageRef::Path(path) => write!(f, "{}", path.display()),
            // Don't dump whole `data:` URLs into our logs.
            ImageRef::Url(url) if url.starts_with("data:") => {
                let end = url.find(',').unwrap_or(url.len());
                write!(f, "{},...", &url[..end])
            }
            ImageRef::Url(url) => write!(f, "{}", url),
        }
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageRef({})", self)
    }
}

/// Image bytes, plus the MIME type we detected.
#[derive(Clone, Debug)]
pub struct ImageData {
    bytes: Arc<[u8]>,
    mime_type: Option<String>,
}

impl ImageData {
    /// Wrap bytes, sniffing the MIME type from their contents.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self::from_shared(bytes.into())
    }

    fn from_shared(bytes: Arc<[u8]>) -> Self {
        let mime_type = infer::get(&bytes).map(|kind| kind.mime_type().to_owned());
        Self { bytes, mime_type }
    }

    /// The raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The MIME type, if we recognize the format.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// A file extension matching our contents, or failing that, our declared
    /// MIME type.
    pub fn extension(&self) -> Option<&'static str> {
        if let Some(kind) = infer::get(&self.bytes) {
            return Some(kind.extension());
        }
        let mime_type = self.mime_type.as_deref()?;
        mime_guess::get_mime_extensions_str(mime_type)
            .and_then(|extensions| extensions.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use base64::{Engine as _, prelude::BASE64_STANDARD};

    use super::*;

    /// The first bytes of every PNG file.
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn parse_distinguishes_urls_from_paths() {
        assert!(matches!(ImageRef::parse("https://x/y.png"), ImageRef::Url(_)));
        assert!(matches!(ImageRef::parse("data:;base64,AA=="), ImageRef::Url(_)));
        assert!(matches!(ImageRef::parse("images/y.png"), ImageRef::Path(_)));
    }

    #[test]
    fn data_urls_are_abbreviated_in_display() {
        let image = ImageRef::parse("data:image/png;base64,AAAAAAAAAAAA");
        assert_eq!(image.to_string(), "data:image/png;base64,...");
    }

    #[test]
    fn sniffs_png_extension() {
        let image = ImageData::new(PNG_MAGIC.to_vec());
        assert_eq!(image.mime_type(), Some("image/png"));
        assert_eq!(image.extension(), Some("png"));

        let text = ImageData::new(b"HELLO".to_vec());
        assert_eq!(text.mime_type(), None);
        assert_eq!(text.extension(), None);
    }

    #[tokio::test]
    async fn resolves_paths_and_data_urls() {
        let client = reqwest::Client::new();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"HELLO").unwrap();
        let from_path = ImageRef::from(file.path().to_owned())
            .resolve(&client)
            .await
            .unwrap();
        assert_eq!(from_path.bytes(), b"HELLO");

        let file_url = format!("file://{}", file.path().display());
        let from_file_url = ImageRef::parse(&file_url).resolve(&client).await.unwrap();
        assert_eq!(from_file_url.bytes(), b"HELLO");

        let data_url =
            format!("data:text/plain;base64,{}", BASE64_STANDARD.encode("HELLO"));
        let from_data_url = ImageRef::parse(&data_url).resolve(&client).await.unwrap();
        assert_eq!(from_data_url.bytes(), b"HELLO");
        assert_eq!(from_data_url.mime_type(), Some("text/plain"));
    }

    #[tokio::test]
    async fn missing_files_are_errors() {
        let client = reqwest::Client::new();
        let missing = ImageRef::parse("/nonexistent/image.png");
        assert!(missing.resolve(&client).await.is_err());
    }
}
