//! Request handling: the glue between the blob store, the OCR pool and the
//! caller.
//!
//! Every request that needs OCR gets its own short-lived [`Scheduler`], which
//! is always terminated before we return, whether or not recognition worked.

use std::sync::Arc;

use schemars::JsonSchema;
use thiserror::Error;

use crate::{
    blob_store::{BlobError, BlobStore, StoredImage},
    engines::OcrEngineFactory,
    image_ref::{ImageData, ImageRef},
    prelude::*,
    scheduler::{
        JobError, JobHandle, JobOptions, JobResult, PoolInitializationError,
        RecognitionResult, Scheduler, SchedulerConfig,
    },
};

/// Image types we accept for upload.
const ACCEPTED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// How to set up the OCR pool for a request.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// How many workers to start.
    pub workers: usize,

    /// Languages to load. The first is the primary language.
    pub languages: Vec<String>,

    /// Scheduler settings.
    pub config: SchedulerConfig,

    /// How many times to resubmit a job that failed in a way that might not
    /// happen again.
    pub retries: usize,
}

/// Errors that a request can fail with.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("missing image id")]
    MissingId,

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("cannot start OCR pool: {0}")]
    PoolInitialization(#[from] PoolInitializationError),

    #[error("OCR failed: {0}")]
    Job(#[from] JobError),

    #[error("unsupported image type {0} (expected PNG or JPEG)")]
    UnsupportedImageType(String),
}

impl HandlerError {
    /// The HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::MissingId | HandlerError::UnsupportedImageType(_) => 400,
            HandlerError::Blob(BlobError::NotFound { .. }) => 404,
            HandlerError::Blob(BlobError::InvalidId(_)) => 400,
            HandlerError::Blob(BlobError::Other(_)) => 500,
            HandlerError::PoolInitialization(_) => 503,
            HandlerError::Job(err) => match err {
                JobError::Recognition { .. }
                | JobError::Timeout { .. }
                | JobError::WorkerFailed { .. }
                | JobError::ImageUnavailable { .. } => 422,
                JobError::UnsupportedLanguage { .. } => 400,
                JobError::PoolShuttingDown
                | JobError::PoolNotReady { .. }
                | JobError::NoHealthyWorkers => 503,
                JobError::Cancelled | JobError::Abandoned => 500,
            },
        }
    }
}

/// The JSON envelope around every response.
#[derive(Debug, Serialize)]
#[serde(tag = "message")]
pub enum Response<T> {
    Success { result: T },
    Error { status: u16, error: String },
}

impl<T> From<Result<T, HandlerError>> for Response<T> {
    fn from(result: Result<T, HandlerError>) -> Self {
        match result {
            Ok(result) => Response::Success { result },
            Err(err) => Response::Error {
                status: err.status_code(),
                error: err.to_string(),
            },
        }
    }
}

/// A stored image plus the text we found in it.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct ImageWithText {
    #[serde(flatten)]
    pub image: StoredImage,

    /// The extracted text.
    pub text: String,

    /// Mean word confidence, from 0 to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Wait for `handle`, resubmitting the job up to `retries` times if it fails
/// in a way that might not happen again.
pub async fn wait_with_retries(
    scheduler: &Scheduler,
    mut handle: JobHandle,
    image: &ImageRef,
    options: &JobOptions,
    retries: usize,
) -> JobResult {
    let mut attempt = 0;
    loop {
        match handle.wait().await {
            Err(err) if err.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(%image, attempt, %err, "Retrying OCR job");
                handle = scheduler.submit(image.clone(), options.clone());
            }
            result => return result,
        }
    }
}

/// Recognize a single image with a fresh pool.
#[instrument(level = "debug", skip_all, fields(image = %image))]
pub async fn recognize_once(
    factory: Arc<dyn OcrEngineFactory>,
    settings: &PoolSettings,
    image: ImageRef,
) -> Result<RecognitionResult, HandlerError> {
    let scheduler = Scheduler::new(factory, settings.config.clone());
    let result = async {
        scheduler
            .initialize(settings.workers, &settings.languages)
            .await?;
        let options = JobOptions::default();
        let handle = scheduler.submit(image.clone(), options.clone());
        Ok::<_, HandlerError>(
            wait_with_retries(&scheduler, handle, &image, &options, settings.retries)
                .await?,
        )
    }
    .await;
    scheduler.terminate().await;
    result
}

/// Fetch a stored image and run OCR on it.
#[instrument(level = "debug", skip(store, factory, settings))]
pub async fn get_image_with_text(
    store: &dyn BlobStore,
    factory: Arc<dyn OcrEngineFactory>,
    settings: &PoolSettings,
    id: &str,
) -> Result<ImageWithText, HandlerError> {
    if id.trim().is_empty() {
        return Err(HandlerError::MissingId);
    }
    let image = store.describe(id).await?;
    let bytes = store.fetch(id).await?;
    let result = recognize_once(factory, settings, ImageRef::from_bytes(id, bytes)).await?;
    info!(%id, chars = result.text.len(), "Recognized image");
    Ok(ImageWithText {
        image,
        text: result.text,
        confidence: result.confidence,
    })
}

/// Store a new PNG or JPEG image.
#[instrument(level = "debug", skip(store))]
pub async fn upload_image(
    store: &dyn BlobStore,
    path: &Path,
) -> Result<StoredImage, HandlerError> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))
        .map_err(BlobError::from)?;
    let image = ImageData::new(bytes);
    match image.mime_type() {
        Some(mime_type) if ACCEPTED_MIME_TYPES.contains(&mime_type) => {}
        other => {
            return Err(HandlerError::UnsupportedImageType(
                other.unwrap_or("unknown").to_owned(),
            ));
        }
    }
    let stored = store.store(path).await?;
    info!(id = %stored.id, "Uploaded image");
    Ok(stored)
}

/// List stored images.
pub async fn list_images(store: &dyn BlobStore) -> Result<Vec<StoredImage>, HandlerError> {
    Ok(store.list().await?)
}

/// Delete a stored image.
#[instrument(level = "debug", skip(store))]
pub async fn delete_image(store: &dyn BlobStore, id: &str) -> Result<(), HandlerError> {
    if id.trim().is_empty() {
        return Err(HandlerError::MissingId);
    }
    store.delete(id).await?;
    info!(%id, "Deleted image");
    Ok(())
}
