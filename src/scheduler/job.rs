//! Jobs, job handles and recognition results.

use std::{fmt, sync::Arc};

use futures::channel::oneshot;
use schemars::JsonSchema;

use crate::{
    engines::{EngineOutput, RecognizedWord},
    image_ref::ImageRef,
    prelude::*,
};

use super::{JobError, Shared, WorkerId};

/// Identifies a job. Ids increase in submission order.
#[derive(
    Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub(super) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-job recognition options.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct JobOptions {
    /// Languages to recognize. Empty means the pool's languages.
    #[serde(default)]
    pub languages: Vec<String>,
}

/// The outcome of a job, as delivered through its completion slot.
pub type JobResult = Result<RecognitionResult, JobError>;

/// A queued or running job. Owned by the scheduler's queue, then by the
/// worker it is assigned to.
pub(super) struct Job {
    pub(super) id: JobId,
    pub(super) image: ImageRef,
    pub(super) options: JobOptions,
    completion: oneshot::Sender<JobResult>,
}

impl Job {
    pub(super) fn new(
        id: JobId,
        image: ImageRef,
        options: JobOptions,
        completion: oneshot::Sender<JobResult>,
    ) -> Self {
        Self {
            id,
            image,
            options,
            completion,
        }
    }

    /// Resolve the completion slot. Consuming `self` guarantees this happens
    /// at most once.
    pub(super) fn complete(self, result: JobResult) {
        if let Err(err) = &result {
            debug!(job = %self.id, %err, "Job failed");
        }
        if self.completion.send(result).is_err() {
            debug!(job = %self.id, "Job result dropped because its handle was dropped");
        }
    }
}

/// A handle to a submitted job.
pub struct JobHandle {
    id: JobId,
    rx: oneshot::Receiver<JobResult>,
    shared: Arc<Shared>,
}

impl JobHandle {
    pub(super) fn new(id: JobId, rx: oneshot::Receiver<JobResult>, shared: Arc<Shared>) -> Self {
        Self { id, rx, shared }
    }

    /// The id of this job.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Remove this job from the queue if no worker has picked it up yet.
    /// Returns `true` if the job was cancelled. Jobs that are already running
    /// can't be interrupted.
    pub fn cancel(&self) -> bool {
        self.shared.cancel(self.id)
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> JobResult {
        match self.rx.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(JobError::Abandoned),
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

/// The result of recognizing one image.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct RecognitionResult {
    /// The job which produced this result.
    pub job_id: JobId,

    /// The worker which ran the job.
    pub worker_id: WorkerId,

    /// The extracted text.
    pub text: String,

    /// Mean word confidence, from 0 to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    /// Individual words with their positions.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<RecognizedWord>,
}

impl RecognitionResult {
    pub(super) fn new(job_id: JobId, worker_id: WorkerId, output: EngineOutput) -> Self {
        Self {
            job_id,
            worker_id,
            text: output.text,
            confidence: output.confidence,
            words: output.words,
        }
    }
}
