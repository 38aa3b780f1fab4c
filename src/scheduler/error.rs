//! Errors reported by the scheduler.
//!
//! Setup errors stay with the worker that hit them, unless every worker fails.
//! Execution errors are delivered to the job that hit them, through its
//! completion slot.

use std::time::Duration;

use thiserror::Error;

use crate::engines::EngineError;

use super::{SchedulerState, WorkerId, WorkerState};

/// A worker failed to reach [`WorkerState::Ready`].
#[derive(Debug, Error)]
pub enum WorkerSetupError {
    #[error("worker {worker} could not load its OCR engine: {error}")]
    EngineLoad { worker: WorkerId, error: EngineError },

    #[error("worker {worker} could not load language {language:?}: {error}")]
    LanguageLoad {
        worker: WorkerId,
        language: String,
        error: EngineError,
    },

    #[error("worker {worker} could not initialize: {error}")]
    Initialization { worker: WorkerId, error: EngineError },

    #[error("worker {worker} cannot {operation} while {state}")]
    InvalidState {
        worker: WorkerId,
        operation: &'static str,
        state: WorkerState,
    },

    #[error("worker {worker} exited before finishing setup")]
    Crashed { worker: WorkerId },
}

/// A pool could not be brought up.
#[derive(Debug, Error)]
pub enum PoolInitializationError {
    #[error("a pool needs at least one worker")]
    NoWorkers,

    #[error("a pool needs at least one language")]
    NoLanguages,

    #[error("invalid language code {0:?}")]
    InvalidLanguage(String),

    #[error("cannot initialize a pool that is {0}")]
    InvalidState(SchedulerState),

    #[error("all {} workers failed to start: {}", .failures.len(), join_errors(.failures))]
    AllWorkersFailed { failures: Vec<WorkerSetupError> },

    #[error("pool was terminated while initializing")]
    Terminated,
}

/// Join several errors into one line.
fn join_errors(errors: &[WorkerSetupError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A job did not produce a result.
#[derive(Debug, Error)]
pub enum JobError {
    /// The engine could not recognize this image, but the worker is fine.
    #[error("recognition failed on worker {worker}: {error}")]
    Recognition { worker: WorkerId, error: EngineError },

    /// Fetching and recognizing the image took too long. If recognition had
    /// started, the worker was taken out of service.
    #[error("job on worker {worker} timed out after {after:?}")]
    Timeout { worker: WorkerId, after: Duration },

    /// The worker's engine crashed while running this job.
    #[error("worker {worker} failed while recognizing: {error}")]
    WorkerFailed { worker: WorkerId, error: EngineError },

    /// The image reference could not be turned into bytes.
    #[error("cannot load image {image}: {error:#}")]
    ImageUnavailable { image: String, error: anyhow::Error },

    #[error("job was cancelled")]
    Cancelled,

    #[error("pool is shutting down")]
    PoolShuttingDown,

    #[error("pool is not accepting jobs while {state}")]
    PoolNotReady { state: SchedulerState },

    #[error("no healthy workers remain in the pool")]
    NoHealthyWorkers,

    #[error("no worker in the pool has loaded language {language:?}")]
    UnsupportedLanguage { language: String },

    /// The completion slot was dropped without a result. This indicates a
    /// bug.
    #[error("job was abandoned without a result")]
    Abandoned,
}

impl JobError {
    /// Might running this job again succeed?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Recognition { .. }
                | JobError::Timeout { .. }
                | JobError::WorkerFailed { .. }
        )
    }
}
