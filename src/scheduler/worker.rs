//! OCR workers.
//!
//! A [`Worker`] owns one engine instance and enforces its lifecycle:
//!
//! ```text
//! Created -> Loading -> LanguageLoading -> Ready <-> Busy
//!                                            |
//!                  Terminating -> Terminated  |  Failed
//! ```
//!
//! Each worker runs in its own task (see [`run_worker`]), which receives jobs
//! from the scheduler one at a time and reports back after each one.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{
    FutureExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};
use schemars::JsonSchema;
use tokio::time::{self, Instant};

use crate::{
    engines::{EngineError, EngineOutput, OcrEngine},
    image_ref::ImageData,
    prelude::*,
};

use super::{
    JobError, Shared, WorkerSetupError,
    job::{Job, RecognitionResult},
};

/// Identifies a worker within its pool. Never reused, so replacement workers
/// get fresh ids.
#[derive(
    Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub(crate) fn new(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a worker is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Loading,
    LanguageLoading,
    Ready,
    Busy,
    Terminating,
    Terminated,
    Failed,
}

impl WorkerState {
    /// Is this worker ready, working, or on its way to being ready?
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            WorkerState::Created
                | WorkerState::Loading
                | WorkerState::LanguageLoading
                | WorkerState::Ready
                | WorkerState::Busy
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::Loading => "loading",
            WorkerState::LanguageLoading => "loading languages",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Terminating => "terminating",
            WorkerState::Terminated => "terminated",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One OCR engine instance plus its lifecycle state.
pub struct Worker {
    id: WorkerId,
    state: WorkerState,
    engine: Box<dyn OcrEngine>,

    /// Loaded languages, primary first once initialized.
    languages: Vec<String>,

    /// Has `engine.terminate()` been called?
    engine_released: bool,
}

impl Worker {
    /// Wrap a freshly created engine.
    pub fn new(id: WorkerId, engine: Box<dyn OcrEngine>) -> Self {
        Self {
            id,
            state: WorkerState::Created,
            engine,
            languages: vec![],
            engine_released: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    fn invalid_state(&self, operation: &'static str) -> WorkerSetupError {
        error!(worker = %self.id, state = %self.state, operation, "Invalid worker state");
        WorkerSetupError::InvalidState {
            worker: self.id,
            operation,
            state: self.state,
        }
    }

    /// Start the engine.
    pub async fn load(&mut self) -> Result<(), WorkerSetupError> {
        if self.state != WorkerState::Created {
            return Err(self.invalid_state("load"));
        }
        self.state = WorkerState::Loading;
        debug!(worker = %self.id, engine = self.engine.name(), "Loading engine");
        match self.engine.load().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.state = WorkerState::Failed;
                Err(WorkerSetupError::EngineLoad {
                    worker: self.id,
                    error,
                })
            }
        }
    }

    /// Load model data for `language`. May be called once per language.
    pub async fn load_language(&mut self, language: &str) -> Result<(), WorkerSetupError> {
        if !matches!(
            self.state,
            WorkerState::Loading | WorkerState::LanguageLoading
        ) {
            return Err(self.invalid_state("load a language"));
        }
        self.state = WorkerState::LanguageLoading;
        debug!(worker = %self.id, language, "Loading language");
        match self.engine.load_language(language).await {
            Ok(()) => {
                if !self.languages.iter().any(|l| l == language) {
                    self.languages.push(language.to_owned());
                }
                Ok(())
            }
            Err(error) => {
                self.state = WorkerState::Failed;
                Err(WorkerSetupError::LanguageLoad {
                    worker: self.id,
                    language: language.to_owned(),
                    error,
                })
            }
        }
    }

    /// Finish setup with `language` as the primary language.
    pub async fn initialize(&mut self, language: &str) -> Result<(), WorkerSetupError> {
        if self.state != WorkerState::LanguageLoading {
            return Err(self.invalid_state("initialize"));
        }
        let Some(primary_idx) = self.languages.iter().position(|l| l == language) else {
            self.state = WorkerState::Failed;
            return Err(WorkerSetupError::Initialization {
                worker: self.id,
                error: EngineError::Fatal(anyhow!(
                    "primary language {language:?} was never loaded"
                )),
            });
        };
        let primary = self.languages.remove(primary_idx);
        self.languages.insert(0, primary);

        match self.engine.initialize(&self.languages).await {
            Ok(()) => {
                self.state = WorkerState::Ready;
                debug!(worker = %self.id, languages = ?self.languages, "Worker ready");
                Ok(())
            }
            Err(error) => {
                self.state = WorkerState::Failed;
                Err(WorkerSetupError::Initialization {
                    worker: self.id,
                    error,
                })
            }
        }
    }

    /// Recognize text in `image`. Only valid while [`WorkerState::Ready`].
    ///
    /// A fatal engine error leaves the worker [`WorkerState::Failed`]; any
    /// other error leaves it ready for the next job.
    pub async fn recognize(
        &mut self,
        image: &ImageData,
        languages: &[String],
    ) -> Result<EngineOutput, EngineError> {
        if self.state != WorkerState::Ready {
            return Err(EngineError::Transient(anyhow!(
                "worker {} cannot recognize while {}",
                self.id,
                self.state
            )));
        }
        self.state = WorkerState::Busy;
        let result = self.engine.recognize(image, languages).await;
        self.state = match &result {
            Err(error) if error.is_fatal() => WorkerState::Failed,
            _ => WorkerState::Ready,
        };
        result
    }

    /// Take the worker out of service after an in-flight recognition was
    /// abandoned.
    pub fn mark_failed(&mut self) {
        self.state = WorkerState::Failed;
    }

    /// Release the engine. A failed worker stays [`WorkerState::Failed`] so
    /// the failure remains visible.
    pub async fn terminate(&mut self) {
        if self.engine_released {
            return;
        }
        let failed = match self.state {
            WorkerState::Terminated => return,
            WorkerState::Failed => true,
            WorkerState::Busy => {
                // Only reachable if a recognition future was dropped without
                // calling `mark_failed`.
                warn!(worker = %self.id, "Terminating a worker with an abandoned job");
                true
            }
            _ => false,
        };
        if !failed {
            self.state = WorkerState::Terminating;
        }
        if let Err(err) = self.engine.terminate().await {
            warn!(worker = %self.id, %err, "Engine did not shut down cleanly");
        }
        self.engine_released = true;
        self.languages.clear();
        self.state = if failed {
            WorkerState::Failed
        } else {
            WorkerState::Terminated
        };
    }
}

/// Pull a readable message out of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Run `load`, `load_language` for each language, then `initialize`.
async fn set_up(
    shared: &Shared,
    worker: &mut Worker,
    languages: &[String],
) -> Result<(), WorkerSetupError> {
    worker.load().await?;
    shared.publish_state(worker.id(), worker.state());
    for language in languages {
        worker.load_language(language).await?;
        shared.publish_state(worker.id(), worker.state());
    }
    let primary = languages
        .first()
        .ok_or_else(|| WorkerSetupError::Initialization {
            worker: worker.id(),
            error: EngineError::Fatal(anyhow!("no languages to load")),
        })?;
    worker.initialize(primary).await
}

/// How a single recognition attempt ended.
enum Attempt {
    Finished(Result<EngineOutput, EngineError>),
    Panicked(String),
    TimedOut(Duration),
}

/// Run one job on `worker` and resolve its completion slot. Returns a
/// description of the failure if the worker was taken out of service.
async fn run_job(
    shared: &Shared,
    worker: &mut Worker,
    job: Job,
    timeout: Option<Duration>,
) -> Option<String> {
    let worker_id = worker.id();
    debug!(worker = %worker_id, job = %job.id, image = %job.image, "Starting job");

    // One time budget covers both fetching and recognizing the image.
    let started = Instant::now();
    let fetch = job.image.resolve(shared.http_client());
    let fetched = match timeout {
        Some(limit) => time::timeout(limit, fetch).await.map_err(|_| limit),
        None => Ok(fetch.await),
    };
    let image = match fetched {
        Ok(Ok(image)) => image,
        Ok(Err(error)) => {
            let image = job.image.to_string();
            job.complete(Err(JobError::ImageUnavailable { image, error }));
            return None;
        }
        Err(after) => {
            // The engine was never involved, so the worker stays in service.
            warn!(worker = %worker_id, image = %job.image, ?after, "Fetching image timed out");
            job.complete(Err(JobError::Timeout {
                worker: worker_id,
                after,
            }));
            return None;
        }
    };

    let recognize = AssertUnwindSafe(worker.recognize(&image, &job.options.languages))
        .catch_unwind()
        .map(|result| match result {
            Ok(result) => Attempt::Finished(result),
            Err(payload) => Attempt::Panicked(panic_message(payload.as_ref())),
        });
    let attempt = match timeout {
        Some(limit) => time::timeout(limit.saturating_sub(started.elapsed()), recognize)
            .await
            .unwrap_or(Attempt::TimedOut(limit)),
        None => recognize.await,
    };

    let result = match attempt {
        Attempt::Finished(Ok(output)) => {
            Ok(RecognitionResult::new(job.id, worker_id, output))
        }
        Attempt::Finished(Err(error)) if error.is_fatal() => {
            error!(worker = %worker_id, %error, "Engine failed; taking worker out of service");
            Err(JobError::WorkerFailed {
                worker: worker_id,
                error,
            })
        }
        Attempt::Finished(Err(error)) => Err(JobError::Recognition {
            worker: worker_id,
            error,
        }),
        Attempt::Panicked(msg) => {
            error!(worker = %worker_id, panic = %msg, "Engine panicked; taking worker out of service");
            worker.mark_failed();
            Err(JobError::WorkerFailed {
                worker: worker_id,
                error: EngineError::Fatal(anyhow!("engine panicked: {msg}")),
            })
        }
        Attempt::TimedOut(after) => {
            warn!(worker = %worker_id, ?after, "Recognition timed out; taking worker out of service");
            worker.mark_failed();
            Err(JobError::Timeout {
                worker: worker_id,
                after,
            })
        }
    };
    let failure = match &result {
        Err(err @ (JobError::WorkerFailed { .. } | JobError::Timeout { .. })) => {
            Some(err.to_string())
        }
        _ => None,
    };
    job.complete(result);
    failure
}

/// The body of a worker task.
///
/// Sets the worker up, reports the outcome through `setup_tx` (if anyone is
/// listening), then runs jobs until the scheduler closes `assignments` or the
/// worker fails. The engine is always terminated before the task exits.
#[instrument(level = "debug", name = "worker", skip_all, fields(worker = %worker.id()))]
pub(super) async fn run_worker(
    shared: Arc<Shared>,
    mut worker: Worker,
    languages: Vec<String>,
    mut assignments: mpsc::UnboundedReceiver<Job>,
    setup_tx: Option<oneshot::Sender<Result<(), WorkerSetupError>>>,
) {
    let id = worker.id();
    let setup = AssertUnwindSafe(set_up(&shared, &mut worker, &languages))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            worker.mark_failed();
            Err(WorkerSetupError::Initialization {
                worker: id,
                error: EngineError::Fatal(anyhow!(
                    "engine panicked: {}",
                    panic_message(payload.as_ref())
                )),
            })
        });

    if let Err(err) = &setup {
        warn!(worker = %id, %err, "Worker setup failed");
        worker.terminate().await;
    }
    shared.finish_setup(id, worker.state(), worker.languages(), setup.as_ref().err());
    if let Some(setup_tx) = setup_tx {
        // `initialize` may have given up on us; that's fine.
        let _ = setup_tx.send(setup);
    }
    if worker.state() != WorkerState::Ready {
        return;
    }

    let timeout = shared.config().recognize_timeout;
    while let Some(job) = assignments.next().await {
        let failure = run_job(&shared, &mut worker, job, timeout).await;
        if worker.state() != WorkerState::Ready {
            // Release the engine before telling the scheduler, so that
            // `terminate` never sees a failed worker still holding one.
            worker.terminate().await;
        }
        if !shared.finish_job(id, worker.state(), failure) {
            break;
        }
    }

    worker.terminate().await;
    shared.finish_worker(id, worker.state());
    debug!(worker = %id, state = %worker.state(), "Worker stopped");
}
