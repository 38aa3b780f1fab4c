//! A pool of OCR workers fed from a FIFO job queue.
//!
//! ```text
//! Uninitialized -> Initializing -> Operational -> Terminating -> Terminated
//! ```
//!
//! All bookkeeping lives in one [`Mutex`], which is never held across an
//! `.await`. Each worker runs in its own task and owns its engine. The
//! scheduler pushes jobs to idle workers over per-worker channels, and workers
//! report back after setup and after each job, at which point the scheduler
//! hands out more work.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{
    channel::{mpsc, oneshot},
    future::join_all,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    engines::{OcrEngineFactory, is_valid_language_code},
    image_ref::ImageRef,
    prelude::*,
};

use self::{
    job::Job,
    worker::{Worker, run_worker},
};

pub use self::{
    error::{JobError, PoolInitializationError, WorkerSetupError},
    job::{JobHandle, JobId, JobOptions, JobResult, RecognitionResult},
    worker::{WorkerId, WorkerState},
};

mod error;
mod job;
mod worker;

/// Where a [`Scheduler`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    Initializing,
    Operational,
    Terminating,
    Terminated,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Uninitialized => "uninitialized",
            SchedulerState::Initializing => "initializing",
            SchedulerState::Operational => "operational",
            SchedulerState::Terminating => "terminating",
            SchedulerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Scheduler settings.
#[derive(Clone, Debug, Default)]
pub struct SchedulerConfig {
    /// Give up on a recognition after this long. The worker which was running
    /// it is taken out of service.
    pub recognize_timeout: Option<Duration>,

    /// Start a new worker whenever one fails while running a job.
    pub replace_failed_workers: bool,
}

/// What [`Scheduler::initialize`] returns when at least one worker is ready.
#[derive(Debug)]
pub struct PoolReady {
    /// How many workers are ready.
    pub capacity: usize,

    /// Why the other workers failed.
    pub failures: Vec<WorkerSetupError>,
}

/// A point-in-time view of one worker.
#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub state: WorkerState,
    pub languages: Vec<String>,
    pub current_job: Option<JobId>,
    pub jobs_completed: u64,
    pub last_error: Option<String>,
}

/// A point-in-time view of the whole pool.
#[derive(Clone, Debug)]
pub struct PoolSnapshot {
    pub state: SchedulerState,
    pub pending_jobs: usize,
    pub workers: Vec<WorkerSnapshot>,
}

impl PoolSnapshot {
    /// How many workers could take a job right now or after their current
    /// one.
    pub fn capacity(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Ready | WorkerState::Busy))
            .count()
    }
}

/// The scheduler's view of one worker.
struct WorkerSlot {
    state: WorkerState,
    languages: Vec<String>,

    /// Where to send jobs. `None` once the worker can't accept any more.
    assignments: Option<mpsc::UnboundedSender<Job>>,

    current_job: Option<JobId>,
    jobs_completed: u64,
    last_error: Option<String>,
}

impl WorkerSlot {
    fn new(assignments: mpsc::UnboundedSender<Job>) -> Self {
        Self {
            state: WorkerState::Created,
            languages: vec![],
            assignments: Some(assignments),
            current_job: None,
            jobs_completed: 0,
            last_error: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.state == WorkerState::Ready
            && self.current_job.is_none()
            && self.assignments.is_some()
    }

    /// Is this worker running, or still setting up?
    fn is_prospective(&self) -> bool {
        self.state.is_healthy() && self.assignments.is_some()
    }

    fn supports(&self, job: &Job) -> bool {
        job.options
            .languages
            .iter()
            .all(|language| self.languages.contains(language))
    }

    fn fail(&mut self, reason: String) {
        self.state = WorkerState::Failed;
        self.assignments = None;
        self.last_error = Some(reason);
    }
}

/// State protected by [`Shared::inner`].
struct Inner {
    state: SchedulerState,
    languages: Vec<String>,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    pending: VecDeque<Job>,
    next_job_id: u64,
    next_worker_id: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    fn has_prospective_worker(&self) -> bool {
        self.workers.values().any(WorkerSlot::is_prospective)
    }

    /// Hand queued jobs to idle workers, lowest worker id first.
    fn dispatch(&mut self) {
        if self.state != SchedulerState::Operational {
            return;
        }
        let idle = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.is_idle())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in idle {
            if self.pending.is_empty() {
                break;
            }
            let Some(slot) = self.workers.get_mut(&id) else {
                continue;
            };
            let Some(pos) = self.pending.iter().position(|job| slot.supports(job)) else {
                continue;
            };
            let Some(job) = self.pending.remove(pos) else {
                continue;
            };
            let Some(assignments) = &slot.assignments else {
                self.pending.insert(pos, job);
                continue;
            };
            let job_id = job.id;
            match assignments.unbounded_send(job) {
                Ok(()) => {
                    trace!(worker = %id, job = %job_id, "Assigned job");
                    slot.state = WorkerState::Busy;
                    slot.current_job = Some(job_id);
                }
                Err(err) => {
                    warn!(worker = %id, "Worker task is gone; taking it out of service");
                    self.pending.insert(pos, err.into_inner());
                    slot.fail("worker task exited unexpectedly".to_owned());
                }
            }
        }
        self.fail_if_no_healthy_workers();
    }

    /// Queued jobs would wait forever if nobody is left to run them.
    fn fail_if_no_healthy_workers(&mut self) {
        if self.pending.is_empty() || self.has_prospective_worker() {
            return;
        }
        error!(jobs = self.pending.len(), "No healthy workers remain; failing queued jobs");
        for job in self.pending.drain(..) {
            job.complete(Err(JobError::NoHealthyWorkers));
        }
    }

    /// Fail queued jobs and tell every worker to stop after its current job.
    fn shut_down(&mut self) {
        for job in self.pending.drain(..) {
            job.complete(Err(JobError::PoolShuttingDown));
        }
        for slot in self.workers.values_mut() {
            slot.assignments = None;
        }
    }
}

/// State shared between the [`Scheduler`], its worker tasks and its job
/// handles.
struct Shared {
    inner: Mutex<Inner>,
    config: SchedulerConfig,
    factory: Arc<dyn OcrEngineFactory>,
    http: reqwest::Client,

    /// Set to `true` once the pool reaches [`SchedulerState::Terminated`].
    terminated: watch::Sender<bool>,
}

impl Shared {
    /// Lock our bookkeeping, even if a thread panicked while holding it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Create a worker and start its task. The worker sets itself up and then
    /// waits for jobs.
    fn spawn_worker(
        self: &Arc<Self>,
        inner: &mut Inner,
        setup_tx: Option<oneshot::Sender<Result<(), WorkerSetupError>>>,
    ) -> WorkerId {
        let id = WorkerId::new(inner.next_worker_id);
        inner.next_worker_id += 1;
        let (assignments_tx, assignments_rx) = mpsc::unbounded();
        inner.workers.insert(id, WorkerSlot::new(assignments_tx));
        let worker = Worker::new(id, self.factory.create_engine(id));
        let task = tokio::spawn(run_worker(
            self.clone(),
            worker,
            inner.languages.clone(),
            assignments_rx,
            setup_tx,
        ));
        inner.tasks.push(task);
        debug!(worker = %id, "Spawned worker");
        id
    }

    /// Record a worker's progress through setup.
    fn publish_state(&self, id: WorkerId, state: WorkerState) {
        if let Some(slot) = self.lock().workers.get_mut(&id) {
            slot.state = state;
        }
    }

    /// Record the outcome of a worker's setup.
    fn finish_setup(
        &self,
        id: WorkerId,
        state: WorkerState,
        languages: &[String],
        error: Option<&WorkerSetupError>,
    ) {
        let mut inner = self.lock();
        if let Some(slot) = inner.workers.get_mut(&id) {
            slot.languages = languages.to_vec();
            match error {
                Some(err) => slot.fail(err.to_string()),
                None => slot.state = state,
            }
        }
        inner.dispatch();
    }

    /// Record that a worker finished its job. Returns `true` if the worker
    /// should wait for another one.
    fn finish_job(
        self: &Arc<Self>,
        id: WorkerId,
        state: WorkerState,
        failure: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.workers.get_mut(&id) else {
            return false;
        };
        slot.current_job = None;
        slot.jobs_completed += 1;
        let ready = state == WorkerState::Ready;
        if ready {
            slot.state = state;
        } else {
            slot.fail(failure.unwrap_or_else(|| format!("worker stopped while {state}")));
            if self.config.replace_failed_workers
                && inner.state == SchedulerState::Operational
            {
                let replacement = self.spawn_worker(&mut inner, None);
                info!(worker = %id, %replacement, "Replacing failed worker");
            }
        }
        inner.dispatch();
        ready
    }

    /// Record a worker's final state after its task stops taking jobs.
    fn finish_worker(&self, id: WorkerId, state: WorkerState) {
        if let Some(slot) = self.lock().workers.get_mut(&id) {
            slot.state = state;
            slot.assignments = None;
            slot.current_job = None;
        }
    }

    /// Remove a queued job, if it hasn't been assigned yet.
    fn cancel(&self, id: JobId) -> bool {
        let mut inner = self.lock();
        let Some(pos) = inner.pending.iter().position(|job| job.id == id) else {
            return false;
        };
        let Some(job) = inner.pending.remove(pos) else {
            return false;
        };
        debug!(job = %id, "Cancelled job");
        job.complete(Err(JobError::Cancelled));
        true
    }
}

/// A pool of OCR workers.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler. No workers are started until
    /// [`Scheduler::initialize`] is called.
    pub fn new(factory: Arc<dyn OcrEngineFactory>, config: SchedulerConfig) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SchedulerState::Uninitialized,
                    languages: vec![],
                    workers: BTreeMap::new(),
                    pending: VecDeque::new(),
                    next_job_id: 0,
                    next_worker_id: 0,
                    tasks: vec![],
                }),
                config,
                factory,
                http: reqwest::Client::new(),
                terminated,
            }),
        }
    }

    /// Start `worker_count` workers and set each of them up with
    /// `languages`. The first language is the primary one.
    ///
    /// Returns once every worker is either ready or failed. Succeeds if at
    /// least one worker is ready.
    #[instrument(level = "debug", skip(self))]
    pub async fn initialize(
        &self,
        worker_count: usize,
        languages: &[String],
    ) -> Result<PoolReady, PoolInitializationError> {
        if worker_count == 0 {
            return Err(PoolInitializationError::NoWorkers);
        }
        if languages.is_empty() {
            return Err(PoolInitializationError::NoLanguages);
        }
        if let Some(invalid) = languages.iter().find(|l| !is_valid_language_code(l)) {
            return Err(PoolInitializationError::InvalidLanguage(invalid.clone()));
        }

        let reports = {
            let mut inner = self.shared.lock();
            if inner.state != SchedulerState::Uninitialized {
                return Err(PoolInitializationError::InvalidState(inner.state));
            }
            inner.state = SchedulerState::Initializing;
            inner.languages = languages.to_vec();
            (0..worker_count)
                .map(|_| {
                    let (setup_tx, setup_rx) = oneshot::channel();
                    let worker = self.shared.spawn_worker(&mut inner, Some(setup_tx));
                    async move {
                        setup_rx
                            .await
                            .unwrap_or(Err(WorkerSetupError::Crashed { worker }))
                    }
                })
                .collect::<Vec<_>>()
        };

        let failures = join_all(reports)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect::<Vec<_>>();

        let mut inner = self.shared.lock();
        if inner.state != SchedulerState::Initializing {
            return Err(PoolInitializationError::Terminated);
        }
        let capacity = inner
            .workers
            .values()
            .filter(|slot| slot.state == WorkerState::Ready)
            .count();
        if capacity == 0 {
            error!(workers = worker_count, "Every worker failed to start");
            inner.state = SchedulerState::Terminated;
            self.shared.terminated.send_replace(true);
            return Err(PoolInitializationError::AllWorkersFailed { failures });
        }
        for failure in &failures {
            warn!(%failure, "Worker unavailable");
        }
        info!(capacity, workers = worker_count, ?languages, "OCR pool ready");
        inner.state = SchedulerState::Operational;
        inner.dispatch();
        Ok(PoolReady { capacity, failures })
    }

    /// Queue `image` for recognition. Never waits for recognition; use
    /// [`JobHandle::wait`] for that.
    ///
    /// If the job can't be accepted, the returned handle resolves to an error
    /// immediately.
    pub fn submit(&self, image: impl Into<ImageRef>, options: JobOptions) -> JobHandle {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.shared.lock();
        let id = JobId::new(inner.next_job_id);
        inner.next_job_id += 1;
        let job = Job::new(id, image.into(), options, tx);
        let handle = JobHandle::new(id, rx, self.shared.clone());
        trace!(job = %id, image = %job.image, "Submitted job");

        let rejection = match inner.state {
            SchedulerState::Operational => job
                .options
                .languages
                .iter()
                .find(|language| !inner.languages.contains(language))
                .map(|language| JobError::UnsupportedLanguage {
                    language: language.clone(),
                })
                .or_else(|| {
                    (!inner.has_prospective_worker()).then_some(JobError::NoHealthyWorkers)
                }),
            SchedulerState::Terminating | SchedulerState::Terminated => {
                Some(JobError::PoolShuttingDown)
            }
            state @ (SchedulerState::Uninitialized | SchedulerState::Initializing) => {
                Some(JobError::PoolNotReady { state })
            }
        };
        match rejection {
            Some(err) => job.complete(Err(err)),
            None => {
                inner.pending.push_back(job);
                inner.dispatch();
            }
        }
        handle
    }

    /// Stop accepting jobs, fail queued jobs, wait for running jobs to finish,
    /// and shut down every worker.
    ///
    /// Safe to call more than once, and from several tasks at once.
    #[instrument(level = "debug", skip(self))]
    pub async fn terminate(&self) {
        let tasks = {
            let mut inner = self.shared.lock();
            match inner.state {
                SchedulerState::Terminated => return,
                SchedulerState::Uninitialized => {
                    inner.state = SchedulerState::Terminated;
                    self.shared.terminated.send_replace(true);
                    return;
                }
                SchedulerState::Terminating => Err(self.shared.terminated.subscribe()),
                SchedulerState::Initializing | SchedulerState::Operational => {
                    debug!(pending = inner.pending.len(), "Terminating OCR pool");
                    inner.state = SchedulerState::Terminating;
                    inner.shut_down();
                    Ok(mem::take(&mut inner.tasks))
                }
            }
        };

        let tasks = match tasks {
            Ok(tasks) => tasks,
            Err(mut terminated) => {
                // Someone else is shutting the pool down.
                if terminated.wait_for(|done| *done).await.is_err() {
                    warn!("Lost track of pool shutdown");
                }
                return;
            }
        };

        for result in join_all(tasks).await {
            if let Err(err) = result {
                error!(%err, "Worker task failed");
            }
        }

        self.shared.lock().state = SchedulerState::Terminated;
        self.shared.terminated.send_replace(true);
        info!("OCR pool terminated");
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        self.shared.lock().state
    }

    /// A point-in-time view of the pool.
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.shared.lock();
        PoolSnapshot {
            state: inner.state,
            pending_jobs: inner.pending.len(),
            workers: inner
                .workers
                .iter()
                .map(|(id, slot)| WorkerSnapshot {
                    id: *id,
                    state: slot.state,
                    languages: slot.languages.clone(),
                    current_job: slot.current_job,
                    jobs_completed: slot.jobs_completed,
                    last_error: slot.last_error.clone(),
                })
                .collect(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Worker tasks hold a reference to `Shared`, which holds their job
        // channels. Closing the channels lets the tasks exit.
        let mut inner = self.shared.lock();
        match inner.state {
            SchedulerState::Terminating | SchedulerState::Terminated => {}
            SchedulerState::Uninitialized => inner.state = SchedulerState::Terminated,
            SchedulerState::Initializing | SchedulerState::Operational => {
                warn!("OCR pool dropped without calling terminate");
                inner.state = SchedulerState::Terminating;
                inner.shut_down();
            }
        }
    }
}
