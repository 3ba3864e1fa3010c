//! Per-file job state machine and the directory driver.
//!
//! One file goes `Idle -> Convolving -> Running -> Draining -> Done`. A
//! missing PSF ends the file in `Done` straight from `Convolving`; a user
//! interrupt lands in `Aborted` after every thread has been joined.

use crate::cancel::CancellationToken;
use crate::collector::{Collector, CollectorOutcome};
use crate::config::{CUTS_SUFFIX, EngineConfig, JobPaths};
use crate::cutout::CutoutArchive;
use crate::feeder::{FeedReport, Feeder};
use crate::kernel::{ChiSquareKernel, FitKernel};
use crate::model_store::{ModelStore, SharedModels};
use crate::psf::PsfConvolver;
use crate::queue::{AckState, work_queue_pair};
use crate::result::Summary;
use crate::worker::{PoolReport, Worker, WorkerPool};
use crate::DreError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Convolving,
    Running,
    Draining,
    Done,
    Aborted,
}

#[derive(Debug)]
struct Job<'a> {
    name: &'a str,
    state: JobState,
}

impl<'a> Job<'a> {
    fn new(name: &'a str) -> Self {
        Self { name, state: JobState::Idle }
    }

    fn enter(&mut self, next: JobState) {
        tracing::debug!("{}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub name: String,
    pub state: JobState,
    pub submitted: usize,
    pub acknowledged: usize,
    pub collected: usize,
    pub succeeded: usize,
    pub crashed_workers: usize,
    pub elapsed: Duration,
}

impl JobReport {
    /// Objects per second over the whole job.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.collected as f64 / secs } else { 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Completed(JobReport),
    Skipped { name: String, reason: String },
    /// An I/O failure ended this file; the run moves on to the next one.
    Failed { name: String, reason: String },
    Aborted(Option<JobReport>),
}

impl FileOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, FileOutcome::Aborted(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub files: Vec<FileOutcome>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.files.iter().filter(|f| matches!(f, FileOutcome::Completed(_))).count()
    }

    pub fn skipped(&self) -> usize {
        self.files.iter().filter(|f| matches!(f, FileOutcome::Skipped { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.files.iter().filter(|f| matches!(f, FileOutcome::Failed { .. })).count()
    }

    pub fn aborted(&self) -> bool {
        self.files.iter().any(FileOutcome::is_aborted)
    }
}

/// Input archives in `dir`, sorted by file name.
pub fn input_files(dir: &Path) -> Result<Vec<PathBuf>, DreError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(CUTS_SUFFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

pub struct Engine {
    config: EngineConfig,
    models: SharedModels,
    kernel: Arc<dyn FitKernel>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, models: SharedModels, kernel: Arc<dyn FitKernel>) -> Self {
        Self { config, models, kernel, cancel: CancellationToken::new() }
    }

    /// Loads the model file with the reference chi-square kernel. Any failure
    /// here is fatal for the run.
    pub fn load(config: EngineConfig, model_path: &Path) -> Result<Self, DreError> {
        config.validate()?;
        let models = ModelStore::load(model_path)?;
        let [ne, nt, nr, na] = models.grid_shape();
        let (ny, nx) = models.image_shape();
        tracing::info!(
            "Loaded {} models ({}x{}x{}x{}) of {}x{} pixels from {}",
            models.n_models(),
            ne,
            nt,
            nr,
            na,
            ny,
            nx,
            model_path.display()
        );
        Ok(Self::new(config, models.shared(), Arc::new(ChiSquareKernel)))
    }

    /// Share the run's cancellation token, e.g. with a signal handler.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn models(&self) -> &SharedModels {
        &self.models
    }

    /// Fit every input archive of the input directory, in sorted order.
    /// Stops after the first aborted file. Only a model load failure or a
    /// crashed worker ends the run with an error.
    pub fn fit_dir(&self) -> Result<RunReport, DreError> {
        let start = Instant::now();
        let paths = &self.config.paths;
        fs::create_dir_all(&paths.output_dir)?;
        let files = input_files(&paths.input_dir)?;
        tracing::info!("{} input file(s) in {}", files.len(), paths.input_dir.display());

        let mut report = RunReport::default();
        for (i, file) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let status = format!("({}/{})", i + 1, files.len());
            let job = paths.job_paths(file);
            let outcome = match self.fit_file(&job, &status) {
                Ok(outcome) => outcome,
                Err(e @ (DreError::ModelLoad(_) | DreError::WorkerCrashed(_))) => return Err(e),
                Err(e) => {
                    tracing::warn!("{} {}: failed ({}), moving on", status, job.name, e);
                    FileOutcome::Failed { name: job.name.clone(), reason: e.to_string() }
                }
            };
            let aborted = outcome.is_aborted();
            report.files.push(outcome);
            if aborted {
                tracing::warn!("Run aborted, {} file(s) not processed", files.len() - i - 1);
                break;
            }
        }
        report.elapsed = start.elapsed();
        tracing::info!(
            "Done: {} fitted, {} skipped, {} failed in {:.1}s",
            report.completed(),
            report.skipped(),
            report.failed(),
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    pub fn fit_file(&self, job: &JobPaths, status: &str) -> Result<FileOutcome, DreError> {
        let start = Instant::now();
        let mut state = Job::new(&job.name);
        tracing::info!("{} {}", status, job.name);

        if job.output.exists() {
            fs::remove_file(&job.output)?;
        }

        let object_ids = match CutoutArchive::open(&job.input) {
            Ok(archive) => archive.object_ids(),
            Err(e) => {
                tracing::warn!("{} {}: unreadable input ({}), skipping", status, job.name, e);
                state.enter(JobState::Done);
                return Ok(FileOutcome::Skipped { name: job.name.clone(), reason: e.to_string() });
            }
        };

        state.enter(JobState::Convolving);
        let convolve_start = Instant::now();
        let convolved = match PsfConvolver::new(self.config.n_proc).convolve(
            &self.models,
            &job.psf,
            &self.cancel,
        ) {
            Ok(c) => c,
            Err(DreError::PsfNotFound(p)) => {
                tracing::warn!("{} {}: PSF {} not found, skipping", status, job.name, p.display());
                state.enter(JobState::Done);
                return Ok(FileOutcome::Skipped {
                    name: job.name.clone(),
                    reason: format!("PSF {} not found", p.display()),
                });
            }
            Err(DreError::Cancelled) => {
                tracing::warn!("{} {}: aborted during convolution", status, job.name);
                state.enter(JobState::Aborted);
                return Ok(FileOutcome::Aborted(None));
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            "{} {}: convolved in {:.2}s",
            status,
            job.name,
            convolve_start.elapsed().as_secs_f64()
        );

        let n_tasks = object_ids.len();
        state.enter(JobState::Running);
        let timeout = self.config.poll_timeout();
        let job_cancel = self.cancel.child();
        let (input_tx, input_rx) = work_queue_pair("input", Some(self.config.queue_capacity));
        let (output_tx, output_rx) = work_queue_pair("output", None);
        let input_state = input_tx.state().clone();
        let output_state = output_tx.state().clone();

        let feeder = {
            let feeder = Feeder::new(job.input.clone(), object_ids, self.config.n_proc, timeout);
            let cancel = job_cancel.clone();
            spawn_named("dre-feeder", move || feeder.run(input_tx, cancel))?
        };
        let worker = Worker::new(convolved, self.kernel.clone(), self.config.save_mosaics, timeout);
        let pool = WorkerPool::spawn(self.config.n_proc, worker, input_rx, output_tx, &job_cancel)?;
        let collector = {
            let collector = Collector::new(job.clone(), n_tasks, self.config.save_mosaics, timeout)
                .with_status(status);
            let cancel = job_cancel.clone();
            spawn_named("dre-collector", move || collector.run(output_rx, cancel))?
        };

        let feed = join_feeder(feeder);
        state.enter(JobState::Draining);
        let settled = wait_for_acks(&input_state, &pool, &job_cancel, timeout);
        if job_cancel.is_cancelled() {
            input_state.release();
            output_state.release();
        }
        let pool_report = pool.join();
        if job_cancel.is_cancelled() {
            output_state.release();
        }
        let CollectorOutcome { summary, report: collected, error } = join_collector(collector, &job.name);

        if !settled && !job_cancel.is_cancelled() {
            tracing::warn!(
                "{} {}: {} queue not settled, {}/{} acknowledged",
                status,
                job.name,
                input_state.name(),
                input_state.acknowledged(),
                input_state.submitted()
            );
        }

        let aborted = self.cancel.is_cancelled();
        state.enter(if aborted { JobState::Aborted } else { JobState::Done });
        let persisted = self.persist(&summary, job);

        let report = JobReport {
            name: job.name.clone(),
            state: state.state,
            submitted: feed.submitted,
            acknowledged: input_state.acknowledged(),
            collected: collected.collected,
            succeeded: collected.succeeded,
            crashed_workers: pool_report.crashed,
            elapsed: start.elapsed(),
        };
        log_report(status, &report, &pool_report);

        if pool_report.crashed > 0 {
            return Err(DreError::WorkerCrashed(pool_report.crashed));
        }
        if aborted {
            return Ok(FileOutcome::Aborted(Some(report)));
        }
        if let Some(e) = error.or(persisted.err()) {
            tracing::warn!("{} {}: failed after {} result(s): {}", status, job.name, report.collected, e);
            return Ok(FileOutcome::Failed { name: job.name.clone(), reason: e.to_string() });
        }
        Ok(FileOutcome::Completed(report))
    }

    fn persist(&self, summary: &Summary, job: &JobPaths) -> Result<(), DreError> {
        summary.save(&job.summary)?;
        tracing::info!(
            "{}: {} row(s) written to {}",
            summary.name(),
            summary.len(),
            job.summary.display()
        );
        Ok(())
    }
}

fn spawn_named<T, F>(name: &str, f: F) -> Result<JoinHandle<T>, DreError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Ok(std::thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Completion check for the input queue: every submitted item acknowledged.
/// Gives up early on cancellation or once no worker is left to acknowledge.
fn wait_for_acks(
    state: &AckState,
    pool: &WorkerPool,
    cancel: &CancellationToken,
    poll: Duration,
) -> bool {
    loop {
        if cancel.is_cancelled() {
            return state.is_settled();
        }
        if state.wait_settled(poll) {
            return true;
        }
        if pool.is_finished() {
            return state.is_settled();
        }
    }
}

fn join_feeder(handle: JoinHandle<Result<FeedReport, DreError>>) -> FeedReport {
    match handle.join() {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            tracing::error!("Feeder failed: {}", e);
            FeedReport::default()
        }
        Err(_) => {
            tracing::error!("Feeder thread panicked");
            FeedReport::default()
        }
    }
}

fn join_collector(handle: JoinHandle<CollectorOutcome>, name: &str) -> CollectorOutcome {
    match handle.join() {
        Ok(outcome) => outcome,
        Err(_) => CollectorOutcome {
            summary: Summary::new(name),
            report: Default::default(),
            error: Some(DreError::Other(format!("{}: collector thread panicked", name))),
        },
    }
}

fn log_report(status: &str, report: &JobReport, pool: &PoolReport) {
    tracing::info!(
        "{} {}: {} fitted of {} submitted ({} acknowledged, {} processed) in {:.1}s, {:.1} objects/s",
        status,
        report.name,
        report.succeeded,
        report.submitted,
        report.acknowledged,
        pool.processed(),
        report.elapsed.as_secs_f64(),
        report.throughput()
    );
    if report.state == JobState::Aborted {
        tracing::warn!("{} {}: aborted, partial summary kept", status, report.name);
    }
}
