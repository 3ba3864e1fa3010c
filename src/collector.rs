use crate::archive::ArchiveWriter;
use crate::array::StoredArray;
use crate::cancel::CancellationToken;
use crate::config::JobPaths;
use crate::fits::write_fits_image;
use crate::progress::Progress;
use crate::queue::{GetError, QueueConsumer};
use crate::result::{FitResult, Summary};
use crate::DreError;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectorReport {
    /// Results taken off the queue, including one that failed to be written.
    pub collected: usize,
    pub succeeded: usize,
    pub dropped: usize,
    pub mosaics: usize,
}

/// What the collector gathered, even when it stopped on an error.
#[derive(Debug)]
pub struct CollectorOutcome {
    pub summary: Summary,
    pub report: CollectorReport,
    pub error: Option<DreError>,
}

/// Drains fit results into the summary table, the score archive and the
/// mosaic directory.
pub struct Collector {
    job: JobPaths,
    n_tasks: usize,
    save_mosaics: bool,
    timeout: Duration,
    status: String,
}

impl Collector {
    pub fn new(job: JobPaths, n_tasks: usize, save_mosaics: bool, timeout: Duration) -> Self {
        Self { job, n_tasks, save_mosaics, timeout, status: String::new() }
    }

    /// Prefix for progress lines, e.g. `(2/5)`.
    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    /// Runs until `n_tasks` results arrived, the job is cancelled, or every
    /// worker is gone. An I/O failure cancels `cancel` and is returned in the
    /// outcome next to the rows collected so far.
    pub fn run(self, output: QueueConsumer<FitResult>, cancel: CancellationToken) -> CollectorOutcome {
        let mut summary = Summary::new(&self.job.name);
        let mut report = CollectorReport::default();
        let mut scores: Option<ArchiveWriter<StoredArray<f32>>> = None;
        let label = format!("{} {}", self.status, self.job.name);
        let mut progress = Progress::new(label.trim_start(), self.n_tasks);
        let mut error = None;

        while report.collected < self.n_tasks && !cancel.is_cancelled() {
            let result = match output.get(self.timeout) {
                Ok(r) => r,
                Err(GetError::Timeout) => continue,
                Err(GetError::Disconnected) => {
                    tracing::warn!(
                        "{}: workers exited after {}/{} results",
                        self.job.name,
                        report.collected,
                        self.n_tasks
                    );
                    break;
                }
                Err(GetError::Released) => break,
            };
            if cancel.is_cancelled() {
                output.task_done();
                break;
            }
            let handled = self.handle(result, &mut summary, &mut scores, &mut report);
            output.task_done();
            report.collected += 1;
            if let Err(e) = handled {
                tracing::error!("{}: {}", self.job.name, e);
                cancel.cancel();
                error = Some(e);
                break;
            }
            progress.advance();
        }

        if let Some(writer) = scores {
            if let Err(e) = writer.finish() {
                error.get_or_insert(e);
            }
        }
        CollectorOutcome { summary, report, error }
    }

    fn handle(
        &self,
        result: FitResult,
        summary: &mut Summary,
        scores: &mut Option<ArchiveWriter<StoredArray<f32>>>,
        report: &mut CollectorReport,
    ) -> Result<(), DreError> {
        match result {
            FitResult::Success { object_id, parameters, score_cube, mosaic } => {
                let writer = match scores {
                    Some(w) => w,
                    None => scores.insert(ArchiveWriter::create(&self.job.output)?),
                };
                writer.append(object_id.as_str(), &StoredArray::from_array(&score_cube))?;
                summary.append(parameters);
                report.succeeded += 1;

                if let (true, Some(mosaic)) = (self.save_mosaics, mosaic) {
                    fs::create_dir_all(&self.job.mosaics)?;
                    write_fits_image(
                        &self.job.mosaic_file(object_id.as_str()),
                        &mosaic,
                        &[("object", object_id.as_str()), ("tile", &self.job.name)],
                    )?;
                    report.mosaics += 1;
                }
            }
            FitResult::Failure { object_id, .. } => {
                tracing::debug!("{}: {} has no valid fit, dropped", self.job.name, object_id);
                report.dropped += 1;
            }
        }
        Ok(())
    }
}
