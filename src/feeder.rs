use crate::cancel::CancellationToken;
use crate::cutout::{CutoutArchive, ObjectId};
use crate::queue::{PutError, QueueProducer, WorkMessage};
use crate::DreError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedReport {
    pub submitted: usize,
    pub sentinels: usize,
    /// Every item went out and the sentinels followed.
    pub completed: bool,
}

/// Pushes the cutouts of one archive onto the input queue.
pub struct Feeder {
    archive_path: PathBuf,
    object_ids: Vec<ObjectId>,
    n_workers: usize,
    timeout: Duration,
}

impl Feeder {
    pub fn new(
        archive_path: PathBuf,
        object_ids: Vec<ObjectId>,
        n_workers: usize,
        timeout: Duration,
    ) -> Self {
        Self { archive_path, object_ids, n_workers, timeout }
    }

    pub fn run(
        self,
        input: QueueProducer<WorkMessage>,
        cancel: CancellationToken,
    ) -> Result<FeedReport, DreError> {
        let mut archive = CutoutArchive::open(&self.archive_path)?;
        let mut report = FeedReport::default();

        for object_id in &self.object_ids {
            let message = match archive.load(object_id) {
                Ok(item) => WorkMessage::Item(item),
                Err(e) => {
                    tracing::warn!("{}: unreadable cutout ({}), it will be dropped", object_id, e);
                    WorkMessage::Unreadable(object_id.clone())
                }
            };
            if !self.put_retrying(&input, message, true, &cancel) {
                return Ok(report);
            }
            report.submitted += 1;
        }

        for _ in 0..self.n_workers {
            if !self.put_retrying(&input, WorkMessage::Stop, false, &cancel) {
                return Ok(report);
            }
            report.sentinels += 1;
        }
        report.completed = true;
        Ok(report)
    }

    /// Retry on timeout until the message is queued. False once cancelled or
    /// nobody is left to consume.
    fn put_retrying(
        &self,
        input: &QueueProducer<WorkMessage>,
        mut message: WorkMessage,
        tracked: bool,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let sent = if tracked {
                input.put(message, self.timeout)
            } else {
                input.put_untracked(message, self.timeout)
            };
            match sent {
                Ok(()) => return true,
                Err(PutError::Timeout(m)) => message = m,
                Err(PutError::Disconnected(_)) => {
                    tracing::warn!("Input queue has no consumers left, feeder stopping");
                    return false;
                }
                Err(PutError::Released(_)) => return false,
            }
        }
    }
}
