use crate::cancel::CancellationToken;
use crate::cutout::{ObjectId, WorkItem};
use crate::kernel::{FitKernel, all_nan, best_fit};
use crate::model_store::SharedModels;
use crate::queue::{GetError, PutError, QueueConsumer, QueueProducer, WorkMessage};
use crate::result::{FitParameters, FitResult};
use crate::DreError;
use ndarray::Array4;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Sentinel,
    Cancelled,
    Disconnected,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerReport {
    pub processed: usize,
    pub succeeded: usize,
    pub stopped_by: StopReason,
}

/// Fits cutouts against the convolved cube. Reads shared state only.
#[derive(Clone)]
pub struct Worker {
    models: SharedModels,
    kernel: Arc<dyn FitKernel>,
    save_mosaics: bool,
    timeout: Duration,
}

impl Worker {
    pub fn new(
        models: SharedModels,
        kernel: Arc<dyn FitKernel>,
        save_mosaics: bool,
        timeout: Duration,
    ) -> Self {
        Self { models, kernel, save_mosaics, timeout }
    }

    pub fn process(&self, item: WorkItem) -> FitResult {
        let WorkItem { object_id, cutout } = item;
        let score_cube = self.kernel.fit(&cutout, &self.models);
        if all_nan(&score_cube) {
            return FitResult::Failure { object_id, score_cube };
        }
        let Some((idx, chi)) = best_fit(&score_cube) else {
            return FitResult::Failure { object_id, score_cube };
        };
        let parameters = match FitParameters::new(&object_id, idx, chi, &self.models) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("{}: dropping fit, {}", object_id, e);
                return FitResult::Failure { object_id, score_cube };
            }
        };
        let mosaic = self
            .save_mosaics
            .then(|| self.kernel.render_mosaic(&cutout, &self.models, idx));
        FitResult::Success { object_id, parameters, score_cube, mosaic }
    }

    fn unreadable(&self, object_id: ObjectId) -> FitResult {
        FitResult::Failure {
            object_id,
            score_cube: Array4::from_elem(self.models.grid_shape(), f32::NAN),
        }
    }

    /// Pull until a sentinel, cancellation, or the queues go away. One result
    /// is pushed per consumed item, then the item is acknowledged. Sentinels
    /// are not acknowledged.
    pub fn run(
        &self,
        input: QueueConsumer<WorkMessage>,
        output: QueueProducer<FitResult>,
        cancel: CancellationToken,
    ) -> WorkerReport {
        let mut report = WorkerReport::default();
        loop {
            if cancel.is_cancelled() {
                report.stopped_by = StopReason::Cancelled;
                break;
            }
            let message = match input.get(self.timeout) {
                Ok(m) => m,
                Err(GetError::Timeout) => continue,
                Err(GetError::Disconnected) => {
                    report.stopped_by = StopReason::Disconnected;
                    break;
                }
                Err(GetError::Released) => {
                    report.stopped_by = StopReason::Released;
                    break;
                }
            };
            let result = match message {
                WorkMessage::Stop => {
                    report.stopped_by = StopReason::Sentinel;
                    break;
                }
                WorkMessage::Item(item) => self.process(item),
                WorkMessage::Unreadable(object_id) => self.unreadable(object_id),
            };
            report.processed += 1;
            if result.is_success() {
                report.succeeded += 1;
            }
            let delivered = self.deliver(&output, result, &cancel);
            input.task_done();
            if !delivered {
                report.stopped_by = StopReason::Disconnected;
                break;
            }
        }
        report
    }

    fn deliver(
        &self,
        output: &QueueProducer<FitResult>,
        mut result: FitResult,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            match output.put(result, self.timeout) {
                Ok(()) => return true,
                Err(PutError::Timeout(r)) if !cancel.is_cancelled() => result = r,
                Err(_) => return false,
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
    pub crashed: usize,
}

impl PoolReport {
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerReport>>,
}

impl WorkerPool {
    /// Start `n` worker threads sharing the queue handles passed in. The
    /// caller's handles are consumed so the queues disconnect once every
    /// worker has exited.
    pub fn spawn(
        n: usize,
        worker: Worker,
        input: QueueConsumer<WorkMessage>,
        output: QueueProducer<FitResult>,
        cancel: &CancellationToken,
    ) -> Result<Self, DreError> {
        let mut handles = Vec::with_capacity(n);
        for i in 0..n {
            let worker = worker.clone();
            let input = input.clone();
            let output = output.clone();
            let cancel = cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dre-worker-{}", i))
                .spawn(move || worker.run(input, output, cancel))?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Every worker thread has exited, normally or not.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    pub fn join(self) -> PoolReport {
        let mut report = PoolReport::default();
        for (i, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(r) => report.workers.push(r),
                Err(_) => {
                    tracing::error!("Worker {} crashed", i);
                    report.crashed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutout::Cutout;
    use crate::kernel::ChiSquareKernel;
    use crate::model_store::{GridIndex, ModelStore};
    use crate::queue::work_queue_pair;
    use ndarray::{Array2, ArrayD, IxDyn};

    const SHORT: Duration = Duration::from_millis(20);

    fn models() -> SharedModels {
        let cube = ArrayD::from_shape_fn(IxDyn(&[2, 1, 2, 1, 4, 4]), |ix| {
            1.0 + (ix[0] * ix[4] + ix[2] * ix[5]) as f32
        });
        ModelStore::new(cube, vec![0.4, 0.8], vec![10.0], vec![0.2, 0.6])
            .unwrap()
            .shared()
    }

    fn item(models: &SharedModels, id: ObjectId, mask: bool) -> WorkItem {
        let obj = models.image(GridIndex { e: 1, t: 0, r: 1, a: 0 }).mapv(|v| 2.0 * v);
        let cutout = Cutout::new(obj, Array2::from_elem((4, 4), mask), Array2::ones((4, 4)))
            .unwrap();
        WorkItem { object_id: id, cutout }
    }

    fn worker(models: &SharedModels, mosaics: bool) -> Worker {
        Worker::new(models.clone(), Arc::new(ChiSquareKernel), mosaics, SHORT)
    }

    #[test]
    fn test_process_success_carries_ids_and_mosaic() {
        let models = models();
        let result = worker(&models, true).process(item(&models, ObjectId::new(2, 31), true));
        match result {
            FitResult::Success { parameters, mosaic, .. } => {
                assert_eq!(parameters.key(), (2, 31));
                assert_eq!(parameters.grid_index(), GridIndex { e: 1, t: 0, r: 1, a: 0 });
                assert_eq!(parameters.ax_ratio, 0.8);
                assert_eq!(mosaic.unwrap().dim(), (4, 12));
            }
            other => panic!("expected success, got {:?}", other.object_id()),
        }
    }

    #[test]
    fn test_process_all_nan_is_failure() {
        let models = models();
        let result = worker(&models, true).process(item(&models, ObjectId::new(0, 1), false));
        assert!(!result.is_success());
        assert!(all_nan(result.score_cube()));
    }

    #[test]
    fn test_run_one_result_per_item_then_stop() {
        let models = models();
        let (in_tx, in_rx) = work_queue_pair("input", Some(10));
        let (out_tx, out_rx) = work_queue_pair("output", None);
        for (n, mask) in [(1, true), (2, false), (3, true)] {
            in_tx.put(WorkMessage::Item(item(&models, ObjectId::new(0, n), mask)), SHORT).unwrap();
        }
        in_tx.put(WorkMessage::Unreadable(ObjectId::new(0, 4)), SHORT).unwrap();
        in_tx.put_untracked(WorkMessage::Stop, SHORT).unwrap();

        let report = worker(&models, false).run(in_rx, out_tx, CancellationToken::new());
        assert_eq!(report, WorkerReport { processed: 4, succeeded: 2, stopped_by: StopReason::Sentinel });
        assert!(in_tx.state().is_settled());
        assert_eq!(in_tx.state().acknowledged(), 4);

        let results: Vec<FitResult> = std::iter::from_fn(|| out_rx.get(SHORT).ok()).collect();
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 2);
    }

    #[test]
    fn test_run_stops_on_cancel_without_sentinel() {
        let models = models();
        let (_in_tx, in_rx) = work_queue_pair::<WorkMessage>("input", Some(1));
        let (out_tx, _out_rx) = work_queue_pair("output", None);
        let cancel = CancellationToken::new();
        let w = worker(&models, false);
        let handle = {
            let cancel = cancel.clone();
            std::thread::spawn(move || w.run(in_rx, out_tx, cancel))
        };
        std::thread::sleep(Duration::from_millis(60));
        cancel.cancel();
        let report = handle.join().unwrap();
        assert_eq!(report.stopped_by, StopReason::Cancelled);
        assert_eq!(report.processed, 0);
    }

    #[test]
    fn test_pool_drains_and_joins() {
        let models = models();
        let (in_tx, in_rx) = work_queue_pair("input", Some(4));
        let (out_tx, out_rx) = work_queue_pair("output", None);
        let pool = WorkerPool::spawn(3, worker(&models, false), in_rx, out_tx, &CancellationToken::new())
            .unwrap();
        assert_eq!(pool.len(), 3);
        for n in 0..10 {
            in_tx.put(WorkMessage::Item(item(&models, ObjectId::new(1, n), true)), Duration::from_secs(5))
                .unwrap();
        }
        for _ in 0..3 {
            in_tx.put_untracked(WorkMessage::Stop, Duration::from_secs(5)).unwrap();
        }
        let report = pool.join();
        assert_eq!(report.crashed, 0);
        assert_eq!(report.processed(), 10);
        let results: Vec<FitResult> = std::iter::from_fn(|| out_rx.get(SHORT).ok()).collect();
        assert_eq!(results.len(), 10);
    }
}
