//! Channel pair with per-message acknowledgment.
//!
//! The input side is bounded to give the feeder backpressure; the output side
//! is unbounded. Every blocking call takes a timeout so callers can re-check
//! cancellation, and `task_done` lets the owner tell "everything consumed"
//! apart from "everything sent".

use crate::cutout::{ObjectId, WorkItem};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Message on the input queue. `Stop` is the per-worker sentinel.
#[derive(Debug)]
pub enum WorkMessage {
    Item(WorkItem),
    /// The cutout could not be read; the worker reports it as failed.
    Unreadable(ObjectId),
    Stop,
}

#[derive(Debug, PartialEq)]
pub enum PutError<T> {
    Timeout(T),
    Disconnected(T),
    Released(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum GetError {
    Timeout,
    Disconnected,
    Released,
}

#[derive(Debug)]
pub struct AckState {
    name: String,
    submitted: AtomicUsize,
    acknowledged: AtomicUsize,
    released: AtomicBool,
    lock: Mutex<()>,
    settled: Condvar,
}

impl AckState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            submitted: AtomicUsize::new(0),
            acknowledged: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            lock: Mutex::new(()),
            settled: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Every message put so far has been acknowledged.
    pub fn is_settled(&self) -> bool {
        self.acknowledged() >= self.submitted()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Block until settled or released, at most `timeout`. Returns whether
    /// the queue is settled.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .settled
            .wait_timeout_while(guard, timeout, |_| !self.is_settled() && !self.is_released())
            .unwrap_or_else(|e| e.into_inner());
        self.is_settled()
    }

    /// Make every later `put`/`get` return `Released` without draining.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify();
    }

    fn notify(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.settled.notify_all();
    }
}

pub struct QueueProducer<T> {
    sender: Sender<T>,
    state: Arc<AckState>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), state: self.state.clone() }
    }
}

impl<T> QueueProducer<T> {
    pub fn put(&self, item: T, timeout: Duration) -> Result<(), PutError<T>> {
        self.send(item, timeout, true)
    }

    /// Send a control message that is neither counted nor acknowledged,
    /// such as a stop sentinel.
    pub fn put_untracked(&self, item: T, timeout: Duration) -> Result<(), PutError<T>> {
        self.send(item, timeout, false)
    }

    fn send(&self, item: T, timeout: Duration, tracked: bool) -> Result<(), PutError<T>> {
        if self.state.is_released() {
            return Err(PutError::Released(item));
        }
        // Count before sending so an early acknowledgment never overtakes it.
        if tracked {
            self.state.submitted.fetch_add(1, Ordering::SeqCst);
        }
        match self.sender.send_timeout(item, timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                if tracked {
                    self.state.submitted.fetch_sub(1, Ordering::SeqCst);
                }
                match e {
                    SendTimeoutError::Timeout(item) => Err(PutError::Timeout(item)),
                    SendTimeoutError::Disconnected(item) => Err(PutError::Disconnected(item)),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn state(&self) -> &Arc<AckState> {
        &self.state
    }
}

pub struct QueueConsumer<T> {
    receiver: Receiver<T>,
    state: Arc<AckState>,
}

impl<T> Clone for QueueConsumer<T> {
    fn clone(&self) -> Self {
        Self { receiver: self.receiver.clone(), state: self.state.clone() }
    }
}

impl<T> QueueConsumer<T> {
    pub fn get(&self, timeout: Duration) -> Result<T, GetError> {
        if self.state.is_released() {
            return Err(GetError::Released);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Ok(item),
            Err(RecvTimeoutError::Timeout) => Err(GetError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(GetError::Disconnected),
        }
    }

    /// Acknowledge one consumed message.
    pub fn task_done(&self) {
        self.state.acknowledged.fetch_add(1, Ordering::SeqCst);
        self.state.notify();
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn state(&self) -> &Arc<AckState> {
        &self.state
    }
}

/// `capacity = None` gives an unbounded queue.
pub fn work_queue_pair<T>(
    name: &str,
    capacity: Option<usize>,
) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (sender, receiver) = match capacity {
        Some(cap) => crossbeam_channel::bounded(cap),
        None => crossbeam_channel::unbounded(),
    };
    let state = Arc::new(AckState::new(name));
    (
        QueueProducer { sender, state: state.clone() },
        QueueConsumer { receiver, state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_fifo_and_ack_counts() {
        let (tx, rx) = work_queue_pair::<u32>("q", Some(4));
        for i in 0..3 {
            tx.put(i, SHORT).unwrap();
        }
        assert_eq!(tx.state().submitted(), 3);
        assert!(!rx.state().is_settled());
        for i in 0..3 {
            assert_eq!(rx.get(SHORT).unwrap(), i);
            rx.task_done();
        }
        assert_eq!(rx.state().acknowledged(), 3);
        assert!(rx.state().is_settled());
    }

    #[test]
    fn test_bounded_put_times_out_and_returns_item() {
        let (tx, _rx) = work_queue_pair::<u32>("q", Some(1));
        tx.put(1, SHORT).unwrap();
        assert_eq!(tx.put(2, SHORT), Err(PutError::Timeout(2)));
        assert_eq!(tx.state().submitted(), 1);
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let (_tx, rx) = work_queue_pair::<u32>("q", None);
        let start = Instant::now();
        assert_eq!(rx.get(SHORT), Err(GetError::Timeout));
        assert!(start.elapsed() >= SHORT);
    }

    #[test]
    fn test_disconnect_both_ways() {
        let (tx, rx) = work_queue_pair::<u32>("q", Some(1));
        drop(rx);
        assert_eq!(tx.put(1, SHORT), Err(PutError::Disconnected(1)));

        let (tx, rx) = work_queue_pair::<u32>("q", None);
        drop(tx);
        assert_eq!(rx.get(SHORT), Err(GetError::Disconnected));
    }

    #[test]
    fn test_release_stops_callers_without_draining() {
        let (tx, rx) = work_queue_pair::<u32>("q", Some(8));
        tx.put(1, SHORT).unwrap();
        rx.state().release();
        assert_eq!(rx.get(SHORT), Err(GetError::Released));
        assert_eq!(tx.put(2, SHORT), Err(PutError::Released(2)));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_wait_settled_wakes_on_last_ack() {
        let (tx, rx) = work_queue_pair::<u32>("q", None);
        for i in 0..5 {
            tx.put(i, SHORT).unwrap();
        }
        let consumer = thread::spawn(move || {
            while let Ok(_) = rx.get(SHORT) {
                rx.task_done();
                if rx.state().is_settled() {
                    break;
                }
            }
        });
        assert!(tx.state().wait_settled(Duration::from_secs(5)));
        consumer.join().unwrap();
    }

    #[test]
    fn test_untracked_messages_need_no_ack() {
        let (tx, rx) = work_queue_pair::<u32>("q", Some(4));
        tx.put(1, SHORT).unwrap();
        tx.put_untracked(0, SHORT).unwrap();
        assert_eq!(tx.state().submitted(), 1);
        assert_eq!(rx.get(SHORT).unwrap(), 1);
        rx.task_done();
        assert_eq!(rx.get(SHORT).unwrap(), 0);
        assert!(rx.state().is_settled());
    }

    #[test]
    fn test_wait_settled_times_out() {
        let (tx, _rx) = work_queue_pair::<u32>("q", None);
        tx.put(1, SHORT).unwrap();
        assert!(!tx.state().wait_settled(SHORT));
    }
}
