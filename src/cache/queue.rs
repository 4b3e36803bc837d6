//! Task Queue shared between the boss and the worker pool
//!
//! Unbounded FIFO protected by a mutex with a not-empty condition.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::control::ControlRequest;
use crate::metrics;

/// One transfer to perform: which channel, which key, what capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub channel: String,
    pub key: String,
    pub capacity: usize,
}

impl From<ControlRequest> for TransferTask {
    fn from(req: ControlRequest) -> Self {
        Self {
            channel: req.channel,
            key: req.key,
            capacity: req.capacity,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<TransferTask>,
    closed: bool,
}

/// FIFO of pending transfer tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task and wake one idle worker.
    ///
    /// Returns `false` (dropping the task) once the queue is closed.
    pub fn push(&self, task: TransferTask) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.tasks.push_back(task);
        metrics::CACHE_QUEUE_DEPTH.set(state.tasks.len() as i64);
        self.not_empty.notify_one();
        true
    }

    /// Block until a task is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<TransferTask> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                metrics::CACHE_QUEUE_DEPTH.set(state.tasks.len() as i64);
                return Some(task);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Stop accepting tasks and wake every waiting worker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn task(key: &str) -> TransferTask {
        TransferTask {
            channel: "/proxy_shm_0".into(),
            key: key.into(),
            capacity: 5712,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        for key in ["a", "b", "c"] {
            assert!(queue.push(task(key)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().key, "a");
        assert_eq!(queue.pop().unwrap().key, "b");
        assert_eq!(queue.pop().unwrap().key, "c");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        queue.push(task("late"));
        assert_eq!(consumer.join().unwrap().unwrap().key, "late");
    }

    #[test]
    fn test_close_wakes_all_workers() {
        let queue = Arc::new(TaskQueue::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        for worker in workers {
            assert!(worker.join().unwrap().is_none());
        }
        assert!(queue.is_closed());
        assert!(!queue.push(task("after-close")));
    }

    #[test]
    fn test_closed_queue_drains_remaining_tasks() {
        let queue = TaskQueue::new();
        queue.push(task("pending"));
        queue.close();
        assert_eq!(queue.pop().unwrap().key, "pending");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_from_control_request() {
        let t = TransferTask::from(ControlRequest::new("/c", "k", 42));
        assert_eq!(t.channel, "/c");
        assert_eq!(t.key, "k");
        assert_eq!(t.capacity, 42);
    }
}
