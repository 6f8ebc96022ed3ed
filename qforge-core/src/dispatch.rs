//! Asynchronous dispatch queue
//!
//! A single-producer, single-consumer FIFO drained by one background
//! worker. Engines queue small operations here and return to the caller
//! immediately; every read-side operation calls `finish` first, so the
//! queue is never observable from outside an engine. Program order is
//! preserved.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    busy: bool,
    quit: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cv: Condvar,
    done_cv: Condvar,
}

/// Background worker executing queued closures in FIFO order
pub struct DispatchQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                busy: false,
                quit: false,
            }),
            cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || Self::worker_loop(worker_shared));

        Self {
            shared,
            worker: Some(worker),
        }
    }

    fn worker_loop(shared: Arc<Shared>) {
        let mut state = shared.state.lock();
        loop {
            while state.tasks.is_empty() && !state.quit {
                shared.cv.wait(&mut state);
            }
            if state.quit && state.tasks.is_empty() {
                return;
            }

            // Leave `busy` set while the task runs outside the lock, so
            // `finish` cannot observe an empty queue mid-task.
            let task = state.tasks.pop_front().unwrap();
            state.busy = true;
            drop(state);

            task();

            state = shared.state.lock();
            state.busy = false;
            if state.tasks.is_empty() {
                shared.done_cv.notify_all();
            }
        }
    }

    /// Enqueue a task; returns immediately
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.cv.notify_one();
    }

    /// Block until every queued task has run
    pub fn finish(&self) {
        let mut state = self.shared.state.lock();
        while !state.tasks.is_empty() || state.busy {
            self.shared.done_cv.wait(&mut state);
        }
    }

    /// Discard queued tasks without running them; waits out the in-flight task
    pub fn dump(&self) {
        let mut state = self.shared.state.lock();
        state.tasks.clear();
        while state.busy {
            self.shared.done_cv.wait(&mut state);
        }
    }

    /// True when nothing is queued or running
    pub fn is_finished(&self) -> bool {
        let state = self.shared.state.lock();
        state.tasks.is_empty() && !state.busy
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.quit = true;
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_in_order() {
        let queue = DispatchQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            queue.dispatch(move || log.lock().push(i));
        }
        queue.finish();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_finish_blocks_until_drained() {
        let queue = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            queue.dispatch(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.finish();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(queue.is_finished());
    }

    #[test]
    fn test_dump_discards_pending() {
        let queue = DispatchQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            queue.dispatch(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            queue.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.dump();
        // The in-flight task may have run; the rest must not.
        assert!(counter.load(Ordering::SeqCst) <= 1);
    }
}
