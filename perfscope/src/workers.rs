//! Background worker pool
//!
//! Teardown of interceptors and statistics passes run off the caller's
//! thread. Jobs travel over a crossbeam channel to a fixed set of named
//! threads; every submission returns a [`TaskHandle`] that callers can block
//! on or poll.
//!
//! A job that panics is contained: the worker logs the panic, marks the
//! handle as [`TaskOutcome::Panicked`] and keeps serving the queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How a submitted job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Panicked(String),
    /// The pool shut down before the job ran
    Dropped,
}

type Latch = Arc<(Mutex<Option<TaskOutcome>>, Condvar)>;

/// Waitable handle of a submitted job.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    latch: Latch,
}

impl TaskHandle {
    fn new() -> Self {
        Self { latch: Arc::new((Mutex::new(None), Condvar::new())) }
    }

    /// Handle that is already complete.
    #[must_use]
    pub fn finished() -> Self {
        let handle = Self::new();
        handle.complete(TaskOutcome::Completed);
        handle
    }

    fn complete(&self, outcome: TaskOutcome) {
        let (lock, cvar) = &*self.latch;
        let mut slot = lock.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        cvar.notify_all();
    }

    /// Block until the job ends.
    pub fn wait(&self) -> TaskOutcome {
        let (lock, cvar) = &*self.latch;
        let mut slot = lock.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            cvar.wait(&mut slot);
        }
    }

    /// Block until the job ends or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let (lock, cvar) = &*self.latch;
        let mut slot = lock.lock();
        cvar.wait_while_for(&mut slot, |outcome| outcome.is_none(), timeout);
        slot.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        let (lock, _) = &*self.latch;
        lock.lock().is_some()
    }

    /// True when both handles observe the same job.
    #[must_use]
    pub fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.latch, &other.latch)
    }
}

/// Marks the handle as dropped if the job never ran.
struct PendingJob {
    job: Option<Job>,
    handle: TaskHandle,
}

impl Drop for PendingJob {
    fn drop(&mut self) {
        if self.job.is_some() {
            self.handle.complete(TaskOutcome::Dropped);
        }
    }
}

pub struct WorkerPool {
    sender: Option<Sender<PendingJob>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = unbounded::<PendingJob>();
        let threads = (0..size.max(1))
            .filter_map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("perfscope-worker-{index}"))
                    .spawn(move || {
                        for mut pending in receiver {
                            let Some(job) = pending.job.take() else { continue };
                            let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                                Ok(()) => TaskOutcome::Completed,
                                Err(payload) => {
                                    let message = panic_message(payload.as_ref());
                                    warn!("Background job panicked: {message}");
                                    TaskOutcome::Panicked(message)
                                }
                            };
                            pending.handle.complete(outcome);
                        }
                        debug!("Worker {index} exiting");
                    })
                    .map_err(|e| warn!("Failed to spawn worker thread {index}: {e}"))
                    .ok()
            })
            .collect();

        Self { sender: Some(sender), threads }
    }

    /// Queue a job; the returned handle completes when it has run.
    pub fn submit<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = TaskHandle::new();
        let pending = PendingJob { job: Some(Box::new(job)), handle: handle.clone() };
        match &self.sender {
            // A failed send hands the job back, whose Drop marks it as dropped
            Some(sender) if !self.threads.is_empty() => {
                let _ = sender.send(pending);
            }
            _ => drop(pending),
        }
        handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain the queue and exit
        self.sender.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
