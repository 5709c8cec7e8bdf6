//! Fixed-size pool running listener and handler callbacks.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::failure::panic_message;

const POOL_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::pool");

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads draining a shared job queue.
///
/// Jobs run under `catch_unwind`, so a panicking callback costs one job and
/// never a worker.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
}

impl WorkerPool {
    /// Starts `threads` workers named after `name`.
    ///
    /// # Errors
    ///
    /// Returns the spawn error when a worker thread cannot be created.
    pub fn start(name: &str, threads: usize) -> io::Result<Self> {
        let (sender, queue) = mpsc::channel::<Job>();
        let shared_queue = Arc::new(Mutex::new(queue));
        for index in 0..threads.max(1) {
            let worker_queue = Arc::clone(&shared_queue);
            thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || run_worker(&worker_queue))?;
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Queues a job; returns `false` once the pool has been shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sender| sender.send(Box::new(job)).is_ok())
    }

    /// Stops accepting jobs.
    ///
    /// Queued jobs still run; workers exit once the queue drains. The call
    /// never blocks on in-flight jobs, so it is safe from inside a job.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            debug!(target: POOL_TARGET, "worker pool shutting down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = next else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            warn!(
                target: POOL_TARGET,
                panic = %panic_message(payload.as_ref()),
                "callback panicked"
            );
        }
    }
}
