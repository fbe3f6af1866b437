use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::{
    error::ErrorKind,
    types::StoreResult,
};

/// One background run-loop: journal flusher, copier, page writer,
/// checkpoint manager, cleanup manager, inventory writer.
///
/// The loop waits for its interval (or an explicit wake), runs one
/// tick, logs any error and re-enters; it never terminates silently.
pub struct WorkerHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    wake: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

pub fn spawn_worker<F>(name: &str, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> StoreResult + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = bounded::<()>(16);

    let thread_name = name.to_string();
    let thread_shutdown = Arc::clone(&shutdown);
    let thread = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || loop {
            match wake_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if thread_shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = tick() {
                if e.kind() == ErrorKind::Interrupted
                    && thread_shutdown.load(Ordering::SeqCst)
                {
                    info!("{}: interruptedAtClose", thread_name);
                    break;
                }
                error!("{}: background tick failed: {}", thread_name, e);
            }
        })
        .expect("background thread spawn failed");

    WorkerHandle {
        name: name.to_string(),
        shutdown,
        wake: wake_tx,
        thread: Some(thread),
    }
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waker(&self) -> Sender<()> {
        self.wake.clone()
    }

    pub fn wake(&self) {
        let _ = self.wake.try_send(());
    }

    /// Signal shutdown and join. The pending tick, if any, completes
    /// first.
    pub fn shutdown_join(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        match self.thread.take() {
            Some(thread) => {
                if thread.join().is_err() {
                    error!("{}: background thread panicked", self.name);
                }
                debug!("{}: stopped", self.name);
            }
            None => {
                // diagnostic only
                error!("MissingThread: {} was not running at shutdown", self.name);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_join();
        }
    }
}
