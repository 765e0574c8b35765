//! Main-loop driver: a dedicated worker calling the engine's iterate-once so
//! handshakes and timers progress while the host is idle.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::engine::PeerEngine;

/// Reference pause between iterations (~100 Hz).
pub const DEFAULT_ITERATE_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct MainLoopDriver {
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl MainLoopDriver {
    /// Start the worker. `next` is consulted before every iteration and returns the
    /// engine to iterate, or `None` once the session stopped the driver or detached the engine.
    pub(crate) fn spawn<F>(interval: Duration, mut next: F) -> io::Result<Self>
    where
        F: FnMut() -> Option<Arc<dyn PeerEngine>> + Send + 'static,
    {
        let (done_tx, done) = channel::bounded(1);
        let thread = thread::Builder::new()
            .name("peerchan-driver".into())
            .spawn(move || {
                let mut iterations: u64 = 0;
                while let Some(engine) = next() {
                    engine.iterate_once();
                    drop(engine);
                    iterations += 1;
                    thread::sleep(interval);
                }
                debug!(iterations, "main-loop driver exited");
                let _ = done_tx.send(());
            })?;
        Ok(Self {
            thread: Some(thread),
            done,
        })
    }

    /// Wait up to `timeout` for the worker to notice it should stop. True if it has exited.
    pub(crate) fn wait_stopped(&self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Block until the worker thread is gone.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("main-loop driver panicked");
            }
        }
    }
}
