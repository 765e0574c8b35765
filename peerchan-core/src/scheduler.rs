//! Host scheduler: runs work on the cooperative host runtime's own turn.
//! Engine callbacks arrive on foreign threads; they only ever `schedule` a
//! dispatcher run, never call user code directly.

use tokio::sync::mpsc;
use tracing::debug;

/// Unit of work to run on the host.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// "Run this at the next opportunity" primitive. Must be callable from any thread
/// and must not run `task` inline on the caller's thread.
pub trait HostScheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

impl<F> HostScheduler for F
where
    F: Fn(Task) + Send + Sync,
{
    fn schedule(&self, task: Task) {
        self(task)
    }
}

/// Sending side of a [`HostLoop`]. Cheap to clone; hand it to sessions as their scheduler.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<Task>,
}

impl HostScheduler for HostHandle {
    fn schedule(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("host loop gone, dropping scheduled task");
        }
    }
}

/// Task queue owned by the host thread. Tasks run only when the host polls it.
pub struct HostLoop {
    rx: mpsc::UnboundedReceiver<Task>,
}

/// Create a connected handle/loop pair.
pub fn host_loop() -> (HostHandle, HostLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HostHandle { tx }, HostLoop { rx })
}

impl HostLoop {
    /// Run every task already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next task and run it. Returns false once every handle is dropped.
    pub async fn next_turn(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}
