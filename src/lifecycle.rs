//! # Process-wide lifecycle control.
//!
//! [`Lifecycle`] owns the cancellation token every worker derives from and the
//! tracker the daemon joins on shutdown. Workers are always spawned through
//! it, so shutdown is a single sequence: cancel the token, close the listener,
//! wait for the tracker to drain, run the after-cancel cleanups.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the process-wide cancellation token and the set of spawned workers.
#[derive(Clone)]
pub struct Lifecycle {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// The process-wide cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Spawns a tracked worker.
    pub fn start_worker<F>(&self, body: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(body)
    }

    /// Spawns a tracked worker that only runs once cancellation fires.
    /// Used for cleanup steps like closing connections and removing the
    /// cache directory.
    pub fn start_worker_after_cancel<F>(&self, body: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            token.cancelled().await;
            body.await;
        })
    }

    /// Waits for every tracked worker to finish. Call after [`cancel`].
    ///
    /// [`cancel`]: Lifecycle::cancel
    pub async fn join(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes when the process receives SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn join_waits_for_workers() {
        let lifecycle = Lifecycle::new();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        let token = lifecycle.token().clone();
        lifecycle.start_worker(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        lifecycle.cancel();
        lifecycle.join().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn after_cancel_worker_runs_only_on_cancel() {
        let lifecycle = Lifecycle::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        lifecycle.start_worker_after_cancel(async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));

        lifecycle.cancel();
        lifecycle.join().await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
