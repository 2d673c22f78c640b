//! # The display registry.
//!
//! Maps display selections to live watcher child processes. A watcher's exit
//! means its display server is gone: after a grace period every task bound to
//! that display is sent a stop signal through the scheduler.

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::messages::Severity;
use crate::protocol::types::{DisplayKind, DisplaySelection};
use crate::scheduler::SchedulerContext;

pub use probe::{DisplayBackend, SocketDisplayBackend};

/// Why a display selection was rejected.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("{0:?} displays are not supported")]
    Unsupported(DisplayKind),

    #[error("display kind cannot carry a watcher")]
    InvalidKind,

    #[error("cannot connect to the display: {0}")]
    Probe(#[source] std::io::Error),

    #[error("cannot start the display watcher: {0}")]
    SpawnWatcher(#[source] std::io::Error),
}

struct DisplayRecord {
    selection: DisplaySelection,
    is_deactivated: bool,
}

/// Registry of displays with live watchers.
pub struct DisplayRegistry {
    backend: Arc<dyn DisplayBackend>,
    kill_grace: Duration,
    xorg_supported: bool,
    wayland_supported: bool,
    records: Mutex<Vec<DisplayRecord>>,
}

impl DisplayRegistry {
    pub fn new(backend: Arc<dyn DisplayBackend>, kill_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            xorg_supported: backend.supports(DisplayKind::Xorg),
            wayland_supported: backend.supports(DisplayKind::Wayland),
            backend,
            kill_grace,
            records: Mutex::new(Vec::new()),
        })
    }

    /// Makes sure a live watcher exists for the selection, probing the
    /// display and spawning one if needed.
    pub async fn init_display(
        self: &Arc<Self>,
        selection: &DisplaySelection,
        ctx: &SchedulerContext,
    ) -> Result<(), DisplayError> {
        let supported = match selection.kind {
            DisplayKind::Xorg => self.xorg_supported,
            DisplayKind::Wayland => self.wayland_supported,
            _ => return Err(DisplayError::InvalidKind),
        };
        if !supported {
            return Err(DisplayError::Unsupported(selection.kind));
        }

        let mut records = self.records.lock().await;

        if records
            .iter()
            .any(|r| !r.is_deactivated && r.selection == *selection)
        {
            return Ok(());
        }

        // The selection is only as valid as our ability to reach the server.
        self.backend
            .probe(selection)
            .await
            .map_err(DisplayError::Probe)?;

        let mut watcher = self
            .backend
            .spawn_watcher(selection)
            .map_err(DisplayError::SpawnWatcher)?;

        records.push(DisplayRecord {
            selection: selection.clone(),
            is_deactivated: false,
        });
        drop(records);

        let registry = self.clone();
        let ctx = ctx.clone();
        let selection = selection.clone();
        ctx.lifecycle.clone().start_worker(async move {
            let token = ctx.lifecycle.token().clone();

            tokio::select! {
                _ = watcher.wait() => {}
                _ = token.cancelled() => {
                    let _ = watcher.start_kill();
                    let _ = watcher.wait().await;
                    return;
                }
            }
            if ctx.lifecycle.is_cancelled() {
                return;
            }

            // The display server is dead but the daemon is not. Give the
            // tasks the grace period to notice and exit on their own.
            ctx.messages.add(
                Severity::Info,
                None,
                format!(
                    "Display {} has been closed. Killing all its tasks in {:?}",
                    selection.label_long(),
                    registry.kill_grace
                ),
            );
            tokio::select! {
                _ = tokio::time::sleep(registry.kill_grace) => {}
                _ = token.cancelled() => {}
            }
            if ctx.lifecycle.is_cancelled() {
                return;
            }

            ctx.messages.add(
                Severity::Info,
                None,
                format!("Killing all tasks on display {}", selection.label_long()),
            );

            // Deactivate the record first, then stop the tasks. The two
            // locks are taken one after the other, never nested, so this
            // cannot cycle with the schedule path.
            {
                let mut records = registry.records.lock().await;
                if let Some(record) = records.iter_mut().find(|r| r.selection == selection) {
                    record.is_deactivated = true;
                }
            }
            {
                let state = ctx.scheduler.lock().await;
                state.stop_tasks_by_display(&selection);
            }
        });

        Ok(())
    }

    /// Drops deactivated records.
    pub async fn trim(&self) {
        let mut records = self.records.lock().await;
        records.retain(|r| !r.is_deactivated);
    }

    /// Number of live watcher records. Used by tests and diagnostics.
    pub async fn active_count(&self) -> usize {
        let records = self.records.lock().await;
        records.iter().filter(|r| !r.is_deactivated).count()
    }
}
