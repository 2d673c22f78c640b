//! Shared test harness: a fully wired scheduler context backed by a
//! throwaway cache directory and a fake display backend whose "watcher" is
//! an arbitrary child process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use spieven::display::{DisplayBackend, DisplayRegistry};
use spieven::lifecycle::Lifecycle;
use spieven::messages::MessageLog;
use spieven::paths::FilePathProvider;
use spieven::protocol::types::{DisplayKind, DisplaySelection, ScheduleRequest};
use spieven::scheduler::task::Dynamic;
use spieven::scheduler::{ScheduleOutcome, Scheduler, SchedulerContext, Task};

/// Display backend that accepts every selection and runs the given command
/// as the watcher process.
pub struct FakeDisplayBackend {
    watcher_cmdline: Vec<String>,
}

#[async_trait]
impl DisplayBackend for FakeDisplayBackend {
    fn supports(&self, _kind: DisplayKind) -> bool {
        true
    }

    async fn probe(&self, _selection: &DisplaySelection) -> std::io::Result<()> {
        Ok(())
    }

    fn spawn_watcher(&self, _selection: &DisplaySelection) -> std::io::Result<Child> {
        Command::new(&self.watcher_cmdline[0])
            .args(&self.watcher_cmdline[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

pub struct Harness {
    pub ctx: SchedulerContext,
    _root: tempfile::TempDir,
}

impl Harness {
    /// Harness whose display watchers block until shutdown.
    pub fn new() -> Self {
        Self::with_watcher(vec!["/bin/sleep".into(), "3600".into()], Duration::from_secs(60))
    }

    /// Harness with a custom watcher command and display kill grace period.
    pub fn with_watcher(watcher_cmdline: Vec<String>, kill_grace: Duration) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let files = Arc::new(
            FilePathProvider::with_cache_root(root.path().join("cache")).expect("cache layout"),
        );
        let messages =
            Arc::new(MessageLog::new(files.message_log_file()).expect("message log"));
        let lifecycle = Lifecycle::new();
        let scheduler = Scheduler::new();
        let displays = DisplayRegistry::new(
            Arc::new(FakeDisplayBackend { watcher_cmdline }),
            kill_grace,
        );

        Self {
            ctx: SchedulerContext {
                scheduler,
                files,
                displays,
                lifecycle,
                messages,
            },
            _root: root,
        }
    }

    pub async fn schedule(&self, request: ScheduleRequest) -> ScheduleOutcome {
        let mut state = self.ctx.scheduler.lock().await;
        state.try_schedule(Task::from(request), &self.ctx).await
    }

    /// Snapshot of one task's dynamic state.
    pub async fn dynamic(&self, id: u32) -> Option<Dynamic> {
        let state = self.ctx.scheduler.lock().await;
        state
            .tasks()
            .iter()
            .find(|t| t.computed.id == id)
            .map(|t| t.dynamic.clone())
    }

    pub async fn active_task_count(&self) -> usize {
        let state = self.ctx.scheduler.lock().await;
        state
            .tasks()
            .iter()
            .filter(|t| !t.dynamic.is_deactivated)
            .count()
    }

    /// Polls until the predicate holds, panicking after the deadline.
    pub async fn wait_for<F>(&self, what: &str, deadline: Duration, mut pred: F)
    where
        F: FnMut(&[Task]) -> bool,
    {
        let start = tokio::time::Instant::now();
        loop {
            {
                let state = self.ctx.scheduler.lock().await;
                if pred(state.tasks()) {
                    return;
                }
            }
            if start.elapsed() > deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancels the lifecycle and waits for every worker to drain.
    pub async fn shutdown(self) {
        self.ctx.lifecycle.cancel();
        self.ctx.lifecycle.join().await;
    }
}

/// A minimal headless schedule request around the given command line.
pub fn request(cmdline: &[&str]) -> ScheduleRequest {
    ScheduleRequest {
        cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
        cwd: String::new(),
        env: vec![],
        friendly_name: String::new(),
        capture_stdout: false,
        display: DisplaySelection::headless(),
        delay_after_success_ms: 10,
        delay_after_failure_ms: 10,
        max_subsequent_failures: -1,
        tags: vec![],
    }
}
