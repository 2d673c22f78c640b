//! # The scheduler.
//!
//! Holds the authoritative in-memory set of tasks behind one coarse lock and
//! mediates between request handlers and supervisor workers. Handlers lock
//! once and run any number of operations against the guarded
//! [`SchedulerState`], which makes a whole request one atomic transaction;
//! "the lock must already be held" is enforced by the borrow checker because
//! every operation is a method on the locked state.
//!
//! The periodic trimmer spills deactivated tasks to an append-only ndjson
//! file, bounding memory while keeping the records queryable.

pub mod logger;
pub mod task;
mod worker;

use std::io::{BufRead, Write};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::display::DisplayRegistry;
use crate::lifecycle::Lifecycle;
use crate::messages::{MessageLog, Severity};
use crate::paths::FilePathProvider;
use crate::protocol::types::{DisplayKind, DisplaySelection, ScheduleStatus};

pub use task::Task;

/// Shared collaborators every scheduler operation may need. Mirrors what the
/// request handlers and workers hold anyway.
#[derive(Clone)]
pub struct SchedulerContext {
    pub scheduler: Arc<Scheduler>,
    pub files: Arc<FilePathProvider>,
    pub displays: Arc<DisplayRegistry>,
    pub lifecycle: Lifecycle,
    pub messages: Arc<MessageLog>,
}

/// The coarse lock around [`SchedulerState`].
pub struct Scheduler {
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                tasks: Vec::new(),
                next_id: 0,
            }),
        })
    }

    /// Acquires the scheduler lock. Hold the guard for the whole request.
    pub async fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().await
    }
}

/// Result of a schedule or reschedule operation. The id and log path are
/// reported even on failure; the id counter advances on every schedule
/// attempt.
#[derive(Clone, Debug)]
pub struct ScheduleOutcome {
    pub status: ScheduleStatus,
    pub id: u32,
    pub log_file: String,
}

/// The task set. Only reachable through [`Scheduler::lock`].
pub struct SchedulerState {
    tasks: Vec<Task>,
    next_id: u32,
}

impl SchedulerState {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Ids are assigned densely from 0; anything below the counter has
    /// existed at some point.
    pub fn is_valid_id(&self, id: u32) -> bool {
        id < self.next_id
    }

    /// Schedules a new task: assigns the next id, resolves its display,
    /// checks conflicts, and spawns its supervisor worker.
    pub async fn try_schedule(&mut self, mut new_task: Task, ctx: &SchedulerContext) -> ScheduleOutcome {
        let id = self.next_id;
        let receivers = new_task.init(id, ctx.files.task_log_file(id).to_string_lossy().into_owned());
        self.next_id += 1;

        self.admit(new_task, receivers, ctx).await
    }

    /// Schedules a task extracted from the spill file, reusing its id and
    /// task-log path. The record's counters restart at zero.
    pub async fn try_reschedule(&mut self, mut task: Task, ctx: &SchedulerContext) -> ScheduleOutcome {
        let id = task.computed.id;
        task.dynamic = task::Dynamic::default();
        let receivers = task.init(id, ctx.files.task_log_file(id).to_string_lossy().into_owned());

        self.admit(task, receivers, ctx).await
    }

    /// Shared admission policy: conflict check, display validation, then
    /// insert and spawn.
    async fn admit(
        &mut self,
        task: Task,
        receivers: task::TaskSignalReceivers,
        ctx: &SchedulerContext,
    ) -> ScheduleOutcome {
        let outcome = |status| ScheduleOutcome {
            status,
            id: task.computed.id,
            log_file: task.computed.out_file_path.clone(),
        };

        if let Some(status) = self.check_for_task_conflict(&task) {
            return outcome(status);
        }
        if let Some(status) = self.check_for_display(&task, ctx).await {
            return outcome(status);
        }

        let result = outcome(ScheduleStatus::Success);
        let snapshot = task.clone();
        self.tasks.push(task);
        worker::spawn_supervisor(ctx.clone(), snapshot, receivers);
        result
    }

    /// Rejects the new task if an active task carries the same identity
    /// fingerprint, or the same non-empty friendly name on the same display.
    fn check_for_task_conflict(&self, new_task: &Task) -> Option<ScheduleStatus> {
        for curr in self.tasks.iter().filter(|t| !t.dynamic.is_deactivated) {
            if curr.computed.hash == new_task.computed.hash {
                return Some(ScheduleStatus::AlreadyRunning);
            }
            if !curr.friendly_name.is_empty()
                && curr.computed.name_display_hash == new_task.computed.name_display_hash
            {
                return Some(ScheduleStatus::NameDisplayAlreadyRunning);
            }
        }
        None
    }

    /// For display-bound tasks, makes sure a watcher exists for the display.
    async fn check_for_display(&self, new_task: &Task, ctx: &SchedulerContext) -> Option<ScheduleStatus> {
        match new_task.display.kind {
            DisplayKind::Headless => None,
            DisplayKind::Xorg | DisplayKind::Wayland => {
                match ctx.displays.init_display(&new_task.display, ctx).await {
                    Ok(()) => None,
                    Err(_) => Some(ScheduleStatus::InvalidDisplay),
                }
            }
            DisplayKind::Unspecified => {
                ctx.messages.add(
                    Severity::Error,
                    Some(&new_task.computed.log_label),
                    "Invalid display type",
                );
                Some(ScheduleStatus::InvalidDisplay)
            }
        }
    }

    /// Fires a reason-carrying stop signal into every task bound to the
    /// display. Reacts to watcher death; pending signals are dropped.
    pub fn stop_tasks_by_display(&self, display: &DisplaySelection) {
        let reason = format!(
            "stopping tasks on {} display {}",
            match display.kind {
                DisplayKind::Xorg => "xorg",
                DisplayKind::Wayland => "wayland",
                DisplayKind::Headless => "headless",
                DisplayKind::Unspecified => "unknown",
            },
            display.name
        );
        for task in &self.tasks {
            if task.display == *display {
                if let Some(signals) = &task.signals {
                    signals.stop.fire(reason.clone());
                }
            }
        }
    }

    /// Commits a worker's updated dynamic state back to the record.
    pub(crate) fn commit_dynamic(&mut self, id: u32, dynamic: &task::Dynamic) {
        if let Some(record) = self.tasks.iter_mut().find(|t| t.computed.id == id) {
            record.dynamic = dynamic.clone();
        }
    }

    /// Moves deactivated tasks out of memory into the spill file. A task
    /// whose record cannot be written stays in memory for this round.
    pub fn trim(&mut self, files: &FilePathProvider, messages: &MessageLog) {
        let (deactivated, mut kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|t| t.dynamic.is_deactivated);

        if !deactivated.is_empty() {
            let path = files.deactivated_tasks_file();
            match std::fs::OpenOptions::new().append(true).open(path) {
                Err(_) => {
                    messages.add(
                        Severity::Error,
                        None,
                        format!(
                            "Failed to open {}. Cannot push deactivated tasks out of memory to a file.",
                            path.display()
                        ),
                    );
                    kept.extend(deactivated);
                }
                Ok(mut file) => {
                    for task in deactivated {
                        // Records are ndjson: no field may contain a newline.
                        // User inputs are validated at the boundary.
                        let written = serde_json::to_vec(&task)
                            .map_err(std::io::Error::other)
                            .and_then(|mut line| {
                                line.push(b'\n');
                                file.write_all(&line)
                            });
                        match written {
                            Ok(()) => messages.add(
                                Severity::Info,
                                Some(&task.computed.log_label),
                                "Trimmed task",
                            ),
                            Err(err) => {
                                messages.add(
                                    Severity::Error,
                                    Some(&task.computed.log_label),
                                    format!("Failed to trim task: {err}"),
                                );
                                kept.push(task);
                            }
                        }
                    }
                }
            }
        }

        self.tasks = kept;
    }

    /// Streams the spill file, decoding one task per line. Malformed lines
    /// are reported and skipped.
    pub fn read_trimmed(&self, files: &FilePathProvider, messages: &MessageLog) -> Vec<Task> {
        let path = files.deactivated_tasks_file();
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) => {
                messages.add(
                    Severity::Error,
                    None,
                    format!("Failed reading trimmed tasks: {err}"),
                );
                return Vec::new();
            }
        };

        let mut result = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Task>(&line) {
                Ok(task) => result.push(task),
                Err(err) => messages.add(
                    Severity::Error,
                    None,
                    format!("Failed decoding a task from {}: {err}", path.display()),
                ),
            }
        }
        result
    }

    /// Removes a deactivated record from memory or from the spill file and
    /// returns it. The spill file is rewritten through a temp file replaced
    /// with an atomic rename.
    pub fn extract_deactivated(
        &mut self,
        task_id: u32,
        files: &FilePathProvider,
        messages: &MessageLog,
    ) -> Result<Task, ScheduleStatus> {
        if let Some(index) = self.tasks.iter().position(|t| t.computed.id == task_id) {
            if !self.tasks[index].dynamic.is_deactivated {
                return Err(ScheduleStatus::TaskNotDeactivated);
            }
            return Ok(self.tasks.swap_remove(index));
        }

        self.extract_from_spill_file(task_id, files, messages)
    }

    fn extract_from_spill_file(
        &mut self,
        task_id: u32,
        files: &FilePathProvider,
        messages: &MessageLog,
    ) -> Result<Task, ScheduleStatus> {
        let path = files.deactivated_tasks_file();
        let input = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) => {
                messages.add(
                    Severity::Error,
                    None,
                    format!("Failed reading trimmed tasks: {err}"),
                );
                return Err(ScheduleStatus::TaskNotFound);
            }
        };

        let Ok(mut output) = files.tmp_file() else {
            messages.add(Severity::Error, None, "Failed opening tmp file");
            return Err(ScheduleStatus::TaskNotFound);
        };

        let mut extracted = None;
        for line in std::io::BufReader::new(input).lines() {
            let Ok(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            let task = match serde_json::from_str::<Task>(&line) {
                Ok(task) => task,
                Err(err) => {
                    messages.add(
                        Severity::Error,
                        None,
                        format!("Failed decoding a task from {}: {err}", path.display()),
                    );
                    continue;
                }
            };

            if extracted.is_none() && task.computed.id == task_id {
                extracted = Some(task);
            } else if writeln!(output, "{line}").is_err() {
                messages.add(Severity::Error, None, "Failed writing to tmp file");
                return Err(ScheduleStatus::TaskNotFound);
            }
        }

        match extracted {
            Some(task) => {
                if output.persist(path).is_err() {
                    messages.add(Severity::Error, None, "Failed replacing the ndjson file");
                    return Err(ScheduleStatus::TaskNotFound);
                }
                Ok(task)
            }
            None => Err(ScheduleStatus::TaskNotFound),
        }
    }
}
