//! # The task record.
//!
//! A [`Task`] describes one supervised command. Fields split into three
//! groups: inputs (set by the client request, never mutated afterwards),
//! computed values (filled once on scheduling), and dynamic state (mutated
//! only by the task's supervisor worker, under the scheduler lock).
//!
//! The record serializes as a single JSON object so deactivated tasks can be
//! spilled to the ndjson file and reconstructed later; the signal handles are
//! skipped and re-issued on reschedule.

use serde::{Deserialize, Serialize};

use crate::fnv::Fnv32a;
use crate::protocol::types::{DisplayKind, DisplaySelection, ScheduleRequest};
use crate::signals::{slot, SlotReceiver, SlotSender};

/// Values derived once when the task is scheduled.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Computed {
    #[serde(rename = "Id")]
    pub id: u32,
    /// Path of the per-task log file.
    #[serde(rename = "OutFilePath")]
    pub out_file_path: String,
    /// Human-readable label used in diagnostics, `task id=N, name`.
    #[serde(rename = "LogLabel")]
    pub log_label: String,
    /// Identity fingerprint over every client-supplied parameter.
    #[serde(rename = "Hash")]
    pub hash: u32,
    /// Fingerprint over friendly name and display only.
    #[serde(rename = "NameDisplayHash")]
    pub name_display_hash: u32,
}

/// State mutated by the supervisor worker as executions come and go.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dynamic {
    #[serde(rename = "RunCount")]
    pub run_count: u64,
    #[serde(rename = "FailureCount")]
    pub failure_count: u64,
    #[serde(rename = "SubsequentFailureCount")]
    pub subsequent_failure_count: u64,
    #[serde(rename = "LastExitValue")]
    pub last_exit_value: i32,
    #[serde(rename = "LastStdoutFilePath")]
    pub last_stdout_file_path: String,
    #[serde(rename = "IsDeactivated")]
    pub is_deactivated: bool,
    #[serde(rename = "DeactivatedReason")]
    pub deactivated_reason: String,
}

/// Sending halves of the task's stop and refresh signals. Held in the
/// scheduler's record; the receiving halves belong to the supervisor worker.
#[derive(Clone, Debug)]
pub struct TaskSignals {
    pub stop: SlotSender<String>,
    pub refresh: SlotSender<()>,
}

/// Receiving halves, handed to the supervisor worker on scheduling.
pub struct TaskSignalReceivers {
    pub stop: SlotReceiver<String>,
    pub refresh: SlotReceiver<()>,
}

/// One supervised command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "Cmdline")]
    pub cmdline: Vec<String>,
    #[serde(rename = "Cwd")]
    pub cwd: String,
    /// `KEY=VALUE` entries for the child process.
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "DelayAfterSuccessMs")]
    pub delay_after_success_ms: u64,
    #[serde(rename = "DelayAfterFailureMs")]
    pub delay_after_failure_ms: u64,
    /// −1 means unbounded.
    #[serde(rename = "MaxSubsequentFailures")]
    pub max_subsequent_failures: i32,
    #[serde(rename = "FriendlyName")]
    pub friendly_name: String,
    #[serde(rename = "CaptureStdout")]
    pub capture_stdout: bool,
    #[serde(rename = "Display")]
    pub display: DisplaySelection,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,

    #[serde(rename = "Computed")]
    pub computed: Computed,
    #[serde(rename = "Dynamic")]
    pub dynamic: Dynamic,

    #[serde(skip)]
    pub signals: Option<TaskSignals>,
}

impl From<ScheduleRequest> for Task {
    fn from(req: ScheduleRequest) -> Self {
        Self {
            cmdline: req.cmdline,
            cwd: req.cwd,
            env: req.env,
            delay_after_success_ms: req.delay_after_success_ms,
            delay_after_failure_ms: req.delay_after_failure_ms,
            max_subsequent_failures: req.max_subsequent_failures,
            friendly_name: req.friendly_name,
            capture_stdout: req.capture_stdout,
            display: req.display,
            tags: req.tags,
            computed: Computed::default(),
            dynamic: Dynamic::default(),
            signals: None,
        }
    }
}

impl Task {
    /// Fills the computed fields, resolves the display selection, issues
    /// fresh signal handles and resets the reactivation-sensitive dynamic
    /// state. Called by the scheduler with the id it assigned.
    pub fn init(&mut self, id: u32, out_file_path: String) -> TaskSignalReceivers {
        self.computed.id = id;
        self.computed.out_file_path = out_file_path;
        self.computed.log_label = compute_log_label(id, &self.friendly_name);

        if self.display.kind == DisplayKind::Unspecified {
            self.display = compute_display_from_env(&self.env);
        }
        set_display_env_vars(&self.display, &mut self.env);

        let (stop_tx, stop_rx) = slot();
        let (refresh_tx, refresh_rx) = slot();
        self.signals = Some(TaskSignals {
            stop: stop_tx,
            refresh: refresh_tx,
        });

        // Reset in case this record is a reactivated deactivated task.
        self.dynamic.subsequent_failure_count = 0;
        self.dynamic.is_deactivated = false;
        self.dynamic.deactivated_reason = String::new();

        let (hash, name_display_hash) = self.compute_hashes();
        self.computed.hash = hash;
        self.computed.name_display_hash = name_display_hash;

        TaskSignalReceivers {
            stop: stop_rx,
            refresh: refresh_rx,
        }
    }

    /// The identity hash covers every client-supplied parameter plus the
    /// resolved display; the name-display hash only the friendly name and
    /// display, to enforce one named task per display.
    pub fn compute_hashes(&self) -> (u32, u32) {
        let mut h = Fnv32a::new();
        for arg in &self.cmdline {
            h.write_str(arg);
        }
        h.write_str(&self.cwd);
        h.write_int(i64::from(self.max_subsequent_failures));
        h.write_str(&self.friendly_name);
        h.write_bool(self.capture_stdout);
        for tag in &self.tags {
            h.write_str(tag);
        }
        h.write_int(display_kind_index(self.display.kind));
        h.write_str(&self.display.name);
        let hash = h.finish();

        let mut h = Fnv32a::new();
        h.write_str(&self.friendly_name);
        h.write_int(display_kind_index(self.display.kind));
        h.write_str(&self.display.name);
        let name_display_hash = h.finish();

        (hash, name_display_hash)
    }

    /// Reads the captured stdout of the last finished execution.
    pub fn read_last_stdout(&self) -> Result<String, String> {
        if !self.capture_stdout {
            return Err("stdout was not captured".to_string());
        }
        if self.dynamic.last_stdout_file_path.is_empty() {
            return Err("no stdout saved".to_string());
        }
        std::fs::read_to_string(&self.dynamic.last_stdout_file_path)
            .map_err(|_| "failed reading stdout file".to_string())
    }
}

pub fn compute_log_label(id: u32, friendly_name: &str) -> String {
    format!("task id={id}, {friendly_name}")
}

fn display_kind_index(kind: DisplayKind) -> i64 {
    match kind {
        DisplayKind::Unspecified => 0,
        DisplayKind::Headless => 1,
        DisplayKind::Xorg => 2,
        DisplayKind::Wayland => 3,
    }
}

/// Derives a display selection from a task's environment.
///
/// An app with both DISPLAY and WAYLAND_DISPLAY set could end up using
/// either; wayland is preferred. Neither set means headless.
pub fn compute_display_from_env(env: &[String]) -> DisplaySelection {
    let mut xorg_name = "";
    let mut wayland_name = "";
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            match key {
                "DISPLAY" => xorg_name = value,
                "WAYLAND_DISPLAY" => wayland_name = value,
                _ => {}
            }
        }
    }

    if !wayland_name.is_empty() {
        DisplaySelection::wayland(wayland_name)
    } else if !xorg_name.is_empty() {
        DisplaySelection::xorg(xorg_name)
    } else {
        DisplaySelection::headless()
    }
}

/// Rewrites DISPLAY / WAYLAND_DISPLAY in a child env list so that exactly
/// the chosen selection is visible: one of the two for a display-bound task,
/// neither for headless.
pub fn set_display_env_vars(display: &DisplaySelection, env: &mut Vec<String>) {
    env.retain(|entry| {
        let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
        key != "DISPLAY" && key != "WAYLAND_DISPLAY"
    });

    match display.kind {
        DisplayKind::Xorg => env.push(format!("DISPLAY={}", display.name)),
        DisplayKind::Wayland => env.push(format!("WAYLAND_DISPLAY={}", display.name)),
        DisplayKind::Headless | DisplayKind::Unspecified => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ScheduleRequest;

    fn request() -> ScheduleRequest {
        ScheduleRequest {
            cmdline: vec!["/bin/true".to_string()],
            cwd: "/tmp".to_string(),
            env: vec![],
            friendly_name: "svc".to_string(),
            capture_stdout: false,
            display: DisplaySelection::headless(),
            delay_after_success_ms: 0,
            delay_after_failure_ms: 0,
            max_subsequent_failures: -1,
            tags: vec![],
        }
    }

    #[test]
    fn display_derivation_prefers_wayland() {
        let both = vec![
            "DISPLAY=:0".to_string(),
            "WAYLAND_DISPLAY=wayland-1".to_string(),
        ];
        assert_eq!(
            compute_display_from_env(&both),
            DisplaySelection::wayland("wayland-1")
        );

        let xorg_only = vec!["DISPLAY=:0".to_string()];
        assert_eq!(compute_display_from_env(&xorg_only), DisplaySelection::xorg(":0"));

        assert_eq!(compute_display_from_env(&[]), DisplaySelection::headless());
    }

    #[test]
    fn env_rewrite_leaves_exactly_the_selection() {
        let mut env = vec![
            "PATH=/bin".to_string(),
            "DISPLAY=:9".to_string(),
            "WAYLAND_DISPLAY=stale".to_string(),
        ];
        set_display_env_vars(&DisplaySelection::xorg(":0"), &mut env);
        assert_eq!(env, vec!["PATH=/bin".to_string(), "DISPLAY=:0".to_string()]);

        set_display_env_vars(&DisplaySelection::headless(), &mut env);
        assert_eq!(env, vec!["PATH=/bin".to_string()]);
    }

    #[test]
    fn identity_hash_covers_inputs() {
        let mut a = Task::from(request());
        a.init(0, "a.log".to_string());
        let mut b = Task::from(request());
        b.init(1, "b.log".to_string());

        // Same inputs produce the same fingerprints regardless of id.
        assert_eq!(a.computed.hash, b.computed.hash);
        assert_eq!(a.computed.name_display_hash, b.computed.name_display_hash);

        let mut c_req = request();
        c_req.cmdline = vec!["/bin/false".to_string()];
        let mut c = Task::from(c_req);
        c.init(2, "c.log".to_string());

        // Different argv changes identity but not name-display.
        assert_ne!(a.computed.hash, c.computed.hash);
        assert_eq!(a.computed.name_display_hash, c.computed.name_display_hash);
    }

    #[test]
    fn init_resets_reactivation_state() {
        let mut task = Task::from(request());
        task.dynamic.is_deactivated = true;
        task.dynamic.deactivated_reason = "old".to_string();
        task.dynamic.subsequent_failure_count = 7;
        task.dynamic.run_count = 3;

        task.init(5, "x.log".to_string());

        assert!(!task.dynamic.is_deactivated);
        assert!(task.dynamic.deactivated_reason.is_empty());
        assert_eq!(task.dynamic.subsequent_failure_count, 0);
        // Lifetime counters survive reactivation of the same record.
        assert_eq!(task.dynamic.run_count, 3);
        assert_eq!(task.computed.log_label, "task id=5, svc");
    }

    #[test]
    fn spill_record_round_trips() {
        let mut task = Task::from(request());
        task.init(4, "task_004.log".to_string());
        task.dynamic.is_deactivated = true;
        task.dynamic.deactivated_reason = "Task killed (stop requested). Deactivating.".to_string();
        task.dynamic.run_count = 9;

        let line = serde_json::to_string(&task).unwrap();
        assert!(!line.contains('\n'));

        let parsed: Task = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.computed.id, 4);
        assert_eq!(parsed.dynamic.run_count, 9);
        assert_eq!(parsed.dynamic.deactivated_reason, task.dynamic.deactivated_reason);
        assert!(parsed.signals.is_none());
    }
}
