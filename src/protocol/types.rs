//! # Wire-level types shared by the daemon and its clients.
//!
//! Bodies are JSON-encoded with the field names fixed by the protocol, so
//! every struct here carries explicit `serde` renames. Status enums travel as
//! their byte value.

use serde::{Deserialize, Serialize};

/// Kind half of a display selection.
///
/// `Unspecified` is the parsing sentinel: a schedule request that does not
/// name a display gets its selection derived from the task's environment.
/// `Headless` means "no display binding".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayKind {
    #[default]
    #[serde(rename = "none")]
    Unspecified,
    #[serde(rename = "headless")]
    Headless,
    #[serde(rename = "xorg")]
    Xorg,
    #[serde(rename = "wayland")]
    Wayland,
}

/// A display server selection: kind plus server name.
///
/// Only xorg and wayland selections carry a name; headless and unspecified
/// selections keep it empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplaySelection {
    #[serde(rename = "Type")]
    pub kind: DisplayKind,
    #[serde(rename = "Name")]
    pub name: String,
}

impl DisplaySelection {
    pub fn headless() -> Self {
        Self {
            kind: DisplayKind::Headless,
            name: String::new(),
        }
    }

    pub fn xorg(name: impl Into<String>) -> Self {
        Self {
            kind: DisplayKind::Xorg,
            name: name.into(),
        }
    }

    pub fn wayland(name: impl Into<String>) -> Self {
        Self {
            kind: DisplayKind::Wayland,
            name: name.into(),
        }
    }

    /// Long label: `headless`, `xorg <name>` or `wayland <name>`.
    pub fn label_long(&self) -> String {
        match self.kind {
            DisplayKind::Headless => "headless".to_string(),
            DisplayKind::Xorg => format!("xorg {}", self.name),
            DisplayKind::Wayland => format!("wayland {}", self.name),
            DisplayKind::Unspecified => "unknown".to_string(),
        }
    }
}

macro_rules! byte_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(into = "u8", try_from = "u8")]
        pub enum $name {
            $($variant),+
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                match value {
                    $($name::$variant => $value),+
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(format!(
                        "invalid {} value: {other}", stringify!($name)
                    )),
                }
            }
        }
    };
}

byte_enum! {
    /// Outcome of a schedule or reschedule request.
    ScheduleStatus {
        Success = 0,
        AlreadyRunning = 1,
        NameDisplayAlreadyRunning = 2,
        InvalidDisplay = 3,
        TaskNotFound = 4,
        TaskNotDeactivated = 5,
        Unknown = 6,
    }
}

byte_enum! {
    /// Outcome of a stop request.
    StopStatus {
        Success = 0,
        TaskNotFound = 1,
        AlreadyStopped = 2,
        Unknown = 3,
    }
}

byte_enum! {
    /// Answer to a task-activity query.
    TaskActivity {
        Active = 0,
        Inactive = 1,
        InvalidTask = 2,
    }
}

mod id_filter {
    //! The id filter travels as an integer with `i64::MAX` meaning "no
    //! filter", which keeps the field present in every request body.

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(id: &Option<u32>, ser: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => i64::from(*id).serialize(ser),
            None => i64::MAX.serialize(ser),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u32>, D::Error> {
        let raw = i64::deserialize(de)?;
        if raw == i64::MAX {
            return Ok(None);
        }
        u32::try_from(raw)
            .map(Some)
            .map_err(|_| serde::de::Error::custom("id filter out of range"))
    }
}

/// Conjunctive task predicate used by the List and Refresh commands.
///
/// Every populated field must match; an empty field matches everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(rename = "IdFilter", with = "id_filter")]
    pub id: Option<u32>,
    /// Matches tasks whose friendly name equals any of these.
    #[serde(rename = "AnyNameFilter")]
    pub any_name: Vec<String>,
    /// Matches tasks bound to exactly this display. `Unspecified` disables
    /// the field.
    #[serde(rename = "DisplayFilter")]
    pub display: DisplaySelection,
    /// Matches tasks carrying all of these tags.
    #[serde(rename = "AllTagsFilter")]
    pub all_tags: Vec<String>,
}

impl TaskFilter {
    pub fn has_any_filter(&self) -> bool {
        self.id.is_some()
            || !self.any_name.is_empty()
            || self.display.kind != DisplayKind::Unspecified
            || !self.all_tags.is_empty()
    }

    /// Evaluates the predicate against one task's identity fields.
    pub fn matches(
        &self,
        id: u32,
        friendly_name: &str,
        display: &DisplaySelection,
        tags: &[String],
    ) -> bool {
        if let Some(want) = self.id {
            if want != id {
                return false;
            }
        }
        if !self.any_name.is_empty() && !self.any_name.iter().any(|n| n == friendly_name) {
            return false;
        }
        if self.display.kind != DisplayKind::Unspecified && &self.display != display {
            return false;
        }
        self.all_tags.iter().all(|t| tags.contains(t))
    }
}

/// Body of a Schedule request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleRequest {
    #[serde(rename = "Cmdline")]
    pub cmdline: Vec<String>,
    #[serde(rename = "Cwd")]
    pub cwd: String,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "FriendlyName")]
    pub friendly_name: String,
    #[serde(rename = "CaptureStdout")]
    pub capture_stdout: bool,
    #[serde(rename = "Display")]
    pub display: DisplaySelection,
    #[serde(rename = "DelayAfterSuccessMs")]
    pub delay_after_success_ms: u64,
    #[serde(rename = "DelayAfterFailureMs")]
    pub delay_after_failure_ms: u64,
    /// −1 means unbounded.
    #[serde(rename = "MaxSubsequentFailures")]
    pub max_subsequent_failures: i32,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
}

/// Body of a Schedule or Reschedule response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    #[serde(rename = "Status")]
    pub status: ScheduleStatus,
    #[serde(rename = "Id")]
    pub id: u32,
    #[serde(rename = "LogFile")]
    pub log_file: String,
}

/// Body of a List request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(rename = "Filter")]
    pub filter: TaskFilter,
    /// Fall back to deactivated tasks when no active task matches.
    #[serde(rename = "IncludeDeactivated")]
    pub include_deactivated: bool,
    /// Always include deactivated tasks.
    #[serde(rename = "IncludeDeactivatedAlways")]
    pub include_deactivated_always: bool,
    /// For tasks sharing a friendly name, keep only the highest id.
    #[serde(rename = "UniqueNames")]
    pub unique_names: bool,
}

/// One task in a List response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListResponseItem {
    #[serde(rename = "Id")]
    pub id: u32,
    #[serde(rename = "Cmdline")]
    pub cmdline: Vec<String>,
    #[serde(rename = "Cwd")]
    pub cwd: String,
    #[serde(rename = "FriendlyName")]
    pub friendly_name: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Display")]
    pub display: DisplaySelection,
    #[serde(rename = "OutFilePath")]
    pub out_file_path: String,
    #[serde(rename = "MaxSubsequentFailures")]
    pub max_subsequent_failures: i32,
    #[serde(rename = "IsDeactivated")]
    pub is_deactivated: bool,
    #[serde(rename = "DeactivationReason")]
    pub deactivation_reason: String,
    #[serde(rename = "RunCount")]
    pub run_count: u64,
    #[serde(rename = "FailureCount")]
    pub failure_count: u64,
    #[serde(rename = "SubsequentFailureCount")]
    pub subsequent_failure_count: u64,
    #[serde(rename = "LastExitValue")]
    pub last_exit_value: i32,
    #[serde(rename = "LastStdout")]
    pub last_stdout: String,
    #[serde(rename = "HasLastStdout")]
    pub has_last_stdout: bool,
}

/// Body of a Refresh request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "Filter")]
    pub filter: TaskFilter,
}

/// Body of a Refresh response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    #[serde(rename = "RefreshedTasksCount")]
    pub refreshed_tasks_count: u64,
    #[serde(rename = "ActiveTasksCount")]
    pub active_tasks_count: u64,
}

/// Body of a Reschedule request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RescheduleRequest {
    #[serde(rename = "TaskId")]
    pub task_id: u32,
}

/// Body of a Stop request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(rename = "TaskId")]
    pub task_id: u32,
}

/// Body of a Stop response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopResponse {
    #[serde(rename = "Status")]
    pub status: StopStatus,
}

/// How a free-form string field is validated.
#[derive(Clone, Copy, Debug)]
pub enum ValidationKind {
    /// Control characters are forbidden. Keeps every serialized field
    /// newline-free, which the ndjson spill file depends on.
    Generic,
    /// Only `[A-Za-z0-9_-]` is allowed.
    Alphanumeric,
}

/// Validates one string field.
pub fn validate_str(val: &str, field: &str, kind: ValidationKind) -> Result<(), String> {
    for ch in val.chars() {
        let ok = match kind {
            ValidationKind::Generic => !ch.is_control(),
            ValidationKind::Alphanumeric => ch.is_alphanumeric() || ch == '_' || ch == '-',
        };
        if !ok {
            return Err(match kind {
                ValidationKind::Generic => format!(
                    "field {field} contains invalid characters; control characters are forbidden"
                ),
                ValidationKind::Alphanumeric => format!(
                    "field {field} contains invalid characters; only alphanumeric characters, hyphens and underscores are allowed"
                ),
            });
        }
    }
    Ok(())
}

fn validate_strs(vals: &[String], field: &str, kind: ValidationKind) -> Result<(), String> {
    vals.iter().try_for_each(|v| validate_str(v, field, kind))
}

/// Validates every free-form field of a schedule request.
///
/// Clients run this before sending; the daemon runs it again on receipt.
pub fn validate_schedule_request(req: &ScheduleRequest) -> Result<(), String> {
    if req.cmdline.is_empty() {
        return Err("field cmdline must not be empty".to_string());
    }
    validate_strs(&req.cmdline, "cmdline", ValidationKind::Generic)?;
    validate_str(&req.cwd, "cwd", ValidationKind::Generic)?;
    validate_strs(&req.env, "env", ValidationKind::Generic)?;
    validate_str(&req.friendly_name, "friendlyName", ValidationKind::Alphanumeric)?;
    validate_strs(&req.tags, "tags", ValidationKind::Alphanumeric)?;
    validate_str(&req.display.name, "display name", ValidationKind::Generic)?;
    Ok(())
}
