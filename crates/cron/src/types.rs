//! Scheduled task and run-log types.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Generates `as_str`, `Display` and `FromStr` for a lowercase wire enum.
macro_rules! wire_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(Error::message(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// How `schedule_value` is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Five-field cron expression evaluated in the scheduler timezone.
    Cron,
    /// Milliseconds between runs.
    Interval,
    /// Single ISO-8601 timestamp.
    Once,
}

wire_enum!(ScheduleType {
    Cron => "cron",
    Interval => "interval",
    Once => "once",
});

/// Whether a run shares the group's conversation or starts fresh.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Group,
    #[default]
    Isolated,
}

wire_enum!(ContextMode {
    Group => "group",
    Isolated => "isolated",
});

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Active,
    Paused,
    Done,
}

wire_enum!(TaskStatus {
    Active => "active",
    Paused => "paused",
    Done => "done",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskRunStatus {
    Success,
    Error,
}

wire_enum!(TaskRunStatus {
    Success => "success",
    Error => "error",
});

/// A prompt that runs in a group's container on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub context_mode: ContextMode,
    #[serde(default)]
    pub status: TaskStatus,
    /// Epoch millis of the next due run; `None` once nothing is left to run.
    pub next_run: Option<u64>,
    pub last_run: Option<u64>,
    pub last_result: Option<String>,
    pub created_at: u64,
}

impl ScheduledTask {
    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.status == TaskStatus::Active && self.next_run.is_some_and(|t| t <= now_ms)
    }
}

/// Input for creating a new task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreate {
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub context_mode: ContextMode,
}

/// One append-only record per execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: u64,
    pub duration_ms: u64,
    pub status: TaskRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
