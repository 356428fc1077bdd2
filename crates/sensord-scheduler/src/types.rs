use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    action::ActionRegistry,
    clock::{next_schedulable_tick, Clock, Tick},
    error::{Result, SchedulerError},
};

pub const DEFAULT_PRIORITY: i32 = 10;

/// A persisted, named job specification the scheduler turns into tasks.
///
/// The cursor fields (`next_task_time`, `next_task_id`, `is_active`) are
/// owned by the scheduler; everything else is configuration owned by
/// whoever created the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Unique slug, also used in result URLs.
    pub name: String,
    /// Key into the [`ActionRegistry`].
    pub action: String,
    /// Lower value runs first when two tasks share a tick.
    pub priority: i32,
    /// First tick, inclusive.
    pub start: Tick,
    /// Last tick, exclusive. `None` means never.
    pub stop: Option<Tick>,
    /// Ticks between tasks. `None` means run exactly once.
    pub interval: Option<i64>,
    pub is_active: bool,
    /// If set, a JSON task result is POSTed here after every task.
    pub callback_url: Option<String>,
    /// Earliest tick not yet consumed.
    pub next_task_time: Tick,
    /// Id handed to the next task; starts at 1 and never repeats.
    pub next_task_id: i64,
    /// Opaque owner reference.
    pub owner: Option<String>,
    /// ISO-8601 timestamp of entry creation.
    pub created_at: String,
    /// ISO-8601 timestamp of the last configuration change.
    pub modified_at: String,
}

impl ScheduleEntry {
    /// Return the next task id and advance the counter.
    pub fn take_next_task_id(&mut self) -> i64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Copy configuration from `updated`, keeping this entry's cursor.
    ///
    /// Changing `start` or `interval` resets `next_task_time` to
    /// `max(start, now + 1)` so the new series never fires in the past.
    pub fn apply_update(&mut self, updated: &ScheduleEntry, clock: &dyn Clock) {
        if updated.start != self.start || updated.interval != self.interval {
            self.next_task_time = updated.start.max(next_schedulable_tick(clock));
        }
        self.action = updated.action.clone();
        self.priority = updated.priority;
        self.start = updated.start;
        self.stop = updated.stop;
        self.interval = updated.interval;
        self.is_active = updated.is_active;
        self.callback_url = updated.callback_url.clone();
        self.owner = updated.owner.clone();
        self.modified_at = Utc::now().to_rfc3339();
    }
}

/// Request to create a [`ScheduleEntry`]; unset fields take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewScheduleEntry {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub priority: Option<i32>,
    /// Defaults to the next schedulable tick.
    #[serde(default)]
    pub start: Option<Tick>,
    #[serde(default)]
    pub stop: Option<Tick>,
    /// Interpret `stop` as an offset from `start`.
    #[serde(default)]
    pub stop_is_relative: bool,
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl NewScheduleEntry {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    /// Validate and fill in defaults.
    pub fn into_entry(self, clock: &dyn Clock, actions: &ActionRegistry) -> Result<ScheduleEntry> {
        if !is_slug(&self.name) {
            return Err(SchedulerError::InvalidEntry(format!(
                "name {:?} must be a non-empty slug of letters, digits, '-' or '_'",
                self.name
            )));
        }
        if !actions.contains(&self.action) {
            return Err(SchedulerError::UnknownAction { name: self.action });
        }
        let start = self.start.unwrap_or_else(|| next_schedulable_tick(clock));
        let stop = match (self.stop, self.stop_is_relative) {
            (Some(offset), true) => Some(start.checked_add(offset).ok_or_else(|| {
                SchedulerError::InvalidEntry(format!(
                    "relative stop {offset} overflows start ({start})"
                ))
            })?),
            (stop, _) => stop,
        };
        check_timing(start, stop, self.interval)?;

        let now = Utc::now().to_rfc3339();
        Ok(ScheduleEntry {
            name: self.name,
            action: self.action,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            start,
            stop,
            interval: self.interval,
            is_active: true,
            callback_url: self.callback_url.filter(|url| !url.is_empty()),
            next_task_time: start,
            next_task_id: 1,
            owner: self.owner,
            created_at: now.clone(),
            modified_at: now,
        })
    }
}

/// `interval` is at least 1 and `stop` comes after `start`.
pub(crate) fn check_timing(start: Tick, stop: Option<Tick>, interval: Option<i64>) -> Result<()> {
    if let Some(interval) = interval {
        if interval < 1 {
            return Err(SchedulerError::InvalidEntry(format!(
                "interval must be at least 1, got {interval}"
            )));
        }
    }
    if let Some(stop) = stop {
        if stop <= start {
            return Err(SchedulerError::InvalidEntry(format!(
                "stop ({stop}) must be after start ({start})"
            )));
        }
    }
    Ok(())
}

fn is_slug(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Outcome of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Written before the action runs so the result row exists meanwhile.
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
    /// The task itself succeeded but its callback never arrived.
    #[serde(rename = "notification_failed")]
    NotificationFailed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::NotificationFailed => "notification_failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(TaskStatus::InProgress),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            "notification_failed" => Ok(TaskStatus::NotificationFailed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted record of one executed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub schedule_entry: String,
    pub task_id: i64,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// Seconds between `started` and `finished`.
    pub duration: f64,
    pub status: TaskStatus,
    /// Free-text detail returned by the action, or the error message.
    pub detail: String,
}

impl TaskResult {
    pub fn in_progress(schedule_entry: &str, task_id: i64, started: DateTime<Utc>) -> Self {
        Self {
            schedule_entry: schedule_entry.to_string(),
            task_id,
            started,
            finished: started,
            duration: 0.0,
            status: TaskStatus::InProgress,
            detail: String::new(),
        }
    }

    /// Fill in the outcome once the action has returned.
    pub fn finish(&mut self, finished: DateTime<Utc>, status: TaskStatus, detail: String) {
        self.finished = finished;
        self.duration = (finished - self.started)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.status = status;
        self.detail = detail;
    }
}

/// Lifecycle of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    /// No active entries, or between runs.
    Idle,
    /// Assembling or executing a pass.
    Running,
    /// Stop requested; the in-flight pass is finishing.
    Stopping,
}

impl std::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulerStatus::Idle => "idle",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> ActionRegistry {
        ActionRegistry::with_builtins()
    }

    #[test]
    fn defaults_fill_start_priority_and_cursor() {
        let clock = ManualClock::new(41);
        let entry = NewScheduleEntry::new("scan", "logger")
            .into_entry(&clock, &registry())
            .unwrap();
        assert_eq!(entry.start, 42);
        assert_eq!(entry.next_task_time, 42);
        assert_eq!(entry.next_task_id, 1);
        assert_eq!(entry.priority, DEFAULT_PRIORITY);
        assert!(entry.is_active);
    }

    #[test]
    fn relative_stop_is_offset_from_start() {
        let clock = ManualClock::new(0);
        let entry = NewScheduleEntry {
            start: Some(100),
            stop: Some(30),
            stop_is_relative: true,
            interval: Some(10),
            ..NewScheduleEntry::new("rel", "logger")
        }
        .into_entry(&clock, &registry())
        .unwrap();
        assert_eq!(entry.stop, Some(130));
    }

    #[test]
    fn relative_stop_overflow_is_rejected() {
        let clock = ManualClock::new(0);
        let entry = NewScheduleEntry {
            start: Some(i64::MAX - 5),
            stop: Some(10),
            stop_is_relative: true,
            ..NewScheduleEntry::new("rel", "logger")
        }
        .into_entry(&clock, &registry());
        assert!(matches!(entry, Err(SchedulerError::InvalidEntry(_))));
    }

    #[test]
    fn rejects_bad_slug_interval_stop_and_action() {
        let clock = ManualClock::new(0);
        let bad_name = NewScheduleEntry::new("has space", "logger").into_entry(&clock, &registry());
        assert!(matches!(bad_name, Err(SchedulerError::InvalidEntry(_))));

        let bad_interval = NewScheduleEntry {
            interval: Some(0),
            ..NewScheduleEntry::new("a", "logger")
        }
        .into_entry(&clock, &registry());
        assert!(matches!(bad_interval, Err(SchedulerError::InvalidEntry(_))));

        let bad_stop = NewScheduleEntry {
            start: Some(5),
            stop: Some(5),
            ..NewScheduleEntry::new("b", "logger")
        }
        .into_entry(&clock, &registry());
        assert!(matches!(bad_stop, Err(SchedulerError::InvalidEntry(_))));

        let bad_action = NewScheduleEntry::new("c", "no_such_action").into_entry(&clock, &registry());
        assert!(matches!(bad_action, Err(SchedulerError::UnknownAction { .. })));
    }

    #[test]
    fn changing_start_or_interval_resets_cursor() {
        let clock = ManualClock::new(0);
        let mut entry = NewScheduleEntry {
            start: Some(1),
            stop: Some(10),
            interval: Some(1),
            ..NewScheduleEntry::new("t", "logger")
        }
        .into_entry(&clock, &registry())
        .unwrap();

        // start moved before the next schedulable tick: cursor stays at now + 1
        let mut edit = entry.clone();
        edit.start = 0;
        entry.apply_update(&edit, &clock);
        assert_eq!(entry.next_task_time, 1);

        edit.start = 2;
        entry.apply_update(&edit, &clock);
        assert_eq!(entry.next_task_time, 2);

        clock.set(2);
        edit.interval = Some(10);
        entry.apply_update(&edit, &clock);
        assert_eq!(entry.next_task_time, 3);

        // priority-only edits leave the cursor alone
        entry.next_task_time = 13;
        edit.priority = 1;
        entry.apply_update(&edit, &clock);
        assert_eq!(entry.next_task_time, 13);
        assert_eq!(entry.priority, 1);
    }

    #[test]
    fn task_ids_increase() {
        let clock = ManualClock::new(0);
        let mut entry = NewScheduleEntry::new("ids", "logger")
            .into_entry(&clock, &registry())
            .unwrap();
        assert_eq!(entry.take_next_task_id(), 1);
        assert_eq!(entry.take_next_task_id(), 2);
        assert_eq!(entry.next_task_id, 3);
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for status in [
            TaskStatus::InProgress,
            TaskStatus::Success,
            TaskStatus::Failure,
            TaskStatus::NotificationFailed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
