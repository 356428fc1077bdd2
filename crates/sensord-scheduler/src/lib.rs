//! `sensord-scheduler` — tick-based task scheduler with SQLite persistence.
//!
//! # Overview
//!
//! [`ScheduleEntry`] rows describe when an action should run: a `start`
//! tick, an optional exclusive `stop`, and an optional `interval` (none
//! means run once). Every pass the [`Scheduler`]:
//!
//! 1. re-reads the active entries from its [`ScheduleStore`],
//! 2. consumes each entry's due ticks, compressing a backlog of missed ticks
//!    into one task,
//! 3. rebuilds the informational upcoming queue,
//! 4. runs the due tasks in `(time, priority)` order, recording a
//!    [`TaskResult`] for each and POSTing it to the entry's callback URL.
//!
//! Action failures and panics are recorded and never stop the loop. Time
//! comes from an injected [`Clock`]; tests drive the loop with a
//! [`ManualClock`].
//!
//! | Entry shape                  | Ticks                             |
//! |------------------------------|-----------------------------------|
//! | `interval`, no `stop`        | `start, start + i, ...` forever   |
//! | `interval`, `stop`           | `[start, stop)` stepped by `i`    |
//! | no `interval`                | `start` once                      |

pub mod action;
pub mod callback;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod store;
pub mod task;
pub mod types;

pub use action::{Action, ActionRegistry, BlockingAction, LoggerAction};
pub use callback::{CallbackPayload, HttpNotifier, ResultNotifier};
pub use clock::{Clock, ManualClock, SystemClock, Tick};
pub use engine::{Scheduler, SchedulerHandle, SchedulerSnapshot};
pub use error::{Result, SchedulerError};
pub use schedule::TaskTimes;
pub use store::{ScheduleStore, SqliteStore};
pub use task::{Task, TaskQueue};
pub use types::{NewScheduleEntry, ScheduleEntry, SchedulerStatus, TaskResult, TaskStatus};
