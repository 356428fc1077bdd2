use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use sensord_core::{CallbackConfig, SchedulerConfig};
use serde::Serialize;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    action::{panic_message, ActionRegistry},
    callback::{CallbackPayload, ResultNotifier},
    clock::{Clock, Tick},
    error::{Result, SchedulerError},
    store::ScheduleStore,
    task::{Task, TaskQueue},
    types::{ScheduleEntry, SchedulerStatus, TaskResult, TaskStatus},
};

/// State shared between the loop and its handles.
struct Shared {
    state: Mutex<LoopState>,
    shutdown: watch::Sender<bool>,
}

struct LoopState {
    status: SchedulerStatus,
    /// Informational lookahead, rebuilt every pass and never executed.
    upcoming: TaskQueue,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_pass(&self) {
        let mut state = self.lock();
        if state.status != SchedulerStatus::Stopping {
            state.status = SchedulerStatus::Running;
        }
    }

    fn set_idle(&self) -> SchedulerStatus {
        std::mem::replace(&mut self.lock().status, SchedulerStatus::Idle)
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Cloneable view of a running [`Scheduler`] for the host process.
///
/// Everything here is safe to call from any task or thread while the loop
/// runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    max_task_queue: usize,
}

/// What the inspection surface reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub status: SchedulerStatus,
    pub task_queue: Vec<Task>,
}

impl SchedulerHandle {
    /// Ask the loop to stop after the in-flight pass. Idempotent.
    pub fn stop(&self) {
        self.shared.shutdown.send_replace(true);
        let mut state = self.shared.lock();
        if state.status == SchedulerStatus::Running {
            state.status = SchedulerStatus::Stopping;
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared.lock().status
    }

    /// The first `limit` upcoming tasks in execution order.
    pub fn upcoming(&self, limit: usize) -> Vec<Task> {
        let mut tasks = self.shared.lock().upcoming.to_list();
        tasks.truncate(limit);
        tasks
    }

    /// Status plus upcoming tasks, capped at `max_task_queue`.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.shared.lock();
        let mut task_queue = state.upcoming.to_list();
        task_queue.truncate(self.max_task_queue);
        SchedulerSnapshot {
            status: state.status,
            task_queue,
        }
    }
}

/// Writes the final task result and delivers its callback.
#[derive(Clone)]
struct Finalizer {
    store: Arc<dyn ScheduleStore>,
    notifier: Option<Arc<dyn ResultNotifier>>,
    result_base_url: String,
    keep: usize,
}

impl Finalizer {
    async fn finalize(&self, mut result: TaskResult, callback_url: Option<String>) -> Result<()> {
        self.store.record_result(&result, self.keep)?;

        let Some(url) = callback_url else {
            return Ok(());
        };
        let Some(notifier) = &self.notifier else {
            warn!(entry = %result.schedule_entry, "callback_url set but no notifier configured");
            return Ok(());
        };

        let payload = CallbackPayload::from_result(&result, &self.result_base_url);
        debug!(entry = %result.schedule_entry, task_id = result.task_id, %url, "posting task result");
        if let Err(e) = notifier.notify(&url, &payload).await {
            warn!(
                entry = %result.schedule_entry,
                task_id = result.task_id,
                status = ?result.status,
                "callback failed: {e}"
            );
            // a failed task stays failed
            if result.status == TaskStatus::Success {
                result.status = TaskStatus::NotificationFailed;
                self.store.record_result(&result, self.keep)?;
            }
        }
        Ok(())
    }
}

/// Turns active schedule entries into tasks and runs them.
///
/// Only one scheduler may run against a given store; two would execute
/// every task twice.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    actions: Arc<ActionRegistry>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    asynchronous_callbacks: bool,
    finalizer: Finalizer,
    shared: Arc<Shared>,
    consecutive_failures: u32,
    /// Result finalisation spawned in asynchronous-callback mode.
    inflight: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        actions: Arc<ActionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = SchedulerConfig::default();
        let callback = CallbackConfig::default();
        let (shutdown, _) = watch::channel(false);
        Self {
            finalizer: Finalizer {
                store: Arc::clone(&store),
                notifier: None,
                result_base_url: callback.result_base_url,
                keep: config.max_task_results,
            },
            store,
            actions,
            clock,
            config,
            asynchronous_callbacks: callback.asynchronous,
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState {
                    status: SchedulerStatus::Idle,
                    upcoming: TaskQueue::new(),
                }),
                shutdown,
            }),
            consecutive_failures: 0,
            inflight: JoinSet::new(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.finalizer.keep = config.max_task_results;
        self.config = config;
        self
    }

    /// Deliver results of entries with a `callback_url` through `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn ResultNotifier>, callback: &CallbackConfig) -> Self {
        self.finalizer.notifier = Some(notifier);
        self.finalizer.result_base_url = callback.result_base_url.clone();
        self.asynchronous_callbacks = callback.asynchronous;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
            max_task_queue: self.config.max_task_queue,
        }
    }

    /// Remove an entry from the schedule without deleting it.
    pub fn cancel(&self, name: &str) -> Result<()> {
        self.store.deactivate(name)
    }

    /// One non-blocking pass; returns once the due tasks have run.
    pub async fn run_once(&mut self) -> Result<()> {
        self.pass().await?;
        self.reap_finished();
        self.shared.set_idle();
        Ok(())
    }

    /// Run passes until [`SchedulerHandle::stop`] is called.
    ///
    /// A pass starts at most once per clock tick. Store failures while
    /// assembling a pass are fatal: the loop logs, touches the health-check
    /// file if one is configured, and returns the error.
    pub async fn run(mut self) -> Result<()> {
        if let Some(path) = &self.config.healthcheck_file {
            remove_healthcheck(Path::new(path));
        }
        info!("scheduler started");

        let result = self.run_until_stopped().await;
        self.flush().await;
        self.shared.set_idle();

        match &result {
            Ok(()) => info!("scheduler interrupted"),
            Err(e) => {
                error!("scheduler dead: {e}");
                if let Some(path) = &self.config.healthcheck_file {
                    touch_healthcheck(Path::new(path));
                }
            }
        }
        result
    }

    /// Wait for results being finalised in the background.
    pub async fn flush(&mut self) {
        while let Some(joined) = self.inflight.join_next().await {
            if let Err(e) = joined {
                error!("result finalisation task failed: {e}");
            }
        }
    }

    async fn run_until_stopped(&mut self) -> Result<()> {
        let mut shutdown = self.shared.shutdown.subscribe();
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        self.restore_task_ids()?;
        loop {
            let started = self.clock.now();
            self.pass().await?;
            self.reap_finished();

            if self.shared.stop_requested() {
                return Ok(());
            }
            while self.clock.now() == started && !self.shared.stop_requested() {
                tokio::select! {
                    _ = self.clock.delay(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
            if self.shared.stop_requested() {
                return Ok(());
            }
        }
    }

    /// Bump each active entry's `next_task_id` past its last stored result.
    fn restore_task_ids(&self) -> Result<()> {
        for mut entry in self.store.active_entries()? {
            if let Some(last) = self.store.last_task_id(&entry.name)? {
                if entry.next_task_id != last + 1 {
                    debug!(entry = %entry.name, from = entry.next_task_id, to = last + 1, "restoring next task id");
                    entry.next_task_id = last + 1;
                    self.store.save_cursor(&entry)?;
                }
            }
        }
        Ok(())
    }

    async fn pass(&mut self) -> Result<()> {
        let mut entries = self.store.active_entries()?;
        if entries.is_empty() {
            self.shared.lock().upcoming.clear();
            if self.shared.set_idle() != SchedulerStatus::Idle {
                info!("all scheduled tasks completed");
            }
            return Ok(());
        }

        self.shared.begin_pass();
        let mut pending = self.queue_pending_tasks(&mut entries)?;
        let upcoming = self.queue_upcoming_tasks(&entries);
        self.shared.lock().upcoming = upcoming;

        while let Some(task) = pending.pop() {
            let Some(status) = self.run_task(&task).await? else {
                continue;
            };
            if !self.record_outcome(status) {
                break;
            }
        }
        Ok(())
    }

    /// Consume every due tick, compressing a run of missed ticks into the
    /// most recent one, and persist each entry's cursor.
    fn queue_pending_tasks(&self, entries: &mut [ScheduleEntry]) -> Result<TaskQueue> {
        let mut pending = TaskQueue::new();
        for entry in entries.iter_mut() {
            let times = entry.take_pending(self.clock.as_ref());
            let due = times.bounded_len().unwrap_or(0);
            let most_recent = times.last();
            if due > 1 {
                warn!(
                    entry = %entry.name,
                    skipped = due - 1,
                    "skipping {} {} tasks with times in the past",
                    due - 1,
                    entry.name
                );
            }

            if !entry.has_remaining_times() {
                info!(entry = %entry.name, "no times remaining in {}, removing", entry.name);
                entry.is_active = false;
            }

            if let Some(time) = most_recent {
                let task_id = entry.take_next_task_id();
                pending.enter(time, entry.priority, &entry.action, &entry.name, Some(task_id));
            }
            self.store.save_cursor(entry)?;
        }
        Ok(pending)
    }

    /// Lookahead of `min_interval * lookahead_multiplier` ticks, so a fast
    /// entry cannot hide a slow one.
    fn queue_upcoming_tasks(&self, entries: &[ScheduleEntry]) -> TaskQueue {
        let min_interval = entries
            .iter()
            .filter_map(|e| e.interval)
            .filter(|i| *i > 0)
            .min()
            .unwrap_or(1);
        let lookahead: Tick = self
            .clock
            .now()
            .saturating_add(min_interval.saturating_mul(self.config.lookahead_multiplier));

        let mut upcoming = TaskQueue::new();
        for entry in entries {
            for time in entry.remaining_times(Some(lookahead)) {
                upcoming.enter(time, entry.priority, &entry.action, &entry.name, None);
            }
        }
        upcoming
    }

    /// Execute one pending task. Returns the action's outcome, or `None` if
    /// the entry vanished first; only store failures are errors.
    async fn run_task(&mut self, task: &Task) -> Result<Option<TaskStatus>> {
        let Some(task_id) = task.task_id else {
            return Err(SchedulerError::Internal(format!(
                "pending task for {} has no task id",
                task.schedule_entry_name
            )));
        };
        let entry = match self.store.get_entry(&task.schedule_entry_name) {
            Ok(entry) => entry,
            Err(SchedulerError::EntryNotFound { name }) => {
                warn!(entry = %name, task_id, "entry deleted before its task ran, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut result = TaskResult::in_progress(&entry.name, task_id, Utc::now());
        debug!(entry = %entry.name, task_id, "creating task result");
        self.store.record_result(&result, self.config.max_task_results)?;

        let (status, detail) = self.call_action(task, task_id).await;
        result.finish(
            Utc::now(),
            status,
            truncate_chars(detail, self.config.max_detail_len),
        );
        self.clock.delay(Duration::ZERO).await;

        if self.asynchronous_callbacks {
            let finalizer = self.finalizer.clone();
            let callback_url = entry.callback_url;
            self.inflight.spawn(async move {
                let entry = result.schedule_entry.clone();
                if let Err(e) = finalizer.finalize(result, callback_url).await {
                    error!(%entry, "failed to finalise task result: {e}");
                }
            });
        } else {
            self.finalizer.finalize(result, entry.callback_url).await?;
        }
        Ok(Some(status))
    }

    async fn call_action(&self, task: &Task, task_id: i64) -> (TaskStatus, String) {
        let name = &task.schedule_entry_name;
        let action = match self.actions.get(&task.action) {
            Ok(action) => action,
            Err(e) => {
                error!(entry = %name, task_id, action = %task.action, "no such action");
                return (TaskStatus::Failure, e.to_string());
            }
        };

        debug!(entry = %name, task_id, action = %task.action, "running task {name}/{task_id}");
        match AssertUnwindSafe(action.call(name, task_id)).catch_unwind().await {
            Ok(Ok(detail)) => (TaskStatus::Success, detail.unwrap_or_default()),
            Ok(Err(e)) => {
                error!(entry = %name, task_id, "action failed: {e:#}");
                (TaskStatus::Failure, format!("{e:#}"))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(entry = %name, task_id, "action panicked: {msg}");
                (TaskStatus::Failure, format!("action panicked: {msg}"))
            }
        }
    }

    /// Track back-to-back failures. Returns `false` once the breaker trips.
    fn record_outcome(&mut self, status: TaskStatus) -> bool {
        if status == TaskStatus::Failure {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        match self.config.max_consecutive_failures {
            Some(limit) if self.consecutive_failures >= limit => {
                error!(
                    failures = self.consecutive_failures,
                    "too many consecutive task failures, stopping scheduler"
                );
                self.handle().stop();
                false
            }
            _ => true,
        }
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.inflight.try_join_next() {
            if let Err(e) = joined {
                error!("result finalisation task failed: {e}");
            }
        }
    }
}

fn truncate_chars(mut s: String, max: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
    s
}

fn remove_healthcheck(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed health-check file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove health-check file: {e}"),
    }
}

fn touch_healthcheck(path: &Path) {
    if let Err(e) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        error!(path = %path.display(), "failed to touch health-check file: {e}");
    }
}
