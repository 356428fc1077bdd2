use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, SchedulerError};

/// Work the scheduler runs for a task.
///
/// Returning `Ok(Some(detail))` records `detail` on the task result. Any
/// error, or a panic, marks the task failed; neither stops the scheduler.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, schedule_entry_name: &str, task_id: i64) -> anyhow::Result<Option<String>>;
}

/// Adapts a blocking closure (hardware acquisition, file I/O) into an
/// [`Action`] by running it on the blocking thread pool.
pub struct BlockingAction<F> {
    f: Arc<F>,
}

impl<F> BlockingAction<F>
where
    F: Fn(&str, i64) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> Action for BlockingAction<F>
where
    F: Fn(&str, i64) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
{
    async fn call(&self, schedule_entry_name: &str, task_id: i64) -> anyhow::Result<Option<String>> {
        let f = Arc::clone(&self.f);
        let name = schedule_entry_name.to_string();
        match tokio::task::spawn_blocking(move || f(&name, task_id)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "action panicked: {}",
                panic_message(e.into_panic().as_ref())
            )),
            Err(e) => Err(anyhow::anyhow!("action was cancelled: {e}")),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Built-in action that only logs the task it was handed.
#[derive(Debug, Default)]
pub struct LoggerAction;

#[async_trait]
impl Action for LoggerAction {
    async fn call(&self, schedule_entry_name: &str, task_id: i64) -> anyhow::Result<Option<String>> {
        info!(entry = %schedule_entry_name, task_id, "running {schedule_entry_name}/{task_id}");
        Ok(None)
    }
}

/// Name → action lookup, built once at startup.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in actions (`logger`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("logger", LoggerAction);
        registry
    }

    /// Add or replace an action.
    pub fn register(&mut self, name: impl Into<String>, action: impl Action + 'static) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    /// Register a blocking closure; see [`BlockingAction`].
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&str, i64) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        self.register(name, BlockingAction::new(f));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Action>> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownAction {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
