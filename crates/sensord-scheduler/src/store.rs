use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::{
    clock::Clock,
    db::init_db,
    error::{Result, SchedulerError},
    types::{check_timing, ScheduleEntry, TaskResult, TaskStatus},
};

/// Persistence the scheduler loop needs.
///
/// Every pass re-reads entries through this trait, so edits made by other
/// processes (the CLI, an API) are picked up on the next tick.
pub trait ScheduleStore: Send + Sync {
    /// All entries with `is_active` set.
    fn active_entries(&self) -> Result<Vec<ScheduleEntry>>;

    fn get_entry(&self, name: &str) -> Result<ScheduleEntry>;

    /// Persist the scheduler-owned fields: `next_task_time`,
    /// `next_task_id` and `is_active`. Configuration is left alone. If the
    /// stored entry was modified since `entry` was read, only
    /// `next_task_id` moves forward; the edit's cursor and active flag win.
    fn save_cursor(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Clear `is_active` so the entry produces no more tasks.
    fn deactivate(&self, name: &str) -> Result<()>;

    /// Insert or replace the result for `(schedule_entry, task_id)`, then
    /// drop all but the newest `keep` results of that entry.
    fn record_result(&self, result: &TaskResult, keep: usize) -> Result<()>;

    /// Highest task id that has a stored result.
    fn last_task_id(&self, name: &str) -> Result<Option<i64>>;
}

/// SQLite-backed [`ScheduleStore`], plus the management operations used by
/// the CLI.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

const ENTRY_COLUMNS: &str = "name, action, priority, start, stop, interval, is_active,
     callback_url, next_task_time, next_task_id, owner, created_at, modified_at";

const RESULT_COLUMNS: &str =
    "schedule_entry, task_id, started, finished, duration, status, detail";

impl SqliteStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::Internal("store connection mutex poisoned".to_string()))
    }

    #[instrument(skip(self, entry), fields(entry = %entry.name))]
    pub fn insert_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "INSERT OR IGNORE INTO schedule_entries
             (name, action, priority, start, stop, interval, is_active,
              callback_url, next_task_time, next_task_id, owner, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                entry.name,
                entry.action,
                entry.priority,
                entry.start,
                entry.stop,
                entry.interval,
                entry.is_active,
                entry.callback_url,
                entry.next_task_time,
                entry.next_task_id,
                entry.owner,
                entry.created_at,
                entry.modified_at,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::EntryExists {
                name: entry.name.clone(),
            });
        }
        info!("schedule entry added");
        Ok(())
    }

    /// Replace the configuration of an existing entry.
    ///
    /// The stored cursor survives unless `start` or `interval` changed; see
    /// [`ScheduleEntry::apply_update`].
    #[instrument(skip(self, updated, clock), fields(entry = %updated.name))]
    pub fn update_entry(&self, updated: &ScheduleEntry, clock: &dyn Clock) -> Result<ScheduleEntry> {
        check_timing(updated.start, updated.stop, updated.interval)?;
        let mut entry = self.get_entry(&updated.name)?;
        entry.apply_update(updated, clock);

        let db = self.conn()?;
        db.execute(
            "UPDATE schedule_entries
             SET action = ?2, priority = ?3, start = ?4, stop = ?5, interval = ?6,
                 is_active = ?7, callback_url = ?8, next_task_time = ?9, owner = ?10,
                 modified_at = ?11
             WHERE name = ?1",
            rusqlite::params![
                entry.name,
                entry.action,
                entry.priority,
                entry.start,
                entry.stop,
                entry.interval,
                entry.is_active,
                entry.callback_url,
                entry.next_task_time,
                entry.owner,
                entry.modified_at,
            ],
        )?;
        info!(next_task_time = entry.next_task_time, "schedule entry updated");
        Ok(entry)
    }

    /// Delete an entry and its results.
    #[instrument(skip(self))]
    pub fn delete_entry(&self, name: &str) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let n = tx.execute("DELETE FROM schedule_entries WHERE name = ?1", [name])?;
        if n == 0 {
            return Err(SchedulerError::EntryNotFound {
                name: name.to_string(),
            });
        }
        tx.execute("DELETE FROM task_results WHERE schedule_entry = ?1", [name])?;
        tx.commit()?;
        info!("schedule entry deleted");
        Ok(())
    }

    /// Every entry, active or not, ordered by name.
    pub fn list_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM schedule_entries ORDER BY name"
        ))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Newest results of one entry first, at most `limit`.
    pub fn list_results(&self, name: &str, limit: usize) -> Result<Vec<TaskResult>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM task_results
             WHERE schedule_entry = ?1
             ORDER BY task_id DESC
             LIMIT ?2"
        ))?;
        let results = stmt
            .query_map(rusqlite::params![name, limit as i64], row_to_result)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    pub fn get_result(&self, name: &str, task_id: i64) -> Result<Option<TaskResult>> {
        let db = self.conn()?;
        let result = db
            .query_row(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM task_results
                     WHERE schedule_entry = ?1 AND task_id = ?2"
                ),
                rusqlite::params![name, task_id],
                row_to_result,
            )
            .optional()?;
        Ok(result)
    }
}

impl ScheduleStore for SqliteStore {
    fn active_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM schedule_entries WHERE is_active = 1 ORDER BY name"
        ))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn get_entry(&self, name: &str) -> Result<ScheduleEntry> {
        let db = self.conn()?;
        db.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM schedule_entries WHERE name = ?1"),
            [name],
            row_to_entry,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::EntryNotFound {
            name: name.to_string(),
        })
    }

    fn save_cursor(&self, entry: &ScheduleEntry) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE schedule_entries
             SET next_task_time = ?2, next_task_id = ?3, is_active = is_active AND ?4
             WHERE name = ?1 AND modified_at = ?5",
            rusqlite::params![
                entry.name,
                entry.next_task_time,
                entry.next_task_id,
                entry.is_active,
                entry.modified_at,
            ],
        )?;
        if n == 0 {
            // edited since the snapshot: keep its cursor, but never reuse ids
            db.execute(
                "UPDATE schedule_entries SET next_task_id = MAX(next_task_id, ?2) WHERE name = ?1",
                rusqlite::params![entry.name, entry.next_task_id],
            )?;
            debug!(entry = %entry.name, "entry changed since read, cursor not saved");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn deactivate(&self, name: &str) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE schedule_entries SET is_active = 0, modified_at = ?2 WHERE name = ?1",
            rusqlite::params![name, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(SchedulerError::EntryNotFound {
                name: name.to_string(),
            });
        }
        info!("schedule entry deactivated");
        Ok(())
    }

    fn record_result(&self, result: &TaskResult, keep: usize) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO task_results
             (schedule_entry, task_id, started, finished, duration, status, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (schedule_entry, task_id) DO UPDATE SET
                started = excluded.started,
                finished = excluded.finished,
                duration = excluded.duration,
                status = excluded.status,
                detail = excluded.detail",
            rusqlite::params![
                result.schedule_entry,
                result.task_id,
                result.started.to_rfc3339(),
                result.finished.to_rfc3339(),
                result.duration,
                result.status.to_string(),
                result.detail,
            ],
        )?;
        let pruned = db.execute(
            "DELETE FROM task_results
             WHERE schedule_entry = ?1 AND task_id NOT IN (
                 SELECT task_id FROM task_results
                 WHERE schedule_entry = ?1
                 ORDER BY task_id DESC
                 LIMIT ?2
             )",
            rusqlite::params![result.schedule_entry, keep as i64],
        )?;
        if pruned > 0 {
            debug!(entry = %result.schedule_entry, pruned, "old task results pruned");
        }
        Ok(())
    }

    fn last_task_id(&self, name: &str) -> Result<Option<i64>> {
        let db = self.conn()?;
        let id = db.query_row(
            "SELECT MAX(task_id) FROM task_results WHERE schedule_entry = ?1",
            [name],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(id)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        name: row.get(0)?,
        action: row.get(1)?,
        priority: row.get(2)?,
        start: row.get(3)?,
        stop: row.get(4)?,
        interval: row.get(5)?,
        is_active: row.get(6)?,
        callback_url: row.get(7)?,
        next_task_time: row.get(8)?,
        next_task_id: row.get(9)?,
        owner: row.get(10)?,
        created_at: row.get(11)?,
        modified_at: row.get(12)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskResult> {
    let status: String = row.get(5)?;
    Ok(TaskResult {
        schedule_entry: row.get(0)?,
        task_id: row.get(1)?,
        started: parse_timestamp(row, 2)?,
        finished: parse_timestamp(row, 3)?,
        duration: row.get(4)?,
        status: status.parse::<TaskStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into())
        })?,
        detail: row.get(6)?,
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::clock::ManualClock;
    use crate::types::NewScheduleEntry;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn entry(name: &str, clock: &ManualClock) -> ScheduleEntry {
        NewScheduleEntry {
            start: Some(1),
            stop: Some(10),
            interval: Some(1),
            callback_url: Some("http://example.invalid/hook".to_string()),
            ..NewScheduleEntry::new(name, "logger")
        }
        .into_entry(clock, &ActionRegistry::with_builtins())
        .unwrap()
    }

    fn result(name: &str, task_id: i64, status: TaskStatus) -> TaskResult {
        let mut r = TaskResult::in_progress(name, task_id, Utc::now());
        r.finish(Utc::now(), status, format!("task {task_id}"));
        r
    }

    #[test]
    fn insert_get_and_list() {
        let clock = ManualClock::new(0);
        let s = store();
        let e = entry("scan", &clock);
        s.insert_entry(&e).unwrap();

        assert_eq!(s.get_entry("scan").unwrap(), e);
        assert_eq!(s.list_entries().unwrap(), vec![e.clone()]);
        assert_eq!(s.active_entries().unwrap(), vec![e]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let clock = ManualClock::new(0);
        let s = store();
        s.insert_entry(&entry("scan", &clock)).unwrap();
        let err = s.insert_entry(&entry("scan", &clock)).unwrap_err();
        assert!(matches!(err, SchedulerError::EntryExists { name } if name == "scan"));
    }

    #[test]
    fn missing_entry_is_not_found() {
        let s = store();
        assert!(matches!(
            s.get_entry("nope"),
            Err(SchedulerError::EntryNotFound { .. })
        ));
        assert!(matches!(
            s.deactivate("nope"),
            Err(SchedulerError::EntryNotFound { .. })
        ));
        assert!(matches!(
            s.delete_entry("nope"),
            Err(SchedulerError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn save_cursor_leaves_configuration_alone() {
        let clock = ManualClock::new(0);
        let s = store();
        let mut e = entry("scan", &clock);
        s.insert_entry(&e).unwrap();

        e.next_task_time = 7;
        e.next_task_id = 4;
        e.priority = 99;
        s.save_cursor(&e).unwrap();

        let stored = s.get_entry("scan").unwrap();
        assert_eq!(stored.next_task_time, 7);
        assert_eq!(stored.next_task_id, 4);
        assert_eq!(stored.priority, 10);
    }

    #[test]
    fn save_cursor_does_not_clobber_concurrent_edit() {
        let clock = ManualClock::new(100);
        let s = store();
        let e = NewScheduleEntry {
            start: Some(1),
            interval: Some(1),
            ..NewScheduleEntry::new("scan", "logger")
        }
        .into_entry(&clock, &ActionRegistry::with_builtins())
        .unwrap();
        s.insert_entry(&e).unwrap();

        let mut snapshot = s.active_entries().unwrap().remove(0);

        let mut edit = s.get_entry("scan").unwrap();
        edit.start = 500;
        s.update_entry(&edit, &clock).unwrap();

        assert_eq!(snapshot.take_pending(&clock).last(), Some(100));
        let task_id = snapshot.take_next_task_id();
        s.save_cursor(&snapshot).unwrap();

        let stored = s.get_entry("scan").unwrap();
        assert_eq!(stored.start, 500);
        assert_eq!(stored.next_task_time, 500);
        assert_eq!(stored.next_task_id, task_id + 1);
        assert!(stored.is_active);
    }

    #[test]
    fn save_cursor_keeps_cancelled_entry_cancelled() {
        let clock = ManualClock::new(0);
        let s = store();
        s.insert_entry(&entry("scan", &clock)).unwrap();
        let mut snapshot = s.get_entry("scan").unwrap();
        s.deactivate("scan").unwrap();

        snapshot.next_task_time = 3;
        s.save_cursor(&snapshot).unwrap();
        assert!(!s.get_entry("scan").unwrap().is_active);
    }

    #[test]
    fn deactivated_entries_are_not_active() {
        let clock = ManualClock::new(0);
        let s = store();
        s.insert_entry(&entry("a", &clock)).unwrap();
        s.insert_entry(&entry("b", &clock)).unwrap();
        s.deactivate("a").unwrap();

        let active: Vec<String> = s.active_entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(active, vec!["b"]);
        assert!(!s.get_entry("a").unwrap().is_active);
    }

    #[test]
    fn update_resets_cursor_when_interval_changes() {
        let clock = ManualClock::new(0);
        let s = store();
        let mut e = entry("scan", &clock);
        s.insert_entry(&e).unwrap();
        e.next_task_time = 5;
        s.save_cursor(&e).unwrap();

        clock.set(3);
        let mut edit = s.get_entry("scan").unwrap();
        edit.interval = Some(2);
        let updated = s.update_entry(&edit, &clock).unwrap();
        assert_eq!(updated.next_task_time, 4);
        assert_eq!(s.get_entry("scan").unwrap().next_task_time, 4);
    }

    #[test]
    fn update_rejects_bad_timing() {
        let clock = ManualClock::new(0);
        let s = store();
        s.insert_entry(&entry("scan", &clock)).unwrap();

        let mut edit = s.get_entry("scan").unwrap();
        edit.stop = Some(edit.start);
        assert!(matches!(
            s.update_entry(&edit, &clock),
            Err(SchedulerError::InvalidEntry(_))
        ));

        let mut edit = s.get_entry("scan").unwrap();
        edit.interval = Some(0);
        assert!(matches!(
            s.update_entry(&edit, &clock),
            Err(SchedulerError::InvalidEntry(_))
        ));

        let stored = s.get_entry("scan").unwrap();
        assert_eq!((stored.stop, stored.interval), (Some(10), Some(1)));
        assert!(stored.is_active);
    }

    #[test]
    fn results_upsert_and_prune() {
        let clock = ManualClock::new(0);
        let s = store();
        s.insert_entry(&entry("scan", &clock)).unwrap();

        s.record_result(&TaskResult::in_progress("scan", 1, Utc::now()), 3)
            .unwrap();
        assert_eq!(
            s.get_result("scan", 1).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
        s.record_result(&result("scan", 1, TaskStatus::Success), 3).unwrap();
        let stored = s.get_result("scan", 1).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.detail, "task 1");

        for id in 2..=5 {
            s.record_result(&result("scan", id, TaskStatus::Failure), 3).unwrap();
        }
        let ids: Vec<i64> = s
            .list_results("scan", 10)
            .unwrap()
            .into_iter()
            .map(|r| r.task_id)
            .collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(s.last_task_id("scan").unwrap(), Some(5));
        assert_eq!(s.last_task_id("other").unwrap(), None);
    }

    #[test]
    fn delete_removes_results() {
        let clock = ManualClock::new(0);
        let s = store();
        s.insert_entry(&entry("scan", &clock)).unwrap();
        s.record_result(&result("scan", 1, TaskStatus::Success), 10).unwrap();

        s.delete_entry("scan").unwrap();
        assert!(s.list_entries().unwrap().is_empty());
        assert!(s.list_results("scan", 10).unwrap().is_empty());
    }
}
