use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedule_entries` and `task_results` tables (idempotent).
/// The scheduler polls `is_active` entries every tick, hence the index.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_entries (
            name            TEXT    NOT NULL PRIMARY KEY,
            action          TEXT    NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 10,
            start           INTEGER NOT NULL,
            stop            INTEGER,            -- NULL means never
            interval        INTEGER,            -- NULL means one-shot
            is_active       INTEGER NOT NULL DEFAULT 1,
            callback_url    TEXT,
            next_task_time  INTEGER NOT NULL,
            next_task_id    INTEGER NOT NULL DEFAULT 1,
            owner           TEXT,
            created_at      TEXT    NOT NULL,
            modified_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedule_entries_active
            ON schedule_entries (is_active);

        CREATE TABLE IF NOT EXISTS task_results (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_entry  TEXT    NOT NULL,
            task_id         INTEGER NOT NULL,
            started         TEXT    NOT NULL,   -- ISO-8601
            finished        TEXT    NOT NULL,   -- ISO-8601
            duration        REAL    NOT NULL DEFAULT 0,
            status          TEXT    NOT NULL DEFAULT 'in-progress',
            detail          TEXT    NOT NULL DEFAULT '',
            UNIQUE (schedule_entry, task_id)
        ) STRICT;
        ",
    )?;
    Ok(())
}
