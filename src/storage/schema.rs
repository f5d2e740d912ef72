//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS past_alerts (
            category TEXT NOT NULL,
            alert_key TEXT NOT NULL,
            last_alert_date TEXT NOT NULL,
            PRIMARY KEY (category, alert_key)
        );

        CREATE TABLE IF NOT EXISTS phase_waits (
            id INTEGER PRIMARY KEY,
            device_id TEXT NOT NULL,
            phase INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            wait_seconds REAL NOT NULL,
            cycle_length REAL NOT NULL,
            preempted INTEGER NOT NULL DEFAULT 0,
            UNIQUE (device_id, phase, ended_at)
        );

        CREATE INDEX IF NOT EXISTS idx_past_alerts_date ON past_alerts(last_alert_date);
        CREATE INDEX IF NOT EXISTS idx_phase_waits_ended ON phase_waits(ended_at);",
    )?;

    if version(conn)? < 1 {
        record_version(conn, 1)?;
    }

    // Migration 2: record which run last wrote each history row
    if version(conn)? < 2 {
        let has_run_id: i32 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('past_alerts') WHERE name='run_id'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if has_run_id == 0 {
            conn.execute("ALTER TABLE past_alerts ADD COLUMN run_id TEXT", [])?;
        }
        record_version(conn, 2)?;
    }

    Ok(())
}

/// Highest applied migration, 0 for a fresh database.
pub fn version(conn: &Connection) -> Result<i64> {
    let v = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })?;
    Ok(v)
}

fn record_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}
