//! SQLite persistence of state carried between runs.
//!
//! The detection core never touches the database; the CLI loads a
//! [`RunState`] before a run and saves the returned one afterwards.

pub mod schema;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Transaction};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::detect::phase_skip::{PhaseWait, PhaseWaitHistory};
use crate::detect::RunState;
use crate::model::{AlertHistory, AlertKey, Category, DeviceId, PastAlertRecord, PastAlerts};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open state database: {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// One stored history row, as listed by `phasewatch history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAlert {
    pub category: Category,
    pub key: AlertKey,
    pub last_alert_date: NaiveDate,
    pub run_id: Option<String>,
}

/// History rows, optionally for one category, newest first.
pub fn list_history(pool: &Pool, category: Option<Category>) -> Result<Vec<StoredAlert>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT category, alert_key, last_alert_date, run_id FROM past_alerts
         WHERE ?1 IS NULL OR category = ?1
         ORDER BY last_alert_date DESC, category, alert_key",
    )?;

    let rows = stmt.query_map([category.map(|c| c.as_str())], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut alerts = Vec::new();
    for r in rows {
        let (category, key, date, run_id) = r?;
        alerts.push(StoredAlert {
            category: category.parse()?,
            key: serde_json::from_str(&key)
                .with_context(|| format!("corrupt alert key in history: {}", key))?,
            last_alert_date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
                .with_context(|| format!("corrupt alert date in history: {}", date))?,
            run_id,
        });
    }
    Ok(alerts)
}

pub fn load_history(pool: &Pool) -> Result<AlertHistory> {
    let mut tables: BTreeMap<Category, Vec<PastAlertRecord>> = BTreeMap::new();
    for stored in list_history(pool, None)? {
        tables.entry(stored.category).or_default().push(PastAlertRecord {
            key: stored.key,
            date: stored.last_alert_date,
        });
    }

    let mut history = AlertHistory::new();
    for (category, records) in tables {
        history.set(category, PastAlerts::from(records));
    }
    debug!(records = history.total_records(), "loaded alert history");
    Ok(history)
}

/// Replace the stored history with `history` in one transaction.
pub fn save_history(pool: &Pool, history: &AlertHistory, run_id: Option<Uuid>) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    write_history(&tx, history, run_id)?;
    tx.commit().context("failed to commit alert history")?;
    Ok(())
}

fn write_history(tx: &Transaction, history: &AlertHistory, run_id: Option<Uuid>) -> Result<()> {
    tx.execute("DELETE FROM past_alerts", [])?;
    let mut stmt = tx.prepare(
        "INSERT INTO past_alerts (category, alert_key, last_alert_date, run_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    let run_id = run_id.map(|id| id.to_string());
    for (category, table) in history.iter() {
        for record in table.records() {
            stmt.execute(params![
                category.as_str(),
                serde_json::to_string(&record.key)?,
                record.date.format(DATE_FORMAT).to_string(),
                run_id,
            ])?;
        }
    }
    debug!(records = history.total_records(), "wrote alert history");
    Ok(())
}

pub fn load_phase_waits(pool: &Pool) -> Result<PhaseWaitHistory> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT device_id, phase, started_at, ended_at, wait_seconds, cycle_length, preempted
         FROM phase_waits",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, bool>(6)?,
        ))
    })?;

    let parse = |s: &str| {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .with_context(|| format!("corrupt timestamp in phase waits: {}", s))
    };

    let mut waits = Vec::new();
    for r in rows {
        let (device_id, phase, started_at, ended_at, wait_seconds, cycle_length, preempted) = r?;
        waits.push(PhaseWait {
            device_id: DeviceId::new(device_id),
            phase,
            started_at: parse(&started_at)?,
            ended_at: parse(&ended_at)?,
            wait_seconds,
            cycle_length,
            preempted,
        });
    }
    Ok(PhaseWaitHistory::new(waits))
}

pub fn save_phase_waits(pool: &Pool, waits: &PhaseWaitHistory) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    write_phase_waits(&tx, waits)?;
    tx.commit().context("failed to commit phase waits")?;
    Ok(())
}

fn write_phase_waits(tx: &Transaction, waits: &PhaseWaitHistory) -> Result<()> {
    tx.execute("DELETE FROM phase_waits", [])?;
    let mut stmt = tx.prepare(
        "INSERT INTO phase_waits
         (device_id, phase, started_at, ended_at, wait_seconds, cycle_length, preempted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for w in waits.waits() {
        stmt.execute(params![
            w.device_id.as_str(),
            w.phase,
            w.started_at.format(TIMESTAMP_FORMAT).to_string(),
            w.ended_at.format(TIMESTAMP_FORMAT).to_string(),
            w.wait_seconds,
            w.cycle_length,
            w.preempted,
        ])?;
    }
    Ok(())
}

pub fn load_state(pool: &Pool) -> Result<RunState> {
    Ok(RunState {
        history: load_history(pool)?,
        phase_waits: load_phase_waits(pool)?,
    })
}

/// Replace history and phase waits together; either both land or neither.
pub fn save_state(
    pool: &Pool,
    history: &AlertHistory,
    phase_waits: &PhaseWaitHistory,
    run_id: Option<Uuid>,
) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    write_history(&tx, history, run_id)?;
    write_phase_waits(&tx, phase_waits)?;
    tx.commit().context("failed to commit run state")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("state.db")).unwrap();
        (dir, pool)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    #[test]
    fn test_history_round_trip() {
        let (_dir, pool) = pool();
        let mut history = AlertHistory::new();
        let mut max_out = PastAlerts::new();
        max_out.upsert(AlertKey::phase(&DeviceId::from("s1"), 2), day(7));
        max_out.upsert(AlertKey::phase(&DeviceId::from("s2"), 4), day(3));
        history.set(Category::MaxOut, max_out);
        let mut outage = PastAlerts::new();
        outage.upsert(AlertKey::region("Region 1"), day(5));
        history.set(Category::SystemOutage, outage);

        let run_id = Uuid::new_v4();
        save_history(&pool, &history, Some(run_id)).unwrap();
        assert_eq!(load_history(&pool).unwrap(), history);

        let listed = list_history(&pool, Some(Category::MaxOut)).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].last_alert_date, day(7));
        assert_eq!(listed[0].run_id, Some(run_id.to_string()));
    }

    #[test]
    fn test_save_replaces_previous_rows() {
        let (_dir, pool) = pool();
        let mut history = AlertHistory::new();
        let mut table = PastAlerts::new();
        table.upsert(AlertKey::device(&DeviceId::from("s1")), day(1));
        history.set(Category::MissingData, table);
        save_state(&pool, &history, &PhaseWaitHistory::default(), None).unwrap();

        save_history(&pool, &AlertHistory::new(), None).unwrap();
        assert_eq!(load_history(&pool).unwrap().total_records(), 0);
    }

    #[test]
    fn test_phase_waits_round_trip() {
        let (_dir, pool) = pool();
        let ended = day(9).and_hms_milli_opt(14, 22, 30, 250).unwrap();
        let waits = PhaseWaitHistory::new(vec![PhaseWait {
            device_id: DeviceId::from("d1"),
            phase: 1,
            started_at: ended - chrono::Duration::seconds(200),
            ended_at: ended,
            wait_seconds: 200.0,
            cycle_length: 120.0,
            preempted: false,
        }]);

        save_phase_waits(&pool, &waits).unwrap();
        assert_eq!(load_phase_waits(&pool).unwrap(), waits);

        let state = RunState { history: AlertHistory::new(), phase_waits: waits };
        save_state(&pool, &state.history, &state.phase_waits, None).unwrap();
        assert_eq!(load_state(&pool).unwrap(), state);
    }

    #[test]
    fn test_failed_state_save_leaves_previous_state() {
        let (_dir, pool) = pool();
        let mut table = PastAlerts::new();
        table.upsert(AlertKey::phase(&DeviceId::from("s1"), 2), day(1));
        let mut history = AlertHistory::new();
        history.set(Category::MaxOut, table);
        save_state(&pool, &history, &PhaseWaitHistory::default(), None).unwrap();

        // two waits with the same (device, phase, end) break the unique index
        let wait = serde_json::json!({
            "device_id": "d1",
            "phase": 1,
            "started_at": "2024-02-09T14:19:10",
            "ended_at": "2024-02-09T14:22:30",
            "wait_seconds": 200.0,
            "cycle_length": 120.0,
            "preempted": false,
        });
        let duplicated: PhaseWaitHistory =
            serde_json::from_value(serde_json::json!([wait.clone(), wait])).unwrap();
        assert_eq!(duplicated.len(), 2);

        let err = save_state(&pool, &AlertHistory::new(), &duplicated, Some(Uuid::new_v4()));
        assert!(err.is_err());

        let kept = load_state(&pool).unwrap();
        assert_eq!(kept.history, history);
        assert!(kept.phase_waits.is_empty());
    }
}
