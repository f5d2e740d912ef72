//! CSV ingestion of the input tables.
//!
//! Each table lives at `<data-dir>/<name>.csv`. Headers are checked before any
//! row is deserialized so a missing column surfaces as `SchemaMismatch` rather
//! than a per-row parse failure.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::detect::{DetectError, RunInputs};
use crate::model::{SignalInfo, TableInput};

/// File stem and required columns of one input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

pub const SIGNALS: TableSpec = TableSpec {
    name: "signals",
    required: &["DeviceId", "Name", "Region"],
};

pub const TERMINATIONS: TableSpec = TableSpec {
    name: "terminations",
    required: &["TimeStamp", "DeviceId", "Phase", "PerformanceMeasure", "Total"],
};

/// `prediction` and `anomaly` are optional pass-through columns.
pub const DETECTOR_HEALTH: TableSpec = TableSpec {
    name: "detector_health",
    required: &["TimeStamp", "DeviceId", "Detector", "Total"],
};

pub const HAS_DATA: TableSpec = TableSpec {
    name: "has_data",
    required: &["TimeStamp", "DeviceId"],
};

pub const FULL_PED: TableSpec = TableSpec {
    name: "full_ped",
    required: &["TimeStamp", "DeviceId", "Phase", "PedActuation", "PedServices"],
};

pub const PHASE_SKIP_EVENTS: TableSpec = TableSpec {
    name: "phase_skip_events",
    required: &["deviceid", "timestamp", "eventid", "parameter"],
};

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Accepts `YYYY-MM-DD HH:MM:SS[.f]`, the ISO `T` form (optionally with a
/// trailing `Z`), and a bare date meaning midnight.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    let s = s.strip_suffix('Z').unwrap_or(s);
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", raw)))
}

/// Boolean flag written as `true`/`false`, `1`/`0` or left empty.
pub fn de_flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "1.0" | "yes" => Ok(Some(true)),
            "false" | "f" | "0" | "0.0" | "no" => Ok(Some(false)),
            other => Err(D::Error::custom(format!("invalid flag '{}'", other))),
        },
    }
}

/// Read and validate one table from any reader.
pub fn read_csv<R, T>(reader: R, spec: &TableSpec) -> std::result::Result<Vec<T>, DetectError>
where
    R: Read,
    T: DeserializeOwned,
{
    let unreadable = |e: csv::Error| DetectError::UnreadableTable {
        table: spec.name.to_string(),
        reason: e.to_string(),
    };

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().map_err(unreadable)?.clone();
    if let Some(column) = spec
        .required
        .iter()
        .find(|col| !headers.iter().any(|h| h == **col))
    {
        return Err(DetectError::SchemaMismatch {
            table: spec.name.to_string(),
            column: column.to_string(),
        });
    }

    rdr.deserialize().collect::<std::result::Result<Vec<T>, _>>().map_err(unreadable)
}

/// Load an optional table. Absence is not an error.
pub fn load_table<T: DeserializeOwned>(dir: &Path, spec: &TableSpec) -> TableInput<T> {
    let path = dir.join(format!("{}.csv", spec.name));
    if !path.exists() {
        debug!(table = spec.name, path = %path.display(), "table not supplied");
        return TableInput::Missing;
    }

    let result = File::open(&path)
        .map_err(|e| DetectError::UnreadableTable {
            table: spec.name.to_string(),
            reason: e.to_string(),
        })
        .and_then(|file| read_csv(file, spec));

    match result {
        Ok(rows) => {
            debug!(table = spec.name, rows = rows.len(), "loaded table");
            TableInput::Loaded(rows)
        }
        Err(e) => {
            warn!(table = spec.name, error = %e, "table rejected");
            TableInput::Invalid(e)
        }
    }
}

/// The signal registry is required; anything short of a readable, non-empty
/// table aborts the run.
pub fn load_signals(dir: &Path) -> Result<Vec<SignalInfo>> {
    let path = dir.join(format!("{}.csv", SIGNALS.name));
    let file = File::open(&path)
        .with_context(|| format!("failed to open signal registry: {}", path.display()))?;
    let signals: Vec<SignalInfo> = read_csv(file, &SIGNALS)
        .with_context(|| format!("failed to read signal registry: {}", path.display()))?;
    if signals.is_empty() {
        bail!("signal registry {} has no rows", path.display());
    }
    Ok(signals)
}

/// Load every input table found under `dir`.
pub fn load_inputs(dir: &Path) -> Result<RunInputs> {
    if !dir.is_dir() {
        bail!("data directory does not exist: {}", dir.display());
    }

    let inputs = RunInputs {
        signals: load_signals(dir)?,
        terminations: load_table(dir, &TERMINATIONS),
        detector_health: load_table(dir, &DETECTOR_HEALTH),
        availability: load_table(dir, &HAS_DATA),
        pedestrian: load_table(dir, &FULL_PED),
        phase_skip_events: load_table(dir, &PHASE_SKIP_EVENTS),
    };
    info!(dir = %dir.display(), signals = inputs.signals.len(), "loaded input tables");
    Ok(inputs)
}
