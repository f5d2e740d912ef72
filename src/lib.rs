//! phasewatch -- traffic signal performance anomaly detection.
//!
//! This crate provides daily metric derivation from ATSPM tables, baseline
//! and CUSUM detection across six issue categories, and the alert lifecycle
//! that keeps an unresolved issue from being reported on every run.

pub mod config;
pub mod detect;
pub mod ingest;
pub mod model;
pub mod storage;

use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;

use crate::config::ReportConfig;
use crate::detect::{AlertEngine, RunOutcome};

/// Load inputs from `data_dir`, run every category against the state stored
/// in `db_path`, and store the returned state.
///
/// Without an explicit date the run evaluates the latest day present in the
/// inputs.
pub fn run_report(
    data_dir: &Path,
    evaluation_date: Option<NaiveDate>,
    db_path: &Path,
    config: ReportConfig,
) -> Result<RunOutcome> {
    // 1. Load input tables
    let inputs = ingest::load_inputs(data_dir)?;
    let evaluation_date = match evaluation_date.or_else(|| inputs.latest_day()) {
        Some(date) => date,
        None => anyhow::bail!("no dated rows in {}; pass --date explicitly", data_dir.display()),
    };

    // 2. Load carried state
    tracing::info!(db_path = %db_path.display(), "Opening state database");
    let pool = storage::open_pool(db_path)?;
    let state = storage::load_state(&pool)?;

    // 3. Evaluate
    let engine = AlertEngine::new(config)?;
    let outcome = engine.run(&inputs, &state, evaluation_date)?;

    // 4. Persist the new state
    storage::save_state(
        &pool,
        &outcome.history,
        &outcome.phase_waits,
        Some(outcome.run_id),
    )?;

    Ok(outcome)
}
