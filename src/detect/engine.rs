use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ReportConfig;
use crate::detect::baseline::BaselineEstimator;
use crate::detect::category::{self, EvaluationWindow};
use crate::detect::cusum::{CusumDetector, PowerWeighting};
use crate::detect::lifecycle;
use crate::detect::metrics;
use crate::detect::phase_skip::{self, PhaseWaitHistory};
use crate::detect::DetectError;
use crate::model::{
    AlertCandidate, AlertHistory, AlertKey, AvailabilityPulse, Category, DetectorRow, DeviceId,
    MetricSeries, PedestrianRow, PhaseSkipEvent, SignalInfo, TableInput, TerminationRow,
};

/// A computation built now and run later.
///
/// Plans borrow the run inputs; nothing is computed until [`Deferred::materialize`].
pub struct Deferred<'a, T> {
    plan: Box<dyn FnOnce() -> T + 'a>,
}

impl<'a, T> Deferred<'a, T> {
    pub fn new(plan: impl FnOnce() -> T + 'a) -> Self {
        Self { plan: Box::new(plan) }
    }

    pub fn materialize(self) -> T {
        (self.plan)()
    }
}

/// Input tables for one run. The signal registry is the only required one.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub signals: Vec<SignalInfo>,
    pub terminations: TableInput<TerminationRow>,
    pub detector_health: TableInput<DetectorRow>,
    pub availability: TableInput<AvailabilityPulse>,
    pub pedestrian: TableInput<PedestrianRow>,
    pub phase_skip_events: TableInput<PhaseSkipEvent>,
}

impl RunInputs {
    /// Latest day with a row in any dated table.
    pub fn latest_day(&self) -> Option<NaiveDate> {
        fn latest<T>(input: &TableInput<T>, at: impl Fn(&T) -> NaiveDate) -> Option<NaiveDate> {
            input.rows().ok()?.iter().map(at).max()
        }

        [
            latest(&self.terminations, |r| r.timestamp.date()),
            latest(&self.detector_health, |r| r.timestamp.date()),
            latest(&self.availability, |r| r.timestamp.date()),
            latest(&self.pedestrian, |r| r.timestamp.date()),
            latest(&self.phase_skip_events, |r| r.timestamp.date()),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// Everything carried from one run to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub history: AlertHistory,
    pub phase_waits: PhaseWaitHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub day: NaiveDate,
    pub value: Option<f64>,
}

/// Daily values of the monitored metric over the evaluation window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyTrend {
    pub key: AlertKey,
    pub points: Vec<TrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryOutcome {
    Completed {
        alerts: Vec<AlertCandidate>,
        suppressed: usize,
        trends: Vec<KeyTrend>,
    },
    /// The category could not run; its history was carried forward as is.
    Failed { error: String },
}

impl CategoryOutcome {
    pub fn alerts(&self) -> &[AlertCandidate] {
        match self {
            CategoryOutcome::Completed { alerts, .. } => alerts,
            CategoryOutcome::Failed { .. } => &[],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CategoryOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub evaluation_date: NaiveDate,
    pub categories: BTreeMap<Category, CategoryOutcome>,
    pub history: AlertHistory,
    pub phase_waits: PhaseWaitHistory,
    /// Phase-skip events that could not be paired and were skipped.
    pub malformed_events: usize,
}

impl RunOutcome {
    pub fn alerts(&self, category: Category) -> &[AlertCandidate] {
        match self.categories.get(&category) {
            Some(outcome) => outcome.alerts(),
            None => &[],
        }
    }

    pub fn total_alerts(&self) -> usize {
        self.categories.values().map(|c| c.alerts().len()).sum()
    }

    /// Reported alerts for one region, across categories.
    pub fn alerts_for_region(&self, region: &str) -> Vec<&AlertCandidate> {
        self.categories
            .values()
            .flat_map(CategoryOutcome::alerts)
            .filter(|a| a.region.as_deref() == Some(region))
            .collect()
    }

    /// Regions with at least one reported alert.
    pub fn regions(&self) -> BTreeSet<&str> {
        self.categories
            .values()
            .flat_map(CategoryOutcome::alerts)
            .filter_map(|a| a.region.as_deref())
            .collect()
    }

    pub fn into_state(self) -> RunState {
        RunState {
            history: self.history,
            phase_waits: self.phase_waits,
        }
    }
}

/// Materialized output of one category plan.
struct Evaluation {
    candidates: Vec<AlertCandidate>,
    /// The monitored series, for trends.
    series: MetricSeries,
    /// Replacement wait history (phase skips only).
    phase_waits: Option<PhaseWaitHistory>,
    malformed: usize,
}

impl Evaluation {
    fn new(candidates: Vec<AlertCandidate>, series: MetricSeries) -> Self {
        Self {
            candidates,
            series,
            phase_waits: None,
            malformed: 0,
        }
    }
}

type Plan<'a> = Deferred<'a, Result<Evaluation, DetectError>>;

fn category_plan<'a>(plan: impl FnOnce() -> Result<Evaluation, DetectError> + 'a) -> Plan<'a> {
    Deferred::new(plan)
}

/// Rows of a table a category depends on. Missing or empty tables are
/// `EmptyInput`; invalid ones carry their load error.
fn required_rows<'t, T>(input: &'t TableInput<T>, table: &str) -> Result<&'t [T], DetectError> {
    let rows = input.rows()?;
    if rows.is_empty() {
        return Err(DetectError::EmptyInput { table: table.to_string() });
    }
    Ok(rows)
}

pub struct AlertEngine {
    config: ReportConfig,
    estimator: BaselineEstimator,
    detector: CusumDetector<PowerWeighting>,
}

impl AlertEngine {
    pub fn new(config: ReportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            estimator: config.baseline_estimator(),
            detector: config.cusum_detector(),
            config,
        })
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Evaluate every category for `evaluation_date`.
    ///
    /// Each category fails on its own; only an empty signal registry aborts
    /// the run. `state` is read, never modified.
    pub fn run(
        &self,
        inputs: &RunInputs,
        state: &RunState,
        evaluation_date: NaiveDate,
    ) -> Result<RunOutcome> {
        if inputs.signals.is_empty() {
            bail!("signal registry is empty; nothing to scope alerts to");
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, date = %evaluation_date);
        let _enter = span.enter();

        let window = self.config.evaluation_window(evaluation_date);
        let registry: BTreeMap<&DeviceId, &SignalInfo> =
            inputs.signals.iter().map(|s| (&s.device_id, s)).collect();
        let lifecycle_policy = self.config.lifecycle_policy();

        info!(
            signals = registry.len(),
            window_start = %window.span().start,
            baseline_cutoff = %window.baseline_cutoff(),
            "starting run"
        );

        let mut categories = BTreeMap::new();
        let mut history = AlertHistory::new();
        let mut phase_waits = state.phase_waits.clone();
        let mut malformed_events = 0;

        for (category, plan) in self.plans(inputs, state, &window) {
            let previous = state.history.table_or_default(category);

            let evaluation = match plan.materialize() {
                Ok(evaluation) => evaluation,
                Err(DetectError::EmptyInput { table }) => {
                    debug!(category = %category, table = %table, "no input rows");
                    Evaluation::new(Vec::new(), MetricSeries::new())
                }
                Err(e) => {
                    warn!(category = %category, error = %e, "category failed, keeping previous history");
                    history.set(category, previous);
                    categories.insert(category, CategoryOutcome::Failed { error: e.to_string() });
                    continue;
                }
            };

            if let Some(waits) = evaluation.phase_waits {
                phase_waits = waits;
            }
            malformed_events += evaluation.malformed;

            let candidates = scope_to_registry(evaluation.candidates, &registry);
            let outcome = lifecycle::apply(&lifecycle_policy, evaluation_date, candidates, &previous);
            let trends = trends(&outcome.to_report, &evaluation.series, &window);

            info!(
                category = %category,
                reported = outcome.to_report.len(),
                suppressed = outcome.suppressed,
                stale = outcome.stale,
                history = outcome.history.len(),
                "category evaluated"
            );

            history.set(category, outcome.history);
            categories.insert(
                category,
                CategoryOutcome::Completed {
                    alerts: outcome.to_report,
                    suppressed: outcome.suppressed,
                    trends,
                },
            );
        }

        let outcome = RunOutcome {
            run_id,
            evaluation_date,
            categories,
            history,
            phase_waits,
            malformed_events,
        };
        info!(
            alerts = outcome.total_alerts(),
            history_records = outcome.history.total_records(),
            "run finished"
        );
        Ok(outcome)
    }

    /// One deferred plan per category, in `Category::ALL` order.
    fn plans<'a>(
        &'a self,
        inputs: &'a RunInputs,
        state: &'a RunState,
        window: &'a EvaluationWindow,
    ) -> Vec<(Category, Plan<'a>)> {
        let config = &self.config;
        let estimator = &self.estimator;
        let detector = &self.detector;

        Category::ALL
            .into_iter()
            .map(|category| {
                let plan: Plan<'a> = match category {
                    Category::MaxOut => category_plan(move || {
                        let rows = required_rows(&inputs.terminations, "terminations")?;
                        let series = metrics::max_out_series(rows);
                        let policy = config.max_out_policy();
                        let found = category::evaluate_cusum(&policy, &series, estimator, detector, window);
                        Ok(Evaluation::new(found, series))
                    }),
                    Category::Actuations => category_plan(move || {
                        let rows = required_rows(&inputs.detector_health, "detector_health")?;
                        let actuations = metrics::actuation_series(rows);
                        let policy = config.actuations_policy();
                        let found = category::evaluate_actuations(
                            &policy, &actuations, estimator, detector, window,
                        );
                        Ok(Evaluation::new(found, actuations.series))
                    }),
                    Category::MissingData => category_plan(move || {
                        let rows = required_rows(&inputs.availability, "has_data")?;
                        let series =
                            metrics::missing_data_series(rows, config.availability_interval_minutes);
                        let policy = config.missing_data_policy();
                        let found = category::evaluate_cusum(&policy, &series, estimator, detector, window);
                        Ok(Evaluation::new(found, series))
                    }),
                    Category::Pedestrian => category_plan(move || {
                        let rows = required_rows(&inputs.pedestrian, "full_ped")?;
                        let series = metrics::pedestrian_series(rows);
                        let policy = config.pedestrian_policy();
                        let found = category::evaluate_pedestrian(&policy, &series, estimator, window);
                        Ok(Evaluation::new(found, series))
                    }),
                    Category::SystemOutage => category_plan(move || {
                        let rows = required_rows(&inputs.availability, "has_data")?;
                        let missing =
                            metrics::missing_data_series(rows, config.availability_interval_minutes);
                        let regions = category::region_missing_series(&missing, &inputs.signals);
                        let found = category::evaluate_system_outage(
                            config.system_outage_threshold,
                            &regions,
                            window,
                        );
                        Ok(Evaluation::new(found, regions))
                    }),
                    Category::PhaseSkip => category_plan(move || {
                        // retained waits are evaluated even without new events
                        let events = inputs.phase_skip_events.rows()?;
                        let derivation = phase_skip::derive_phase_waits(events);
                        for e in &derivation.malformed {
                            debug!(error = %e, "skipping unpaired event");
                        }

                        let policy = config.phase_skip_policy();
                        let waits = state
                            .phase_waits
                            .merged(derivation.waits)
                            .pruned(window.evaluation_date, policy.retention_days);
                        let found = phase_skip::evaluate_phase_skips(&policy, &waits, window);
                        Ok(Evaluation {
                            candidates: found,
                            series: phase_skip::skip_series(&policy, &waits),
                            phase_waits: Some(waits),
                            malformed: derivation.malformed.len(),
                        })
                    }),
                };
                (category, plan)
            })
            .collect()
    }
}

/// Attach registry name and region; drop candidates for unregistered devices.
fn scope_to_registry(
    candidates: Vec<AlertCandidate>,
    registry: &BTreeMap<&DeviceId, &SignalInfo>,
) -> Vec<AlertCandidate> {
    let before = candidates.len();
    let scoped: Vec<AlertCandidate> = candidates
        .into_iter()
        .filter_map(|mut candidate| {
            let Some(device_id) = candidate.key.device_id() else {
                return Some(candidate);
            };
            let signal = registry.get(device_id)?;
            candidate.signal_name = Some(signal.name.clone());
            candidate.region = Some(signal.region.clone());
            Some(candidate)
        })
        .collect();
    if scoped.len() < before {
        debug!(dropped = before - scoped.len(), "dropped candidates for unregistered devices");
    }
    scoped
}

fn trends(reported: &[AlertCandidate], series: &MetricSeries, window: &EvaluationWindow) -> Vec<KeyTrend> {
    let keys: BTreeSet<&AlertKey> = reported.iter().map(|a| &a.key).collect();
    keys.into_iter()
        .map(|key| KeyTrend {
            key: key.clone(),
            points: window
                .span()
                .days()
                .map(|day| TrendPoint {
                    day,
                    value: series.get(key, day).map(|obs| obs.value),
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PastAlerts, PerformanceMeasure, PhaseSkipEvent};
    use chrono::Duration;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, n).unwrap()
    }

    fn signals() -> Vec<SignalInfo> {
        vec![SignalInfo {
            device_id: DeviceId::from("s1"),
            name: "Main & 1st".into(),
            region: "Region 1".into(),
        }]
    }

    /// 21 noisy baseline days then a spike on the evaluation date.
    fn terminations(device: &str) -> Vec<TerminationRow> {
        let mut rows = Vec::new();
        for d in 1..=28u32 {
            let max_outs = match d {
                28 => 40.0,
                d if d % 2 == 0 => 4.0,
                _ => 6.0,
            };
            let at = day(d).and_hms_opt(8, 0, 0).unwrap();
            rows.push(TerminationRow {
                timestamp: at,
                device_id: DeviceId::from(device),
                phase: 2,
                performance_measure: PerformanceMeasure::MaxOut,
                total: max_outs,
            });
            rows.push(TerminationRow {
                timestamp: at + Duration::hours(1),
                device_id: DeviceId::from(device),
                phase: 2,
                performance_measure: PerformanceMeasure::GapOut,
                total: 100.0 - max_outs,
            });
        }
        rows
    }

    #[test]
    fn test_deferred_runs_only_on_materialize() {
        let mut ran = false;
        let plan = Deferred::new(|| {
            ran = true;
            7
        });
        assert_eq!(plan.materialize(), 7);
        assert!(ran);
    }

    #[test]
    fn test_latest_day_spans_tables() {
        let inputs = RunInputs {
            signals: signals(),
            terminations: terminations("s1").into(),
            availability: vec![AvailabilityPulse {
                timestamp: day(29).and_hms_opt(0, 15, 0).unwrap(),
                device_id: DeviceId::from("s1"),
            }]
            .into(),
            ..RunInputs::default()
        };
        assert_eq!(inputs.latest_day(), Some(day(29)));
        assert_eq!(RunInputs::default().latest_day(), None);
    }

    #[test]
    fn test_empty_registry_aborts() {
        let engine = AlertEngine::new(ReportConfig::default()).unwrap();
        let err = engine.run(&RunInputs::default(), &RunState::default(), day(28));
        assert!(err.is_err());
    }

    #[test]
    fn test_spike_is_reported_with_registry_fields_and_trend() {
        let engine = AlertEngine::new(ReportConfig::default()).unwrap();
        let inputs = RunInputs {
            signals: signals(),
            terminations: terminations("s1").into(),
            ..RunInputs::default()
        };
        let outcome = engine.run(&inputs, &RunState::default(), day(28)).unwrap();

        let alerts = outcome.alerts(Category::MaxOut);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].signal_name.as_deref(), Some("Main & 1st"));
        assert_eq!(outcome.alerts_for_region("Region 1").len(), 1);
        assert!(outcome.alerts_for_region("Region 2").is_empty());

        let key = AlertKey::phase(&DeviceId::from("s1"), 2);
        assert_eq!(
            outcome.history.table(Category::MaxOut).and_then(|t| t.last_alert(&key)),
            Some(day(28))
        );

        let CategoryOutcome::Completed { trends, .. } = &outcome.categories[&Category::MaxOut] else {
            panic!("max-out should complete");
        };
        assert_eq!(trends[0].points.len(), 7);
        assert_eq!(trends[0].points[6].value, Some(0.4));

        // every category reports, the missing tables as empty completions
        assert_eq!(outcome.categories.len(), Category::ALL.len());
        assert!(outcome.categories.values().all(|c| !c.is_failed()));
    }

    #[test]
    fn test_unregistered_devices_are_dropped() {
        let engine = AlertEngine::new(ReportConfig::default()).unwrap();
        let inputs = RunInputs {
            signals: signals(),
            terminations: terminations("ghost").into(),
            ..RunInputs::default()
        };
        let outcome = engine.run(&inputs, &RunState::default(), day(28)).unwrap();
        assert_eq!(outcome.total_alerts(), 0);
    }

    #[test]
    fn test_invalid_table_fails_only_its_category() {
        let engine = AlertEngine::new(ReportConfig::default()).unwrap();
        let key = AlertKey::device(&DeviceId::from("s1"));
        let mut previous = PastAlerts::new();
        previous.upsert(key.clone(), day(20));
        let mut state = RunState::default();
        state.history.set(Category::MissingData, previous.clone());

        let inputs = RunInputs {
            signals: signals(),
            terminations: terminations("s1").into(),
            availability: TableInput::Invalid(DetectError::SchemaMismatch {
                table: "has_data".into(),
                column: "TimeStamp".into(),
            }),
            ..RunInputs::default()
        };
        let outcome = engine.run(&inputs, &state, day(28)).unwrap();

        assert!(outcome.categories[&Category::MissingData].is_failed());
        assert!(outcome.categories[&Category::SystemOutage].is_failed());
        assert_eq!(outcome.alerts(Category::MaxOut).len(), 1);
        assert_eq!(outcome.history.table(Category::MissingData), Some(&previous));
    }

    #[test]
    fn test_corrupt_wait_duration_leaves_max_out_running() {
        let engine = AlertEngine::new(ReportConfig::default()).unwrap();
        let event = |at: u32, event_id: i32, parameter: i64| PhaseSkipEvent {
            device_id: DeviceId::from("s1"),
            timestamp: day(28).and_hms_opt(8, at, 0).unwrap(),
            event_id,
            parameter,
        };
        let inputs = RunInputs {
            signals: signals(),
            terminations: terminations("s1").into(),
            phase_skip_events: vec![event(0, 132, 100), event(5, 612, 10_000_000_000_000)].into(),
            ..RunInputs::default()
        };
        let outcome = engine.run(&inputs, &RunState::default(), day(28)).unwrap();

        assert_eq!(outcome.malformed_events, 1);
        assert!(outcome.phase_waits.is_empty());
        assert!(!outcome.categories[&Category::PhaseSkip].is_failed());
        assert_eq!(outcome.alerts(Category::MaxOut).len(), 1);
    }

    #[test]
    fn test_second_run_with_returned_state_is_quiet() {
        let engine = AlertEngine::new(ReportConfig::default()).unwrap();
        let inputs = RunInputs {
            signals: signals(),
            terminations: terminations("s1").into(),
            ..RunInputs::default()
        };
        let first = engine.run(&inputs, &RunState::default(), day(28)).unwrap();
        assert_eq!(first.total_alerts(), 1);

        let second = engine.run(&inputs, &first.into_state(), day(28)).unwrap();
        assert_eq!(second.total_alerts(), 0);
        let CategoryOutcome::Completed { suppressed, .. } = &second.categories[&Category::MaxOut] else {
            panic!("max-out should complete");
        };
        assert_eq!(*suppressed, 1);
    }
}
