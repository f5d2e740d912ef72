//! Category threshold policies.
//!
//! Max-out, actuations and missing data share the CUSUM path and alert only
//! when every gate passes. Pedestrian uses a single GEH-style statistic on
//! the actuations-per-service ratio. System outage works at region grain.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::detect::baseline::{Baseline, BaselineEstimator, DayWindow};
use crate::detect::cusum::{CusumDetector, RecencyWeighting};
use crate::detect::metrics::ActuationMetrics;
use crate::model::{AlertCandidate, AlertKey, Category, DailyObservation, MetricSeries, SignalInfo};

/// Days evaluated in a run and the baseline cutoff that precedes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvaluationWindow {
    pub evaluation_date: NaiveDate,
    pub flagging_days: i64,
}

impl EvaluationWindow {
    pub fn new(evaluation_date: NaiveDate, flagging_days: i64) -> Self {
        Self {
            evaluation_date,
            flagging_days: flagging_days.max(1),
        }
    }

    pub fn span(&self) -> DayWindow {
        DayWindow::ending_at(self.evaluation_date, self.flagging_days)
    }

    /// Last day that may feed a baseline.
    pub fn baseline_cutoff(&self) -> NaiveDate {
        self.span().start.pred_opt().unwrap_or(NaiveDate::MIN)
    }
}

/// Gate values for a CUSUM category. Every comparison is strict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cusum: f64,
    pub z_score: f64,
    pub min_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<f64>,
}

impl Thresholds {
    pub const MAX_OUT: Thresholds = Thresholds {
        cusum: 0.25,
        z_score: 4.0,
        min_value: 0.20,
        min_volume: Some(30.0),
    };

    pub const ACTUATIONS: Thresholds = Thresholds {
        cusum: 0.20,
        z_score: 3.5,
        min_value: 0.10,
        min_volume: None,
    };

    pub const MISSING_DATA: Thresholds = Thresholds {
        cusum: 0.10,
        z_score: 3.0,
        min_value: 0.05,
        min_volume: None,
    };
}

/// What the minimum-value gate compares against `min_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimumGate {
    /// The day's raw value.
    Value,
    /// `(value - mean) / mean`
    RelativeDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CusumPolicy {
    pub category: Category,
    pub thresholds: Thresholds,
    pub minimum: MinimumGate,
}

impl CusumPolicy {
    pub fn max_out(thresholds: Thresholds) -> Self {
        Self { category: Category::MaxOut, thresholds, minimum: MinimumGate::Value }
    }

    pub fn actuations(thresholds: Thresholds) -> Self {
        Self {
            category: Category::Actuations,
            thresholds,
            minimum: MinimumGate::RelativeDeviation,
        }
    }

    pub fn missing_data(thresholds: Thresholds) -> Self {
        Self { category: Category::MissingData, thresholds, minimum: MinimumGate::Value }
    }

    pub fn minimum_metric(&self, observation: &DailyObservation, baseline: &Baseline) -> f64 {
        match self.minimum {
            MinimumGate::Value => observation.value,
            MinimumGate::RelativeDeviation if baseline.mean > 0.0 => {
                (observation.value - baseline.mean) / baseline.mean
            }
            MinimumGate::RelativeDeviation => 0.0,
        }
    }

    /// All gates, AND-ed.
    pub fn passes(&self, cusum: f64, z_score: f64, minimum_metric: f64, volume: f64) -> bool {
        let t = &self.thresholds;
        cusum > t.cusum
            && z_score > t.z_score
            && minimum_metric > t.min_value
            && t.min_volume.map_or(true, |min| volume > min)
    }
}

/// Candidates for one key given its baseline. Days without an observation
/// are never flagged.
pub fn evaluate_cusum_key<W: RecencyWeighting>(
    policy: &CusumPolicy,
    detector: &CusumDetector<W>,
    key: &AlertKey,
    days: &BTreeMap<NaiveDate, DailyObservation>,
    baseline: &Baseline,
    window: &EvaluationWindow,
) -> Vec<AlertCandidate> {
    let mut candidates = Vec::new();
    for day in window.span().days() {
        let Some(observation) = days.get(&day) else {
            continue;
        };
        let state = match detector.evaluate(days, day, baseline) {
            Ok(state) => state,
            Err(e) => {
                debug!(category = %policy.category, key = %key, error = %e, "skipping key");
                return candidates;
            }
        };
        let Some(z) = state.z_latest else {
            continue;
        };
        let minimum = policy.minimum_metric(observation, baseline);
        if policy.passes(state.cusum, z, minimum, observation.volume) {
            candidates.push(
                AlertCandidate::new(policy.category, key.clone(), day, observation.value)
                    .with_evidence(json!({
                        "cusum": state.cusum,
                        "z_score": z,
                        "volume": observation.volume,
                        "minimum_metric": minimum,
                        "baseline_mean": baseline.mean,
                        "baseline_std_dev": baseline.std_dev,
                    })),
            );
        }
    }
    candidates
}

/// Run a CUSUM category over every key of a series.
pub fn evaluate_cusum<W: RecencyWeighting>(
    policy: &CusumPolicy,
    series: &MetricSeries,
    estimator: &BaselineEstimator,
    detector: &CusumDetector<W>,
    window: &EvaluationWindow,
) -> Vec<AlertCandidate> {
    let cutoff = window.baseline_cutoff();
    let mut candidates = Vec::new();
    let mut invalid = 0usize;

    for (key, days) in series.iter() {
        let baseline = estimator.estimate_days(days, cutoff);
        if let Err(e) = baseline.require_valid() {
            debug!(category = %policy.category, key = %key, error = %e, "no alert possible");
            invalid += 1;
            continue;
        }
        candidates.extend(evaluate_cusum_key(policy, detector, key, days, &baseline, window));
    }

    debug!(
        category = %policy.category,
        keys = series.keys().count(),
        invalid_baselines = invalid,
        candidates = candidates.len(),
        "cusum evaluation finished"
    );
    candidates
}

/// Actuations are CUSUM-evaluated; detector diagnostics ride along as evidence.
pub fn evaluate_actuations<W: RecencyWeighting>(
    policy: &CusumPolicy,
    metrics: &ActuationMetrics,
    estimator: &BaselineEstimator,
    detector: &CusumDetector<W>,
    window: &EvaluationWindow,
) -> Vec<AlertCandidate> {
    let mut candidates = evaluate_cusum(policy, &metrics.series, estimator, detector, window);
    for candidate in &mut candidates {
        if let Some(diag) = metrics.diagnostics.get(&(candidate.key.clone(), candidate.day)) {
            if let Some(evidence) = candidate.evidence.as_object_mut() {
                evidence.insert("mean_prediction".into(), json!(diag.mean_prediction));
                evidence.insert("anomalous_share".into(), json!(diag.anomalous_share));
            }
        }
    }
    candidates
}

// ---------------------------------------------------------------------------
// Pedestrian
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PedestrianPolicy {
    /// Alert when the signed statistic falls below this (negative) value.
    pub geh_threshold: f64,
    pub min_baseline_days: usize,
}

/// `sign(M - C) * sqrt(2 (M - C)^2 / (M + C))`
pub fn signed_geh(observed: f64, expected: f64) -> f64 {
    let total = observed + expected;
    if total <= 0.0 {
        return 0.0;
    }
    let diff = observed - expected;
    diff.signum() * (2.0 * diff * diff / total).sqrt()
}

/// Historical actuations-per-service ratio and the days behind it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatioBaseline {
    pub ratio: f64,
    pub days: usize,
}

pub fn ratio_baseline(
    days: &BTreeMap<NaiveDate, DailyObservation>,
    window: DayWindow,
) -> Option<RatioBaseline> {
    let (mut actuations, mut services, mut count) = (0.0, 0.0, 0usize);
    for (_, obs) in days.range(window.start..=window.end) {
        if obs.volume > 0.0 {
            actuations += obs.value;
            services += obs.volume;
            count += 1;
        }
    }
    (services > 0.0 && actuations > 0.0).then(|| RatioBaseline {
        ratio: actuations / services,
        days: count,
    })
}

pub fn evaluate_pedestrian(
    policy: &PedestrianPolicy,
    series: &MetricSeries,
    estimator: &BaselineEstimator,
    window: &EvaluationWindow,
) -> Vec<AlertCandidate> {
    let baseline_window = estimator.window(window.baseline_cutoff());
    let mut candidates = Vec::new();

    for (key, days) in series.iter() {
        let baseline = match ratio_baseline(days, baseline_window) {
            Some(b) if b.days >= policy.min_baseline_days => b,
            other => {
                debug!(
                    key = %key,
                    days = other.map_or(0, |b| b.days),
                    "pedestrian baseline insufficient"
                );
                continue;
            }
        };

        for day in window.span().days() {
            let Some(obs) = days.get(&day) else {
                continue;
            };
            let expected = obs.volume * baseline.ratio;
            let statistic = signed_geh(obs.value, expected);
            if statistic < policy.geh_threshold {
                candidates.push(
                    AlertCandidate::new(Category::Pedestrian, key.clone(), day, statistic)
                        .with_evidence(json!({
                            "actuations": obs.value,
                            "services": obs.volume,
                            "expected_actuations": expected,
                            "baseline_ratio": baseline.ratio,
                            "baseline_days": baseline.days,
                        })),
                );
            }
        }
    }
    candidates
}

// ---------------------------------------------------------------------------
// System outage
// ---------------------------------------------------------------------------

/// Mean missing-data proportion across a region's reporting devices, per day.
/// Volume is the number of devices that contributed.
pub fn region_missing_series(missing: &MetricSeries, signals: &[SignalInfo]) -> MetricSeries {
    let regions: BTreeMap<&str, BTreeSet<AlertKey>> =
        signals.iter().fold(BTreeMap::new(), |mut acc, s| {
            acc.entry(s.region.as_str())
                .or_default()
                .insert(AlertKey::device(&s.device_id));
            acc
        });

    let mut series = MetricSeries::new();
    for (region, keys) in regions {
        let mut days: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
        for (day, obs) in keys.iter().filter_map(|k| missing.days(k)).flatten() {
            let entry = days.entry(*day).or_default();
            entry.0 += obs.value;
            entry.1 += 1;
        }
        for (day, (sum, count)) in days {
            series.insert(
                AlertKey::region(region),
                day,
                DailyObservation::new(sum / count as f64, count as f64),
            );
        }
    }
    series
}

pub fn evaluate_system_outage(
    threshold: f64,
    regions: &MetricSeries,
    window: &EvaluationWindow,
) -> Vec<AlertCandidate> {
    let mut candidates = Vec::new();
    for (key, days) in regions.iter() {
        let AlertKey::Region { region } = key else {
            continue;
        };
        for (day, obs) in days.range(window.span().start..=window.span().end) {
            if obs.value > threshold {
                let mut candidate =
                    AlertCandidate::new(Category::SystemOutage, key.clone(), *day, obs.value)
                        .with_evidence(json!({
                            "devices_reporting": obs.volume,
                            "threshold": threshold,
                        }));
                candidate.region = Some(region.clone());
                candidates.push(candidate);
            }
        }
    }
    candidates
}
