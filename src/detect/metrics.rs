//! Daily aggregation of raw input tables into metric series.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, Timelike};
use serde::Serialize;

use crate::model::{
    AlertKey, AvailabilityPulse, DailyObservation, DetectorRow, MetricSeries, PedestrianRow,
    TerminationRow,
};

/// Percent max-out per (device, phase, day); volume is total services.
pub fn max_out_series(rows: &[TerminationRow]) -> MetricSeries {
    let mut sums: BTreeMap<(AlertKey, NaiveDate), (f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = sums
            .entry((AlertKey::phase(&row.device_id, row.phase), row.timestamp.date()))
            .or_default();
        if row.performance_measure.is_max_out() {
            entry.0 += row.total;
        }
        entry.1 += row.total;
    }

    let mut series = MetricSeries::new();
    for ((key, day), (max_outs, services)) in sums {
        if services > 0.0 {
            series.insert(key, day, DailyObservation::new(max_outs / services, services));
        }
    }
    series
}

/// Pass-through detector diagnostics for one day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorDiagnostics {
    pub mean_prediction: Option<f64>,
    pub anomalous_share: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ActuationMetrics {
    pub series: MetricSeries,
    pub diagnostics: BTreeMap<(AlertKey, NaiveDate), DetectorDiagnostics>,
}

#[derive(Default)]
struct DetectorDay {
    total: f64,
    prediction_sum: f64,
    predictions: usize,
    anomalous: usize,
    flagged: usize,
}

/// Daily actuation totals per (device, detector, day).
pub fn actuation_series(rows: &[DetectorRow]) -> ActuationMetrics {
    let mut days: BTreeMap<(AlertKey, NaiveDate), DetectorDay> = BTreeMap::new();
    for row in rows {
        let entry = days
            .entry((AlertKey::detector(&row.device_id, row.detector), row.timestamp.date()))
            .or_default();
        entry.total += row.total;
        if let Some(p) = row.prediction.filter(|p| p.is_finite()) {
            entry.prediction_sum += p;
            entry.predictions += 1;
        }
        if let Some(flag) = row.anomaly {
            entry.flagged += 1;
            if flag {
                entry.anomalous += 1;
            }
        }
    }

    let mut metrics = ActuationMetrics::default();
    for ((key, day), agg) in days {
        metrics
            .series
            .insert(key.clone(), day, DailyObservation::new(agg.total, agg.total));
        metrics.diagnostics.insert(
            (key, day),
            DetectorDiagnostics {
                mean_prediction: (agg.predictions > 0)
                    .then(|| agg.prediction_sum / agg.predictions as f64),
                anomalous_share: (agg.flagged > 0)
                    .then(|| agg.anomalous as f64 / agg.flagged as f64),
            },
        );
    }
    metrics
}

/// Missing-data proportion per (device, day).
///
/// Expected cadence is one pulse per `interval_minutes` bin. Only days seen
/// somewhere in the table are scored, and only devices seen at least once.
pub fn missing_data_series(pulses: &[AvailabilityPulse], interval_minutes: u32) -> MetricSeries {
    let interval = interval_minutes.clamp(1, 1440);
    let expected = (1440 / interval) as f64;

    let mut bins: BTreeMap<(AlertKey, NaiveDate), BTreeSet<u32>> = BTreeMap::new();
    let mut devices = BTreeSet::new();
    let mut observed_days = BTreeSet::new();
    for pulse in pulses {
        let key = AlertKey::device(&pulse.device_id);
        let day = pulse.timestamp.date();
        let minute = pulse.timestamp.hour() * 60 + pulse.timestamp.minute();
        bins.entry((key.clone(), day)).or_default().insert(minute / interval);
        devices.insert(key);
        observed_days.insert(day);
    }

    let mut series = MetricSeries::new();
    for key in &devices {
        for day in &observed_days {
            let present = bins.get(&(key.clone(), *day)).map_or(0, BTreeSet::len) as f64;
            let missing = (1.0 - present / expected).clamp(0.0, 1.0);
            series.insert(key.clone(), *day, DailyObservation::new(missing, present));
        }
    }
    series
}

/// Pedestrian actuations (value) and services (volume) per (device, phase, day).
pub fn pedestrian_series(rows: &[PedestrianRow]) -> MetricSeries {
    let mut sums: BTreeMap<(AlertKey, NaiveDate), (f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = sums
            .entry((AlertKey::phase(&row.device_id, row.phase), row.timestamp.date()))
            .or_default();
        entry.0 += row.ped_actuation;
        entry.1 += row.ped_services;
    }

    let mut series = MetricSeries::new();
    for ((key, day), (actuations, services)) in sums {
        series.insert(key, day, DailyObservation::new(actuations, services));
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceId, PerformanceMeasure};
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_max_out_counts_force_offs() {
        let dev = DeviceId::from("s1");
        let row = |t: &str, measure, total| TerminationRow {
            timestamp: ts(t),
            device_id: dev.clone(),
            phase: 2,
            performance_measure: measure,
            total,
        };
        let rows = vec![
            row("2024-01-15 08:30:00", PerformanceMeasure::MaxOut, 30.0),
            row("2024-01-15 09:30:00", PerformanceMeasure::GapOut, 50.0),
            row("2024-01-15 10:30:00", PerformanceMeasure::ForceOff, 20.0),
        ];
        let series = max_out_series(&rows);
        let obs = series
            .get(&AlertKey::phase(&dev, 2), day("2024-01-15"))
            .unwrap();
        assert_eq!(obs.value, 0.5);
        assert_eq!(obs.volume, 100.0);
    }

    #[test]
    fn test_actuation_diagnostics_pass_through() {
        let dev = DeviceId::from("s1");
        let rows = vec![
            DetectorRow {
                timestamp: ts("2024-01-15 08:00:00"),
                device_id: dev.clone(),
                detector: 1,
                total: 150.0,
                prediction: Some(140.0),
                anomaly: Some(false),
            },
            DetectorRow {
                timestamp: ts("2024-01-15 09:00:00"),
                device_id: dev.clone(),
                detector: 1,
                total: 50.0,
                prediction: Some(160.0),
                anomaly: Some(true),
            },
        ];
        let metrics = actuation_series(&rows);
        let key = AlertKey::detector(&dev, 1);
        assert_eq!(metrics.series.get(&key, day("2024-01-15")).unwrap().value, 200.0);
        let diag = metrics.diagnostics[&(key, day("2024-01-15"))];
        assert_eq!(diag.mean_prediction, Some(150.0));
        assert_eq!(diag.anomalous_share, Some(0.5));
    }

    #[test]
    fn test_missing_data_scores_absent_days_as_fully_missing() {
        let a = DeviceId::from("a");
        let b = DeviceId::from("b");
        let mut pulses = Vec::new();
        // device a reports every bin on the 15th
        for bin in 0..96u32 {
            let t = day("2024-01-15")
                .and_hms_opt(bin * 15 / 60, bin * 15 % 60, 0)
                .unwrap();
            pulses.push(AvailabilityPulse { timestamp: t, device_id: a.clone() });
        }
        // device b reports once on the 16th, twice in the same bin
        pulses.push(AvailabilityPulse { timestamp: ts("2024-01-16 00:01:00"), device_id: b.clone() });
        pulses.push(AvailabilityPulse { timestamp: ts("2024-01-16 00:07:00"), device_id: b.clone() });

        let series = missing_data_series(&pulses, 15);
        let a_key = AlertKey::device(&a);
        let b_key = AlertKey::device(&b);
        assert_eq!(series.get(&a_key, day("2024-01-15")).unwrap().value, 0.0);
        assert_eq!(series.get(&a_key, day("2024-01-16")).unwrap().value, 1.0);
        assert_eq!(series.get(&b_key, day("2024-01-15")).unwrap().value, 1.0);
        let b16 = series.get(&b_key, day("2024-01-16")).unwrap();
        assert!((b16.value - 95.0 / 96.0).abs() < 1e-12);
    }
}
