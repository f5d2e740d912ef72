use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::detect::DetectError;
use crate::model::{AlertKey, DailyObservation, MetricSeries};

/// Historical mean and sample standard deviation for one series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
    pub min_samples: usize,
}

impl Baseline {
    /// Baseline with known moments, e.g. from an external store.
    pub fn known(mean: f64, std_dev: f64, sample_count: usize) -> Self {
        Self {
            mean,
            std_dev,
            sample_count,
            min_samples: sample_count,
        }
    }

    pub fn from_values(values: &[f64], min_samples: usize) -> Self {
        let count = values.len();
        if count == 0 {
            return Self {
                mean: 0.0,
                std_dev: 0.0,
                sample_count: 0,
                min_samples,
            };
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = if count > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };

        Self {
            mean,
            std_dev: variance.sqrt(),
            sample_count: count,
            min_samples,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sample_count >= self.min_samples
            && self.sample_count > 0
            && self.std_dev.is_finite()
            && self.std_dev > 0.0
    }

    pub fn require_valid(&self) -> Result<&Self, DetectError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(DetectError::InvalidBaseline {
                needed: self.min_samples,
                have: self.sample_count,
                std_dev: self.std_dev,
            })
        }
    }

    /// Z = (value - mean) / std_dev
    pub fn z_score(&self, value: f64) -> Result<f64, DetectError> {
        let baseline = self.require_valid()?;
        Ok((value - baseline.mean) / baseline.std_dev)
    }
}

/// Inclusive day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayWindow {
    /// The `days` days ending at `end`, inclusive.
    pub fn ending_at(end: NaiveDate, days: i64) -> Self {
        Self {
            start: Duration::try_days(days.max(1) - 1)
                .and_then(|span| end.checked_sub_signed(span))
                .unwrap_or(NaiveDate::MIN),
            end,
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

/// Computes per-key baselines over a lookback window that ends before the
/// days under evaluation.
#[derive(Debug, Clone)]
pub struct BaselineEstimator {
    window_days: i64,
    min_samples: usize,
}

impl BaselineEstimator {
    pub fn new(window_days: i64, min_samples: usize) -> Self {
        Self {
            window_days: window_days.max(1),
            min_samples,
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    pub fn window(&self, cutoff: NaiveDate) -> DayWindow {
        DayWindow::ending_at(cutoff, self.window_days)
    }

    /// Baseline over the observed days of one series. Gaps are skipped.
    pub fn estimate_days(
        &self,
        days: &BTreeMap<NaiveDate, DailyObservation>,
        cutoff: NaiveDate,
    ) -> Baseline {
        let window = self.window(cutoff);
        let values: Vec<f64> = days
            .range(window.start..=window.end)
            .map(|(_, obs)| obs.value)
            .filter(|v| v.is_finite())
            .collect();
        Baseline::from_values(&values, self.min_samples)
    }

    /// Baselines for every key in the series, valid or not.
    pub fn estimate(&self, series: &MetricSeries, cutoff: NaiveDate) -> BTreeMap<AlertKey, Baseline> {
        series
            .iter()
            .map(|(key, days)| (key.clone(), self.estimate_days(days, cutoff)))
            .collect()
    }
}
