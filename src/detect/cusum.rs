//! Recency-weighted one-sided CUSUM over a short rolling window.
//!
//! For a window of `n` days ending on the evaluated day:
//!
//! ```text
//! z_t    = (value_t - mean) / std_dev
//! CUSUM  = sum_t  w_t * max(z_t - k, 0)
//! ```
//!
//! `w_t` comes from a [`RecencyWeighting`] and is normalized so the weights sum
//! to `n`. Weights are fixed per window position: a missing day contributes
//! zero and the remaining days keep their weight.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::detect::baseline::Baseline;
use crate::detect::DetectError;
use crate::model::DailyObservation;

/// Weighting curve over window positions, `0` being the oldest day.
///
/// Implementations must be non-decreasing in `position`.
pub trait RecencyWeighting {
    fn raw_weight(&self, position: usize) -> f64;
}

/// `(position + 1) ^ forgetfulness`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerWeighting {
    pub forgetfulness: f64,
}

impl Default for PowerWeighting {
    fn default() -> Self {
        Self { forgetfulness: 2.0 }
    }
}

impl RecencyWeighting for PowerWeighting {
    fn raw_weight(&self, position: usize) -> f64 {
        (position as f64 + 1.0).powf(self.forgetfulness)
    }
}

/// Every day counts the same.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UniformWeighting;

impl RecencyWeighting for UniformWeighting {
    fn raw_weight(&self, _position: usize) -> f64 {
        1.0
    }
}

/// Per-key intermediate state for one evaluated day. Rebuilt every run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CusumState {
    /// Standardized deviation per window day, oldest first; `None` for gaps.
    pub deviations: Vec<Option<f64>>,
    pub cusum: f64,
    /// Deviation on the evaluated day itself.
    pub z_latest: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CusumDetector<W = PowerWeighting> {
    window_days: usize,
    allowance: f64,
    weights: Vec<f64>,
    weighting: W,
}

impl Default for CusumDetector<PowerWeighting> {
    fn default() -> Self {
        Self::new(7, 0.0, PowerWeighting::default())
    }
}

impl<W: RecencyWeighting> CusumDetector<W> {
    pub fn new(window_days: usize, allowance: f64, weighting: W) -> Self {
        let window_days = window_days.max(1);
        let raw: Vec<f64> = (0..window_days)
            .map(|p| weighting.raw_weight(p).max(0.0))
            .collect();
        let total: f64 = raw.iter().sum();

        let weights = if total.is_finite() && total > 0.0 {
            raw.iter().map(|w| w / total * window_days as f64).collect()
        } else {
            vec![1.0; window_days]
        };

        Self {
            window_days,
            allowance: allowance.max(0.0),
            weights,
            weighting,
        }
    }

    pub fn window_days(&self) -> usize {
        self.window_days
    }

    /// Normalized weights, oldest position first.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weighting(&self) -> &W {
        &self.weighting
    }

    /// CUSUM for the window ending on `day`, reading values from a daily series.
    pub fn evaluate(
        &self,
        days: &BTreeMap<NaiveDate, DailyObservation>,
        day: NaiveDate,
        baseline: &Baseline,
    ) -> Result<CusumState, DetectError> {
        let values: Vec<Option<f64>> = (0..self.window_days)
            .rev()
            .map(|back| {
                Duration::try_days(back as i64)
                    .and_then(|offset| day.checked_sub_signed(offset))
                    .and_then(|d| days.get(&d))
                    .map(|obs| obs.value)
            })
            .collect();
        self.evaluate_values(&values, baseline)
    }

    /// CUSUM over explicit window values, oldest first. Shorter slices are
    /// treated as gaps at the old end.
    pub fn evaluate_values(
        &self,
        values: &[Option<f64>],
        baseline: &Baseline,
    ) -> Result<CusumState, DetectError> {
        let baseline = baseline.require_valid()?;

        let take = values.len().min(self.window_days);
        let mut deviations = vec![None; self.window_days - take];
        deviations.extend(
            values[values.len() - take..]
                .iter()
                .map(|v| v.filter(|x| x.is_finite()).map(|x| (x - baseline.mean) / baseline.std_dev)),
        );

        let cusum = deviations
            .iter()
            .zip(&self.weights)
            .map(|(z, w)| match z {
                Some(z) => w * (z - self.allowance).max(0.0),
                None => 0.0,
            })
            .sum();

        Ok(CusumState {
            z_latest: deviations.last().copied().flatten(),
            deviations,
            cusum,
        })
    }
}
