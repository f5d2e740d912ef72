//! TOML configuration for a phasewatch run.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Lookup order for the file itself: explicit path, the
//! `PHASEWATCH_CONFIG` environment variable, `./phasewatch.toml`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::baseline::BaselineEstimator;
use crate::detect::category::{CusumPolicy, EvaluationWindow, PedestrianPolicy, Thresholds};
use crate::detect::cusum::{CusumDetector, PowerWeighting};
use crate::detect::lifecycle::{LifecyclePolicy, SuppressionClock};
use crate::detect::phase_skip::PhaseSkipPolicy;

pub const CONFIG_ENV: &str = "PHASEWATCH_CONFIG";
pub const LOCAL_CONFIG: &str = "phasewatch.toml";

/// Upper bound for every day-count window (about a century).
pub const MAX_WINDOW_DAYS: i64 = 36_500;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Minimum days between two reported alerts for the same key.
    pub alert_suppression_days: i64,
    /// History records older than this are purged.
    pub alert_retention_weeks: i64,
    /// Baseline lookback, ending the day before the evaluation window.
    pub historical_window_days: i64,
    /// Days ending on the evaluation date that may produce alerts.
    pub alert_flagging_days: i64,
    pub phase_skip_alert_threshold: u32,
    pub phase_skip_retention_days: i64,
    pub suppress_repeated_alerts: bool,
    pub suppression_clock: SuppressionClock,
    pub min_baseline_days: usize,
    /// 0 = warn, 1 = info, 2 = debug. `RUST_LOG` takes precedence.
    pub verbosity: u8,
    pub pedestrian_geh_threshold: f64,
    pub system_outage_threshold: f64,
    pub availability_interval_minutes: u32,
    pub phase_skip_cycle_multiplier: f64,
    pub cusum: CusumConfig,
    pub thresholds: ThresholdConfig,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            alert_suppression_days: 21,
            alert_retention_weeks: 104,
            historical_window_days: 21,
            alert_flagging_days: 7,
            phase_skip_alert_threshold: 1,
            phase_skip_retention_days: 14,
            suppress_repeated_alerts: true,
            suppression_clock: SuppressionClock::Fixed,
            min_baseline_days: 7,
            verbosity: 1,
            pedestrian_geh_threshold: -11.0,
            system_outage_threshold: 0.30,
            availability_interval_minutes: 15,
            phase_skip_cycle_multiplier: 1.5,
            cusum: CusumConfig::default(),
            thresholds: ThresholdConfig::default(),
        }
    }
}

impl ReportConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded report configuration");
        Ok(config)
    }

    /// An explicit path must load. Otherwise try `PHASEWATCH_CONFIG`, then
    /// `./phasewatch.toml`, then fall back to defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PHASEWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let day_windows = [
            ("historical_window_days", self.historical_window_days, 1),
            ("alert_flagging_days", self.alert_flagging_days, 1),
            ("phase_skip_retention_days", self.phase_skip_retention_days, 1),
            ("alert_suppression_days", self.alert_suppression_days, 0),
        ];
        for (name, days, min) in day_windows {
            if !(min..=MAX_WINDOW_DAYS).contains(&days) {
                bail!("{name} must be between {min} and {MAX_WINDOW_DAYS}");
            }
        }
        if !(0..=MAX_WINDOW_DAYS / 7).contains(&self.alert_retention_weeks) {
            bail!("alert_retention_weeks must be between 0 and {}", MAX_WINDOW_DAYS / 7);
        }
        if self.phase_skip_alert_threshold == 0 {
            bail!("phase_skip_alert_threshold must be at least 1");
        }
        if self.availability_interval_minutes == 0 || self.availability_interval_minutes > 1440 {
            bail!("availability_interval_minutes must be between 1 and 1440");
        }
        if !(self.phase_skip_cycle_multiplier > 0.0) {
            bail!("phase_skip_cycle_multiplier must be positive");
        }
        if self.verbosity > 2 {
            bail!("verbosity must be 0, 1 or 2");
        }
        self.cusum.validate()
    }

    /// Default tracing directive for this verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }

    pub fn evaluation_window(&self, evaluation_date: chrono::NaiveDate) -> EvaluationWindow {
        EvaluationWindow::new(evaluation_date, self.alert_flagging_days)
    }

    pub fn baseline_estimator(&self) -> BaselineEstimator {
        BaselineEstimator::new(self.historical_window_days, self.min_baseline_days)
    }

    pub fn cusum_detector(&self) -> CusumDetector<PowerWeighting> {
        CusumDetector::new(
            self.cusum.window_days,
            self.cusum.allowance,
            PowerWeighting { forgetfulness: self.cusum.forgetfulness },
        )
    }

    pub fn max_out_policy(&self) -> CusumPolicy {
        CusumPolicy::max_out(self.thresholds.max_out)
    }

    pub fn actuations_policy(&self) -> CusumPolicy {
        CusumPolicy::actuations(self.thresholds.actuations)
    }

    pub fn missing_data_policy(&self) -> CusumPolicy {
        CusumPolicy::missing_data(self.thresholds.missing_data)
    }

    pub fn pedestrian_policy(&self) -> PedestrianPolicy {
        PedestrianPolicy {
            geh_threshold: self.pedestrian_geh_threshold,
            min_baseline_days: self.min_baseline_days,
        }
    }

    pub fn phase_skip_policy(&self) -> PhaseSkipPolicy {
        PhaseSkipPolicy {
            cycle_multiplier: self.phase_skip_cycle_multiplier,
            alert_threshold: self.phase_skip_alert_threshold,
            retention_days: self.phase_skip_retention_days,
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            flagging_days: self.alert_flagging_days,
            suppression_days: self.alert_suppression_days,
            retention_days: self.alert_retention_weeks.saturating_mul(7),
            suppress_repeated: self.suppress_repeated_alerts,
            clock: self.suppression_clock,
        }
    }
}

// ---------------------------------------------------------------------------
// CUSUM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CusumConfig {
    pub window_days: usize,
    /// Recency weight exponent: position `i` (0 = oldest) weighs `(i + 1)^f`.
    pub forgetfulness: f64,
    /// Slack subtracted from each standardized deviation before clipping.
    pub allowance: f64,
}

impl Default for CusumConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            forgetfulness: 2.0,
            allowance: 0.0,
        }
    }
}

impl CusumConfig {
    fn validate(&self) -> Result<()> {
        if self.window_days == 0 || self.window_days as i64 > MAX_WINDOW_DAYS {
            bail!("cusum.window_days must be between 1 and {MAX_WINDOW_DAYS}");
        }
        if !(self.forgetfulness >= 0.0) {
            bail!("cusum.forgetfulness must be non-negative");
        }
        if !(self.allowance >= 0.0) {
            bail!("cusum.allowance must be non-negative");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub max_out: Thresholds,
    pub actuations: Thresholds,
    pub missing_data: Thresholds,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_out: Thresholds::MAX_OUT,
            actuations: Thresholds::ACTUATIONS,
            missing_data: Thresholds::MISSING_DATA,
        }
    }
}
